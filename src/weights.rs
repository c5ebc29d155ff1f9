use std::{
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::errors::{DeepLabError, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Where a checkpoint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Local(PathBuf),
    Remote(String),
}

impl WeightSource {
    /// URLs are recognized by scheme; anything else is a filesystem path.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Remote(trimmed.to_string())
        } else {
            Self::Local(PathBuf::from(trimmed))
        }
    }

    /// Last path or URL segment, ignoring any query string.
    pub fn file_name(&self) -> String {
        match self {
            Self::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Remote(url) => cache_file_name(url),
        }
    }

    /// Whether the source names an ONNX export, judged by its extension.
    pub fn is_onnx(&self) -> bool {
        Path::new(&self.file_name())
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
    }

    /// Resolve to a local file, downloading into `cache_dir` when remote.
    ///
    /// Remote files are cached by their last URL segment and reused on later
    /// calls. A download lands in a temporary file inside `cache_dir` that
    /// is only moved into place once complete, so a failed transfer never
    /// leaves a truncated checkpoint behind.
    pub fn fetch(&self, cache_dir: &Path) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(DeepLabError::weight_load(self, "file does not exist"))
                }
            }
            Self::Remote(url) => {
                let target = cache_dir.join(cache_file_name(url));
                if target.is_file() {
                    debug!("Using cached weights {}", target.display());
                    return Ok(target);
                }
                download(url, cache_dir, &target)?;
                Ok(target)
            }
        }
    }
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

fn cache_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("weights")
        .to_string()
}

fn download(url: &str, cache_dir: &Path, target: &Path) -> Result<()> {
    let failed = |reason: String| DeepLabError::weight_load(url, reason);

    fs::create_dir_all(cache_dir).map_err(|e| DeepLabError::FileSystem {
        path: cache_dir.to_path_buf(),
        operation: "cache directory creation".to_string(),
        source: e,
    })?;

    info!("Downloading weights from {url}");
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| failed(format!("HTTP client setup failed: {e}")))?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| failed(format!("request failed: {e}")))?;

    let mut partial = NamedTempFile::new_in(cache_dir)
        .map_err(|e| failed(format!("cannot create temporary file: {e}")))?;
    let bytes = response
        .copy_to(partial.as_file_mut())
        .map_err(|e| failed(format!("transfer interrupted: {e}")))?;
    partial
        .as_file_mut()
        .flush()
        .map_err(|e| failed(format!("cannot flush download: {e}")))?;
    partial
        .persist(target)
        .map_err(|e| failed(format!("cannot move download into cache: {}", e.error)))?;

    info!("Cached {bytes} bytes at {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_source() {
        assert_eq!(
            WeightSource::parse("https://host/a/model.onnx"),
            WeightSource::Remote("https://host/a/model.onnx".to_string())
        );
        assert_eq!(
            WeightSource::parse(" output/model_final.onnx "),
            WeightSource::Local(PathBuf::from("output/model_final.onnx"))
        );
    }

    #[test]
    fn test_cache_file_name() {
        assert_eq!(
            cache_file_name("https://host/a/b/model_final_a8a355.pkl"),
            "model_final_a8a355.pkl"
        );
        assert_eq!(cache_file_name("https://host/m.onnx?token=1"), "m.onnx");
        assert_eq!(cache_file_name("https://host/dir/"), "dir");
    }

    #[test]
    fn test_onnx_detection() {
        assert!(WeightSource::parse("https://host/m.ONNX?token=1").is_onnx());
        assert!(WeightSource::parse("out/model_final.onnx").is_onnx());
        assert!(!WeightSource::parse("https://host/a/model_final_a8a355.pkl").is_onnx());
        assert!(!WeightSource::parse("out/model_final.pth").is_onnx());
    }

    #[test]
    fn test_missing_local_file_names_path() {
        let source = WeightSource::Local("/nonexistent/model.onnx".into());
        let err = source.fetch(Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/model.onnx"));
    }

    #[test]
    fn test_remote_cache_hit_skips_download() -> Result<()> {
        let cache = TempDir::new()?;
        let cached = cache.path().join("model.onnx");
        fs::write(&cached, b"weights")?;

        let source = WeightSource::Remote("https://unreachable.invalid/x/model.onnx".into());
        assert_eq!(source.fetch(cache.path())?, cached);
        Ok(())
    }
}
