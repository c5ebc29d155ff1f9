use std::{collections::HashMap, fmt, fs, path::Path, path::PathBuf, str::FromStr};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{DeepLabError, Result};

pub const KEY_CONFIG_FILE: &str = "config_file";
pub const KEY_WEIGHTS_FILE: &str = "model_weight_file";
pub const KEY_DATASET: &str = "dataset";

/// Which model the task runs: the bundled Cityscapes checkpoint or a
/// user-trained one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dataset {
    #[default]
    Cityscapes,
    Custom,
}

impl Dataset {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cityscapes => "Cityscapes",
            Self::Custom => "Custom",
        }
    }

    pub const fn is_predefined(&self) -> bool {
        matches!(self, Self::Cityscapes)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = DeepLabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cityscapes" => Ok(Self::Cityscapes),
            "custom" => Ok(Self::Custom),
            _ => Err(DeepLabError::UnsupportedDataset {
                name: s.to_string(),
            }),
        }
    }
}

/// Task parameters as edited by the host's parameter form.
///
/// Empty paths mean "not set". `dirty` is raised whenever a field changes and
/// cleared by the pipeline after a successful model load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
    pub config_file: PathBuf,
    pub weights_file: PathBuf,
    pub dataset: Dataset,
    #[serde(skip)]
    pub dirty: bool,
}

impl SegmentationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the host's string map. Unknown keys are ignored, missing keys
    /// keep their default, and an unknown dataset name is rejected here.
    pub fn from_param_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut params = Self::default();
        params.apply_param_map(map)?;
        Ok(params)
    }

    /// Apply a form submission on top of the current values.
    ///
    /// Always marks the record dirty, matching an explicit "apply" from the
    /// form. Nothing is changed if validation fails.
    pub fn apply_param_map(&mut self, map: &HashMap<String, String>) -> Result<()> {
        let dataset = match map.get(KEY_DATASET) {
            Some(name) => name.parse::<Dataset>()?,
            None => self.dataset,
        };
        if let Some(path) = map.get(KEY_CONFIG_FILE) {
            self.config_file = PathBuf::from(path.trim());
        }
        if let Some(path) = map.get(KEY_WEIGHTS_FILE) {
            self.weights_file = PathBuf::from(path.trim());
        }
        self.dataset = dataset;
        self.dirty = true;
        Ok(())
    }

    pub fn to_param_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                KEY_CONFIG_FILE.to_string(),
                self.config_file.display().to_string(),
            ),
            (
                KEY_WEIGHTS_FILE.to_string(),
                self.weights_file.display().to_string(),
            ),
            (KEY_DATASET.to_string(), self.dataset.to_string()),
        ])
    }

    /// Read a parameter record saved with [`Self::to_yaml_string`]. The result
    /// is dirty, like any other submission.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DeepLabError::FileSystem {
            path: path.to_path_buf(),
            operation: "parameter file read".to_string(),
            source: e,
        })?;
        let mut params: Self = serde_yaml::from_str(&text).map_err(|e| DeepLabError::Validation {
            field: path.display().to_string(),
            reason: e.to_string(),
        })?;
        params.dirty = true;
        Ok(params)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| DeepLabError::Validation {
            field: "parameters".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn has_config_file(&self) -> bool {
        !self.config_file.as_os_str().is_empty()
    }

    pub fn has_weights_file(&self) -> bool {
        !self.weights_file.as_os_str().is_empty()
    }

    /// Decide which dataset mode applies to the next call.
    ///
    /// An existing weights file forces `Custom`; a configured but missing one
    /// falls back to `Cityscapes` with a warning. A changed selector raises
    /// the dirty flag so the cached model is rebuilt. Only the existence of
    /// the weights path is checked.
    pub fn resolve(&mut self, defaults: &DefaultModel) -> Resolution {
        if self.has_weights_file() {
            let detected = if self.weights_file.exists() {
                Dataset::Custom
            } else {
                warn!(
                    "Model file {} not found, inference will use the {} pretrained model",
                    self.weights_file.display(),
                    Dataset::Cityscapes
                );
                Dataset::Cityscapes
            };
            if detected != self.dataset {
                self.dataset = detected;
                self.dirty = true;
            }
        }

        match self.dataset {
            Dataset::Cityscapes => Resolution {
                dataset: Dataset::Cityscapes,
                config_file: Some(defaults.config_file.clone()),
                weights: Some(defaults.weights_url.clone()),
            },
            Dataset::Custom => Resolution {
                dataset: Dataset::Custom,
                config_file: self.has_config_file().then(|| self.config_file.clone()),
                weights: self
                    .has_weights_file()
                    .then(|| self.weights_file.display().to_string()),
            },
        }
    }
}

/// Baked-in defaults for the predefined dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultModel {
    pub config_file: PathBuf,
    pub weights_url: String,
}

impl DefaultModel {
    pub fn new(install_dir: &Path, weights_url: impl Into<String>) -> Self {
        Self {
            config_file: install_dir
                .join("configs")
                .join(crate::model_config::DEFAULT_CONFIG_FILE),
            weights_url: weights_url.into(),
        }
    }
}

/// The outcome of parameter resolution: which mode runs, and which config
/// file and weight source feed the loader. `None` defers to the config's own
/// `MODEL.WEIGHTS` (weights) or is an error at load time (config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub dataset: Dataset,
    pub config_file: Option<PathBuf>,
    pub weights: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn defaults() -> DefaultModel {
        DefaultModel::new(Path::new("/opt/deeplab"), "https://example.org/model.onnx")
    }

    #[test]
    fn test_dataset_parsing() -> Result<()> {
        assert_eq!("Cityscapes".parse::<Dataset>()?, Dataset::Cityscapes);
        assert_eq!("custom".parse::<Dataset>()?, Dataset::Custom);
        assert!(matches!(
            "ADE20K".parse::<Dataset>(),
            Err(DeepLabError::UnsupportedDataset { name }) if name == "ADE20K"
        ));
        Ok(())
    }

    #[test]
    fn test_param_map_round_trip() -> Result<()> {
        let params = SegmentationParams {
            config_file: "cfg.yaml".into(),
            weights_file: "model.onnx".into(),
            dataset: Dataset::Custom,
            dirty: false,
        };
        let parsed = SegmentationParams::from_param_map(&params.to_param_map())?;
        assert_eq!(parsed.config_file, params.config_file);
        assert_eq!(parsed.weights_file, params.weights_file);
        assert_eq!(parsed.dataset, Dataset::Custom);
        assert!(parsed.dirty);
        Ok(())
    }

    #[test]
    fn test_yaml_file_round_trip() -> Result<()> {
        let params = SegmentationParams {
            config_file: "train/config.yaml".into(),
            weights_file: "train/model_final.onnx".into(),
            dataset: Dataset::Custom,
            dirty: false,
        };
        let file = NamedTempFile::new()?;
        fs::write(file.path(), params.to_yaml_string()?)?;

        let loaded = SegmentationParams::from_yaml_file(file.path())?;
        assert_eq!(loaded.config_file, params.config_file);
        assert_eq!(loaded.weights_file, params.weights_file);
        assert_eq!(loaded.dataset, Dataset::Custom);
        assert!(loaded.dirty);
        Ok(())
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(file.path(), "weights_file: model.onnx\n")?;

        let loaded = SegmentationParams::from_yaml_file(file.path())?;
        assert_eq!(loaded.weights_file, PathBuf::from("model.onnx"));
        assert_eq!(loaded.dataset, Dataset::Cityscapes);
        assert!(!loaded.has_config_file());

        fs::write(file.path(), "dataset: Mapillary\n")?;
        assert!(matches!(
            SegmentationParams::from_yaml_file(file.path()),
            Err(DeepLabError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_map_leaves_params_untouched() {
        let mut params = SegmentationParams::new();
        let map = HashMap::from([
            (KEY_DATASET.to_string(), "Pascal".to_string()),
            (KEY_CONFIG_FILE.to_string(), "other.yaml".to_string()),
        ]);
        assert!(params.apply_param_map(&map).is_err());
        assert_eq!(params, SegmentationParams::new());
    }

    #[test]
    fn test_existing_weights_force_custom() -> Result<()> {
        let weights = NamedTempFile::new()?;
        let mut params = SegmentationParams {
            weights_file: weights.path().to_path_buf(),
            ..Default::default()
        };

        let resolution = params.resolve(&defaults());
        assert_eq!(resolution.dataset, Dataset::Custom);
        assert_eq!(
            resolution.weights.as_deref(),
            Some(weights.path().display().to_string().as_str())
        );
        assert!(params.dirty);
        Ok(())
    }

    #[test]
    fn test_missing_weights_fall_back_to_default() {
        let mut params = SegmentationParams {
            config_file: "custom.yaml".into(),
            weights_file: "/nonexistent/model.onnx".into(),
            dataset: Dataset::Custom,
            dirty: false,
        };

        let resolution = params.resolve(&defaults());
        assert_eq!(resolution.dataset, Dataset::Cityscapes);
        assert_eq!(resolution.config_file, Some(defaults().config_file));
        assert_eq!(resolution.weights, Some(defaults().weights_url));
        assert_eq!(params.dataset, Dataset::Cityscapes);
        assert!(params.dirty);
    }

    #[test]
    fn test_default_mode_ignores_custom_paths() {
        let mut params = SegmentationParams {
            config_file: "custom.yaml".into(),
            ..Default::default()
        };

        let resolution = params.resolve(&defaults());
        assert_eq!(
            resolution.config_file,
            Some(PathBuf::from(
                "/opt/deeplab/configs/deeplab_v3_plus_R_103_os16_mg124_poly_90k_bs16.yaml"
            ))
        );
        assert!(!params.dirty);
    }
}
