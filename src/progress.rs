use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, warn};
use walkdir::WalkDir;

use crate::{
    errors::{DeepLabError, Result},
    labels::ClassTable,
    processing::LabelMask,
    traits::{NetworkLoader, TaskContext},
    SegmentationPipeline,
};

/// Host context for the command line: reads one image from disk and writes
/// the published outputs next to each other.
pub struct FileTask<'a> {
    image: DynamicImage,
    progress: &'a ProgressBar,
    mask: Option<LabelMask>,
    legend: Option<RgbImage>,
    overlay: Option<RgbImage>,
}

impl<'a> FileTask<'a> {
    pub fn open(path: &Path, progress: &'a ProgressBar) -> Result<Self> {
        let image = image::open(path).map_err(|e| DeepLabError::ImageProcessing {
            path: path.display().to_string(),
            operation: "image read".to_string(),
            source: Box::new(e),
        })?;
        Ok(Self {
            image,
            progress,
            mask: None,
            legend: None,
            overlay: None,
        })
    }

    /// Write `<stem>_mask.png` plus the legend and overlay if they were
    /// published. Returns the files written.
    pub fn save(&self, output_dir: &Path, stem: &str, format: ImageFormat) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(output_dir).map_err(|e| DeepLabError::FileSystem {
            path: output_dir.to_path_buf(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let extension = format.extensions_str().first().copied().unwrap_or("png");
        let mut written = Vec::new();

        if let Some(mask) = &self.mask {
            let path = output_dir.join(format!("{stem}_mask.png"));
            save_image(&path, || mask.as_image().save_with_format(&path, ImageFormat::Png))?;
            written.push(path);
        }
        if let Some(legend) = &self.legend {
            let path = output_dir.join(format!("{stem}_legend.{extension}"));
            save_image(&path, || legend.save_with_format(&path, format))?;
            written.push(path);
        }
        if let Some(overlay) = &self.overlay {
            let path = output_dir.join(format!("{stem}_overlay.{extension}"));
            save_image(&path, || overlay.save_with_format(&path, format))?;
            written.push(path);
        }
        Ok(written)
    }
}

fn save_image(path: &Path, save: impl FnOnce() -> image::ImageResult<()>) -> Result<()> {
    save().map_err(|e| DeepLabError::ImageProcessing {
        path: path.display().to_string(),
        operation: "image save".to_string(),
        source: Box::new(e),
    })
}

impl TaskContext for FileTask<'_> {
    fn input_image(&self) -> Option<&DynamicImage> {
        Some(&self.image)
    }

    fn set_mask(&mut self, mask: LabelMask, _classes: &ClassTable) {
        self.mask = Some(mask);
    }

    fn set_legend(&mut self, legend: RgbImage) {
        self.legend = Some(legend);
    }

    fn set_color_overlay(&mut self, overlay: RgbImage) {
        self.overlay = Some(overlay);
    }

    fn emit_step_progress(&mut self) {
        self.progress.inc(1);
    }
}

/// Outcome of a batch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Drives one pipeline over every image under an input path.
///
/// Images run one after another through the same pipeline, so the model is
/// loaded once for the whole batch.
pub struct ProgressTracker {
    progress_bar: ProgressBar,
    input_root: PathBuf,
    image_paths: Vec<PathBuf>,
}

impl ProgressTracker {
    pub fn new(input: &Path, steps_per_image: usize) -> Result<Self> {
        let (input_root, image_paths) = if input.is_file() {
            let root = input.parent().unwrap_or(Path::new("")).to_path_buf();
            (root, vec![input.to_path_buf()])
        } else {
            (input.to_path_buf(), collect_images(input))
        };

        let progress_bar = ProgressBar::new((image_paths.len() * steps_per_image) as u64);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map_err(|e| DeepLabError::Validation {
                    field: "progress template".to_string(),
                    reason: e.to_string(),
                })?
                .progress_chars("#>-"),
        );

        Ok(Self {
            progress_bar,
            input_root,
            image_paths,
        })
    }

    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    /// Segment every image, mirroring the input layout under `output_dir`.
    ///
    /// A failing image is logged and skipped; a model load failure stops the
    /// batch since every later image would fail the same way.
    pub fn process_images<L: NetworkLoader>(
        &self,
        pipeline: &mut SegmentationPipeline<L>,
        output_dir: &Path,
        format: ImageFormat,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if self.image_paths.is_empty() {
            warn!("No images found under {}", self.input_root.display());
            return Ok(summary);
        }

        for path in &self.image_paths {
            self.progress_bar
                .set_message(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
            match self.process_image(pipeline, path, output_dir, format) {
                Ok(()) => summary.processed += 1,
                Err(
                    e @ (DeepLabError::ConfigLoad { .. }
                    | DeepLabError::WeightLoad { .. }
                    | DeepLabError::UnsupportedDataset { .. }),
                ) => {
                    self.progress_bar.abandon();
                    return Err(e);
                }
                Err(e) => {
                    error!("Failed to process {}: {e}", path.display());
                    summary.failed += 1;
                }
            }
        }

        self.progress_bar.finish_with_message("done");
        Ok(summary)
    }

    fn process_image<L: NetworkLoader>(
        &self,
        pipeline: &mut SegmentationPipeline<L>,
        path: &Path,
        output_dir: &Path,
        format: ImageFormat,
    ) -> Result<()> {
        let mut task = FileTask::open(path, &self.progress_bar)?;
        pipeline.run(&mut task)?;

        let relative = path.strip_prefix(&self.input_root).unwrap_or(path);
        let target_dir = output_dir.join(relative.parent().unwrap_or(Path::new("")));
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        task.save(&target_dir, &stem, format)?;
        Ok(())
    }
}

fn collect_images(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| ImageFormat::from_path(e.path()).is_ok())
        .map(|e| e.into_path())
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::MockLoader, pipeline::PipelineSettings};
    use image::Rgb;
    use tempfile::TempDir;

    #[test]
    fn test_collects_images_recursively() -> Result<()> {
        let dir = TempDir::new()?;
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested)?;
        RgbImage::new(2, 2).save(dir.path().join("one.png"))?;
        RgbImage::new(2, 2).save(nested.join("two.png"))?;
        fs::write(dir.path().join("notes.txt"), "x")?;

        let tracker = ProgressTracker::new(dir.path(), 2)?;
        assert_eq!(tracker.image_paths().len(), 2);
        Ok(())
    }

    #[test]
    fn test_batch_mirrors_layout_and_loads_once() -> Result<()> {
        let input = TempDir::new()?;
        let output = TempDir::new()?;
        let nested = input.path().join("street");
        fs::create_dir_all(&nested)?;
        RgbImage::from_pixel(8, 6, Rgb([1, 2, 3])).save(input.path().join("a.png"))?;
        RgbImage::from_pixel(5, 4, Rgb([4, 5, 6])).save(nested.join("b.png"))?;

        let mut pipeline = SegmentationPipeline::new(MockLoader::new(), PipelineSettings::default());
        let tracker = ProgressTracker::new(input.path(), pipeline.progress_steps())?;
        let summary = tracker.process_images(&mut pipeline, output.path(), ImageFormat::Png)?;

        assert_eq!(summary, RunSummary { processed: 2, failed: 0 });
        assert_eq!(pipeline.load_count(), 1);
        assert!(output.path().join("a_mask.png").is_file());
        assert!(output.path().join("a_legend.png").is_file());
        assert!(output.path().join("street/b_mask.png").is_file());

        let mask = image::open(output.path().join("street/b_mask.png"))?;
        assert_eq!((mask.width(), mask.height()), (5, 4));
        Ok(())
    }
}
