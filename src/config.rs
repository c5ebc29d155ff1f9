use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;

use crate::errors::Result;
use crate::params::{Dataset, SegmentationParams};
use crate::pipeline::{PipelineSettings, DEFAULT_WEIGHTS_URL};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image file, or a directory searched recursively for images
    pub input: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short, long, default_value = "Cityscapes", value_parser = parse_dataset)]
    pub dataset: Dataset,

    /// Config file written by a training run (custom dataset)
    #[arg(short, long)]
    pub config_file: Option<PathBuf>,

    /// Weights of a custom model; selects the custom dataset when it exists
    #[arg(short, long)]
    pub weights_file: Option<PathBuf>,

    /// Saved parameter record (YAML); replaces --dataset, --config-file and --weights-file
    #[arg(long, conflicts_with_all = ["config_file", "weights_file"])]
    pub params_file: Option<PathBuf>,

    /// Where downloaded weights are cached [default: <install-dir>/models]
    #[arg(long, env = "DEEPLAB_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Directory holding the bundled `configs/`
    #[arg(long)]
    pub install_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_WEIGHTS_URL)]
    pub default_weights_url: String,

    /// TrueType font for legend labels
    #[arg(long)]
    pub font: Option<PathBuf>,

    #[arg(long)]
    pub no_legend: bool,

    /// Also write the input blended with the class colors
    #[arg(long)]
    pub color_overlay: bool,

    #[arg(long, default_value_t = 0.5)]
    pub overlay_alpha: f32,

    /// Format of the legend and overlay images; masks are always 16-bit PNG
    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// Model config override, may be repeated
    #[arg(long = "opt", value_name = "KEY=VALUE")]
    pub config_overrides: Vec<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn params(&self) -> Result<SegmentationParams> {
        if let Some(path) = &self.params_file {
            return SegmentationParams::from_yaml_file(path);
        }
        Ok(SegmentationParams {
            config_file: self.config_file.clone().unwrap_or_default(),
            weights_file: self.weights_file.clone().unwrap_or_default(),
            dataset: self.dataset,
            dirty: true,
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let defaults = PipelineSettings::default();
        PipelineSettings {
            install_dir: self.install_dir.clone().unwrap_or(defaults.install_dir),
            default_weights_url: self.default_weights_url.clone(),
            cache_dir: self.cache_dir.clone(),
            render_legend: !self.no_legend,
            color_overlay: self.color_overlay,
            overlay_alpha: self.overlay_alpha,
            color_seed: defaults.color_seed,
            config_overrides: self.config_overrides.clone(),
        }
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn parse_dataset(s: &str) -> std::result::Result<Dataset, String> {
    s.parse::<Dataset>().map_err(|e| e.to_string())
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
