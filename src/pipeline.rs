use std::{collections::HashMap, path::PathBuf};

use image::RgbImage;
use log::{debug, info};

use crate::{
    errors::{DeepLabError, Result},
    labels::{cityscapes_class_names, ClassTable, DEFAULT_COLOR_SEED},
    legend::{draw_legend, LegendFont},
    model_config::ModelConfig,
    params::{Dataset, DefaultModel, Resolution, SegmentationParams},
    processing::{argmax_labels, preprocess, PREDEFINED_INPUT_SIZE},
    traits::{LoadRequest, NetworkLoader, SegmentationNetwork, TaskContext},
    weights::WeightSource,
};

pub const DEFAULT_WEIGHTS_URL: &str = "https://dl.fbaipublicfiles.com/detectron2/DeepLab/\
    Cityscapes-SemanticSegmentation/deeplab_v3_plus_R_103_os16_mg124_poly_90k_bs16/\
    28054032/model_final_a8a355.pkl";

/// Number of `emit_step_progress` calls per run.
pub const PROGRESS_STEPS: usize = 2;

/// Static description of the task, as shown by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: &'static str,
    pub short_description: &'static str,
    pub authors: &'static str,
    pub article: &'static str,
    pub journal: &'static str,
    pub year: u16,
    pub license: &'static str,
    pub version: &'static str,
    pub keywords: &'static [&'static str],
}

impl TaskInfo {
    pub const fn deeplabv3plus() -> Self {
        Self {
            name: "infer_deeplabv3plus",
            short_description: "DeepLabv3+ inference for semantic segmentation.",
            authors: "Liang-Chieh Chen, Yukun Zhu, George Papandreou, Florian Schroff, Hartwig Adam",
            article: "Encoder-Decoder with Atrous Separable Convolution for Semantic Image Segmentation",
            journal: "ECCV 2018",
            year: 2018,
            license: "Apache-2.0",
            version: env!("CARGO_PKG_VERSION"),
            keywords: &["semantic", "segmentation", "deeplab", "atrous", "convolution", "encoder", "decoder"],
        }
    }
}

/// Pipeline-level settings that do not change between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Root holding `configs/`; also the parent of the default cache.
    pub install_dir: PathBuf,
    pub default_weights_url: String,
    /// Defaults to `<install_dir>/models`.
    pub cache_dir: Option<PathBuf>,
    pub render_legend: bool,
    pub color_overlay: bool,
    pub overlay_alpha: f32,
    pub color_seed: u64,
    /// `KEY=VALUE` config overrides applied after the config is resolved.
    pub config_overrides: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            default_weights_url: DEFAULT_WEIGHTS_URL.to_string(),
            cache_dir: None,
            render_legend: true,
            color_overlay: false,
            overlay_alpha: 0.5,
            color_seed: DEFAULT_COLOR_SEED,
            config_overrides: Vec::new(),
        }
    }
}

impl PipelineSettings {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join("models"))
    }

    pub fn default_model(&self) -> DefaultModel {
        DefaultModel::new(&self.install_dir, self.default_weights_url.clone())
    }
}

/// The cached result of a successful load.
#[derive(Debug)]
pub struct LoadedModel<N> {
    pub dataset: Dataset,
    pub config: ModelConfig,
    pub classes: ClassTable,
    pub network: N,
    legend: Option<RgbImage>,
}

impl<N> LoadedModel<N> {
    pub fn legend(&self) -> Option<&RgbImage> {
        self.legend.as_ref()
    }
}

/// Lazily loads a network and turns images into label masks.
///
/// The loaded model is cached on the instance and rebuilt only when none is
/// loaded or the parameters are dirty. A failed rebuild keeps the previous
/// model. Runs take `&mut self`; share an instance across threads only behind
/// a lock.
pub struct SegmentationPipeline<L: NetworkLoader> {
    loader: L,
    settings: PipelineSettings,
    params: SegmentationParams,
    font: Option<LegendFont>,
    state: Option<LoadedModel<L::Network>>,
    load_count: usize,
}

impl<L: NetworkLoader> SegmentationPipeline<L> {
    pub fn new(loader: L, settings: PipelineSettings) -> Self {
        Self {
            loader,
            settings,
            params: SegmentationParams::default(),
            font: None,
            state: None,
            load_count: 0,
        }
    }

    pub fn with_font(mut self, font: Option<LegendFont>) -> Self {
        self.font = font;
        self
    }

    pub fn with_params(mut self, params: SegmentationParams) -> Self {
        self.set_params(params);
        self
    }

    pub const fn info(&self) -> TaskInfo {
        TaskInfo::deeplabv3plus()
    }

    pub const fn progress_steps(&self) -> usize {
        PROGRESS_STEPS
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    /// Direct field access for the parameter form. Set `dirty` after edits
    /// that should trigger a reload.
    pub fn params_mut(&mut self) -> &mut SegmentationParams {
        &mut self.params
    }

    pub fn set_params(&mut self, mut params: SegmentationParams) {
        params.dirty = true;
        self.params = params;
    }

    pub fn apply_param_map(&mut self, map: &HashMap<String, String>) -> Result<()> {
        self.params.apply_param_map(map)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loaded(&self) -> Option<&LoadedModel<L::Network>> {
        self.state.as_ref()
    }

    /// Successful model loads so far.
    pub const fn load_count(&self) -> usize {
        self.load_count
    }

    /// Run one task step: resolve parameters, (re)load if needed, infer and
    /// publish. Nothing reaches `ctx` unless every step succeeds.
    pub fn run<T: TaskContext>(&mut self, ctx: &mut T) -> Result<()> {
        let image = ctx
            .input_image()
            .ok_or(DeepLabError::MissingInput)?
            .to_rgb8();

        let resolution = self.params.resolve(&self.settings.default_model());
        self.ensure_loaded(&resolution)?;
        let loaded = self
            .state
            .as_ref()
            .ok_or_else(|| DeepLabError::inference("model load", "no model loaded"))?;
        ctx.emit_step_progress();

        let target = loaded
            .dataset
            .is_predefined()
            .then_some(PREDEFINED_INPUT_SIZE);
        let input = preprocess(&image, target, loaded.config.channel_order());
        let scores = loaded.network.forward(&input)?;

        let expected = (loaded.classes.len(), image.height() as usize, image.width() as usize);
        if scores.dim() != expected {
            return Err(DeepLabError::inference(
                "score map check",
                format!(
                    "expected (classes, height, width) = {expected:?}, network returned {:?}",
                    scores.dim()
                ),
            ));
        }

        let mask = argmax_labels(scores.view())?;
        let overlay = if self.settings.color_overlay {
            Some(mask.overlay(&image, &loaded.classes, self.settings.overlay_alpha)?)
        } else {
            None
        };
        debug!("Segmented {}x{} image", mask.width(), mask.height());

        ctx.set_mask(mask, &loaded.classes);
        if let Some(overlay) = overlay {
            ctx.set_color_overlay(overlay);
        }
        if let Some(legend) = loaded.legend() {
            ctx.set_legend(legend.clone());
        }
        ctx.emit_step_progress();
        Ok(())
    }

    fn ensure_loaded(&mut self, resolution: &Resolution) -> Result<()> {
        if self.state.is_none() || self.params.dirty {
            let loaded = self.build_model(resolution)?;
            info!(
                "Loaded {} model with {} classes",
                loaded.dataset,
                loaded.classes.len()
            );
            self.state = Some(loaded);
            self.params.dirty = false;
            self.load_count += 1;
        }
        Ok(())
    }

    /// Build a complete model off to the side; the cache is only touched by
    /// the caller once this succeeds.
    fn build_model(&self, resolution: &Resolution) -> Result<LoadedModel<L::Network>> {
        let (mut config, names) = match resolution.dataset {
            Dataset::Cityscapes => self.predefined_config(resolution)?,
            Dataset::Custom => custom_config(resolution)?,
        };

        config.merge_from_list(&self.settings.config_overrides)?;
        if !self.loader.gpu_available() {
            debug!("No GPU available, configuring for CPU");
            config.apply_cpu_overrides();
        }

        let weights = config
            .weights()
            .map(WeightSource::parse)
            .ok_or_else(|| DeepLabError::weight_load("<none>", "no weights configured"))?;
        let cache_dir = self.settings.cache_dir();
        let network = self.loader.load(&LoadRequest {
            config: &config,
            weights: &weights,
            cache_dir: &cache_dir,
        })?;

        let classes = ClassTable::from_names(&names, self.settings.color_seed);
        let legend = self
            .settings
            .render_legend
            .then(|| draw_legend(&classes, self.font.as_ref()));

        Ok(LoadedModel {
            dataset: resolution.dataset,
            config,
            classes,
            network,
            legend,
        })
    }

    fn predefined_config(&self, resolution: &Resolution) -> Result<(ModelConfig, Vec<String>)> {
        let default = self.settings.default_model();
        let config_file = resolution.config_file.as_ref().unwrap_or(&default.config_file);

        let mut config = ModelConfig::base();
        config.apply_deeplab_defaults();
        config.merge_from_file(config_file)?;
        config.set(
            "MODEL.WEIGHTS",
            resolution
                .weights
                .clone()
                .unwrap_or(default.weights_url),
        );

        let names = cityscapes_class_names();
        config.set_class_names(&names);
        Ok((config, names))
    }
}

fn custom_config(resolution: &Resolution) -> Result<(ModelConfig, Vec<String>)> {
    let config_file = resolution.config_file.as_ref().ok_or_else(|| {
        DeepLabError::config_load("", "the custom dataset needs a configuration file")
    })?;

    let mut config = ModelConfig::from_file(config_file)?;
    let names = config
        .class_names()
        .filter(|names| !names.is_empty())
        .ok_or_else(|| DeepLabError::config_load(config_file, "CLASS_NAMES is missing or empty"))?;
    config.apply_deeplab_defaults();
    config.set_default("MODEL.SEM_SEG_HEAD.NUM_CLASSES", names.len() as u64);
    if let Some(weights) = &resolution.weights {
        config.set("MODEL.WEIGHTS", weights.as_str());
    }
    Ok((config, names))
}
