use std::path::Path;

use image::{DynamicImage, RgbImage};
use ndarray::prelude::*;

use crate::{
    errors::Result,
    labels::ClassTable,
    model_config::ModelConfig,
    processing::{LabelMask, NetworkInput},
    weights::WeightSource,
};

/// A weight-loaded segmentation network in inference mode.
pub trait SegmentationNetwork: Send + Sync {
    /// Run the forward pass and return a `(C, H, W)` score map already
    /// resized to `input.height` x `input.width`.
    fn forward(&self, input: &NetworkInput) -> Result<Array3<f32>>;
}

/// Everything needed to build a network.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub config: &'a ModelConfig,
    pub weights: &'a WeightSource,
    /// Scoped to this load only; remote checkpoints are cached here.
    pub cache_dir: &'a Path,
}

/// Builds networks from a resolved configuration.
pub trait NetworkLoader {
    type Network: SegmentationNetwork;

    /// Whether GPU execution is possible. When false the configuration is
    /// rewritten for CPU before `load` is called.
    fn gpu_available(&self) -> bool;

    fn load(&self, request: &LoadRequest<'_>) -> Result<Self::Network>;
}

/// The host side of a task run: input and output slots plus progress.
pub trait TaskContext {
    fn input_image(&self) -> Option<&DynamicImage>;

    /// Publish the label mask along with the class table it indexes into.
    fn set_mask(&mut self, mask: LabelMask, classes: &ClassTable);

    fn set_legend(&mut self, legend: RgbImage);

    /// Input image with the class colors blended in. Hosts that render their
    /// own color maps can ignore it.
    fn set_color_overlay(&mut self, _overlay: RgbImage) {}

    /// Called once per major phase (model ready, inference done).
    fn emit_step_progress(&mut self);
}
