use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use image::{DynamicImage, RgbImage};
use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{DeepLabError, Result};
use crate::labels::ClassTable;
use crate::model_config::ModelConfig;
use crate::processing::{LabelMask, NetworkInput};
use crate::traits::{LoadRequest, NetworkLoader, SegmentationNetwork, TaskContext};

/// Test network that labels pixel `(x, y)` with class `(x + y) % classes`.
///
/// Records the shape of the last tensor it was fed.
#[derive(Debug, Clone)]
pub struct MockSegmentationNetwork {
    pub num_classes: usize,
    last_input_shape: Arc<Mutex<Option<Vec<usize>>>>,
}

impl MockSegmentationNetwork {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            last_input_shape: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_input_shape(&self) -> Option<Vec<usize>> {
        self.last_input_shape.lock().clone()
    }
}

impl SegmentationNetwork for MockSegmentationNetwork {
    fn forward(&self, input: &NetworkInput) -> Result<Array3<f32>> {
        *self.last_input_shape.lock() = Some(input.tensor.shape().to_vec());
        let (height, width) = (input.height as usize, input.width as usize);
        let classes = self.num_classes;
        if classes == 0 {
            return Ok(Array3::zeros((0, height, width)));
        }
        Ok(Array3::from_shape_fn((classes, height, width), |(c, y, x)| {
            if c == (x + y) % classes {
                1.0
            } else {
                0.0
            }
        }))
    }
}

/// Test loader that counts loads and records the configuration it was given.
///
/// Clones share their counters, so a test can keep a handle while the
/// pipeline owns the loader.
#[derive(Debug, Clone)]
pub struct MockLoader {
    gpu: bool,
    loads: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
    last_config: Arc<Mutex<Option<ModelConfig>>>,
    last_input_shape: Arc<Mutex<Option<Vec<usize>>>>,
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            gpu: false,
            loads: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicBool::new(false)),
            last_config: Arc::new(Mutex::new(None)),
            last_input_shape: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Make the next `load` fail with a weight error.
    pub fn fail_next_load(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn last_config(&self) -> Option<ModelConfig> {
        self.last_config.lock().clone()
    }

    /// `[N, C, H, W]` of the last tensor any network from this loader saw.
    pub fn last_input_shape(&self) -> Option<Vec<usize>> {
        self.last_input_shape.lock().clone()
    }
}

impl NetworkLoader for MockLoader {
    type Network = MockSegmentationNetwork;

    fn gpu_available(&self) -> bool {
        self.gpu
    }

    fn load(&self, request: &LoadRequest<'_>) -> Result<Self::Network> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DeepLabError::weight_load(
                request.weights,
                "simulated load failure",
            ));
        }

        let num_classes = request
            .config
            .get("MODEL.SEM_SEG_HEAD.NUM_CLASSES")
            .and_then(serde_yaml::Value::as_u64)
            .ok_or_else(|| DeepLabError::weight_load(request.weights, "NUM_CLASSES not set"))?;

        *self.last_config.lock() = Some(request.config.clone());
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(MockSegmentationNetwork {
            num_classes: num_classes as usize,
            last_input_shape: Arc::clone(&self.last_input_shape),
        })
    }
}

/// In-memory host task: holds the input and captures everything published.
#[derive(Debug, Default)]
pub struct MemoryTask {
    pub image: Option<DynamicImage>,
    pub mask: Option<LabelMask>,
    pub class_names: Vec<String>,
    pub legend: Option<RgbImage>,
    pub overlay: Option<RgbImage>,
    pub progress: usize,
}

impl MemoryTask {
    pub fn with_image(image: DynamicImage) -> Self {
        Self {
            image: Some(image),
            ..Default::default()
        }
    }
}

impl TaskContext for MemoryTask {
    fn input_image(&self) -> Option<&DynamicImage> {
        self.image.as_ref()
    }

    fn set_mask(&mut self, mask: LabelMask, classes: &ClassTable) {
        self.mask = Some(mask);
        self.class_names = classes.names().map(str::to_string).collect();
    }

    fn set_legend(&mut self, legend: RgbImage) {
        self.legend = Some(legend);
    }

    fn set_color_overlay(&mut self, overlay: RgbImage) {
        self.overlay = Some(overlay);
    }

    fn emit_step_progress(&mut self) {
        self.progress += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightSource;
    use std::path::Path;

    #[test]
    fn test_mock_network_shape() -> Result<()> {
        let network = MockSegmentationNetwork::new(3);
        let input = NetworkInput {
            tensor: Array4::zeros((1, 3, 8, 8)),
            height: 5,
            width: 7,
        };
        let scores = network.forward(&input)?;
        assert_eq!(scores.dim(), (3, 5, 7));
        assert_eq!(scores[[2, 1, 1]], 1.0);
        assert_eq!(network.last_input_shape(), Some(vec![1, 3, 8, 8]));
        Ok(())
    }

    #[test]
    fn test_mock_loader_counts_and_fails() {
        let loader = MockLoader::new();
        let mut config = ModelConfig::base();
        config.set("MODEL.SEM_SEG_HEAD.NUM_CLASSES", 4);
        let weights = WeightSource::Local("w.onnx".into());
        let request = LoadRequest {
            config: &config,
            weights: &weights,
            cache_dir: Path::new("/tmp"),
        };

        assert!(loader.load(&request).is_ok());
        loader.fail_next_load();
        assert!(loader.load(&request).is_err());
        assert!(loader.load(&request).is_ok());
        assert_eq!(loader.load_count(), 2);
    }
}
