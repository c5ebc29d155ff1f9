use std::fmt::Display;

use image::{imageops, imageops::FilterType, ImageBuffer, Luma};
use log::{debug, info};
use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    value::TensorRef,
};
use parking_lot::Mutex;

use crate::{
    errors::{DeepLabError, Result},
    processing::NetworkInput,
    traits::{LoadRequest, NetworkLoader, SegmentationNetwork},
    weights::WeightSource,
};

/// Loads ONNX exports of the segmentation network through ONNX Runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtLoader {
    pub device_id: i32,
}

impl OrtLoader {
    pub const fn new(device_id: i32) -> Self {
        Self { device_id }
    }
}

impl NetworkLoader for OrtLoader {
    type Network = OrtNetwork;

    /// Reports whether the CUDA provider is compiled into ONNX Runtime, not
    /// whether a device is present. On a CPU-only host with a `cuda` build the
    /// config keeps its GPU settings; the providers then fail to register and
    /// ort runs the session on its CPU provider. The norm settings only matter
    /// to how the graph was exported, so inference still succeeds.
    fn gpu_available(&self) -> bool {
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }

    fn load(&self, request: &LoadRequest<'_>) -> Result<OrtNetwork> {
        let weights = request.weights;
        if !weights.is_onnx() {
            return Err(DeepLabError::weight_load(
                weights,
                "not an ONNX export; point --default-weights-url or the weights file at a .onnx model",
            ));
        }
        let path = weights.fetch(request.cache_dir)?;

        let providers: Vec<ExecutionProviderDispatch> = if request.config.is_cpu() {
            Vec::new()
        } else {
            vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
            ]
        };

        let session = SessionBuilder::new()
            .map_err(|e| load_error(weights, "session builder init", e))?
            .with_execution_providers(providers)
            .map_err(|e| load_error(weights, "execution provider setup", e))?
            .with_memory_pattern(true)
            .map_err(|e| load_error(weights, "memory pattern setup", e))?
            .commit_from_file(&path)
            .map_err(|e| load_error(weights, "checkpoint load", e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| DeepLabError::weight_load(weights, "model declares no inputs"))?;
        if session.outputs.is_empty() {
            return Err(DeepLabError::weight_load(weights, "model declares no outputs"));
        }

        info!("Loaded {} (input `{input_name}`)", path.display());
        Ok(OrtNetwork {
            input_name,
            session: Mutex::new(session),
        })
    }
}

fn load_error(weights: &WeightSource, operation: &str, err: impl Display) -> DeepLabError {
    DeepLabError::weight_load(weights, format!("{operation}: {err}"))
}

/// An ONNX Runtime session producing `(1, C, h, w)` logits.
pub struct OrtNetwork {
    input_name: String,
    session: Mutex<Session>,
}

impl OrtNetwork {
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        Ok(outputs[0]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

impl SegmentationNetwork for OrtNetwork {
    fn forward(&self, input: &NetworkInput) -> Result<Array3<f32>> {
        let logits = self.predict(input.tensor.view())?;
        if logits.shape()[0] != 1 {
            return Err(DeepLabError::inference(
                "forward",
                format!("expected batch size 1, got {}", logits.shape()[0]),
            ));
        }
        let logits = logits.index_axis_move(Axis(0), 0);
        Ok(resize_scores(logits, input.width, input.height))
    }
}

/// Resize every class channel of a `(C, h, w)` score map to `width` x
/// `height` with bilinear filtering.
pub fn resize_scores(scores: Array3<f32>, width: u32, height: u32) -> Array3<f32> {
    let (classes, h, w) = scores.dim();
    if (h, w) == (height as usize, width as usize) {
        return scores;
    }
    debug!("Resizing {classes} score channels from {w}x{h} to {width}x{height}");

    let mut resized = Array3::<f32>::zeros((classes, height as usize, width as usize));
    for (channel, mut target) in scores.outer_iter().zip(resized.outer_iter_mut()) {
        let plane: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
            Luma([channel[[y as usize, x as usize]]])
        });
        let plane = imageops::resize(&plane, width, height, FilterType::Triangle);
        for (value, pixel) in target.iter_mut().zip(plane.pixels()) {
            *value = pixel.0[0];
        }
    }
    resized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_scores_noop_at_target_size() {
        let scores = Array3::from_shape_fn((2, 3, 4), |(c, y, x)| (c * 100 + y * 10 + x) as f32);
        let resized = resize_scores(scores.clone(), 4, 3);
        assert_eq!(resized, scores);
    }

    #[test]
    fn test_resize_scores_upsamples_each_channel() {
        let mut scores = Array3::<f32>::zeros((2, 2, 2));
        scores.index_axis_mut(Axis(0), 1).fill(3.0);

        let resized = resize_scores(scores, 8, 6);
        assert_eq!(resized.dim(), (2, 6, 8));
        assert!(resized.index_axis(Axis(0), 0).iter().all(|v| v.abs() < 1e-5));
        assert!(resized
            .index_axis(Axis(0), 1)
            .iter()
            .all(|v| (v - 3.0).abs() < 1e-4));
    }

    #[test]
    fn test_missing_checkpoint_is_weight_error() {
        use crate::model_config::ModelConfig;
        use std::path::Path;

        let config = ModelConfig::base();
        let weights = WeightSource::Local("/nonexistent/model.onnx".into());
        let result = OrtLoader::default().load(&LoadRequest {
            config: &config,
            weights: &weights,
            cache_dir: Path::new("/tmp"),
        });
        assert!(matches!(result, Err(DeepLabError::WeightLoad { .. })));
    }

    #[test]
    fn test_non_onnx_checkpoint_rejected_before_download() -> Result<()> {
        use crate::model_config::ModelConfig;
        use tempfile::TempDir;

        let cache = TempDir::new()?;
        let cache_dir = cache.path().join("models");
        let config = ModelConfig::base();
        let url = "https://unreachable.invalid/deeplab/model_final.pkl";
        let weights = WeightSource::Remote(url.to_string());

        let err = OrtLoader::default()
            .load(&LoadRequest {
                config: &config,
                weights: &weights,
                cache_dir: &cache_dir,
            })
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains(url));
        assert!(err.contains("--default-weights-url"));
        assert!(!cache_dir.exists());
        Ok(())
    }
}
