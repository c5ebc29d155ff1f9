pub mod config;
pub mod errors;
pub mod labels;
pub mod legend;
pub mod model;
pub mod model_config;
pub mod params;
pub mod pipeline;
pub mod processing;
pub mod progress;
pub mod traits;
pub mod weights;

pub mod mocks;

pub use config::Config;
pub use errors::{DeepLabError, Result};
pub use labels::{ClassEntry, ClassTable};
pub use legend::{draw_legend, LegendFont, LegendLayout};
pub use model::{OrtLoader, OrtNetwork};
pub use model_config::ModelConfig;
pub use params::{Dataset, SegmentationParams};
pub use pipeline::{LoadedModel, PipelineSettings, SegmentationPipeline, TaskInfo};
pub use processing::{argmax_labels, preprocess, LabelMask, NetworkInput};
pub use progress::{FileTask, ProgressTracker, RunSummary};
pub use traits::*;
pub use weights::WeightSource;
