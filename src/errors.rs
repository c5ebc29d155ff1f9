use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the segmentation task.
///
/// Load failures (`ConfigLoad`, `WeightLoad`, `UnsupportedDataset`) name the
/// file or URL that failed so the host can show something actionable. Every
/// variant is fatal for the current call: nothing is published after one is
/// raised.
#[derive(Error, Debug)]
pub enum DeepLabError {
    #[error("Config load error: {reason} ({path:?})")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("Weight load error: {reason} (source: {source_desc})")]
    WeightLoad { source_desc: String, reason: String },

    #[error("Unsupported dataset: {name}")]
    UnsupportedDataset { name: String },

    #[error("No input image provided")]
    MissingInput,

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DeepLabError>;

impl DeepLabError {
    pub(crate) fn config_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn weight_load(source_desc: impl ToString, reason: impl ToString) -> Self {
        Self::WeightLoad {
            source_desc: source_desc.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn inference(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::Inference {
            operation: operation.into(),
            source: reason.into(),
        }
    }
}

/// Convert anyhow errors to validation errors.
///
/// Only the binary deals in anyhow; anything crossing back into the library
/// is treated as bad user input.
impl From<anyhow::Error> for DeepLabError {
    fn from(err: anyhow::Error) -> Self {
        DeepLabError::Validation {
            field: "input".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build `FileSystem`
/// directly; this is the fallback for bare `?`.
impl From<std::io::Error> for DeepLabError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for DeepLabError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for DeepLabError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor reshaping around the forward pass, so they
/// are reported as inference failures.
impl From<ndarray::ShapeError> for DeepLabError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_load_names_source() {
        let err = DeepLabError::weight_load("https://example.org/w.onnx", "connection refused");
        let message = err.to_string();
        assert!(message.contains("https://example.org/w.onnx"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: DeepLabError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, DeepLabError::FileSystem { .. }));
    }
}
