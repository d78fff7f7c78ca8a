//! Error types for action-fusion-rs.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use action_fusion_rs::{FusionConfig, FusionError};
//!
//! # fn main() {
//! match FusionConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(FusionError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for action-fusion-rs operations.
pub type Result<T> = std::result::Result<T, FusionError>;

/// Errors that can occur while building, training or evaluating a fusion model.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FusionError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Architecture tag that is not in the registry.
    #[error("unknown architecture '{0}' (expected one of resnet18, resnet34, resnet50)")]
    UnknownArchitecture(String),

    /// A stream adapter produced a feature map that cannot be concatenated.
    #[error("stream '{stream}' adapter output is not concatenation compatible: expected {expected}, got {got}")]
    StreamShape {
        /// Stream whose adapter is misconfigured.
        stream: String,
        /// Expected shape description.
        expected: String,
        /// Observed shape.
        got: String,
    },

    /// Dataset or clip index error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV metrics log error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl FusionError {
    /// Create a stream shape error.
    pub fn stream_shape(
        stream: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::StreamShape {
            stream: stream.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for FusionError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FusionError::Template(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for FusionError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        FusionError::Checkpoint(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = FusionError::Config("rgb needs nb_per_stack = 1".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: rgb needs nb_per_stack = 1"
        );
    }

    #[test]
    fn test_stream_shape_names_stream() {
        let error = FusionError::stream_shape("flow", "[512, 4, 4]", "[1024, 4, 4]");
        let msg = error.to_string();
        assert!(msg.contains("'flow'"));
        assert!(msg.contains("[512, 4, 4]"));
        assert!(msg.contains("[1024, 4, 4]"));
    }

    #[test]
    fn test_unknown_architecture_message() {
        let error = FusionError::UnknownArchitecture("vgg16".into());
        assert!(error.to_string().contains("vgg16"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: FusionError = io_error.into();
        assert!(matches!(error, FusionError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: FusionError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: FusionError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: FusionError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert!(error.source().is_some());
    }
}
