use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error for {parameter}: {message}")]
    Configuration {
        message: String,
        parameter: String,
    },

    #[error("Unsupported model type: {model_type}")]
    UnsupportedModel {
        model_type: String,
    },

    #[error("Failed to load weight '{name}': {message}")]
    WeightLoad {
        name: String,
        message: String,
    },

    #[error("Encoding error: {message}")]
    Encoding {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
    },

    #[error("{model} does not support {capability}")]
    Capability {
        model: String,
        capability: String,
    },

    #[error("Chat template error: {message}")]
    Template {
        message: String,
    },

    #[error("Context overflow: {required} positions required, capacity is {capacity}")]
    ContextOverflow {
        required: usize,
        capacity: usize,
    },

    #[error("Model error: {message}")]
    Model {
        message: String,
    },

    #[error("Compute backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write streamed text: {0}")]
    Stream(#[source] std::io::Error),
}

impl EngineError {
    pub(crate) fn config(parameter: &str, message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
            parameter: parameter.to_string(),
        }
    }

    pub(crate) fn encoding(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        EngineError::Encoding {
            message: message.into(),
            source,
        }
    }

    pub(crate) fn model(message: impl Into<String>) -> Self {
        EngineError::Model {
            message: message.into(),
        }
    }

    pub(crate) fn template(message: impl Into<String>) -> Self {
        EngineError::Template {
            message: message.into(),
        }
    }
}

/// Extension trait for error handling utilities
pub trait ErrorExt {
    /// Whether the error invalidates the model or pipeline it came from.
    fn is_fatal(&self) -> bool;
    /// Whether the caller can retry with different input.
    fn is_recoverable(&self) -> bool;
}

impl ErrorExt for EngineError {
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::WeightLoad { .. }
                | EngineError::UnsupportedModel { .. }
                | EngineError::Capability { .. }
                | EngineError::Configuration { .. }
        )
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Encoding { .. }
                | EngineError::Validation { .. }
                | EngineError::Template { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::WeightLoad {
            name: "transformer.output_layer.weight".to_string(),
            message: "missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to load weight 'transformer.output_layer.weight': missing"
        );

        let error = EngineError::Capability {
            model: "ChatGLM3".to_string(),
            capability: "image input".to_string(),
        };
        assert_eq!(error.to_string(), "ChatGLM3 does not support image input");
    }

    #[test]
    fn test_error_classification() {
        let error = EngineError::UnsupportedModel {
            model_type: "gpt2".to_string(),
        };
        assert!(error.is_fatal());
        assert!(!error.is_recoverable());

        let error = EngineError::encoding("invalid byte", None);
        assert!(error.is_recoverable());
        assert!(!error.is_fatal());

        let error = EngineError::Validation {
            message: "expected 3 channels".to_string(),
        };
        assert!(error.is_recoverable());
    }
}
