//! Error type shared by every layer in the crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    /// A config value breaks a layer invariant. Raised at construction.
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    /// An input disagrees with the shape recorded at build time or with the layer's window.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("{0}")]
    Uninitialized(&'static str),

    #[error("unexpected number of layer inputs: {0}")]
    InputCount(usize),

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("checkpoint is missing parameter `{0}`")]
    MissingParameter(String),

    #[error("unknown layer class `{0}`")]
    UnknownLayer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        LayerError::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        LayerError::Configuration {
            field,
            reason: reason.into(),
        }
    }
}
