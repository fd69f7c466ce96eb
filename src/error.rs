use thiserror::Error;

/// Result type for mutual-information estimation
pub type Result<T> = std::result::Result<T, MiError>;

/// Main error type for the estimator subsystem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiError {
    /// Batch, mask or parameter shapes disagree
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        expected: String,
        actual: String,
    },

    /// Mask selects no rows, or a pairing refers to a row the mask excludes
    #[error("Invalid mask: {0}")]
    InvalidMask(String),

    /// Estimator needs more selected rows than the batch provides
    #[error("Insufficient batch size: need at least {required} selected rows, got {actual}")]
    InsufficientBatchSize {
        required: usize,
        actual: usize,
    },

    /// Conditioned estimator called without a conditioning batch
    #[error("Conditioning samples are required by this estimator")]
    MissingConditioning,

    /// Invalid configuration or argument value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        name: String,
        reason: String,
    },

    /// A bound or loss overflowed or became NaN
    #[error("Non-finite value in {context}: {value}")]
    NonFinite {
        context: String,
        value: f32,
    },

    /// Snapshot or config (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors (file operations)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MiError {
    fn from(err: std::io::Error) -> Self {
        MiError::Io(err.to_string())
    }
}

impl From<bincode::Error> for MiError {
    fn from(err: bincode::Error) -> Self {
        MiError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MiError {
    fn from(err: serde_json::Error) -> Self {
        MiError::Serialization(err.to_string())
    }
}

// Helper functions for common error patterns
impl MiError {
    pub fn shape_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        MiError::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        MiError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
