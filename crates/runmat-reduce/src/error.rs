use crate::dtype::DType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReduceError>;

/// Errors surfaced by the reduction engine.
///
/// Configuration errors are detected before anything is enqueued on the
/// device; device errors carry the backend diagnostic text verbatim.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("{op}: unsupported dtype {dtype}")]
    UnsupportedDType { op: &'static str, dtype: DType },

    #[error("{op}: dtype mismatch ({expected} expected, got {got})")]
    DTypeMismatch {
        op: &'static str,
        expected: DType,
        got: DType,
    },

    #[error("{op}: device does not support double precision")]
    Fp64Unsupported { op: &'static str },

    #[error("{op}: {reason}")]
    InvalidShape { op: &'static str, reason: String },

    #[error("{op}: mode {mode} unavailable: {reason}")]
    ModeUnavailable {
        op: &'static str,
        mode: u8,
        reason: String,
    },

    #[error("kernel generation failed for '{kernel}': {reason}")]
    Codegen { kernel: String, reason: String },

    #[error("kernel '{name}' failed to build:\n{log}")]
    Build { name: String, log: String },

    #[error("{context}: out of device resources ({detail})")]
    OutOfResources { context: String, detail: String },

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ReduceError {
    pub fn invalid_shape(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            op,
            reason: reason.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }

    /// True for errors raised by eager argument validation, before any device work.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedDType { .. }
                | Self::DTypeMismatch { .. }
                | Self::Fp64Unsupported { .. }
                | Self::InvalidShape { .. }
                | Self::ModeUnavailable { .. }
        )
    }
}
