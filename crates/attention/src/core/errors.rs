//! Errors returned by kernels and modules.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttentionError {
    /// Rank, length, device or contiguity mismatch.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A configuration value is outside its accepted range.
    #[error("invalid attention config: {context}")]
    InvalidConfig { context: String },
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
