//! Per-call kernel settings.

use super::AttentionError;

/// Dtype used for score and softmax arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    /// Promote `f16`/`bf16` inputs to `f32` before computing scores.
    #[default]
    ForceF32,
    /// Compute scores in the dtype of the incoming tensors. The tiled kernel
    /// still carries its running softmax statistics in `f32`.
    Inherit,
}

/// Settings passed to [`Attention::attend`](super::Attention::attend).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Dropout on the attention weights. `None` keeps the kernel
    /// deterministic.
    pub dropout_p: Option<f32>,
    /// Restrict each query to keys at or before its own position.
    pub causal: bool,
    pub precision: PrecisionPolicy,
    /// Queries processed together by tiled kernels.
    pub q_chunk_size: usize,
    /// Keys processed together by tiled kernels.
    pub k_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropout_p: None,
            causal: false,
            precision: PrecisionPolicy::default(),
            q_chunk_size: 512,
            k_chunk_size: 1024,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), AttentionError> {
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::InvalidConfig {
                    context: format!("dropout probability must be in [0, 1), got {p}"),
                });
            }
        }
        if self.q_chunk_size == 0 || self.k_chunk_size == 0 {
            return Err(AttentionError::InvalidConfig {
                context: format!(
                    "chunk sizes must be non-zero (q={}, k={})",
                    self.q_chunk_size, self.k_chunk_size
                ),
            });
        }
        Ok(())
    }

    /// Dropout probability when dropout is actually active.
    pub(crate) fn active_dropout(&self) -> Option<f32> {
        self.dropout_p.filter(|p| *p > 0.0)
    }
}
