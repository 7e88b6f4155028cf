//! Kernel trait and input validation.
//!
//! Kernels take `[batch, heads, seq_len, head_dim]` tensors and return the
//! same layout. Scores and softmax run in `f32` for `bf16`/`f16` inputs
//! unless [`PrecisionPolicy::Inherit`] is set.

pub mod config;
pub mod errors;

use candle_core::{DType, Device, Tensor};

pub use config::{Config, PrecisionPolicy};
pub use errors::AttentionError;

/// Scaled dot-product attention over per-head tensors.
///
/// * `q`, `k`, `v` are `[batch, heads, seq_len, head_dim]`; `k` and `v` may
///   be longer than `q`.
/// * The output has `q`'s shape and dtype.
/// * Masks, when present, are additive `f32` tensors shaped
///   `[batch, 1 or n_heads, q_len, k_len]`.
/// * Causal masking is applied when [`Config::causal`] is set.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

/// Dimensions shared by validated `q`, `k`, `v` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvDims {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
}

/// Checks the device, dtype, contiguity and shape contract of [`Attention`].
pub fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<QkvDims, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must reside on the same device".to_string(),
        });
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must share the same dtype".to_string(),
        });
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    if !q.is_contiguous() || !k.is_contiguous() || !v.is_contiguous() {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must be contiguous in memory".to_string(),
        });
    }

    let (batch, heads, q_len, head_dim) =
        q.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
    let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
        context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
    })?;
    let (vb, vh, vk, vd) = v.dims4().map_err(|_| AttentionError::InvalidShape {
        context: "v must have shape [batch, heads, seq_len, head_dim]".to_string(),
    })?;

    if kb != batch || kh != heads || kd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            ),
        });
    }
    if vb != batch || vh != heads || vk != k_len || vd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            ),
        });
    }
    if q_len == 0 || k_len == 0 || head_dim == 0 {
        return Err(AttentionError::InvalidShape {
            context: "sequence lengths and head_dim must be non-zero".to_string(),
        });
    }

    Ok(QkvDims {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
    })
}

/// Checks an additive mask against validated dimensions and returns it
/// broadcast to `[batch, heads, q_len, k_len]`.
pub fn validate_mask(
    mask: &Tensor,
    device: &Device,
    dims: &QkvDims,
) -> Result<Tensor, AttentionError> {
    let QkvDims {
        batch,
        heads,
        q_len,
        k_len,
        ..
    } = *dims;

    if !device.same_device(mask.device()) {
        return Err(AttentionError::InvalidShape {
            context: "mask must reside on the same device as q".to_string(),
        });
    }
    if mask.dtype() != crate::masks::MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "mask expects dtype {:?}, got {:?}",
                crate::masks::MASK_DTYPE,
                mask.dtype()
            ),
        });
    }
    let (mb, mh, mq, mk) = mask.dims4().map_err(|_| AttentionError::InvalidShape {
        context: "mask must have shape [batch, heads|1, q_len, k_len]".to_string(),
    })?;
    if mb != batch || mq != q_len || mk != k_len {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
            ),
        });
    }
    if mh != 1 && mh != heads {
        return Err(AttentionError::InvalidShape {
            context: format!("mask head dimension must be 1 or {heads}, got {mh}"),
        });
    }
    if mh == heads {
        Ok(mask.clone())
    } else {
        Ok(mask.broadcast_as((batch, heads, q_len, k_len))?)
    }
}
