//! Reference attention kernel that materialises the full score matrix.
//!
//! Memory grows with `batch * heads * q_len * k_len`, so long sequences
//! should go through [`TiledAttention`](crate::flash::TiledAttention).

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{dropout, softmax};

use crate::core::{validate_mask, validate_qkv, Attention, AttentionError, Config, PrecisionPolicy};
use crate::masks::build_causal_mask;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        config.validate()?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} causal={} dropout={:?}",
                config.precision,
                config.causal,
                config.dropout_p
            );
        }

        let dims = validate_qkv(q, k, v)?;
        let device = q.device();
        let dtype = q.dtype();
        let mask = mask.map(|m| validate_mask(m, device, &dims)).transpose()?;

        let (q_work, k_work, v_work) = match config.precision {
            PrecisionPolicy::ForceF32 => (
                q.to_dtype(DType::F32)?,
                k.to_dtype(DType::F32)?,
                v.to_dtype(DType::F32)?,
            ),
            PrecisionPolicy::Inherit => (q.clone(), k.clone(), v.clone()),
        };

        let merged = dims.batch * dims.heads;
        let q_view = q_work.reshape((merged, dims.q_len, dims.head_dim))?;
        let k_view = k_work.reshape((merged, dims.k_len, dims.head_dim))?;
        let v_view = v_work.reshape((merged, dims.k_len, dims.head_dim))?;

        let scale = 1.0 / (dims.head_dim as f64).sqrt();
        let scores = q_view.matmul(&k_view.t()?)?.affine(scale, 0.0)?;
        let mut scores = scores.reshape((dims.batch, dims.heads, dims.q_len, dims.k_len))?;

        if config.causal {
            let causal = build_causal_mask(device, 1, 1, dims.q_len, dims.k_len)?
                .to_dtype(scores.dtype())?;
            scores = scores.broadcast_add(&causal)?;
        }
        if let Some(mask) = mask {
            scores = scores.add(&mask.to_dtype(scores.dtype())?)?;
        }

        let probs = softmax(&scores, D::Minus1)?;
        let probs = match config.active_dropout() {
            Some(p) => dropout(&probs, p)?,
            None => probs,
        };

        let output = probs
            .reshape((merged, dims.q_len, dims.k_len))?
            .matmul(&v_view)?
            .reshape((dims.batch, dims.heads, dims.q_len, dims.head_dim))?;

        Ok(output.to_dtype(dtype)?)
    }
}
