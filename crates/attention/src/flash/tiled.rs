//! Tiled attention with an online softmax.
//!
//! For each query tile the kernel walks the key tiles while carrying three
//! running quantities per query row: the maximum score seen so far, the
//! softmax denominator relative to that maximum, and the weighted sum of
//! values relative to that maximum. When a later tile raises the maximum the
//! carried sums are rescaled by `exp(old_max - new_max)`. After the last tile
//! the accumulator divided by the denominator equals the exact softmax
//! attention output.
//!
//! Every step is an autograd-tracked Candle op. The running maximum is
//! detached since it cancels out of the result.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::dropout;

use crate::core::{
    validate_mask, validate_qkv, Attention, AttentionError, Config, PrecisionPolicy, QkvDims,
};
use crate::masks::{build_causal_tile_mask, causal::tile_is_unmasked, tile_is_fully_masked};

// Starting value for the running maximum. Finite so that rows whose first
// tiles are fully masked never evaluate `-inf - -inf`.
const INITIAL_ROW_MAX: f64 = -1e30;

// Running maximum, denominator and accumulator stay in f32 whatever the
// score dtype: `INITIAL_ROW_MAX` and the denominator floor do not survive a
// round trip through f16.
const STATS_DTYPE: DType = DType::F32;

/// Chunked attention kernel whose peak memory scales with the tile sizes.
#[derive(Debug, Default)]
pub struct TiledAttention {
    first_call: OnceLock<()>,
}

impl TiledAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for TiledAttention {
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
                "attention::tiled init precision={:?} causal={} dropout={:?} q_chunk={} k_chunk={}",
                config.precision,
                config.causal,
                config.dropout_p,
                config.q_chunk_size,
                config.k_chunk_size
            );
        }

        let dims = validate_qkv(q, k, v)?;
        let dtype = q.dtype();
        let mask = mask
            .map(|m| validate_mask(m, q.device(), &dims))
            .transpose()?;

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
        let mask_view = match mask {
            Some(m) => Some(m.reshape((merged, dims.q_len, dims.k_len))?),
            None => None,
        };

        let tiles = TilePlan::new(&dims, config);
        let mut outputs = Vec::with_capacity(tiles.q_tiles().count());
        for (q_start, q_size) in tiles.q_tiles() {
            let out = attend_query_tile(
                &q_view,
                &k_view,
                &v_view,
                mask_view.as_ref(),
                &tiles,
                q_start,
                q_size,
                config,
            )?;
            outputs.push(out);
        }

        let output = if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            Tensor::cat(&outputs, 1)?
        };
        let output = output.reshape((dims.batch, dims.heads, dims.q_len, dims.head_dim))?;
        Ok(output.to_dtype(dtype)?)
    }
}

/// Tile boundaries for one attention call.
#[derive(Debug, Clone, Copy)]
struct TilePlan {
    q_len: usize,
    k_len: usize,
    q_chunk: usize,
    k_chunk: usize,
    head_dim: usize,
    causal: bool,
    diagonal_offset: usize,
}

impl TilePlan {
    fn new(dims: &QkvDims, config: &Config) -> Self {
        Self {
            q_len: dims.q_len,
            k_len: dims.k_len,
            q_chunk: config.q_chunk_size.min(dims.q_len),
            k_chunk: config.k_chunk_size.min(dims.k_len),
            head_dim: dims.head_dim,
            causal: config.causal,
            diagonal_offset: dims.k_len.saturating_sub(dims.q_len),
        }
    }

    fn q_tiles(&self) -> impl Iterator<Item = (usize, usize)> {
        spans(self.q_len, self.q_chunk)
    }

    fn k_tiles(&self) -> impl Iterator<Item = (usize, usize)> {
        spans(self.k_len, self.k_chunk)
    }
}

fn spans(len: usize, chunk: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..len)
        .step_by(chunk)
        .map(move |start| (start, chunk.min(len - start)))
}

#[allow(clippy::too_many_arguments)]
fn attend_query_tile(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    plan: &TilePlan,
    q_start: usize,
    q_size: usize,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    let device = q.device();
    let (merged, _, _) = q.dims3()?;
    let scale = 1.0 / (plan.head_dim as f64).sqrt();

    let q_tile = q.narrow(1, q_start, q_size)?.affine(scale, 0.0)?;

    let mut row_max = Tensor::full(INITIAL_ROW_MAX as f32, (merged, q_size, 1), device)?;
    let mut row_sum = Tensor::zeros((merged, q_size, 1), STATS_DTYPE, device)?;
    let mut acc = Tensor::zeros((merged, q_size, plan.head_dim), STATS_DTYPE, device)?;

    for (k_start, k_size) in plan.k_tiles() {
        if plan.causal && tile_is_fully_masked(q_start, q_size, k_start, plan.diagonal_offset) {
            break;
        }

        let k_tile = k.narrow(1, k_start, k_size)?;
        let v_tile = v.narrow(1, k_start, k_size)?.to_dtype(STATS_DTYPE)?;
        let mut scores = q_tile.matmul(&k_tile.t()?)?.to_dtype(STATS_DTYPE)?;

        if plan.causal && !tile_is_unmasked(q_start, k_start, k_size, plan.diagonal_offset) {
            let causal = build_causal_tile_mask(
                device,
                q_start,
                q_size,
                k_start,
                k_size,
                plan.diagonal_offset,
            )?;
            scores = scores.broadcast_add(&causal)?;
        }
        if let Some(mask) = mask {
            let tile_mask = mask
                .narrow(1, q_start, q_size)?
                .narrow(2, k_start, k_size)?;
            scores = scores.add(&tile_mask)?;
        }

        let tile_max = scores.max_keepdim(D::Minus1)?.detach();
        let new_max = row_max.maximum(&tile_max)?;
        let probs = scores.broadcast_sub(&new_max)?.exp()?;
        let correction = row_max.sub(&new_max)?.exp()?;

        row_sum = row_sum
            .mul(&correction)?
            .add(&probs.sum_keepdim(D::Minus1)?)?;

        let weights = match config.active_dropout() {
            Some(p) => dropout(&probs, p)?,
            None => probs,
        };
        acc = acc
            .broadcast_mul(&correction)?
            .add(&weights.matmul(&v_tile)?)?;
        row_max = new_max;
    }

    // Rows with no visible key keep a zero accumulator; clamping the
    // denominator turns 0/0 into 0.
    let denom = row_sum.maximum(f32::MIN_POSITIVE as f64)?;
    Ok(acc.broadcast_div(&denom)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use crate::reference::ExactAttention;
    use candle_core::{Device, Result as CandleResult, Var};

    fn random_qkv(
        device: &Device,
        shape: (usize, usize, usize, usize),
        k_len: usize,
    ) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let (b, h, q_len, d) = shape;
        let q = Tensor::randn(0f32, 1.0, (b, h, q_len, d), device)?;
        let k = Tensor::randn(0f32, 1.0, (b, h, k_len, d), device)?;
        let v = Tensor::randn(0f32, 1.0, (b, h, k_len, d), device)?;
        Ok((q, k, v))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    fn small_tiles(causal: bool) -> Config {
        Config {
            causal,
            q_chunk_size: 3,
            k_chunk_size: 5,
            ..Config::default()
        }
    }

    #[test]
    fn matches_exact_with_uneven_tiles() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (2, 3, 11, 8), 11)?;
        for causal in [false, true] {
            let config = small_tiles(causal);
            let tiled = TiledAttention::new().attend(&q, &k, &v, None, &config).unwrap();
            let exact = ExactAttention::new().attend(&q, &k, &v, None, &config).unwrap();
            assert_eq!(tiled.dims(), &[2, 3, 11, 8]);
            let diff = max_abs_diff(&tiled, &exact)?;
            assert!(diff < 1e-4, "causal={causal} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn matches_exact_with_longer_keys() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 2, 4, 8), 9)?;
        let config = small_tiles(true);
        let tiled = TiledAttention::new().attend(&q, &k, &v, None, &config).unwrap();
        let exact = ExactAttention::new().attend(&q, &k, &v, None, &config).unwrap();
        assert!(max_abs_diff(&tiled, &exact)? < 1e-4);
        Ok(())
    }

    #[test]
    fn honours_additive_masks() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 2, 6, 4), 6)?;
        let mask = build_causal_mask(&device, 1, 1, 6, 6)?;
        let config = small_tiles(false);
        let tiled = TiledAttention::new()
            .attend(&q, &k, &v, Some(&mask), &config)
            .unwrap();
        let causal = TiledAttention::new()
            .attend(&q, &k, &v, None, &small_tiles(true))
            .unwrap();
        assert!(max_abs_diff(&tiled, &causal)? < 1e-5);
        Ok(())
    }

    #[test]
    fn fully_masked_rows_are_zero_not_nan() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 1, 2, 4), 3)?;
        let mask = Tensor::full(f32::NEG_INFINITY, (1, 1, 2, 3), &device)?;
        let out = TiledAttention::new()
            .attend(&q, &k, &v, Some(&mask), &small_tiles(false))
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn half_precision_inherit_handles_masked_leading_tiles() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 1, 2, 4), 6)?;
        let (q16, k16, v16) = (
            q.to_dtype(DType::F16)?,
            k.to_dtype(DType::F16)?,
            v.to_dtype(DType::F16)?,
        );
        // row 0 sees only the second key tile, row 1 sees nothing
        let ninf = f32::NEG_INFINITY;
        let mask = Tensor::from_vec(
            vec![ninf, ninf, ninf, 0.0, 0.0, 0.0, ninf, ninf, ninf, ninf, ninf, ninf],
            (1, 1, 2, 6),
            &device,
        )?;
        let config = Config {
            precision: PrecisionPolicy::Inherit,
            q_chunk_size: 2,
            k_chunk_size: 3,
            ..Config::default()
        };

        let out = TiledAttention::new()
            .attend(&q16, &k16, &v16, Some(&mask), &config)
            .unwrap();
        assert_eq!(out.dtype(), DType::F16);
        let rows = out.to_dtype(DType::F32)?.squeeze(0)?.squeeze(0)?;
        let values = rows.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|x| x.is_finite()));
        assert!(values[4..].iter().all(|x| *x == 0.0));

        let visible = ExactAttention::new()
            .attend(
                &q16.to_dtype(DType::F32)?,
                &k16.narrow(2, 3, 3)?.to_dtype(DType::F32)?,
                &v16.narrow(2, 3, 3)?.to_dtype(DType::F32)?,
                None,
                &Config::default(),
            )
            .unwrap();
        let want = visible.squeeze(0)?.squeeze(0)?.get(0)?;
        assert!(max_abs_diff(&rows.get(0)?, &want)? < 1e-2);
        Ok(())
    }

    #[test]
    fn gradients_match_exact() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 2, 7, 4), 7)?;
        let config = small_tiles(true);

        let grads_for = |kernel: &dyn Attention| -> CandleResult<(Tensor, Tensor, Tensor)> {
            let qv = Var::from_tensor(&q)?;
            let kv = Var::from_tensor(&k)?;
            let vv = Var::from_tensor(&v)?;
            let out = kernel
                .attend(qv.as_tensor(), kv.as_tensor(), vv.as_tensor(), None, &config)
                .unwrap();
            let loss = out.sqr()?.sum_all()?;
            let grads = loss.backward()?;
            Ok((
                grads.get(qv.as_tensor()).expect("q grad").clone(),
                grads.get(kv.as_tensor()).expect("k grad").clone(),
                grads.get(vv.as_tensor()).expect("v grad").clone(),
            ))
        };

        let (tq, tk, tv) = grads_for(&TiledAttention::new())?;
        let (eq, ek, ev) = grads_for(&ExactAttention::new())?;
        assert!(max_abs_diff(&tq, &eq)? < 1e-4);
        assert!(max_abs_diff(&tk, &ek)? < 1e-4);
        assert!(max_abs_diff(&tv, &ev)? < 1e-4);
        Ok(())
    }

    #[test]
    fn low_precision_inputs_round_trip_dtype() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv(&device, (1, 2, 5, 8), 5)?;
        let reference = TiledAttention::new()
            .attend(&q, &k, &v, None, &small_tiles(false))
            .unwrap();
        let out = TiledAttention::new()
            .attend(
                &q.to_dtype(DType::BF16)?,
                &k.to_dtype(DType::BF16)?,
                &v.to_dtype(DType::BF16)?,
                None,
                &small_tiles(false),
            )
            .unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        assert!(max_abs_diff(&out, &reference)? < 5e-2);
        Ok(())
    }

    #[test]
    fn spans_cover_length_without_overlap() {
        let covered: Vec<_> = spans(10, 4).collect();
        assert_eq!(covered, vec![(0, 4), (4, 4), (8, 2)]);
    }
}
