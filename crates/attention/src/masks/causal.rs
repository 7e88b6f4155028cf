//! Causal masks, whole or per tile.
//!
//! Query `i` of a `q_len`-long block sees keys `0..=i + (k_len - q_len)`:
//! when there are more keys than queries the queries are the most recent
//! positions.

use candle_core::{Device, Result, Tensor};

/// `[batch, num_heads, q_len, k_len]` causal mask.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let shift = k_len.saturating_sub(q_len);
    build_causal_tile_mask(device, 0, q_len, 0, k_len, shift)?
        .unsqueeze(0)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}

/// `[1, q_len, k_len]` window of a causal mask whose top-left corner sits at
/// query `q_offset`, key `k_offset`. `diagonal_offset` is the shift of the
/// whole problem, `k_total - q_total`.
pub fn build_causal_tile_mask(
    device: &Device,
    q_offset: usize,
    q_len: usize,
    k_offset: usize,
    k_len: usize,
    diagonal_offset: usize,
) -> Result<Tensor> {
    let data: Vec<f32> = (q_offset..q_offset + q_len)
        .flat_map(|query| {
            let last_visible = query + diagonal_offset;
            (k_offset..k_offset + k_len).map(move |key| {
                if key > last_visible {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(data, (1, q_len, k_len), device)
}

/// The tile's first key is past the last query's horizon.
pub fn tile_is_fully_masked(
    q_offset: usize,
    q_len: usize,
    k_offset: usize,
    diagonal_offset: usize,
) -> bool {
    let last_query = (q_offset + q_len).saturating_sub(1);
    k_offset > last_query + diagonal_offset
}

/// The tile's last key is within the first query's horizon.
pub(crate) fn tile_is_unmasked(
    q_offset: usize,
    k_offset: usize,
    k_len: usize,
    diagonal_offset: usize,
) -> bool {
    let last_key = (k_offset + k_len).saturating_sub(1);
    last_key <= q_offset + diagonal_offset
}
