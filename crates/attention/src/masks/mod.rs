//! Additive causal masks.
//!
//! Entries are `0.0` where a query may look at a key and `-inf` where it
//! may not, in [`MASK_DTYPE`]. Kernels add them to the scaled scores before
//! the softmax.

pub mod causal;

use candle_core::DType;

pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, build_causal_tile_mask, tile_is_fully_masked};
