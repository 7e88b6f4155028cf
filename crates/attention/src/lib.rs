//! Multi-head self-attention for the attention bench.
//!
//! The crate exposes two layers of API. Kernels implement [`Attention`] and
//! operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`;
//! [`ExactAttention`](reference::ExactAttention) materialises the full score
//! matrix while [`TiledAttention`](flash::TiledAttention) streams over query
//! and key chunks with an online softmax so long sequences fit in memory.
//!
//! Modules implement [`AttentionModule`] and operate on `(batch, seq_len, dim)`
//! activations. [`FlashAttention`] projects its input into per-head queries,
//! keys and values, runs one of the kernels and projects back to `dim`, so the
//! output always has the input's shape. Every operation is built from Candle
//! primitives with autograd support, which lets callers backpropagate to the
//! input by wrapping it in a [`candle_core::Var`].
//!
//! Dropout is an optional, train-only concern controlled via [`Config`].
//! Leave it disabled when deterministic outputs are required.

pub mod core;
pub mod flash;
pub mod masks;
pub mod module;
pub mod projection;
pub mod reference;

pub use core::{Attention, AttentionError, Config, PrecisionPolicy};
pub use module::{AttentionModule, FlashAttention, FlashAttentionConfig, KernelKind};
