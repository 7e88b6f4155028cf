//! Memory-efficient attention kernels.
//!
//! These kernels never hold the full `[q_len, k_len]` score matrix. Work is
//! split into query and key tiles sized by
//! [`Config::q_chunk_size`](crate::Config::q_chunk_size) and
//! [`Config::k_chunk_size`](crate::Config::k_chunk_size).

pub mod tiled;

pub use tiled::TiledAttention;
