//! Portable, exact implementation of multi-head attention.
//!
//! This path favours clarity over memory footprint and serves as the
//! baseline for validating the tiled kernel.

pub mod exact;

pub use exact::ExactAttention;
