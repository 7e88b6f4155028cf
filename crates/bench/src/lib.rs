//! Probe harness for attention modules.
//!
//! A [`Suite`] builds a fresh module per probe, feeds it random
//! `(batch, seq_len, dim)` inputs on the selected device and collects
//! memory, timing, scalability, output-stability, shape and gradient
//! observations into a [`SuiteReport`]. The harness only sees modules
//! through [`attention::AttentionModule`], so any implementation can be
//! measured.

pub mod config;
pub mod device;
pub mod inputs;
pub mod memory;
pub mod probes;
pub mod report;
pub mod suite;

pub use config::{BenchConfig, BenchError};
pub use device::{select_device, synchronize, DeviceRequest};
pub use inputs::InputFactory;
pub use memory::{memory_source_for, MemorySource, TrackingAllocator};
pub use report::{Measurement, ProbeReport, ProbeStatus, SuiteReport, Unit};
pub use suite::{ProbeKind, Suite};
