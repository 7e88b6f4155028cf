//! The individual probes. Each one is a straight-line procedure: build an
//! input, call the module, synchronise, read one measurement, report.

pub mod backward;
pub mod determinism;
pub mod error_rate;
pub mod forward;
pub mod memory;
pub mod scalability;
pub mod speed;

use std::time::Instant;

use attention::AttentionModule;
use candle_core::{DType, Device, Tensor};

use crate::{
    config::{BenchConfig, BenchError},
    device::synchronize,
    inputs::InputFactory,
    memory::MemorySource,
};

/// Everything a probe may touch for one run.
pub struct ProbeContext<'a> {
    pub module: &'a dyn AttentionModule,
    pub device: &'a Device,
    pub config: &'a BenchConfig,
    pub inputs: &'a InputFactory,
    pub memory: &'a dyn MemorySource,
}

impl ProbeContext<'_> {
    /// `(batch, seq_len, module.dim())` standard-normal input on the device.
    pub fn input(&self, seq_len: usize) -> Result<Tensor, BenchError> {
        self.inputs
            .normal(self.config.input.batch, seq_len, self.module.dim())
    }

    pub fn default_input(&self) -> Result<Tensor, BenchError> {
        self.input(self.config.input.seq_len)
    }

    /// Runs one forward pass and waits for the device, returning the output
    /// and the wall-clock seconds spent.
    pub fn timed_forward(&self, x: &Tensor) -> Result<(Tensor, f64), BenchError> {
        let start = Instant::now();
        let out = self.module.forward_inference(x)?;
        synchronize(self.device)?;
        Ok((out, start.elapsed().as_secs_f64()))
    }
}

/// Fraction of elements where `a` and `b` differ.
pub(crate) fn mismatch_ratio(a: &Tensor, b: &Tensor) -> Result<f64, BenchError> {
    if a.dims() != b.dims() {
        return Err(BenchError::runtime(format!(
            "cannot compare outputs of shapes {:?} and {:?}",
            a.dims(),
            b.dims()
        )));
    }
    let ratio = a
        .ne(b)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(ratio as f64)
}
