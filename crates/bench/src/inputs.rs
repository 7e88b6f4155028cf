use std::sync::Mutex;

use candle_core::{DType, Device, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::BenchError;

/// Builds standard-normal `(batch, seq_len, dim)` inputs for the probes.
///
/// With a seed the values come from a host `StdRng` and are then copied to
/// the device, so two runs with the same seed see identical inputs on any
/// backend. Without one the device RNG is used directly.
#[derive(Debug)]
pub struct InputFactory {
    device: Device,
    rng: Option<Mutex<StdRng>>,
}

impl InputFactory {
    pub fn new(device: &Device, seed: Option<u64>) -> Self {
        Self {
            device: device.clone(),
            rng: seed.map(|seed| Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_seeded(&self) -> bool {
        self.rng.is_some()
    }

    pub fn normal(&self, batch: usize, seq_len: usize, dim: usize) -> Result<Tensor, BenchError> {
        if batch == 0 || seq_len == 0 || dim == 0 {
            return Err(BenchError::runtime(format!(
                "input dimensions must be non-zero, got ({batch}, {seq_len}, {dim})"
            )));
        }

        let shape = (batch, seq_len, dim);
        let tensor = match &self.rng {
            Some(rng) => {
                let mut rng = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let values = standard_normal(&mut *rng, batch * seq_len * dim);
                Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(&self.device)?
            }
            None => Tensor::randn(0f32, 1f32, shape, &self.device)?,
        };
        Ok(tensor)
    }

    /// Same as [`normal`](Self::normal) but wrapped in a `Var` so autograd
    /// records a gradient for it.
    pub fn tracked(&self, batch: usize, seq_len: usize, dim: usize) -> Result<Var, BenchError> {
        let tensor = self.normal(batch, seq_len, dim)?;
        Ok(Var::from_tensor(&tensor.to_dtype(DType::F32)?)?)
    }
}

// Box-Muller; the second sample of each pair is kept.
fn standard_normal(rng: &mut StdRng, count: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(count);
    while values.len() < count {
        let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * theta.cos()) as f32);
        if values.len() < count {
            values.push((radius * theta.sin()) as f32);
        }
    }
    values
}
