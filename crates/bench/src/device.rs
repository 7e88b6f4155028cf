use std::{fmt, str::FromStr};

use candle_core::Device;
use serde::Deserialize;

use crate::config::BenchError;

/// Where the suite should run. `Auto` walks Metal, then CUDA, then CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DeviceRequest {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceRequest {
    type Err = BenchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lowered = raw.trim().to_ascii_lowercase();
        let (name, ordinal) = match lowered.split_once(':') {
            Some((name, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    BenchError::device(format!("invalid device ordinal in '{raw}'"))
                })?;
                (name, Some(ordinal))
            }
            None => (lowered.as_str(), None),
        };

        match (name, ordinal) {
            ("auto", None) => Ok(Self::Auto),
            ("cpu", None) => Ok(Self::Cpu),
            ("cuda", ordinal) => Ok(Self::Cuda(ordinal.unwrap_or(0))),
            ("metal", ordinal) => Ok(Self::Metal(ordinal.unwrap_or(0))),
            _ => Err(BenchError::device(format!(
                "unknown device '{raw}', expected auto, cpu, cuda[:N] or metal[:N]"
            ))),
        }
    }
}

impl TryFrom<String> for DeviceRequest {
    type Error = BenchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

/// Resolves a request to a live device.
///
/// Explicit accelerator requests fail instead of silently falling back to
/// the CPU, so a CUDA run never reports CPU numbers.
pub fn select_device(request: DeviceRequest) -> Result<Device, BenchError> {
    match request {
        DeviceRequest::Cpu => Ok(Device::Cpu),
        DeviceRequest::Cuda(ordinal) => {
            let device = Device::new_cuda(ordinal)
                .map_err(|err| BenchError::device(format!("cuda:{ordinal}: {err}")))?;
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        DeviceRequest::Metal(ordinal) => {
            let device = Device::new_metal(ordinal)
                .map_err(|err| BenchError::device(format!("metal:{ordinal}: {err}")))?;
            metal_preflight(&device)
                .map_err(|err| BenchError::device(format!("metal:{ordinal} preflight: {err}")))?;
            log::info!("Metal device selected: {:?}", device);
            Ok(device)
        }
        DeviceRequest::Auto => Ok(auto_device()),
    }
}

fn auto_device() -> Device {
    log::debug!("starting device detection");

    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        use std::panic::AssertUnwindSafe;

        let metal_device = std::panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        match metal_device {
            Ok(Ok(device)) if metal_preflight(&device).is_ok() => {
                log::info!("Metal device selected: {:?}", device);
                return device;
            }
            Ok(Ok(_)) => log::warn!("Metal device detected but preflight failed"),
            _ => log::debug!("Metal unavailable"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            device
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Device::Cpu
        }
    }
}

/// Runs the ops the attention module leans on so a broken Metal stack is
/// caught before any probe is timed.
fn metal_preflight(device: &Device) -> candle_core::Result<()> {
    use candle_core::{DType, Tensor, D};

    let a = Tensor::ones((2, 4), DType::F32, device)?;
    let b = Tensor::ones((4, 2), DType::F32, device)?;
    let _ = a.matmul(&b)?;

    let x = Tensor::ones((4, 16, 32), DType::F32, device)?;
    let scores = x.matmul(&x.transpose(1, 2)?.contiguous()?)?;
    let max = scores.max_keepdim(D::Minus1)?;
    let _ = scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    Ok(())
}

/// Blocks until queued kernels on `device` have finished.
pub fn synchronize(device: &Device) -> Result<(), BenchError> {
    device.synchronize()?;
    Ok(())
}

pub fn describe(device: &Device) -> String {
    match device.location() {
        candle_core::DeviceLocation::Cpu => "cpu".to_string(),
        candle_core::DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        candle_core::DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}
