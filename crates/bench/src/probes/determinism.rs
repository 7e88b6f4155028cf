use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::{mismatch_ratio, ProbeContext};

pub const NAME: &str = "determinism";

/// Feeds the same input twice; any differing element fails the probe.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let x = ctx.default_input()?;
    let first = ctx.module.forward_inference(&x)?;
    let second = ctx.module.forward_inference(&x)?;
    synchronize(ctx.device)?;

    let ratio = mismatch_ratio(&first, &second)?;
    let mut report = if ratio == 0.0 {
        ProbeReport::passed(NAME)
    } else {
        log::warn!("repeated forward passes differ on {ratio} of elements");
        ProbeReport::failed(
            NAME,
            format!("repeated forward passes differ on {ratio} of elements"),
        )
    };
    report.push("mismatch", ratio, Unit::Ratio);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use attention::{AttentionError, AttentionModule};
    use candle_core::{Device, Tensor};

    use super::*;
    use crate::{
        probes::test_support::{small_config, with_context, Identity},
        report::ProbeStatus,
    };

    /// Adds an increasing offset on every call.
    struct Drifting {
        calls: AtomicU32,
        device: Device,
    }

    impl AttentionModule for Drifting {
        fn dim(&self) -> usize {
            8
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn forward(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(x.affine(1.0, call as f64)?)
        }
    }

    #[test]
    fn stable_module_passes() {
        let config = small_config();
        let module = Identity { dim: 8, device: Device::Cpu };
        let report = with_context(&module, &config, run).unwrap();
        assert_eq!(report.status, ProbeStatus::Passed);
        assert_eq!(report.measurement("mismatch").unwrap().value, 0.0);
    }

    #[test]
    fn drifting_module_fails() {
        let config = small_config();
        let module = Drifting {
            calls: AtomicU32::new(0),
            device: Device::Cpu,
        };
        let report = with_context(&module, &config, run).unwrap();
        assert!(report.status.is_failed());
        assert_eq!(report.measurement("mismatch").unwrap().value, 1.0);
    }
}
