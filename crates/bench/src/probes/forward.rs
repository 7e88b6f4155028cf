use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::ProbeContext;

pub const NAME: &str = "forward";

/// The module must map `(batch, seq_len, dim)` to exactly the same shape.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let x = ctx.default_input()?;
    let out = ctx.module.forward_inference(&x)?;
    synchronize(ctx.device)?;

    if out.dims() != x.dims() {
        let reason = format!("Unexpected output shape: {:?}", out.dims());
        log::error!("{reason} (expected {:?})", x.dims());
        return Ok(ProbeReport::failed(NAME, reason));
    }

    let mut report = ProbeReport::passed(NAME);
    report.push("elements", out.elem_count() as f64, Unit::Count);
    report.note(format!("output shape: {:?}", out.dims()));
    log::info!("forward produced shape {:?}", out.dims());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use attention::{AttentionError, AttentionModule};
    use candle_core::{Device, Tensor};

    use super::*;
    use crate::{
        probes::test_support::{small_config, with_context, Identity},
        report::ProbeStatus,
    };

    struct Truncating(Device);

    impl AttentionModule for Truncating {
        fn dim(&self) -> usize {
            8
        }

        fn device(&self) -> &Device {
            &self.0
        }

        fn forward(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
            Ok(x.narrow(2, 0, 4)?)
        }
    }

    #[test]
    fn matching_shape_passes() {
        let config = small_config();
        let module = Identity { dim: 8, device: Device::Cpu };
        let report = with_context(&module, &config, run).unwrap();
        assert_eq!(report.status, ProbeStatus::Passed);
        assert_eq!(report.measurement("elements").unwrap().value, 48.0);
    }

    #[test]
    fn wrong_shape_fails_with_observed_dims() {
        let config = small_config();
        let report = with_context(&Truncating(Device::Cpu), &config, run).unwrap();
        assert_eq!(
            report.status,
            ProbeStatus::Failed("Unexpected output shape: [1, 6, 4]".to_string())
        );
    }
}
