use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::ProbeContext;

pub const NAME: &str = "backward";

/// Sums the output, backpropagates, and checks that a gradient shaped like
/// the input reached it.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let x = ctx
        .inputs
        .tracked(ctx.config.input.batch, ctx.config.input.seq_len, ctx.module.dim())?;

    let out = ctx.module.forward(x.as_tensor())?;
    let grads = out.sum_all()?.backward()?;
    synchronize(ctx.device)?;

    let grad = match grads.get(x.as_tensor()) {
        Some(grad) if grad.dims() == x.dims() => grad,
        Some(grad) => {
            log::error!(
                "gradient shape {:?} does not match input {:?}",
                grad.dims(),
                x.dims()
            );
            return Ok(ProbeReport::failed(NAME, "No gradient computed"));
        }
        None => {
            log::error!("No gradient computed");
            return Ok(ProbeReport::failed(NAME, "No gradient computed"));
        }
    };

    let norm = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
    let mut report = ProbeReport::passed(NAME);
    report.push("grad_l2_norm", norm, Unit::Ratio);
    log::info!("gradient reached the input, l2 norm {norm}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use attention::{AttentionError, AttentionModule};
    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::{
        probes::test_support::{small_config, with_context, Identity},
        report::ProbeStatus,
    };

    /// Output that does not depend on the input.
    struct Detached(Device);

    impl AttentionModule for Detached {
        fn dim(&self) -> usize {
            8
        }

        fn device(&self) -> &Device {
            &self.0
        }

        fn forward(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
            Ok(Tensor::zeros(x.dims(), DType::F32, &self.0)?)
        }
    }

    #[test]
    fn identity_gradient_is_all_ones() {
        let config = small_config();
        let module = Identity { dim: 8, device: Device::Cpu };
        let report = with_context(&module, &config, run).unwrap();
        assert_eq!(report.status, ProbeStatus::Passed);
        let norm = report.measurement("grad_l2_norm").unwrap().value;
        assert!((norm - 48f64.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn detached_output_reports_missing_gradient() {
        let config = small_config();
        let report = with_context(&Detached(Device::Cpu), &config, run).unwrap();
        assert_eq!(
            report.status,
            ProbeStatus::Failed("No gradient computed".to_string())
        );
    }
}
