use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::{mismatch_ratio, ProbeContext};

pub const NAME: &str = "error_rate";

/// Fraction of output elements that differ between two independent random
/// inputs. Purely descriptive: any module whose output depends on its input
/// scores close to one.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let x = ctx.default_input()?;
    let y = ctx.default_input()?;

    let out_x = ctx.module.forward_inference(&x)?;
    let out_y = ctx.module.forward_inference(&y)?;
    synchronize(ctx.device)?;

    let rate = mismatch_ratio(&out_x, &out_y)?;
    let mut report = ProbeReport::observed(NAME);
    report.push("error_rate", rate, Unit::Ratio);

    let line = format!("Error rate: {rate}");
    log::info!("{line}");
    report.note(line);
    Ok(report)
}
