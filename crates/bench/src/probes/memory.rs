use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::ProbeContext;

pub const NAME: &str = "memory";

/// Memory attributed to one forward pass: the reading after the call (with
/// the output still alive) minus the reading before it.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let mut report = ProbeReport::observed(NAME);
    report.note(format!("source: {}", ctx.memory.name()));

    let x = ctx.default_input()?;
    synchronize(ctx.device)?;
    let before = ctx.memory.allocated_bytes();
    ctx.memory.reset_peak();

    let out = ctx.module.forward_inference(&x)?;
    synchronize(ctx.device)?;
    let after = ctx.memory.allocated_bytes();
    let peak = ctx.memory.peak_bytes();
    drop(out);

    match (before, after) {
        (Some(before), Some(after)) => {
            let delta = after as i64 - before as i64;
            report.push("delta", delta as f64, Unit::Bytes);
            if let Some(peak) = peak {
                report.push("peak_delta", peak.saturating_sub(before) as f64, Unit::Bytes);
            }
            let line = format!("Memory usage: {delta} bytes");
            log::info!("{line}");
            report.note(line);
        }
        _ => {
            log::warn!("memory source {} returned no reading", ctx.memory.name());
            report.note("memory reading unavailable on this device");
        }
    }

    Ok(report)
}
