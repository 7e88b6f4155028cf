use crate::{
    config::BenchError,
    device::synchronize,
    report::{ProbeReport, Unit},
};

use super::ProbeContext;

pub const NAME: &str = "speed";

pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let timing = &ctx.config.timing;
    let x = ctx.default_input()?;

    for _ in 0..timing.warmup {
        let _ = ctx.module.forward_inference(&x)?;
    }
    synchronize(ctx.device)?;

    let mut samples = Vec::with_capacity(timing.iterations);
    for _ in 0..timing.iterations {
        let (_, seconds) = ctx.timed_forward(&x)?;
        samples.push(seconds);
    }

    let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(0.0, f64::max);
    let tokens = (ctx.config.input.batch * ctx.config.input.seq_len) as f64;

    let mut report = ProbeReport::observed(NAME);
    report.push("mean", mean, Unit::Seconds);
    report.push("min", min, Unit::Seconds);
    report.push("max", max, Unit::Seconds);
    report.push("iterations", samples.len() as f64, Unit::Count);
    if mean > 0.0 {
        report.push("throughput", tokens / mean, Unit::TokensPerSecond);
    }

    let line = format!("Execution time: {mean} seconds");
    log::info!("{line}");
    report.note(line);
    Ok(report)
}
