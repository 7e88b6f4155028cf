use crate::{
    config::BenchError,
    report::{ProbeReport, ProbeStatus, Unit},
};

use super::ProbeContext;

pub const NAME: &str = "scalability";

/// Times one forward pass per sequence length. A failure at one length
/// (typically out of memory) ends the sweep but keeps the earlier rows.
pub fn run(ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
    let mut report = ProbeReport::observed(NAME);

    for &seq_len in &ctx.config.scalability.seq_lens {
        let result = ctx
            .input(seq_len)
            .and_then(|x| ctx.timed_forward(&x).map(|(_, seconds)| seconds));
        let seconds = match result {
            Ok(seconds) => seconds,
            Err(err) => {
                log::warn!("scalability sweep stopped at input size {seq_len}: {err}");
                report.status = ProbeStatus::Failed(format!("Input size: {seq_len}, error: {err}"));
                break;
            }
        };

        report.push(format!("n={seq_len}"), seconds, Unit::Seconds);
        if seconds > 0.0 {
            let tokens = (ctx.config.input.batch * seq_len) as f64;
            report.push(format!("n={seq_len} throughput"), tokens / seconds, Unit::TokensPerSecond);
        }
        let line = format!("Input size: {seq_len}, Execution time: {seconds} seconds");
        log::info!("{line}");
        report.note(line);
    }

    Ok(report)
}
