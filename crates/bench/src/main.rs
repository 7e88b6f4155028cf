use std::path::PathBuf;

use attention::KernelKind;
use attention_bench::{
    config::OutputSettings, report::update_results, select_device, BenchConfig, BenchError,
    DeviceRequest, ProbeKind, Suite, SuiteReport, TrackingAllocator,
};
use clap::Parser;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("attention-bench failed: {}", err);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Attention module probe harness", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON bench config")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DEVICE", help = "auto, cpu, cuda[:N] or metal[:N]")]
    device: Option<DeviceRequest>,

    #[arg(
        long = "probe",
        value_name = "NAME",
        help = "Probe to run; repeat to run several (default: all, in order)"
    )]
    probes: Vec<ProbeKind>,

    #[arg(long, value_name = "KIND", help = "Attention kernel: tiled or exact")]
    kernel: Option<KernelKind>,

    #[arg(
        long,
        value_name = "N,N,...",
        value_delimiter = ',',
        help = "Sequence lengths for the scalability sweep"
    )]
    seq_lens: Option<Vec<usize>>,

    #[arg(long, help = "Seed for reproducible inputs")]
    seed: Option<u64>,

    #[arg(long, value_name = "PATH", help = "Markdown file to update with results")]
    results: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write the full report as JSON")]
    json: Option<PathBuf>,

    #[arg(long, help = "Stop after the first failing probe")]
    fail_fast: bool,
}

/// Runs the requested probes; `Ok(false)` means at least one probe failed.
fn run(args: Args) -> Result<bool, BenchError> {
    let config = load_config(&args)?;
    let device = select_device(config.device)?;
    let suite = Suite::new(config, device)?;

    let probes = if args.probes.is_empty() {
        ProbeKind::ALL.to_vec()
    } else {
        args.probes.clone()
    };

    let report = suite.run(&probes);
    finish(&report, &suite.config().output)
}

/// Config file (or defaults) with command-line overrides applied.
fn load_config(args: &Args) -> Result<BenchConfig, BenchError> {
    let mut config = match &args.config {
        Some(path) => BenchConfig::from_path(path)?,
        None => BenchConfig::default(),
    };
    apply_args(&mut config, args);
    config.validate()?;
    Ok(config)
}

/// Prints the report, writes the configured outputs and returns whether
/// every probe passed.
fn finish(report: &SuiteReport, output: &OutputSettings) -> Result<bool, BenchError> {
    for probe in &report.reports {
        for note in &probe.notes {
            println!("{note}");
        }
        println!("[{}] {}", probe.probe, probe.status);
    }

    if let Some(path) = &output.results_markdown {
        update_results(path, "probes", &report.to_markdown())?;
        log::info!("updated {}", path.display());
    }
    if let Some(path) = &output.json {
        report.write_json(path)?;
        log::info!("wrote {}", path.display());
    }

    if !report.passed() {
        let failed = report
            .failures()
            .map(|r| r.probe.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        eprintln!("failed probes: {failed}");
    }
    Ok(report.passed())
}

fn apply_args(config: &mut BenchConfig, args: &Args) {
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(kernel) = args.kernel {
        config.module.kernel = kernel;
    }
    if let Some(seq_lens) = &args.seq_lens {
        config.scalability.seq_lens = seq_lens.clone();
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.results.is_some() {
        config.output.results_markdown = args.results.clone();
    }
    if args.json.is_some() {
        config.output.json = args.json.clone();
    }
    if args.fail_fast {
        config.fail_fast = true;
    }
}
