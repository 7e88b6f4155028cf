use std::{fmt, str::FromStr};

use attention::{AttentionModule, FlashAttention};
use candle_core::Device;

use crate::{
    config::{BenchConfig, BenchError},
    device,
    inputs::InputFactory,
    memory::{memory_source_for, MemorySource},
    probes::{self, ProbeContext},
    report::{ProbeReport, SuiteReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Memory,
    Speed,
    Scalability,
    ErrorRate,
    Forward,
    Backward,
    Determinism,
}

impl ProbeKind {
    /// Default run order.
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::Memory,
        ProbeKind::Speed,
        ProbeKind::Scalability,
        ProbeKind::ErrorRate,
        ProbeKind::Forward,
        ProbeKind::Backward,
        ProbeKind::Determinism,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Memory => probes::memory::NAME,
            ProbeKind::Speed => probes::speed::NAME,
            ProbeKind::Scalability => probes::scalability::NAME,
            ProbeKind::ErrorRate => probes::error_rate::NAME,
            ProbeKind::Forward => probes::forward::NAME,
            ProbeKind::Backward => probes::backward::NAME,
            ProbeKind::Determinism => probes::determinism::NAME,
        }
    }

    fn run(&self, ctx: &ProbeContext<'_>) -> Result<ProbeReport, BenchError> {
        match self {
            ProbeKind::Memory => probes::memory::run(ctx),
            ProbeKind::Speed => probes::speed::run(ctx),
            ProbeKind::Scalability => probes::scalability::run(ctx),
            ProbeKind::ErrorRate => probes::error_rate::run(ctx),
            ProbeKind::Forward => probes::forward::run(ctx),
            ProbeKind::Backward => probes::backward::run(ctx),
            ProbeKind::Determinism => probes::determinism::run(ctx),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = BenchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "memory" | "memory_usage" => Ok(ProbeKind::Memory),
            "speed" => Ok(ProbeKind::Speed),
            "scalability" => Ok(ProbeKind::Scalability),
            "error_rate" => Ok(ProbeKind::ErrorRate),
            "forward" => Ok(ProbeKind::Forward),
            "backward" => Ok(ProbeKind::Backward),
            "determinism" => Ok(ProbeKind::Determinism),
            _ => Err(BenchError::Validation(vec![format!(
                "unknown probe '{raw}', expected one of: {}",
                ProbeKind::ALL
                    .iter()
                    .map(ProbeKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )])),
        }
    }
}

type ModuleFactory = Box<dyn Fn(&Device) -> Result<Box<dyn AttentionModule>, BenchError>>;

/// Runs probes in order against freshly constructed modules.
pub struct Suite {
    config: BenchConfig,
    device: Device,
    factory: ModuleFactory,
    label: String,
    inputs: InputFactory,
    memory: Box<dyn MemorySource>,
}

impl Suite {
    /// Suite over the built-in `FlashAttention` module described by
    /// `config.module`.
    pub fn new(config: BenchConfig, device: Device) -> Result<Self, BenchError> {
        config.validate()?;
        let module_config = config.module.module_config();
        let label = module_config.kernel.to_string();
        let factory = move |device: &Device| -> Result<Box<dyn AttentionModule>, BenchError> {
            Ok(Box::new(FlashAttention::new(module_config.clone(), device)?))
        };
        Self::build(config, device, Box::new(factory), label)
    }

    /// Suite over any module implementation.
    pub fn with_factory<F>(
        config: BenchConfig,
        device: Device,
        label: impl Into<String>,
        factory: F,
    ) -> Result<Self, BenchError>
    where
        F: Fn(&Device) -> Result<Box<dyn AttentionModule>, BenchError> + 'static,
    {
        config.validate()?;
        Self::build(config, device, Box::new(factory), label.into())
    }

    fn build(
        config: BenchConfig,
        device: Device,
        factory: ModuleFactory,
        label: String,
    ) -> Result<Self, BenchError> {
        let inputs = InputFactory::new(&device, config.seed);
        let memory = memory_source_for(&device);
        log::debug!(
            "suite ready on {} with module '{}' (memory source {})",
            device::describe(&device),
            label,
            memory.name()
        );
        Ok(Self {
            config,
            device,
            factory,
            label,
            inputs,
            memory,
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs `probes` in the given order. Probe errors are recorded as failed
    /// reports; with `fail_fast` the run stops after the first failure.
    pub fn run(&self, probes: &[ProbeKind]) -> SuiteReport {
        let mut reports = Vec::with_capacity(probes.len());
        for probe in probes {
            log::info!("running probe '{probe}'");
            let report = match self.run_one(*probe) {
                Ok(report) => report,
                Err(err) => {
                    log::error!("probe '{probe}' errored: {err}");
                    ProbeReport::failed(probe.as_str(), err.to_string())
                }
            };
            log::info!("probe '{}' {}", report.probe, report.status);

            let failed = report.status.is_failed();
            reports.push(report);
            if failed && self.config.fail_fast {
                log::warn!("stopping after '{probe}' (fail-fast)");
                break;
            }
        }

        SuiteReport {
            device: device::describe(&self.device),
            kernel: self.label.clone(),
            seed: self.config.seed,
            reports,
        }
    }

    fn run_one(&self, probe: ProbeKind) -> Result<ProbeReport, BenchError> {
        let module = (self.factory)(&self.device)?;
        let ctx = ProbeContext {
            module: module.as_ref(),
            device: &self.device,
            config: &self.config,
            inputs: &self.inputs,
            memory: self.memory.as_ref(),
        };
        probe.run(&ctx)
    }
}
