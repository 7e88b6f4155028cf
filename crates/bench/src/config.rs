use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use attention::{AttentionError, FlashAttentionConfig, KernelKind};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::device::DeviceRequest;

pub const DEFAULT_DIM: usize = 512;
pub const DEFAULT_HEADS: usize = 8;
pub const DEFAULT_DIM_HEAD: usize = 64;
pub const DEFAULT_BATCH: usize = 1;
pub const DEFAULT_SEQ_LEN: usize = 1000;
pub const DEFAULT_SWEEP: [usize; 6] = [1000, 2000, 4000, 8000, 16000, 32000];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub device: DeviceRequest,
    /// Seeds input generation; `None` draws from the device RNG.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub module: ModuleSettings,
    #[serde(default)]
    pub input: InputSettings,
    #[serde(default)]
    pub scalability: ScalabilitySettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl BenchConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: BenchConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(BenchError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.output.apply_base_path(base_dir);
        config.validate()?;

        log::debug!("loaded bench config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        let mut errors = Vec::new();

        if self.module.dim == 0 {
            errors.push("module.dim must be greater than 0".to_string());
        }
        if self.module.heads == 0 {
            errors.push("module.heads must be greater than 0".to_string());
        }
        if self.module.dim_head == 0 {
            errors.push("module.dim_head must be greater than 0".to_string());
        }
        if self.module.q_chunk_size == 0 {
            errors.push("module.q_chunk_size must be greater than 0".to_string());
        }
        if self.module.k_chunk_size == 0 {
            errors.push("module.k_chunk_size must be greater than 0".to_string());
        }
        if let Some(p) = self.module.dropout_p {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("module.dropout_p must be in [0, 1), got {p}"));
            }
        }

        if self.input.batch == 0 {
            errors.push("input.batch must be greater than 0".to_string());
        }
        if self.input.seq_len == 0 {
            errors.push("input.seq_len must be greater than 0".to_string());
        }

        if self.scalability.seq_lens.is_empty() {
            errors.push("scalability.seq_lens must not be empty".to_string());
        }
        if self.scalability.seq_lens.iter().any(|n| *n == 0) {
            errors.push("scalability.seq_lens entries must be greater than 0".to_string());
        }

        if self.timing.iterations == 0 {
            errors.push("timing.iterations must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(BenchError::Validation(errors));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSettings {
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    #[serde(default)]
    pub causal: bool,
    #[serde(default, deserialize_with = "from_str_field")]
    pub kernel: KernelKind,
    #[serde(default = "default_q_chunk")]
    pub q_chunk_size: usize,
    #[serde(default = "default_k_chunk")]
    pub k_chunk_size: usize,
    #[serde(default)]
    pub dropout_p: Option<f32>,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            dim: DEFAULT_DIM,
            heads: DEFAULT_HEADS,
            dim_head: DEFAULT_DIM_HEAD,
            causal: false,
            kernel: KernelKind::default(),
            q_chunk_size: default_q_chunk(),
            k_chunk_size: default_k_chunk(),
            dropout_p: None,
        }
    }
}

impl ModuleSettings {
    pub fn module_config(&self) -> FlashAttentionConfig {
        let mut config = FlashAttentionConfig::new(self.dim, self.heads, self.dim_head);
        config.causal = self.causal;
        config.kernel = self.kernel;
        config.q_chunk_size = self.q_chunk_size;
        config.k_chunk_size = self.k_chunk_size;
        config.dropout_p = self.dropout_p;
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSettings {
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            seq_len: DEFAULT_SEQ_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalabilitySettings {
    #[serde(default = "default_sweep")]
    pub seq_lens: Vec<usize>,
}

impl Default for ScalabilitySettings {
    fn default() -> Self {
        Self {
            seq_lens: default_sweep(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingSettings {
    /// Untimed forward calls issued before measuring.
    #[serde(default)]
    pub warmup: usize,
    /// Timed forward calls; each is followed by a device synchronisation.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            warmup: 0,
            iterations: default_iterations(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSettings {
    /// Markdown file whose `PROBES` section is rewritten after each run.
    #[serde(default)]
    pub results_markdown: Option<PathBuf>,
    #[serde(default)]
    pub json: Option<PathBuf>,
}

impl OutputSettings {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [&mut self.results_markdown, &mut self.json].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

fn default_dim() -> usize {
    DEFAULT_DIM
}

fn default_heads() -> usize {
    DEFAULT_HEADS
}

fn default_dim_head() -> usize {
    DEFAULT_DIM_HEAD
}

fn default_q_chunk() -> usize {
    attention::Config::default().q_chunk_size
}

fn default_k_chunk() -> usize {
    attention::Config::default().k_chunk_size
}

fn default_batch() -> usize {
    DEFAULT_BATCH
}

fn default_seq_len() -> usize {
    DEFAULT_SEQ_LEN
}

fn default_sweep() -> Vec<usize> {
    DEFAULT_SWEEP.to_vec()
}

fn default_iterations() -> usize {
    1
}

fn from_str_field<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("device unavailable: {0}")]
    Device(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("benchmark failed: {0}")]
    Runtime(String),
}

impl BenchError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }
}

impl From<toml::de::Error> for BenchError {
    fn from(value: toml::de::Error) -> Self {
        BenchError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(value: serde_json::Error) -> Self {
        BenchError::ConfigFormat(value.to_string())
    }
}
