//! Sequence-level attention modules.
//!
//! [`AttentionModule`] is the contract benchmarks and callers program
//! against: the module is built for an embedding width `dim`, lives on one
//! device, and maps `(batch, seq_len, dim)` activations to a tensor of the
//! same shape. [`FlashAttention`] is the concrete multi-head implementation.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};

use crate::core::{Attention, AttentionError, Config, PrecisionPolicy};
use crate::flash::TiledAttention;
use crate::projection::{Projection, ProjectionConfig, ProjectionInit};
use crate::reference::ExactAttention;

/// A module that attends over a sequence of embeddings.
pub trait AttentionModule: Send + Sync {
    /// Embedding width accepted and produced by [`forward`](Self::forward).
    fn dim(&self) -> usize;

    /// Device hosting the module parameters.
    fn device(&self) -> &Device;

    /// Maps `(batch, seq_len, dim)` to a tensor of identical shape.
    fn forward(&self, x: &Tensor) -> Result<Tensor, AttentionError>;

    /// Forward pass that keeps no gradient history for the module's own
    /// parameters. The default detaches the output of
    /// [`forward`](Self::forward); implementations holding trainable
    /// parameters override it so intermediates are released tile by tile.
    fn forward_inference(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
        Ok(self.forward(x)?.detach())
    }
}

/// Which kernel computes the per-head attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelKind {
    /// Chunked online-softmax kernel, memory linear in sequence length.
    #[default]
    Tiled,
    /// Materialises the full score matrix.
    Exact,
}

impl KernelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelKind::Tiled => "tiled",
            KernelKind::Exact => "exact",
        }
    }

    fn build(self) -> Arc<dyn Attention> {
        match self {
            KernelKind::Tiled => Arc::new(TiledAttention::new()),
            KernelKind::Exact => Arc::new(ExactAttention::new()),
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KernelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiled" | "flash" => Ok(KernelKind::Tiled),
            "exact" | "reference" => Ok(KernelKind::Exact),
            other => Err(format!("unknown attention kernel '{other}' (expected tiled or exact)")),
        }
    }
}

/// Parameters are held in f32; inputs of another float dtype are cast on the
/// way in and the output is cast back.
const PARAMETER_DTYPE: DType = DType::F32;

/// Hyperparameters of a [`FlashAttention`] module.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashAttentionConfig {
    /// Embedding width of inputs and outputs.
    pub dim: usize,
    pub heads: usize,
    /// Width of each head; `heads * dim_head` need not equal `dim`.
    pub dim_head: usize,
    pub causal: bool,
    pub kernel: KernelKind,
    pub q_chunk_size: usize,
    pub k_chunk_size: usize,
    pub dropout_p: Option<f32>,
}

impl FlashAttentionConfig {
    pub fn new(dim: usize, heads: usize, dim_head: usize) -> Self {
        let defaults = Config::default();
        Self {
            dim,
            heads,
            dim_head,
            causal: false,
            kernel: KernelKind::default(),
            q_chunk_size: defaults.q_chunk_size,
            k_chunk_size: defaults.k_chunk_size,
            dropout_p: None,
        }
    }

    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    fn attention_config(&self) -> Config {
        Config {
            dropout_p: self.dropout_p,
            causal: self.causal,
            precision: PrecisionPolicy::ForceF32,
            q_chunk_size: self.q_chunk_size,
            k_chunk_size: self.k_chunk_size,
        }
    }

    fn validate(&self) -> Result<(), AttentionError> {
        let mut problems = Vec::new();
        if self.dim == 0 {
            problems.push("dim must be greater than 0");
        }
        if self.heads == 0 {
            problems.push("heads must be greater than 0");
        }
        if self.dim_head == 0 {
            problems.push("dim_head must be greater than 0");
        }
        if !problems.is_empty() {
            return Err(AttentionError::InvalidConfig {
                context: problems.join("; "),
            });
        }
        self.attention_config().validate()
    }
}

/// Multi-head self-attention: project to queries, keys and values, attend
/// per head, merge heads and project back to `dim`.
#[derive(Clone)]
pub struct FlashAttention {
    config: FlashAttentionConfig,
    attention_config: Config,
    to_q: Projection,
    to_kv: Projection,
    to_out: Projection,
    kernel: Arc<dyn Attention>,
    device: Device,
}

impl fmt::Debug for FlashAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashAttention")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish()
    }
}

impl FlashAttention {
    /// Builds a module with freshly initialised parameters on `device`.
    pub fn new(config: FlashAttentionConfig, device: &Device) -> Result<Self, AttentionError> {
        config.validate()?;
        let inner = config.inner_dim();
        let init = ProjectionInit::default();

        let to_q = Projection::with_init(
            ProjectionConfig::new(config.dim, inner).without_bias(),
            &init,
            device,
            PARAMETER_DTYPE,
        )?;
        let to_kv = Projection::with_init(
            ProjectionConfig::new(config.dim, 2 * inner).without_bias(),
            &init,
            device,
            PARAMETER_DTYPE,
        )?;
        let to_out = Projection::with_init(
            ProjectionConfig::new(inner, config.dim),
            &init,
            device,
            PARAMETER_DTYPE,
        )?;

        log::debug!(
            "built attention module dim={} heads={} dim_head={} kernel={} device={:?}",
            config.dim,
            config.heads,
            config.dim_head,
            config.kernel,
            device.location()
        );

        Ok(Self {
            attention_config: config.attention_config(),
            kernel: config.kernel.build(),
            config,
            to_q,
            to_kv,
            to_out,
            device: device.clone(),
        })
    }

    /// Shorthand for the three-argument form `(dim, heads, dim_head)`.
    pub fn with_dims(
        dim: usize,
        heads: usize,
        dim_head: usize,
        device: &Device,
    ) -> Result<Self, AttentionError> {
        Self::new(FlashAttentionConfig::new(dim, heads, dim_head), device)
    }

    pub fn config(&self) -> &FlashAttentionConfig {
        &self.config
    }

    /// Returns a copy of the module with every parameter moved to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self, AttentionError> {
        Ok(Self {
            config: self.config.clone(),
            attention_config: self.attention_config.clone(),
            to_q: self.to_q.to_device(device)?,
            to_kv: self.to_kv.to_device(device)?,
            to_out: self.to_out.to_device(device)?,
            kernel: Arc::clone(&self.kernel),
            device: device.clone(),
        })
    }

    /// Returns a module sharing these parameters but computing attention with
    /// `kernel`.
    pub fn with_kernel(&self, kernel: KernelKind) -> Self {
        let mut config = self.config.clone();
        config.kernel = kernel;
        Self {
            config,
            attention_config: self.attention_config.clone(),
            to_q: self.to_q.clone(),
            to_kv: self.to_kv.clone(),
            to_out: self.to_out.clone(),
            kernel: kernel.build(),
            device: self.device.clone(),
        }
    }

    /// All trainable parameters keyed by their dotted path.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.to_q.named_parameters("to_q");
        params.extend(self.to_kv.named_parameters("to_kv"));
        params.extend(self.to_out.named_parameters("to_out"));
        params
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    fn validate_input(&self, x: &Tensor) -> Result<(usize, usize), AttentionError> {
        match *x.dims() {
            [batch, seq, dim] if dim == self.config.dim && batch > 0 && seq > 0 => Ok((batch, seq)),
            _ => Err(AttentionError::InvalidShape {
                context: format!(
                    "input must be [batch, seq_len, {}] with non-zero batch and seq_len, got {:?}",
                    self.config.dim,
                    x.dims()
                ),
            }),
        }
    }

    /// `(batch, seq, heads * dim_head)` to `(batch, heads, seq, dim_head)`.
    fn split_heads(&self, t: &Tensor, batch: usize, seq: usize) -> Result<Tensor, AttentionError> {
        Ok(t.contiguous()?
            .reshape((batch, seq, self.config.heads, self.config.dim_head))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn run(&self, x: &Tensor, track: bool) -> Result<Tensor, AttentionError> {
        let (batch, seq) = self.validate_input(x)?;
        if !x.device().same_device(&self.device) {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "input on {:?} but module parameters on {:?}",
                    x.device().location(),
                    self.device.location()
                ),
            });
        }
        let inner = self.config.inner_dim();

        let project = |proj: &Projection, input: &Tensor| {
            if track {
                proj.forward(input)
            } else {
                proj.forward_detached(input)
            }
        };

        let q = project(&self.to_q, x)?;
        let kv = project(&self.to_kv, x)?;
        let k = kv.narrow(2, 0, inner)?;
        let v = kv.narrow(2, inner, inner)?;

        let q = self.split_heads(&q, batch, seq)?;
        let k = self.split_heads(&k, batch, seq)?;
        let v = self.split_heads(&v, batch, seq)?;

        let attended = self
            .kernel
            .attend(&q, &k, &v, None, &self.attention_config)?;
        let merged = attended
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, inner))?;

        let out = project(&self.to_out, &merged)?;
        if out.dtype() == x.dtype() {
            Ok(out)
        } else {
            Ok(out.to_dtype(x.dtype())?)
        }
    }
}

impl AttentionModule for FlashAttention {
    fn dim(&self) -> usize {
        self.config.dim
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
        self.run(x, true)
    }

    fn forward_inference(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
        self.run(x, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_kind_parses_aliases() {
        assert_eq!("flash".parse::<KernelKind>(), Ok(KernelKind::Tiled));
        assert_eq!(" Exact ".parse::<KernelKind>(), Ok(KernelKind::Exact));
        assert!("dense".parse::<KernelKind>().is_err());
    }

    #[test]
    fn zero_sized_config_is_rejected() {
        let err = FlashAttention::with_dims(0, 8, 64, &Device::Cpu).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
        let err = FlashAttention::with_dims(32, 0, 0, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("heads"));
        assert!(err.to_string().contains("dim_head"));
    }

    #[test]
    fn parameter_layout_follows_projections() {
        let module = FlashAttention::with_dims(16, 2, 4, &Device::Cpu).unwrap();
        let names: Vec<_> = module.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["to_q.weight", "to_kv.weight", "to_out.weight", "to_out.bias"]
        );
        // q: 16*8, kv: 16*16, out: 8*16 + 16
        assert_eq!(module.parameter_count(), 128 + 256 + 128 + 16);
    }

    #[test]
    fn rejects_wrong_rank_and_width() {
        let module = FlashAttention::with_dims(8, 2, 4, &Device::Cpu).unwrap();
        let flat = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(module.forward(&flat).is_err());
        let wide = Tensor::zeros((1, 4, 9), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            module.forward(&wide),
            Err(AttentionError::InvalidShape { .. })
        ));
    }

    #[test]
    fn inference_forward_matches_and_keeps_no_history() {
        let module = FlashAttention::with_dims(8, 2, 4, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 5, 8), &Device::Cpu).unwrap();
        let tracked = module.forward(&x).unwrap();
        let plain = module.forward_inference(&x).unwrap();
        let diff = (tracked - &plain)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);

        let grads = plain.sum_all().unwrap().backward().unwrap();
        for (name, var) in module.parameters() {
            assert!(grads.get(var.as_tensor()).is_none(), "{name} has a gradient");
        }
    }
}
