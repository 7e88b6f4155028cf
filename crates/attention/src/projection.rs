//! Dense projections used by attention modules.
//!
//! Projections accept inputs shaped `(batch, seq, in_dim)` or `(rows, in_dim)`
//! and return the same leading dimensions with `out_dim` features. Parameters
//! are stored as [`Var`]s so `loss.backward()` produces gradients for them as
//! well as for the activations flowing through. Initialisation policies mirror
//! common transformer recipes (Glorot and Kaiming uniform).

use candle_core::{DType, Device, Error, Result, Tensor, Var};

/// Shape and bias settings of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
}

impl ProjectionConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

/// How the weight matrix is drawn. Biases always start at zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectionInit {
    /// `U(±sqrt(6 / (fan_in + fan_out)))`.
    XavierUniform,
    /// `U(±gain * sqrt(3 / fan_in))` with `gain = sqrt(2 / (1 + slope²))`.
    KaimingUniform { negative_slope: f64 },
}

impl Default for ProjectionInit {
    /// Uniform in `±1/sqrt(fan_in)`, the usual default for dense layers.
    fn default() -> Self {
        Self::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }
}

impl ProjectionInit {
    fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            ProjectionInit::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            ProjectionInit::KaimingUniform { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
        }
    }
}

/// Affine projection `y = x Wᵀ + b` with trainable parameters.
#[derive(Debug, Clone)]
pub struct Projection {
    config: ProjectionConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Projection {
    /// Builds a projection from existing parameters.
    pub fn new(config: ProjectionConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.map(|b| Var::from_tensor(&b)).transpose()?,
        })
    }

    /// Builds a projection with weights sampled from `init` and a zero bias.
    pub fn with_init(
        config: ProjectionConfig,
        init: &ProjectionInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            return Err(Error::Msg(format!(
                "projection dimensions must be non-zero, got {}x{}",
                config.output_dim, config.input_dim
            )));
        }
        let weight = init
            .sample((config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Returns a copy whose parameters live on `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let weight = self.weight.as_tensor().to_device(device)?;
        let bias = match &self.bias {
            Some(bias) => Some(bias.as_tensor().to_device(device)?),
            None => None,
        };
        Self::new(self.config, weight, bias)
    }

    /// Parameters under `scope`, e.g. `to_q.weight`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{scope}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{scope}.bias"), bias.clone()));
        }
        params
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.apply(
            input,
            self.weight.as_tensor(),
            self.bias.as_ref().map(Var::as_tensor),
        )
    }

    /// Same result as [`forward`](Self::forward) but the parameters enter the
    /// graph detached, so nothing downstream records gradient history unless
    /// `input` itself is tracked.
    pub fn forward_detached(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight.as_tensor().detach();
        let bias = self.bias.as_ref().map(|b| b.as_tensor().detach());
        self.apply(input, &weight, bias.as_ref())
    }

    fn apply(&self, input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let input = if input.dtype() == weight.dtype() {
            input.clone()
        } else {
            input.to_dtype(weight.dtype())?
        };
        let weight_t = weight.t()?;

        let output = match *input.dims() {
            [batch, seq, hidden] => {
                self.check_hidden(hidden)?;
                input
                    .reshape((batch * seq, hidden))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            [_, hidden] => {
                self.check_hidden(hidden)?;
                input.matmul(&weight_t)?
            }
            _ => {
                return Err(Error::Msg(format!(
                    "projection expects input shaped [B, T, {0}] or [T, {0}], got {1:?}",
                    self.config.input_dim,
                    input.dims()
                )))
            }
        };

        match bias {
            Some(bias) => output.broadcast_add(bias),
            None => Ok(output),
        }
    }

    fn check_hidden(&self, hidden: usize) -> Result<()> {
        if hidden == self.config.input_dim {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "expected last dim {} but received {}",
                self.config.input_dim, hidden
            )))
        }
    }

    fn validate_weight(config: &ProjectionConfig, weight: &Tensor) -> Result<()> {
        let expected = [config.output_dim, config.input_dim];
        if weight.dims() != expected {
            return Err(Error::Msg(format!(
                "projection weight expected shape {:?}, got {:?}",
                expected,
                weight.dims()
            )));
        }
        if !matches!(weight.dtype(), DType::F16 | DType::BF16 | DType::F32) {
            return Err(Error::Msg(format!(
                "projection weight dtype {:?} is not a float type",
                weight.dtype()
            )));
        }
        Ok(())
    }

    fn validate_bias(config: &ProjectionConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) if tensor.dims() == [config.output_dim] => Ok(()),
            (true, Some(tensor)) => Err(Error::Msg(format!(
                "projection bias expected shape [{}], got {:?}",
                config.output_dim,
                tensor.dims()
            ))),
            (false, Some(_)) => Err(Error::Msg("projection configured without bias was given one".into())),
            (true, None) => Err(Error::Msg("projection configured with bias is missing it".into())),
            (false, None) => Ok(()),
        }
    }
}
