use anyhow::Result;
use attention::{AttentionModule, FlashAttention, FlashAttentionConfig, KernelKind};
use candle_core::{DType, Device, Tensor, Var};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

#[test]
fn forward_preserves_input_shape() -> Result<()> {
    let device = Device::Cpu;
    let module = FlashAttention::with_dims(512, 8, 64, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 1000, 512), &device)?;

    let out = module.forward(&x)?;

    assert_eq!(out.dims(), &[1, 1000, 512]);
    assert_eq!(out.dtype(), DType::F32);
    Ok(())
}

#[test]
fn inner_width_may_differ_from_dim() -> Result<()> {
    let device = Device::Cpu;
    let module = FlashAttention::with_dims(24, 3, 16, &device)?;
    let x = Tensor::randn(0f32, 1.0, (2, 5, 24), &device)?;
    assert_eq!(module.forward(&x)?.dims(), &[2, 5, 24]);
    Ok(())
}

#[test]
fn backward_populates_input_gradient() -> Result<()> {
    let device = Device::Cpu;
    let module = FlashAttention::with_dims(32, 4, 8, &device)?;
    let x = Var::randn(0f32, 1.0, (1, 20, 32), &device)?;

    let out = module.forward(x.as_tensor())?;
    let grads = out.sum_all()?.backward()?;

    let grad = grads.get(x.as_tensor()).expect("input gradient");
    assert_eq!(grad.dims(), x.dims());
    for (name, param) in module.parameters() {
        assert!(grads.get(param.as_tensor()).is_some(), "{name} has no gradient");
    }
    Ok(())
}

#[test]
fn tiled_and_exact_kernels_agree() -> Result<()> {
    let device = Device::Cpu;
    let mut config = FlashAttentionConfig::new(32, 4, 8);
    config.q_chunk_size = 7;
    config.k_chunk_size = 5;
    config.causal = true;
    let tiled = FlashAttention::new(config, &device)?;
    let exact = tiled.with_kernel(KernelKind::Exact);
    let x = Tensor::randn(0f32, 1.0, (2, 19, 32), &device)?;

    let diff = max_abs_diff(&tiled.forward(&x)?, &exact.forward(&x)?)?;
    assert!(diff < 1e-4, "kernels diverged by {diff}");
    Ok(())
}

#[test]
fn outputs_are_repeatable_without_dropout() -> Result<()> {
    let device = Device::Cpu;
    let module = FlashAttention::with_dims(16, 2, 8, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 12, 16), &device)?;
    let first = module.forward(&x)?;
    let second = module.forward(&x)?;
    assert_eq!(max_abs_diff(&first, &second)?, 0.0);
    Ok(())
}

#[test]
fn to_device_keeps_parameters() -> Result<()> {
    let device = Device::Cpu;
    let module = FlashAttention::with_dims(16, 2, 8, &device)?;
    let moved = module.to_device(&Device::Cpu)?;
    let x = Tensor::randn(0f32, 1.0, (1, 6, 16), &device)?;
    assert_eq!(max_abs_diff(&module.forward(&x)?, &moved.forward(&x)?)?, 0.0);
    assert!(moved.device().is_cpu());
    Ok(())
}
