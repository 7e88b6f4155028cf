//! Sweeps shapes, dtypes and causality and checks that the tiled kernel
//! tracks the exact one.
//! Run with: `cargo bench -p attention-bench --bench kernel_agreement`

use std::{error::Error, path::Path};

use attention::{flash::TiledAttention, reference::ExactAttention, Attention, Config};
use attention_bench::{
    report::{format_markdown_table, update_results},
    select_device, DeviceRequest,
};
use candle_core::{DType, Device, Tensor};

const ABS_TOL: f32 = 5e-3;
// Only enforced for f32; half precision inputs differ after rounding.
const REL_TOL: f32 = 5e-2;

const HEADS: usize = 4;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("kernel agreement failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = select_device(DeviceRequest::Auto)?;
    let tiled = TiledAttention::new();
    let exact = ExactAttention::new();

    let mut rows = Vec::new();
    let mut breaches = Vec::new();
    for seq_len in [32usize, 128, 517, 2048] {
        for head_dim in [64usize, 80, 128] {
            for dtype in [DType::F32, DType::BF16, DType::F16] {
                let (q, k, v) = random_qkv(&device, seq_len, head_dim, dtype)?;
                for causal in [false, true] {
                    let config = Config {
                        causal,
                        q_chunk_size: 128,
                        k_chunk_size: 256,
                        ..Config::default()
                    };
                    let want = exact.attend(&q, &k, &v, None, &config)?;
                    let got = tiled.attend(&q, &k, &v, None, &config)?;
                    let (max_abs, max_rel) = deviation(&want, &got)?;

                    let label = format!("s={seq_len} d={head_dim} {dtype:?} causal={causal}");
                    if max_abs > ABS_TOL || (dtype == DType::F32 && max_rel > REL_TOL) {
                        breaches.push(format!("{label}: abs={max_abs:.3e} rel={max_rel:.3e}"));
                    }
                    rows.push(vec![
                        format!("(1,{HEADS},{seq_len},{head_dim})"),
                        format!("{dtype:?}"),
                        causal.to_string(),
                        format!("{max_abs:.2e}"),
                        format!("{max_rel:.2e}"),
                    ]);
                }
            }
        }
    }

    let table = format_markdown_table(&["shape", "dtype", "causal", "max abs", "max rel"], &rows);
    println!("\nKernel agreement:\n{table}");
    update_results(Path::new("benchmarks/RESULTS.md"), "agreement", &table)?;

    if !breaches.is_empty() {
        return Err(format!("tolerance exceeded:\n  {}", breaches.join("\n  ")).into());
    }
    Ok(())
}

fn random_qkv(
    device: &Device,
    seq_len: usize,
    head_dim: usize,
    dtype: DType,
) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
    let shape = (1, HEADS, seq_len, head_dim);
    let draw = || Tensor::rand(0f32, 1.0, shape, device)?.to_dtype(dtype);
    Ok((draw()?, draw()?, draw()?))
}

/// Largest absolute and relative (to the exact output) element difference.
fn deviation(want: &Tensor, got: &Tensor) -> candle_core::Result<(f32, f32)> {
    let want = want.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let got = got.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(want
        .iter()
        .zip(&got)
        .fold((0f32, 0f32), |(max_abs, max_rel), (w, g)| {
            let abs = (w - g).abs();
            (max_abs.max(abs), max_rel.max(abs / w.abs().max(1e-5)))
        }))
}
