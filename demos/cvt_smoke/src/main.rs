//! Build a CvT model, print its parameter count, and run one forward pass.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bimm_cvt::models::cvt::{CvtConfig, CvtMeta, PoolMode};
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::prelude::Tensor;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "cvt_smoke")]
#[command(about = "Build a CvT model and run one forward pass on a ones-filled image")]
struct Args {
    /// Load the model config from a JSON file; overrides the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective model config to a JSON file.
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Input image channels.
    #[arg(long, default_value = "3")]
    channels: usize,

    /// First stage embedding width.
    #[arg(long, default_value = "64")]
    d_embed: usize,

    /// Token pooling strategy (cls or mean).
    #[arg(long, default_value = "cls")]
    pool: PoolMode,

    /// Maximum stochastic depth rate.
    #[arg(long, default_value = "0.0")]
    drop_path_rate: f64,

    /// Side of the square input image.
    #[arg(long, default_value = "224")]
    image_size: usize,

    /// Batch size.
    #[arg(long, default_value = "1")]
    batch: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    type B = NdArray;
    let device = Default::default();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            CvtConfig::load(path)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => CvtConfig::new(args.channels)
            .with_d_embed(args.d_embed)
            .with_pool(args.pool)
            .with_drop_path_rate(args.drop_path_rate),
    };

    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("saving {}", path.display()))?;
        info!("Saved configuration to: {:?}", path);
    }

    let model = config.try_init::<B>(&device)?;
    println!(
        "Trainable Parameters: {:.3}M",
        model.num_params() as f64 / 1.0e6
    );

    let resolutions = model.stage_resolutions(args.image_size)?;
    info!(?resolutions, "stage grid sizes");

    let images = Tensor::<B, 4>::ones(
        [args.batch, model.d_input(), args.image_size, args.image_size],
        &device,
    );
    let output = model.forward(images);
    println!("Output shape: {:?}", output.dims());

    Ok(())
}
