//! Strip command: rewrite a checkpoint with adapter tensors only.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use vq_clip::{RuntimeSettings, VqClipModel};

/// Arguments for the strip command.
#[derive(Args, Debug)]
pub struct StripArgs {
    /// Checkpoint directory to read.
    #[arg(long, short)]
    pub input: PathBuf,

    /// Output directory for the adapter-only checkpoint.
    #[arg(long, short)]
    pub output: PathBuf,
}

pub fn run(args: &StripArgs, settings: &RuntimeSettings) -> Result<()> {
    let device = settings.device()?;
    let model = VqClipModel::from_pretrained(&args.input, &device)
        .with_context(|| format!("loading {}", args.input.display()))?;
    model
        .save_adapter(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let tensors = model.adapter_parameters()?.len();
    info!(output = %args.output.display(), tensors, "stripped checkpoint");
    println!(
        "Wrote adapter-only checkpoint ({} tensors) to {}",
        tensors,
        args.output.display()
    );
    Ok(())
}
