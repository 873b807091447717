//! Graft command: adapter checkpoint + pretrained backbone -> full checkpoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{error, info};
use vq_clip::{RuntimeSettings, VqClipModel};

use super::path_or_setting;

/// Arguments for the graft command.
#[derive(Args, Debug)]
pub struct GraftArgs {
    /// Adapter checkpoint directory (falls back to `checkpoints.adapter`).
    #[arg(long)]
    pub adapter: Option<PathBuf>,

    /// Backbone checkpoint directory or .safetensors file (falls back to
    /// `checkpoints.backbone`).
    #[arg(long)]
    pub backbone: Option<PathBuf>,

    /// Output directory for the combined checkpoint.
    #[arg(long, short)]
    pub output: PathBuf,
}

pub fn run(args: &GraftArgs, settings: &RuntimeSettings) -> Result<()> {
    let adapter = path_or_setting(
        args.adapter.as_deref(),
        settings.checkpoints.adapter.as_deref(),
        "--adapter",
        "checkpoints.adapter",
    )?;
    let backbone = path_or_setting(
        args.backbone.as_deref(),
        settings.checkpoints.backbone.as_deref(),
        "--backbone",
        "checkpoints.backbone",
    )?;
    let device = settings.device()?;

    let model = match VqClipModel::from_parts(&adapter, &backbone, &device) {
        Ok(model) => model,
        Err(e) => {
            error!(error = %e, "graft failed");
            return Err(e).with_context(|| {
                format!(
                    "grafting {} onto {}",
                    adapter.display(),
                    backbone.display()
                )
            });
        }
    };
    model
        .save_pretrained(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    info!(
        output = %args.output.display(),
        backbone_parameters = model.backbone().parameter_count(),
        "graft complete"
    );
    println!("Wrote combined checkpoint to {}", args.output.display());
    Ok(())
}
