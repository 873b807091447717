//! Inspect command: print what a checkpoint directory contains.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{json, Value};
use vq_clip::{AdapterConfig, CheckpointSummary};

/// Arguments for the inspect command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Checkpoint directory (config.json + model.safetensors).
    #[arg(long, short)]
    pub checkpoint: PathBuf,

    /// Print JSON instead of a text table.
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &InspectArgs) -> Result<()> {
    let summary = CheckpointSummary::read(&args.checkpoint)
        .with_context(|| format!("reading {}", args.checkpoint.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?);
    } else {
        print_text(&args.checkpoint, &summary);
    }
    Ok(())
}

pub(crate) fn summary_json(summary: &CheckpointSummary) -> Value {
    let backbone = &summary.config.backbone;
    json!({
        "projection_dim": backbone.projection_dim,
        "text_layers": backbone.text_config.num_hidden_layers,
        "vision_layers": backbone.vision_config.num_hidden_layers,
        "vision_adapter": summary.config.vision_adapter.as_ref().map(adapter_json),
        "text_adapter": summary.config.text_adapter.as_ref().map(adapter_json),
        "adapter_only": summary.is_adapter_only(),
        "tensors": {
            "adapter": summary.adapter_tensor_count(),
            "backbone": summary.backbone_tensor_count(),
        },
        "parameters": summary.parameter_count(),
    })
}

fn adapter_json(config: &AdapterConfig) -> Value {
    json!({
        "codebook_size": config.codebook_size,
        "codebook_dim": config.codebook_dim,
        "heads": config.heads,
        "use_cosine_sim": config.use_cosine_sim,
    })
}

fn print_text(path: &std::path::Path, summary: &CheckpointSummary) {
    let describe = |adapter: Option<&AdapterConfig>| match adapter {
        Some(c) => format!(
            "K={} d={} heads={}{}",
            c.codebook_size,
            c.codebook_dim,
            c.heads,
            if c.use_cosine_sim { " cosine" } else { "" }
        ),
        None => "-".to_string(),
    };

    println!("Checkpoint: {}", path.display());
    println!("  projection_dim:  {}", summary.config.backbone.projection_dim);
    println!(
        "  vision adapter:  {}",
        describe(summary.config.vision_adapter.as_ref())
    );
    println!(
        "  text adapter:    {}",
        describe(summary.config.text_adapter.as_ref())
    );
    println!(
        "  tensors:         {} adapter, {} backbone",
        summary.adapter_tensor_count(),
        summary.backbone_tensor_count()
    );
    println!("  parameters:      {}", summary.parameter_count());
}
