//! `vq-clip`: compose, graft, strip and inspect VQ-CLIP checkpoints.
//!
//! # Usage
//!
//! ```bash
//! vq-clip compose --backbone-config clip/config.json --vision-adapter vq.json --output config.json
//! vq-clip graft --adapter ./vq-vit-l-14-k64-d32 --backbone ./clip-vit-large-patch14 --output ./merged
//! vq-clip strip --input ./merged --output ./adapter-only
//! vq-clip inspect --checkpoint ./adapter-only --json
//! ```
//!
//! Runtime settings come from `--settings FILE` (TOML) with `VQCLIP_*`
//! environment overrides.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vq_clip::RuntimeSettings;

use commands::compose::ComposeArgs;
use commands::graft::GraftArgs;
use commands::inspect::InspectArgs;
use commands::strip::StripArgs;

/// Tools for VQ-CLIP checkpoints.
#[derive(Parser, Debug)]
#[command(name = "vq-clip", version)]
#[command(about = "Compose, graft, strip and inspect VQ-CLIP checkpoints")]
struct Cli {
    /// Runtime settings file (TOML).
    #[arg(long, global = true, env = "VQCLIP_SETTINGS")]
    settings: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge a backbone config and adapter configs into a composite config.json.
    Compose(ComposeArgs),
    /// Combine an adapter checkpoint with a pretrained backbone.
    Graft(GraftArgs),
    /// Rewrite a checkpoint keeping only the adapter tensors.
    Strip(StripArgs),
    /// Summarize a checkpoint directory.
    Inspect(InspectArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(cli.settings.as_deref())?;
    debug!(?settings, "runtime settings");

    match &cli.command {
        Command::Compose(args) => commands::compose::run(args),
        Command::Graft(args) => commands::graft::run(args, &settings),
        Command::Strip(args) => commands::strip::run(args, &settings),
        Command::Inspect(args) => commands::inspect::run(args),
    }
}

/// Logs go to stderr so `inspect --json` output stays machine-readable.
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<RuntimeSettings> {
    let settings = match path {
        Some(path) => RuntimeSettings::from_file(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => RuntimeSettings::default(),
    };
    let settings = settings.with_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}
