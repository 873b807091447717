//! Compose command: write a composite config.json from separate fragments.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use vq_clip::{AdapterConfig, BackboneConfig, CompositeConfig, ConfigFragment};

/// Arguments for the compose command.
#[derive(Args, Debug)]
pub struct ComposeArgs {
    /// Backbone config (plain CLIP config.json or a composite config).
    #[arg(long)]
    pub backbone_config: PathBuf,

    /// Vision adapter config; omit to leave images unquantized.
    #[arg(long)]
    pub vision_adapter: Option<PathBuf>,

    /// Text adapter config; omit to leave text unquantized.
    #[arg(long)]
    pub text_adapter: Option<PathBuf>,

    /// Output path for the composite config.
    #[arg(long, short)]
    pub output: PathBuf,
}

pub fn run(args: &ComposeArgs) -> Result<()> {
    let config = compose(args)?;
    config
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let active = config.active_modalities();
    info!(
        output = %args.output.display(),
        vision_adapter = active.vision,
        text_adapter = active.text,
        "composed config"
    );
    println!(
        "Wrote {} (vision adapter: {}, text adapter: {})",
        args.output.display(),
        active.vision,
        active.text
    );
    Ok(())
}

fn compose(args: &ComposeArgs) -> Result<CompositeConfig> {
    let backbone = BackboneConfig::from_file(&args.backbone_config)?;
    let vision = args
        .vision_adapter
        .as_ref()
        .map(|p| AdapterConfig::from_file(p, ConfigFragment::VisionAdapter))
        .transpose()?;
    let text = args
        .text_adapter
        .as_ref()
        .map(|p| AdapterConfig::from_file(p, ConfigFragment::TextAdapter))
        .transpose()?;

    let config = CompositeConfig::from_parts(backbone, vision, text);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_utils::{tiny_adapter, tiny_backbone};

    fn write_json(dir: &std::path::Path, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_compose_writes_composite_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = ComposeArgs {
            backbone_config: write_json(dir.path(), "clip.json", serde_json::to_value(tiny_backbone()).unwrap()),
            vision_adapter: None,
            text_adapter: Some(write_json(dir.path(), "text.json", serde_json::to_value(tiny_adapter()).unwrap())),
            output: dir.path().join("config.json"),
        };
        run(&args).unwrap();

        let config = CompositeConfig::from_file(&args.output).unwrap();
        assert_eq!(config.backbone, tiny_backbone());
        assert!(config.vision_adapter.is_none());
        assert_eq!(config.text_adapter, Some(tiny_adapter()));
    }

    #[test]
    fn test_compose_rejects_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let wide = AdapterConfig {
            embed_dim: 99,
            ..tiny_adapter()
        };
        let args = ComposeArgs {
            backbone_config: write_json(dir.path(), "clip.json", serde_json::to_value(tiny_backbone()).unwrap()),
            vision_adapter: Some(write_json(dir.path(), "vision.json", serde_json::to_value(&wide).unwrap())),
            text_adapter: None,
            output: dir.path().join("config.json"),
        };
        assert!(run(&args).is_err());
        assert!(!args.output.exists());
    }
}
