//! Runtime settings for tools that assemble a VQ-CLIP model.
//!
//! # TOML Structure
//!
//! ```toml
//! [device]
//! kind = "cuda"
//! ordinal = 0
//!
//! [checkpoints]
//! adapter = "./checkpoints/vq-vit-l-14-k64-d32"
//! backbone = "./models/clip-vit-large-patch14"
//! ```
//!
//! Environment variables (prefix `VQCLIP_`) override file values.

use std::env;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigFragment, VqClipError, VqClipResult};

/// Compute device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub kind: DeviceKind,
    /// CUDA device ordinal; ignored for CPU.
    pub ordinal: usize,
}

/// `[checkpoints]` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Adapter-only checkpoint directory.
    pub adapter: Option<PathBuf>,
    /// Backbone checkpoint directory or `.safetensors` file.
    pub backbone: Option<PathBuf>,
}

/// Root runtime settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub checkpoints: CheckpointSettings,
}

impl RuntimeSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    /// - `LoadError` if the file cannot be read
    /// - `ConfigError { fragment: Settings }` if TOML parsing fails
    pub fn from_file(path: impl AsRef<Path>) -> VqClipResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| VqClipError::load(path, e))?;
        toml::from_str(&contents).map_err(|e| {
            VqClipError::config(
                ConfigFragment::Settings,
                format!("failed to parse TOML in '{}': {}", path.display(), e),
            )
        })
    }

    /// Parse settings from a TOML string.
    pub fn from_toml_str(toml: &str) -> VqClipResult<Self> {
        toml::from_str(toml).map_err(|e| {
            VqClipError::config(ConfigFragment::Settings, format!("failed to parse TOML: {}", e))
        })
    }

    /// Serialize settings to a TOML string.
    pub fn to_toml_string(&self) -> VqClipResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            VqClipError::config(
                ConfigFragment::Settings,
                format!("failed to serialize to TOML: {}", e),
            )
        })
    }

    /// Apply `VQCLIP_*` environment overrides.
    ///
    /// | Variable | Setting |
    /// |----------|---------|
    /// | `VQCLIP_DEVICE` | `device.kind` (`cpu` or `cuda`) |
    /// | `VQCLIP_CUDA_ORDINAL` | `device.ordinal` |
    /// | `VQCLIP_ADAPTER_CHECKPOINT` | `checkpoints.adapter` |
    /// | `VQCLIP_BACKBONE_CHECKPOINT` | `checkpoints.backbone` |
    ///
    /// # Errors
    /// - `ConfigError` if a variable is set to an unparseable value
    pub fn with_env_overrides(self) -> VqClipResult<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> VqClipResult<Self> {
        if let Some(val) = lookup("VQCLIP_DEVICE") {
            self.device.kind = match val.to_ascii_lowercase().as_str() {
                "cpu" => DeviceKind::Cpu,
                "cuda" => DeviceKind::Cuda,
                other => {
                    return Err(VqClipError::config(
                        ConfigFragment::Settings,
                        format!("VQCLIP_DEVICE must be 'cpu' or 'cuda', got '{}'", other),
                    ))
                }
            };
        }
        if let Some(val) = lookup("VQCLIP_CUDA_ORDINAL") {
            self.device.ordinal = val.parse().map_err(|_| {
                VqClipError::config(
                    ConfigFragment::Settings,
                    format!("VQCLIP_CUDA_ORDINAL must be an integer, got '{}'", val),
                )
            })?;
        }
        if let Some(val) = lookup("VQCLIP_ADAPTER_CHECKPOINT") {
            self.checkpoints.adapter = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("VQCLIP_BACKBONE_CHECKPOINT") {
            self.checkpoints.backbone = Some(PathBuf::from(val));
        }
        Ok(self)
    }

    /// Validate settings.
    ///
    /// # Errors
    /// - `ConfigError` if a checkpoint path is empty
    pub fn validate(&self) -> VqClipResult<()> {
        for (name, path) in [
            ("checkpoints.adapter", &self.checkpoints.adapter),
            ("checkpoints.backbone", &self.checkpoints.backbone),
        ] {
            if let Some(p) = path {
                if p.as_os_str().is_empty() {
                    return Err(VqClipError::config(
                        ConfigFragment::Settings,
                        format!("{} must not be empty", name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Open the configured device.
    pub fn device(&self) -> VqClipResult<Device> {
        match self.device.kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => Ok(Device::new_cuda(self.device.ordinal)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid_cpu() {
        let settings = RuntimeSettings::default();
        settings.validate().expect("defaults must validate");
        assert_eq!(settings.device.kind, DeviceKind::Cpu);
        assert!(matches!(settings.device().unwrap(), Device::Cpu));
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [device]
            kind = "cuda"
            ordinal = 1

            [checkpoints]
            adapter = "/ckpt/adapter"
            backbone = "/ckpt/clip"
        "#;
        let settings = RuntimeSettings::from_toml_str(toml).unwrap();
        assert_eq!(settings.device.kind, DeviceKind::Cuda);
        assert_eq!(settings.device.ordinal, 1);
        assert_eq!(settings.checkpoints.adapter, Some(PathBuf::from("/ckpt/adapter")));
        assert_eq!(settings.checkpoints.backbone, Some(PathBuf::from("/ckpt/clip")));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = RuntimeSettings::from_toml_str("[gpu]\nenabled = true\n").unwrap_err();
        assert!(matches!(
            err,
            VqClipError::ConfigError {
                fragment: ConfigFragment::Settings,
                ..
            }
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = RuntimeSettings::default();
        settings.checkpoints.backbone = Some(PathBuf::from("/models/clip"));
        settings.device.ordinal = 2;
        let toml = settings.to_toml_string().unwrap();
        assert_eq!(RuntimeSettings::from_toml_str(&toml).unwrap(), settings);
    }

    #[test]
    fn test_env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("VQCLIP_DEVICE", "CUDA"),
            ("VQCLIP_CUDA_ORDINAL", "3"),
            ("VQCLIP_BACKBONE_CHECKPOINT", "/env/clip"),
        ]
        .into_iter()
        .collect();
        let settings = RuntimeSettings::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.device.kind, DeviceKind::Cuda);
        assert_eq!(settings.device.ordinal, 3);
        assert_eq!(settings.checkpoints.backbone, Some(PathBuf::from("/env/clip")));
        assert_eq!(settings.checkpoints.adapter, None);
    }

    #[test]
    fn test_bad_env_override_fails_fast() {
        let err = RuntimeSettings::default()
            .with_overrides(|k| (k == "VQCLIP_CUDA_ORDINAL").then(|| "first".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("VQCLIP_CUDA_ORDINAL"));
    }

    #[test]
    fn test_empty_checkpoint_path_is_invalid() {
        let mut settings = RuntimeSettings::default();
        settings.checkpoints.adapter = Some(PathBuf::new());
        assert!(settings.validate().is_err());
    }
}
