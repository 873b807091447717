//! Loading pretrained backbone weights.

use std::path::{Path, PathBuf};

use candle_core::Device;
use tracing::{debug, info};

use crate::checkpoint::{self, BACKBONE_PREFIX, CONFIG_FILE, WEIGHTS_FILE};
use crate::config::BackboneConfig;
use crate::error::{VqClipError, VqClipResult};

use super::ClipBackbone;

impl ClipBackbone {
    /// Load a pretrained backbone.
    ///
    /// `path` is either a directory containing `config.json` and
    /// `model.safetensors`, or a bare `.safetensors` file, in which case
    /// `fallback_config` describes its shape. A directory config may be a
    /// plain CLIP config or a composite VQ-CLIP config; for the latter the
    /// backbone fragment is used. Tensor names with a `clip_model.` prefix
    /// are accepted.
    ///
    /// # Errors
    /// - `LoadError` if the path, config or container is missing or
    ///   unreadable, or if any backbone tensor is absent or mis-shaped
    /// - `ConfigError` if the config is unparseable
    pub fn from_pretrained(
        path: impl AsRef<Path>,
        fallback_config: &BackboneConfig,
        device: &Device,
    ) -> VqClipResult<Self> {
        let path = path.as_ref();
        let (config, weights_path) = resolve(path, fallback_config)?;

        let tensors = checkpoint::read_tensors(&weights_path, device)?;
        let prefix = if tensors
            .keys()
            .any(|k| k.starts_with(&format!("{}.", BACKBONE_PREFIX)))
        {
            BACKBONE_PREFIX
        } else {
            ""
        };
        debug!(
            path = %weights_path.display(),
            tensors = tensors.len(),
            prefix,
            "read backbone container"
        );

        let backbone = Self::new(config, device)?;
        let loaded = checkpoint::assign_strict(&backbone.vars, &tensors, prefix, &weights_path)?;
        info!(path = %path.display(), tensors = loaded, "loaded pretrained backbone");
        Ok(backbone)
    }
}

fn resolve(path: &Path, fallback_config: &BackboneConfig) -> VqClipResult<(BackboneConfig, PathBuf)> {
    if path.is_dir() {
        let config = BackboneConfig::from_file(path.join(CONFIG_FILE))?;
        Ok((config, path.join(WEIGHTS_FILE)))
    } else if path.is_file() {
        Ok((fallback_config.clone(), path.to_path_buf()))
    } else {
        Err(VqClipError::load(path, "no such file or directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::tests::tiny_config;
    use crate::backbone::DualEncoder;
    use std::collections::HashMap;

    fn save_backbone(backbone: &ClipBackbone, path: &Path, prefix: &str) {
        let tensors: HashMap<_, _> = checkpoint::snapshot(backbone.vars(), prefix)
            .into_iter()
            .collect();
        checkpoint::write_tensors(&tensors, path).unwrap();
    }

    fn same_parameters(a: &ClipBackbone, b: &ClipBackbone) -> bool {
        let (pa, pb) = (a.parameters().unwrap(), b.parameters().unwrap());
        pa.len() == pb.len()
            && pa.iter().all(|(name, t)| {
                let x: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
                let y: Vec<f32> = pb[name].flatten_all().unwrap().to_vec1().unwrap();
                x == y
            })
    }

    #[test]
    fn test_load_bare_file_with_fallback_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.safetensors");
        let source = ClipBackbone::new(tiny_config(), &Device::Cpu).unwrap();
        save_backbone(&source, &file, "");

        let loaded = ClipBackbone::from_pretrained(&file, &tiny_config(), &Device::Cpu).unwrap();
        assert!(same_parameters(&source, &loaded));
    }

    #[test]
    fn test_load_directory_with_plain_config_and_prefixed_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = ClipBackbone::new(tiny_config(), &Device::Cpu).unwrap();
        save_backbone(&source, &dir.path().join(WEIGHTS_FILE), BACKBONE_PREFIX);
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&tiny_config()).unwrap(),
        )
        .unwrap();

        // The fallback is ignored when the directory carries its own config.
        let loaded =
            ClipBackbone::from_pretrained(dir.path(), &BackboneConfig::default(), &Device::Cpu)
                .unwrap();
        assert_eq!(loaded.config(), &tiny_config());
        assert!(same_parameters(&source, &loaded));
    }

    #[test]
    fn test_missing_tensor_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("partial.safetensors");
        let source = ClipBackbone::new(tiny_config(), &Device::Cpu).unwrap();
        let tensors: HashMap<_, _> = source
            .parameters()
            .unwrap()
            .into_iter()
            .filter(|(name, _)| name != "logit_scale")
            .collect();
        checkpoint::write_tensors(&tensors, &file).unwrap();

        let err = ClipBackbone::from_pretrained(&file, &tiny_config(), &Device::Cpu).unwrap_err();
        match err {
            VqClipError::LoadError { message, .. } => assert!(message.contains("logit_scale")),
            other => panic!("expected LoadError, got {:?}", other),
        }
    }

    #[test]
    fn test_nonexistent_path_is_load_error() {
        let err = ClipBackbone::from_pretrained(
            "/definitely/not/here",
            &tiny_config(),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, VqClipError::LoadError { .. }));
    }

    #[test]
    fn test_directory_without_config_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            ClipBackbone::from_pretrained(dir.path(), &tiny_config(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, VqClipError::LoadError { .. }));
    }
}
