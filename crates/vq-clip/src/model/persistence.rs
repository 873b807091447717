//! Adapter-only checkpoints and backbone grafting.
//!
//! | Operation | `config.json` | adapter tensors | `clip_model.*` tensors |
//! |-----------|---------------|-----------------|------------------------|
//! | `save_adapter` | yes | yes | no |
//! | `save_pretrained` | yes | yes | yes |
//!
//! The backbone fragment of the composite config is fixed at construction.
//! Grafting swaps backbone weights only; a replacement whose architecture
//! differs from that fragment is rejected.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{info, instrument};

use crate::backbone::{ClipBackbone, DualEncoder};
use crate::checkpoint::{self, BACKBONE_PREFIX, CONFIG_FILE, WEIGHTS_FILE};
use crate::config::{BackboneConfig, CompositeConfig};
use crate::error::{ConfigFragment, VqClipError, VqClipResult};

use super::VqClipModel;

impl VqClipModel {
    /// Copies of every parameter, backbone entries prefixed `clip_model.`.
    pub fn named_parameters(&self) -> VqClipResult<BTreeMap<String, Tensor>> {
        let mut params = self.backbone_parameters()?;
        params.extend(self.adapter_parameters()?);
        Ok(params)
    }

    /// Copies of the adapter parameters (`vision_vq_adapter.*`,
    /// `text_vq_adapter.*`).
    pub fn adapter_parameters(&self) -> VqClipResult<BTreeMap<String, Tensor>> {
        checkpoint::copy_all(&self.adapter_vars, "")
    }

    /// Copies of the backbone parameters, prefixed `clip_model.`.
    pub fn backbone_parameters(&self) -> VqClipResult<BTreeMap<String, Tensor>> {
        checkpoint::copy_all(self.backbone.vars(), BACKBONE_PREFIX)
    }

    /// Write the composite config and only the adapter tensors to `dir`.
    ///
    /// # Errors
    /// - `SaveError` if the directory or either file cannot be written
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn save_adapter(&self, dir: impl AsRef<Path>) -> VqClipResult<()> {
        self.write_checkpoint(dir.as_ref(), false)
    }

    /// Write the composite config and every tensor to `dir`.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> VqClipResult<()> {
        self.write_checkpoint(dir.as_ref(), true)
    }

    fn write_checkpoint(&self, dir: &Path, include_backbone: bool) -> VqClipResult<()> {
        fs::create_dir_all(dir).map_err(|e| VqClipError::save(dir, e))?;
        self.config.save(dir.join(CONFIG_FILE))?;

        let mut tensors: HashMap<String, Tensor> =
            checkpoint::snapshot(&self.adapter_vars, "").into_iter().collect();
        if include_backbone {
            tensors.extend(checkpoint::snapshot(self.backbone.vars(), BACKBONE_PREFIX));
        }
        checkpoint::write_tensors(&tensors, &dir.join(WEIGHTS_FILE))?;

        info!(
            tensors = tensors.len(),
            include_backbone,
            "saved VQ-CLIP checkpoint"
        );
        Ok(())
    }

    /// Rebuild a model from a checkpoint directory.
    ///
    /// Every adapter tensor must be present. Backbone tensors are loaded
    /// when the container has any; otherwise the backbone keeps its
    /// config-derived initialization (adapter-only checkpoint).
    ///
    /// # Errors
    /// - `LoadError` if a file is missing or a required tensor is absent
    /// - `ConfigError` if `config.json` is malformed or describes unusable sizes
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn from_pretrained(dir: impl AsRef<Path>, device: &Device) -> VqClipResult<Self> {
        let dir = dir.as_ref();
        let config = CompositeConfig::from_file(dir.join(CONFIG_FILE))?;
        let model = Self::new(config, device)?;

        let weights = dir.join(WEIGHTS_FILE);
        let tensors = checkpoint::read_tensors(&weights, device)?;
        let adapters = checkpoint::assign_strict(&model.adapter_vars, &tensors, "", &weights)?;

        let backbone_scope = format!("{}.", BACKBONE_PREFIX);
        let has_backbone = tensors.keys().any(|k| k.starts_with(&backbone_scope));
        let backbone = if has_backbone {
            checkpoint::assign_strict(model.backbone.vars(), &tensors, BACKBONE_PREFIX, &weights)?
        } else {
            0
        };

        info!(
            adapter_tensors = adapters,
            backbone_tensors = backbone,
            "loaded VQ-CLIP checkpoint"
        );
        Ok(model)
    }

    /// Graft-load a model from an adapter checkpoint and a pretrained
    /// backbone.
    ///
    /// # Arguments
    /// * `adapter_dir` - Checkpoint directory written by [`Self::save_adapter`]
    ///   (or [`Self::save_pretrained`]); its `config.json` defines the model
    /// * `backbone_path` - Pretrained CLIP directory (`config.json` +
    ///   `model.safetensors`) or a bare `.safetensors` file
    /// * `device` - Device for every parameter
    ///
    /// # Returns
    /// A model whose adapters come from `adapter_dir` and whose backbone
    /// weights come from `backbone_path`. The composite config is the one
    /// stored in `adapter_dir`.
    ///
    /// # Pipeline
    /// 1. Read `config.json` from `adapter_dir` and build the model
    /// 2. Strict-load the adapter tensors
    /// 3. Build the pretrained backbone from `backbone_path`
    /// 4. Check it against the recorded backbone fragment, then swap it in
    ///
    /// Both loads finish before the model is returned; any failure returns
    /// the originating error and no model.
    #[instrument(skip_all, fields(adapter = %adapter_dir.as_ref().display(), backbone = %backbone_path.as_ref().display()))]
    pub fn from_parts(
        adapter_dir: impl AsRef<Path>,
        backbone_path: impl AsRef<Path>,
        device: &Device,
    ) -> VqClipResult<Self> {
        let mut model = Self::from_pretrained(adapter_dir, device)?;
        model.graft_backbone(backbone_path)?;
        Ok(model)
    }

    /// Replace the backbone with pretrained weights from `path`.
    ///
    /// The replacement is fully loaded before the swap, so on error the
    /// current backbone is untouched. Adapter state is never modified.
    pub fn graft_backbone(&mut self, path: impl AsRef<Path>) -> VqClipResult<()> {
        let backbone = ClipBackbone::from_pretrained(path, &self.config.backbone, &self.device)?;
        self.replace_backbone(backbone)
    }

    /// Swap in an already-built backbone.
    ///
    /// Only weights change. The composite config, including the backbone
    /// fragment's default forward switches, stays as constructed.
    ///
    /// # Errors
    /// - `ConfigError` naming the adapter if an active adapter's width
    ///   differs from the new backbone's `projection_dim`
    /// - `ConfigError { fragment: Backbone }` if the new backbone's tower
    ///   sizes differ from the recorded backbone fragment
    pub fn replace_backbone(&mut self, backbone: ClipBackbone) -> VqClipResult<()> {
        let incoming = backbone.config();
        self.config.check_adapter_widths(incoming.projection_dim)?;
        if !same_architecture(&self.config.backbone, incoming) {
            return Err(VqClipError::config(
                ConfigFragment::Backbone,
                "replacement backbone sizes differ from the configured backbone",
            ));
        }
        self.backbone = backbone;
        info!(
            parameters = self.backbone.parameter_count(),
            "grafted backbone"
        );
        Ok(())
    }
}

/// Tower and projection sizes agree. Forward switches and the logit scale
/// init value are not part of the architecture.
fn same_architecture(a: &BackboneConfig, b: &BackboneConfig) -> bool {
    a.text_config == b.text_config
        && a.vision_config == b.vision_config
        && a.projection_dim == b.projection_dim
}
