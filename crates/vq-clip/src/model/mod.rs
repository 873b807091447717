//! The composed VQ-CLIP model.
//!
//! A `VqClipModel` owns one [`ClipBackbone`] and two [`AdapterSlot`]s.
//! Backbone parameters live in the backbone's own `VarMap`; adapter
//! parameters live in a separate one, which is what makes adapter-only
//! checkpoints and backbone grafting possible.

mod forward;
mod persistence;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::adapter::{AdapterSlot, Modality};
use crate::backbone::{ClipBackbone, TowerOptions};
use crate::config::{BackboneConfig, CompositeConfig};
use crate::error::VqClipResult;

/// Per-call switches for [`VqClipModel::forward`].
///
/// Unset diagnostics switches fall back to the backbone config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    pub return_loss: bool,
    pub return_perplexity: bool,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    pub return_dict: Option<bool>,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss(mut self) -> Self {
        self.return_loss = true;
        self
    }

    pub fn with_perplexity(mut self) -> Self {
        self.return_perplexity = true;
        self
    }

    pub fn output_attentions(mut self, enabled: bool) -> Self {
        self.output_attentions = Some(enabled);
        self
    }

    pub fn output_hidden_states(mut self, enabled: bool) -> Self {
        self.output_hidden_states = Some(enabled);
        self
    }

    pub fn return_dict(mut self, enabled: bool) -> Self {
        self.return_dict = Some(enabled);
        self
    }

    pub(crate) fn tower_options(&self, config: &BackboneConfig) -> TowerOptions {
        TowerOptions {
            output_attentions: self.output_attentions.unwrap_or(config.output_attentions),
            output_hidden_states: self
                .output_hidden_states
                .unwrap_or(config.output_hidden_states),
        }
    }

    pub(crate) fn use_return_dict(&self, config: &BackboneConfig) -> bool {
        self.return_dict.unwrap_or(config.use_return_dict)
    }
}

/// CLIP backbone composed with optional per-modality VQ adapters.
pub struct VqClipModel {
    config: CompositeConfig,
    device: Device,
    backbone: ClipBackbone,
    vision_adapter: AdapterSlot,
    text_adapter: AdapterSlot,
    adapter_vars: VarMap,
}

impl std::fmt::Debug for VqClipModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VqClipModel")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("backbone", &self.backbone)
            .field("vision_adapter", &self.vision_adapter)
            .field("text_adapter", &self.text_adapter)
            .finish_non_exhaustive()
    }
}

impl VqClipModel {
    /// Build a freshly initialized model from a composite config.
    ///
    /// # Errors
    /// - `ConfigError` if an adapter's `embed_dim` differs from the
    ///   backbone `projection_dim`, or any size is invalid
    pub fn new(config: CompositeConfig, device: &Device) -> VqClipResult<Self> {
        config.validate()?;

        let backbone = ClipBackbone::new(config.backbone.clone(), device)?;
        let adapter_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&adapter_vars, DType::F32, device);
        let vision_adapter =
            AdapterSlot::build(config.vision_adapter.as_ref(), Modality::Vision, &vb)?;
        let text_adapter = AdapterSlot::build(config.text_adapter.as_ref(), Modality::Text, &vb)?;

        let active = config.active_modalities();
        info!(
            vision_adapter = active.vision,
            text_adapter = active.text,
            projection_dim = config.backbone.projection_dim,
            "composed VQ-CLIP model"
        );

        Ok(Self {
            config,
            device: device.clone(),
            backbone,
            vision_adapter,
            text_adapter,
            adapter_vars,
        })
    }

    /// Assemble from prebuilt parts. `adapter_vars` must hold every
    /// parameter the slots use.
    #[cfg(test)]
    pub(crate) fn from_components(
        config: CompositeConfig,
        backbone: ClipBackbone,
        vision_adapter: AdapterSlot,
        text_adapter: AdapterSlot,
        adapter_vars: VarMap,
    ) -> Self {
        let device = backbone.device().clone();
        Self {
            config,
            device,
            backbone,
            vision_adapter,
            text_adapter,
            adapter_vars,
        }
    }

    pub fn config(&self) -> &CompositeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backbone(&self) -> &ClipBackbone {
        &self.backbone
    }

    pub fn vision_adapter(&self) -> &AdapterSlot {
        &self.vision_adapter
    }

    pub fn text_adapter(&self) -> &AdapterSlot {
        &self.text_adapter
    }
}
