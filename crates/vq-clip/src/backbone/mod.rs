//! Dual-encoder (CLIP) backbone.
//!
//! `ClipBackbone` owns its parameters in its own `VarMap`, separate from any
//! adapter parameters, so it can be persisted or replaced as a unit.
//!
//! Parameter names follow the standard CLIP safetensors layout:
//! `text_model.*`, `vision_model.*`, `text_projection.weight`,
//! `visual_projection.weight`, `logit_scale`.

mod layers;
mod loading;
mod text;
mod vision;

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder, VarMap};
use tracing::debug;

use crate::checkpoint;
use crate::config::BackboneConfig;
use crate::error::VqClipResult;

pub use layers::TowerOptions;

use text::TextTransformer;
use vision::VisionTransformer;

/// Token inputs for the text tower.
///
/// `input_ids` is `[batch, seq]`. `attention_mask` (same shape, 1 = keep,
/// 0 = padding) and `position_ids` are optional.
#[derive(Debug, Clone, Copy)]
pub struct TextInputs<'a> {
    pub input_ids: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
}

impl<'a> TextInputs<'a> {
    pub fn new(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            position_ids: None,
        }
    }

    pub fn with_attention_mask(mut self, mask: &'a Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_position_ids(mut self, position_ids: &'a Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }
}

/// Raw output of one tower.
#[derive(Debug, Clone)]
pub struct TowerOutput {
    /// `[batch, seq, hidden]`
    pub last_hidden_state: Tensor,
    /// `[batch, hidden]`
    pub pooled_output: Tensor,
    /// Embedding output followed by each layer's output, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Per-layer attention probabilities `[batch, heads, seq, seq]`, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Capability required of a pretrained dual encoder.
///
/// Projections return unnormalized embeddings; normalization and
/// quantization happen in the composed model.
pub trait DualEncoder: Send + Sync + fmt::Debug {
    fn config(&self) -> &BackboneConfig;

    fn text_tower(&self, text: &TextInputs<'_>, options: TowerOptions)
        -> VqClipResult<TowerOutput>;

    fn vision_tower(&self, pixel_values: &Tensor, options: TowerOptions)
        -> VqClipResult<TowerOutput>;

    /// `[batch, text_hidden]` -> `[batch, projection_dim]`
    fn project_text(&self, pooled: &Tensor) -> VqClipResult<Tensor>;

    /// `[batch, vision_hidden]` -> `[batch, projection_dim]`
    fn project_image(&self, pooled: &Tensor) -> VqClipResult<Tensor>;

    /// Exponentiated logit scale as a 0-dim tensor.
    fn logit_scale_exp(&self) -> VqClipResult<Tensor>;

    /// Symmetric cross-entropy over text-side logits.
    fn contrastive_loss(&self, logits_per_text: &Tensor) -> VqClipResult<Tensor> {
        crate::loss::clip_loss(logits_per_text)
    }
}

/// CLIP text + vision towers with their projections.
pub struct ClipBackbone {
    config: BackboneConfig,
    vars: VarMap,
    device: Device,
    text_model: TextTransformer,
    vision_model: VisionTransformer,
    text_projection: Linear,
    visual_projection: Linear,
    logit_scale: Tensor,
}

impl ClipBackbone {
    /// Build a freshly initialized backbone.
    ///
    /// # Errors
    /// - `ConfigError` if tower sizes are inconsistent
    /// - `Tensor` if parameter allocation fails on `device`
    pub fn new(config: BackboneConfig, device: &Device) -> VqClipResult<Self> {
        config.validate()?;
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);

        let text_model = TextTransformer::new(vb.pp("text_model"), &config.text_config)?;
        let vision_model = VisionTransformer::new(vb.pp("vision_model"), &config.vision_config)?;
        let text_projection = linear_no_bias(
            config.text_config.hidden_size,
            config.projection_dim,
            vb.pp("text_projection"),
        )?;
        let visual_projection = linear_no_bias(
            config.vision_config.hidden_size,
            config.projection_dim,
            vb.pp("visual_projection"),
        )?;
        let logit_scale = vb.get_with_hints(
            (),
            "logit_scale",
            Init::Const(config.logit_scale_init_value),
        )?;

        let backbone = Self {
            config,
            vars,
            device: device.clone(),
            text_model,
            vision_model,
            text_projection,
            visual_projection,
            logit_scale,
        };
        debug!(
            parameters = backbone.parameter_count(),
            projection_dim = backbone.config.projection_dim,
            "built CLIP backbone"
        );
        Ok(backbone)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Copies of the current parameters keyed by their CLIP names.
    pub fn parameters(&self) -> VqClipResult<BTreeMap<String, Tensor>> {
        checkpoint::copy_all(&self.vars, "")
    }

    /// Total scalar parameter count.
    pub fn parameter_count(&self) -> usize {
        checkpoint::snapshot(&self.vars, "")
            .values()
            .map(|t| t.elem_count())
            .sum()
    }

    pub(crate) fn vars(&self) -> &VarMap {
        &self.vars
    }
}

impl fmt::Debug for ClipBackbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipBackbone")
            .field("projection_dim", &self.config.projection_dim)
            .field("text_layers", &self.config.text_config.num_hidden_layers)
            .field("vision_layers", &self.config.vision_config.num_hidden_layers)
            .field("device", &self.device)
            .finish()
    }
}

impl DualEncoder for ClipBackbone {
    fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn text_tower(
        &self,
        text: &TextInputs<'_>,
        options: TowerOptions,
    ) -> VqClipResult<TowerOutput> {
        self.text_model.forward(text, options)
    }

    fn vision_tower(
        &self,
        pixel_values: &Tensor,
        options: TowerOptions,
    ) -> VqClipResult<TowerOutput> {
        self.vision_model.forward(pixel_values, options)
    }

    fn project_text(&self, pooled: &Tensor) -> VqClipResult<Tensor> {
        Ok(self.text_projection.forward(pooled)?)
    }

    fn project_image(&self, pooled: &Tensor) -> VqClipResult<Tensor> {
        Ok(self.visual_projection.forward(pooled)?)
    }

    fn logit_scale_exp(&self) -> VqClipResult<Tensor> {
        Ok(self.logit_scale.exp()?)
    }
}
