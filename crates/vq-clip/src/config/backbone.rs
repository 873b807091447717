//! Backbone (dual-encoder) configuration.
//!
//! Mirrors the standard CLIP `config.json` layout so a pretrained backbone's
//! own config file deserializes directly. Unknown keys are ignored and missing
//! keys take the defaults below; a key with the wrong type is an error.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigFragment, VqClipError, VqClipResult};

/// Activation used inside the transformer MLP blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    /// `x * sigmoid(1.702 * x)`
    #[default]
    QuickGelu,
    /// Exact (erf) GELU.
    Gelu,
}

/// CLIP text encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextTowerConfig {
    /// Vocabulary size (49408 for CLIP).
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Maximum sequence length (77 tokens).
    pub max_position_embeddings: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: HiddenAct,
}

impl Default for TextTowerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 512,
            intermediate_size: 2048,
            num_hidden_layers: 12,
            num_attention_heads: 8,
            max_position_embeddings: 77,
            layer_norm_eps: 1e-5,
            hidden_act: HiddenAct::QuickGelu,
        }
    }
}

/// CLIP vision encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionTowerConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    /// Square input resolution in pixels.
    pub image_size: usize,
    /// Square patch size in pixels.
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: HiddenAct,
}

impl Default for VisionTowerConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            num_channels: 3,
            image_size: 224,
            patch_size: 32,
            layer_norm_eps: 1e-5,
            hidden_act: HiddenAct::QuickGelu,
        }
    }
}

impl VisionTowerConfig {
    /// Number of patches per image side.
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Total sequence length including the class token.
    pub fn num_positions(&self) -> usize {
        self.patches_per_side() * self.patches_per_side() + 1
    }

    /// The patch grid must tile the image exactly.
    ///
    /// # Errors
    /// - `ConfigError { fragment: Backbone }` for a zero size or a patch
    ///   size that does not divide `image_size`
    pub fn validate(&self) -> VqClipResult<()> {
        if self.patch_size == 0 || self.image_size == 0 || self.num_channels == 0 {
            return Err(VqClipError::config(
                ConfigFragment::Backbone,
                format!(
                    "vision_config sizes must be positive (image_size {}, patch_size {}, num_channels {})",
                    self.image_size, self.patch_size, self.num_channels
                ),
            ));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(VqClipError::config(
                ConfigFragment::Backbone,
                format!(
                    "vision_config image_size {} is not a multiple of patch_size {}",
                    self.image_size, self.patch_size
                ),
            ));
        }
        Ok(())
    }
}

/// Complete backbone configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub text_config: TextTowerConfig,
    pub vision_config: VisionTowerConfig,
    /// Shared embedding width after projection.
    pub projection_dim: usize,
    /// Initial value of the learned log temperature.
    pub logit_scale_init_value: f64,
    /// Default for `ForwardOptions::output_attentions`.
    pub output_attentions: bool,
    /// Default for `ForwardOptions::output_hidden_states`.
    pub output_hidden_states: bool,
    /// Default for `ForwardOptions::return_dict`.
    #[serde(rename = "return_dict")]
    pub use_return_dict: bool,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            text_config: TextTowerConfig::default(),
            vision_config: VisionTowerConfig::default(),
            projection_dim: 512,
            logit_scale_init_value: 2.6592,
            output_attentions: false,
            output_hidden_states: false,
            use_return_dict: true,
        }
    }
}

impl BackboneConfig {
    /// Size checks that would otherwise surface as arithmetic faults while
    /// building the towers.
    pub fn validate(&self) -> VqClipResult<()> {
        self.vision_config.validate()?;
        if self.projection_dim == 0 {
            return Err(VqClipError::config(
                ConfigFragment::Backbone,
                "projection_dim must be positive",
            ));
        }
        Ok(())
    }

    /// Sizes of `openai/clip-vit-large-patch14`.
    pub fn vit_large_patch14() -> Self {
        Self {
            text_config: TextTowerConfig {
                hidden_size: 768,
                intermediate_size: 3072,
                num_attention_heads: 12,
                ..TextTowerConfig::default()
            },
            vision_config: VisionTowerConfig {
                hidden_size: 1024,
                intermediate_size: 4096,
                num_hidden_layers: 24,
                num_attention_heads: 16,
                patch_size: 14,
                ..VisionTowerConfig::default()
            },
            projection_dim: 768,
            ..Self::default()
        }
    }
}
