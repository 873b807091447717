//! CLIP vision encoder.
//!
//! 1. Patch embedding (conv2d, stride = patch size, no bias)
//! 2. Prepend class token, add position embeddings
//! 3. Pre-LayerNorm
//! 4. Transformer layers (bidirectional, no mask)
//! 5. Post-LayerNorm on the class token as pooled output

use candle_core::{Module, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, Conv2d, Conv2dConfig, Embedding, Init, LayerNorm,
    VarBuilder,
};
use tracing::trace;

use crate::config::VisionTowerConfig;
use crate::error::{VqClipError, VqClipResult};

use super::layers::{Encoder, EncoderDims, TowerOptions};
use super::TowerOutput;

#[derive(Debug, Clone)]
pub(crate) struct VisionTransformer {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Embedding,
    pre_layrnorm: LayerNorm,
    encoder: Encoder,
    post_layernorm: LayerNorm,
    num_positions: usize,
    num_channels: usize,
}

impl VisionTransformer {
    pub(crate) fn new(vb: VarBuilder, config: &VisionTowerConfig) -> VqClipResult<Self> {
        let h = config.hidden_size;
        let embeddings = vb.pp("embeddings");
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let dims = EncoderDims {
            hidden_size: h,
            intermediate_size: config.intermediate_size,
            num_heads: config.num_attention_heads,
            num_layers: config.num_hidden_layers,
            layer_norm_eps: config.layer_norm_eps,
            act: config.hidden_act,
        };

        Ok(Self {
            patch_embedding: conv2d_no_bias(
                config.num_channels,
                h,
                config.patch_size,
                conv_config,
                embeddings.pp("patch_embedding"),
            )?,
            class_embedding: embeddings.get_with_hints(
                h,
                "class_embedding",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?,
            position_embedding: embedding(
                config.num_positions(),
                h,
                embeddings.pp("position_embedding"),
            )?,
            // Upstream checkpoints spell it "pre_layrnorm".
            pre_layrnorm: layer_norm(h, config.layer_norm_eps, vb.pp("pre_layrnorm"))?,
            encoder: Encoder::new(vb.pp("encoder"), dims)?,
            post_layernorm: layer_norm(h, config.layer_norm_eps, vb.pp("post_layernorm"))?,
            num_positions: config.num_positions(),
            num_channels: config.num_channels,
        })
    }

    pub(crate) fn forward(
        &self,
        pixel_values: &Tensor,
        options: TowerOptions,
    ) -> VqClipResult<TowerOutput> {
        let (batch, channels, _, _) = pixel_values.dims4()?;
        if channels != self.num_channels {
            return Err(VqClipError::InvalidInput(format!(
                "expected {} image channels, got {}",
                self.num_channels, channels
            )));
        }
        let device = pixel_values.device();
        let hidden_size = self.class_embedding.dim(0)?;

        // [batch, hidden, gh, gw] -> [batch, num_patches, hidden]
        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let class_token = self
            .class_embedding
            .reshape((1, 1, hidden_size))?
            .expand((batch, 1, hidden_size))?
            .contiguous()?;
        let tokens = Tensor::cat(&[&class_token, &patches], 1)?;

        let position_ids = Tensor::arange(0u32, self.num_positions as u32, device)?;
        let position_emb = self.position_embedding.forward(&position_ids)?.unsqueeze(0)?;
        let embeddings = tokens.broadcast_add(&position_emb)?;
        let embeddings = self.pre_layrnorm.forward(&embeddings)?;

        let encoded = self.encoder.forward(embeddings, None, options)?;
        let class_hidden = encoded.last_hidden_state.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled_output = self.post_layernorm.forward(&class_hidden)?;
        trace!(batch, "vision tower forward");

        Ok(TowerOutput {
            last_hidden_state: encoded.last_hidden_state,
            pooled_output,
            hidden_states: encoded.hidden_states,
            attentions: encoded.attentions,
        })
    }
}
