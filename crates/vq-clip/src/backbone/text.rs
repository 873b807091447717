//! CLIP text encoder.
//!
//! 1. Lookup token embeddings + add position embeddings
//! 2. Apply transformer layers with causal mask (plus padding mask if given)
//! 3. Apply final layer norm
//! 4. Pool at the end-of-text token (highest token id in each row)

use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use tracing::trace;

use crate::config::TextTowerConfig;
use crate::error::{VqClipError, VqClipResult};

use super::layers::{causal_mask, Encoder, EncoderDims, TowerOptions};
use super::{TextInputs, TowerOutput};

/// Additive penalty applied to padded key positions.
const PADDING_PENALTY: f64 = -1e9;

#[derive(Debug, Clone)]
pub(crate) struct TextTransformer {
    token_embedding: Embedding,
    position_embedding: Embedding,
    encoder: Encoder,
    final_layer_norm: LayerNorm,
    max_positions: usize,
}

impl TextTransformer {
    pub(crate) fn new(vb: VarBuilder, config: &TextTowerConfig) -> VqClipResult<Self> {
        let h = config.hidden_size;
        let embeddings = vb.pp("embeddings");
        let dims = EncoderDims {
            hidden_size: h,
            intermediate_size: config.intermediate_size,
            num_heads: config.num_attention_heads,
            num_layers: config.num_hidden_layers,
            layer_norm_eps: config.layer_norm_eps,
            act: config.hidden_act,
        };

        Ok(Self {
            token_embedding: embedding(config.vocab_size, h, embeddings.pp("token_embedding"))?,
            position_embedding: embedding(
                config.max_position_embeddings,
                h,
                embeddings.pp("position_embedding"),
            )?,
            encoder: Encoder::new(vb.pp("encoder"), dims)?,
            final_layer_norm: layer_norm(h, config.layer_norm_eps, vb.pp("final_layer_norm"))?,
            max_positions: config.max_position_embeddings,
        })
    }

    pub(crate) fn forward(
        &self,
        text: &TextInputs<'_>,
        options: TowerOptions,
    ) -> VqClipResult<TowerOutput> {
        let (batch, seq_len) = text.input_ids.dims2()?;
        if seq_len == 0 || seq_len > self.max_positions {
            return Err(VqClipError::InvalidInput(format!(
                "text sequence length {} outside 1..={}",
                seq_len, self.max_positions
            )));
        }
        let device = text.input_ids.device();
        let input_ids = text.input_ids.to_dtype(DType::U32)?;

        let position_ids = match text.position_ids {
            Some(p) => p.to_dtype(DType::U32)?,
            None => Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?,
        };
        let token_emb = self.token_embedding.forward(&input_ids)?;
        let position_emb = self.position_embedding.forward(&position_ids)?;
        let embeddings = token_emb.broadcast_add(&position_emb)?;

        let mask = causal_mask(seq_len, device)?;
        let mask = match text.attention_mask {
            Some(attention_mask) => {
                // 1 keeps a key position, 0 masks it.
                let padding = attention_mask
                    .to_dtype(DType::F32)?
                    .affine(-PADDING_PENALTY, PADDING_PENALTY)?
                    .reshape((batch, 1, 1, seq_len))?;
                mask.broadcast_add(&padding)?
            }
            None => mask,
        };

        let encoded = self.encoder.forward(embeddings, Some(&mask), options)?;
        let last_hidden_state = self.final_layer_norm.forward(&encoded.last_hidden_state)?;
        let pooled_output = pool_end_of_text(&last_hidden_state, &input_ids)?;
        trace!(batch, seq_len, "text tower forward");

        Ok(TowerOutput {
            last_hidden_state,
            pooled_output,
            hidden_states: encoded.hidden_states,
            attentions: encoded.attentions,
        })
    }
}

/// Gather `hidden[b, argmax(input_ids[b]), :]` for every row `b`.
fn pool_end_of_text(hidden: &Tensor, input_ids: &Tensor) -> VqClipResult<Tensor> {
    let (batch, seq_len, hidden_size) = hidden.dims3()?;
    let eos = input_ids.argmax(candle_core::D::Minus1)?;
    let row_offsets = Tensor::arange_step(
        0u32,
        (batch * seq_len) as u32,
        seq_len as u32,
        hidden.device(),
    )?;
    let flat_index = (eos + row_offsets)?;
    Ok(hidden
        .reshape((batch * seq_len, hidden_size))?
        .index_select(&flat_index, 0)?)
}
