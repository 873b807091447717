//! Dual-tower forward pass with optional quantization.

use candle_core::Tensor;
use tracing::{debug, instrument};

use crate::adapter::Quantized;
use crate::backbone::{DualEncoder, TextInputs};
use crate::error::VqClipResult;
use crate::loss::{blend_quantization, total_loss};
use crate::ops::l2_normalize;
use crate::output::{ForwardOutput, ForwardResult};

use super::{ForwardOptions, VqClipModel};

impl VqClipModel {
    /// Text embeddings as the model scores them.
    ///
    /// # Arguments
    /// * `text` - Token ids `[batch, seq]` with optional attention mask and
    ///   position ids
    ///
    /// # Returns
    /// `[batch, projection_dim]`: L2-normalized projections, replaced by the
    /// adapter output `z` when a text adapter is active. The adapter output
    /// is not re-normalized.
    ///
    /// # Pipeline
    /// 1. Text tower, pooled at the end-of-text token
    /// 2. `text_projection`
    /// 3. L2 normalize
    /// 4. Text adapter, if active
    pub fn get_text_features(&self, text: &TextInputs<'_>) -> VqClipResult<Tensor> {
        let options = ForwardOptions::default().tower_options(&self.config.backbone);
        let tower = self.backbone.text_tower(text, options)?;
        let embeds = l2_normalize(&self.backbone.project_text(&tower.pooled_output)?)?;
        Ok(match self.text_adapter.apply(&embeds, false)? {
            Some(quantized) => quantized.z,
            None => embeds,
        })
    }

    /// Normalized (and, with a vision adapter, quantized) image embeddings.
    ///
    /// Same pipeline as [`Self::get_text_features`] on the vision tower;
    /// `pixel_values` is `[batch, channels, image_size, image_size]`.
    pub fn get_image_features(&self, pixel_values: &Tensor) -> VqClipResult<Tensor> {
        let options = ForwardOptions::default().tower_options(&self.config.backbone);
        let tower = self.backbone.vision_tower(pixel_values, options)?;
        let embeds = l2_normalize(&self.backbone.project_image(&tower.pooled_output)?)?;
        Ok(match self.vision_adapter.apply(&embeds, false)? {
            Some(quantized) => quantized.z,
            None => embeds,
        })
    }

    /// Run both towers, quantize the active modalities and score every
    /// text against every image.
    ///
    /// # Arguments
    /// * `text` - Token ids `[n_text, seq]` plus optional mask and positions
    /// * `pixel_values` - Images `[n_image, channels, size, size]`
    /// * `options` - Loss, perplexity and diagnostics switches; unset
    ///   switches fall back to the model's backbone config fragment
    ///
    /// # Returns
    /// [`ForwardOutput::Structured`] unless `return_dict` resolves to false,
    /// in which case [`ForwardOutput::Flat`].
    ///
    /// # Pipeline
    /// 1. Vision and text towers
    /// 2. Project and L2 normalize both embeddings
    /// 3. Active adapters quantize the normalized embeddings
    /// 4. Quantization loss and perplexity averaged over active adapters
    /// 5. `logits_per_text[i, j] = text_i . image_j * exp(logit_scale)`,
    ///    `logits_per_image` its transpose
    /// 6. Contrastive loss and total, when `return_loss`
    ///
    /// # Errors
    /// - `InvalidInput` for malformed text inputs, or when loss is requested
    ///   for unpaired batches
    /// - `Tensor` for shape or device failures in the numeric layer
    #[instrument(level = "debug", skip_all, fields(return_loss = options.return_loss))]
    pub fn forward(
        &self,
        text: &TextInputs<'_>,
        pixel_values: &Tensor,
        options: &ForwardOptions,
    ) -> VqClipResult<ForwardOutput> {
        let backbone_config = &self.config.backbone;
        let tower_options = options.tower_options(backbone_config);

        let vision_outputs = self.backbone.vision_tower(pixel_values, tower_options)?;
        let text_outputs = self.backbone.text_tower(text, tower_options)?;

        let image_embeds =
            l2_normalize(&self.backbone.project_image(&vision_outputs.pooled_output)?)?;
        let text_embeds = l2_normalize(&self.backbone.project_text(&text_outputs.pooled_output)?)?;

        let text_quantized = self.text_adapter.apply(&text_embeds, options.return_perplexity)?;
        let image_quantized = self
            .vision_adapter
            .apply(&image_embeds, options.return_perplexity)?;

        let active: Vec<&Quantized> = [text_quantized.as_ref(), image_quantized.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        let losses: Vec<Tensor> = active.iter().map(|q| q.loss.clone()).collect();
        let perplexities: Vec<Tensor> = active.iter().filter_map(|q| q.perplexity.clone()).collect();
        let blended = blend_quantization(
            &losses,
            &perplexities,
            options.return_perplexity,
            &self.device,
        )?;

        let (text_embeds, text_codes) = match text_quantized {
            Some(q) => (q.z, Some(q.codes)),
            None => (text_embeds, None),
        };
        let (image_embeds, image_codes) = match image_quantized {
            Some(q) => (q.z, Some(q.codes)),
            None => (image_embeds, None),
        };

        let logit_scale = self.backbone.logit_scale_exp()?;
        let logits_per_text = text_embeds
            .matmul(&image_embeds.t()?)?
            .broadcast_mul(&logit_scale)?;
        let logits_per_image = logits_per_text.t()?.contiguous()?;

        let contrastive_loss = if options.return_loss {
            Some(self.backbone.contrastive_loss(&logits_per_text)?)
        } else {
            None
        };
        let loss = total_loss(contrastive_loss.as_ref(), &blended.loss)?;

        debug!(
            texts = logits_per_text.dim(0)?,
            images = logits_per_text.dim(1)?,
            active_adapters = active_count(&text_codes, &image_codes),
            "forward complete"
        );

        let result = ForwardResult {
            loss,
            contrastive_loss,
            quantization_loss: blended.loss,
            perplexity: blended.perplexity,
            logits_per_image,
            logits_per_text,
            text_embeds,
            image_embeds,
            text_codes,
            image_codes,
            text_model_output: text_outputs,
            vision_model_output: vision_outputs,
        };

        Ok(if options.use_return_dict(backbone_config) {
            ForwardOutput::Structured(result)
        } else {
            ForwardOutput::Flat(result.into_flat())
        })
    }
}

fn active_count(text_codes: &Option<Tensor>, image_codes: &Option<Tensor>) -> usize {
    usize::from(text_codes.is_some()) + usize::from(image_codes.is_some())
}
