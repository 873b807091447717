//! Forward-pass result shapes.
//!
//! A forward pass yields either a structured [`ForwardResult`] or, when the
//! caller opts out of structured results, a positional [`FlatOutput`]. The
//! flat form is derived from the structured one, so both agree.

use candle_core::Tensor;

use crate::backbone::TowerOutput;
use crate::error::VqClipResult;
use crate::loss::LossComponents;

/// Structured result of a composed forward pass.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    /// Contrastive + quantization; present only when loss was requested.
    pub loss: Option<Tensor>,
    pub contrastive_loss: Option<Tensor>,
    /// Scalar; zero when no adapter is active.
    pub quantization_loss: Tensor,
    /// Present only when requested and at least one adapter is active.
    pub perplexity: Option<Tensor>,
    /// `[N_images, N_texts]`
    pub logits_per_image: Tensor,
    /// `[N_texts, N_images]`
    pub logits_per_text: Tensor,
    pub text_embeds: Tensor,
    pub image_embeds: Tensor,
    pub text_codes: Option<Tensor>,
    pub image_codes: Option<Tensor>,
    pub text_model_output: TowerOutput,
    pub vision_model_output: TowerOutput,
}

impl ForwardResult {
    /// Host-side snapshot of the loss terms for logging.
    pub fn loss_components(&self) -> VqClipResult<LossComponents> {
        LossComponents::from_tensors(
            self.contrastive_loss.as_ref(),
            &self.quantization_loss,
            self.perplexity.as_ref(),
            self.loss.as_ref(),
        )
    }

    /// Positional form. Carries the contrastive loss (not the total) and
    /// drops codes, quantization loss and perplexity.
    pub fn into_flat(self) -> FlatOutput {
        FlatOutput {
            loss: self.contrastive_loss,
            logits_per_image: self.logits_per_image,
            logits_per_text: self.logits_per_text,
            text_embeds: self.text_embeds,
            image_embeds: self.image_embeds,
            text_outputs: self.text_model_output,
            vision_outputs: self.vision_model_output,
        }
    }
}

/// Positional result:
/// `(loss?, logits_per_image, logits_per_text, text_embeds, image_embeds,
/// text_outputs, vision_outputs)`.
#[derive(Debug, Clone)]
pub struct FlatOutput {
    /// Contrastive loss, when requested.
    pub loss: Option<Tensor>,
    pub logits_per_image: Tensor,
    pub logits_per_text: Tensor,
    pub text_embeds: Tensor,
    pub image_embeds: Tensor,
    pub text_outputs: TowerOutput,
    pub vision_outputs: TowerOutput,
}

/// One positional element of a [`FlatOutput`].
#[derive(Debug, Clone)]
pub enum FlatItem {
    Tensor(Tensor),
    Tower(TowerOutput),
}

impl FlatOutput {
    /// Flatten into the positional sequence; the loss is prepended only
    /// when present.
    pub fn into_items(self) -> Vec<FlatItem> {
        let mut items = Vec::with_capacity(7);
        if let Some(loss) = self.loss {
            items.push(FlatItem::Tensor(loss));
        }
        items.extend([
            FlatItem::Tensor(self.logits_per_image),
            FlatItem::Tensor(self.logits_per_text),
            FlatItem::Tensor(self.text_embeds),
            FlatItem::Tensor(self.image_embeds),
            FlatItem::Tower(self.text_outputs),
            FlatItem::Tower(self.vision_outputs),
        ]);
        items
    }
}

/// Result of `VqClipModel::forward`.
#[derive(Debug, Clone)]
pub enum ForwardOutput {
    Structured(ForwardResult),
    Flat(FlatOutput),
}

impl ForwardOutput {
    pub fn into_structured(self) -> Option<ForwardResult> {
        match self {
            ForwardOutput::Structured(result) => Some(result),
            ForwardOutput::Flat(_) => None,
        }
    }

    pub fn into_flat(self) -> Option<FlatOutput> {
        match self {
            ForwardOutput::Flat(flat) => Some(flat),
            ForwardOutput::Structured(_) => None,
        }
    }

    /// Text-side logits, whichever form the result took.
    pub fn logits_per_text(&self) -> &Tensor {
        match self {
            ForwardOutput::Structured(result) => &result.logits_per_text,
            ForwardOutput::Flat(flat) => &flat.logits_per_text,
        }
    }
}
