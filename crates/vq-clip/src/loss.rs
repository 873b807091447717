//! Loss blending for the composed model.
//!
//! 1. Contrastive: symmetric cross-entropy over the similarity matrix
//! 2. Quantization: mean of the active adapters' losses (0 when none)
//! 3. Total: contrastive + quantization, only when contrastive was requested

use candle_core::{DType, Device, Tensor};
use candle_nn::loss::cross_entropy;

use crate::error::{VqClipError, VqClipResult};
use crate::ops::tensor_to_f32;

/// Symmetric CLIP loss from text-side logits `[N, N]`.
///
/// Row `i` of `logits_per_text` pairs with column `i`; the loss averages the
/// caption-direction and image-direction cross-entropies.
///
/// # Errors
/// - `InvalidInput` if the logits are not a non-empty square matrix
pub fn clip_loss(logits_per_text: &Tensor) -> VqClipResult<Tensor> {
    let (rows, cols) = logits_per_text.dims2()?;
    if rows != cols || rows == 0 {
        return Err(VqClipError::InvalidInput(format!(
            "contrastive loss needs paired batches, got {}x{} logits",
            rows, cols
        )));
    }
    let labels = Tensor::arange(0u32, rows as u32, logits_per_text.device())?;
    let caption_loss = cross_entropy(logits_per_text, &labels)?;
    let image_loss = cross_entropy(&logits_per_text.t()?.contiguous()?, &labels)?;
    Ok(((caption_loss + image_loss)? / 2.0)?)
}

/// Quantization terms blended across active adapters.
#[derive(Debug, Clone)]
pub struct BlendedQuantization {
    /// Scalar mean loss; zero when no adapter is active.
    pub loss: Tensor,
    /// Scalar mean perplexity; present only when requested and at least one
    /// adapter reported it.
    pub perplexity: Option<Tensor>,
}

/// Average per-adapter losses and perplexities over the active adapters.
pub fn blend_quantization(
    losses: &[Tensor],
    perplexities: &[Tensor],
    return_perplexity: bool,
    device: &Device,
) -> VqClipResult<BlendedQuantization> {
    let loss = match losses {
        [] => Tensor::zeros((), DType::F32, device)?,
        _ => mean_of_scalars(losses)?,
    };
    let perplexity = if return_perplexity && !perplexities.is_empty() {
        Some(mean_of_scalars(perplexities)?)
    } else {
        None
    };
    Ok(BlendedQuantization { loss, perplexity })
}

/// Total loss, defined only when a contrastive term exists.
pub fn total_loss(contrastive: Option<&Tensor>, quantization: &Tensor) -> VqClipResult<Option<Tensor>> {
    match contrastive {
        Some(c) => Ok(Some(c.broadcast_add(quantization)?)),
        None => Ok(None),
    }
}

fn mean_of_scalars(terms: &[Tensor]) -> VqClipResult<Tensor> {
    let flat = terms
        .iter()
        .map(|t| t.flatten_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&flat, 0)?.mean_all()?)
}

/// Per-component loss values for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossComponents {
    pub contrastive: Option<f32>,
    pub quantization: f32,
    pub perplexity: Option<f32>,
    pub total: Option<f32>,
}

impl LossComponents {
    pub fn from_tensors(
        contrastive: Option<&Tensor>,
        quantization: &Tensor,
        perplexity: Option<&Tensor>,
        total: Option<&Tensor>,
    ) -> VqClipResult<Self> {
        Ok(Self {
            contrastive: contrastive.map(tensor_to_f32).transpose()?,
            quantization: tensor_to_f32(quantization)?,
            perplexity: perplexity.map(tensor_to_f32).transpose()?,
            total: total.map(tensor_to_f32).transpose()?,
        })
    }
}
