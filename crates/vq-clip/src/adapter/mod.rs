//! Vector-quantization adapters applied to normalized tower embeddings.
//!
//! Each modality has an [`AdapterSlot`]: either an active quantizer or a
//! passthrough. Adapter parameters live under `vision_vq_adapter.*` and
//! `text_vq_adapter.*`.

mod vq;

use std::fmt;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::AdapterConfig;
use crate::error::{ConfigFragment, VqClipResult};

pub use vq::VqAdapter;

/// Output of one quantization pass.
#[derive(Debug, Clone)]
pub struct Quantized {
    /// Quantized embeddings `[N, embed_dim]` (straight-through gradient).
    pub z: Tensor,
    /// Discrete codes `[N, heads]`, `u32`.
    pub codes: Tensor,
    /// Scalar quantization loss.
    pub loss: Tensor,
    /// Scalar codebook perplexity, when requested.
    pub perplexity: Option<Tensor>,
}

/// Capability of a discrete bottleneck over embedding vectors.
pub trait Quantizer: Send + Sync + fmt::Debug {
    fn quantize(&self, embeds: &Tensor, return_perplexity: bool) -> VqClipResult<Quantized>;
}

/// Which tower an adapter is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Vision,
    Text,
}

impl Modality {
    /// Parameter-name prefix of this modality's adapter.
    pub fn param_prefix(self) -> &'static str {
        match self {
            Modality::Vision => "vision_vq_adapter",
            Modality::Text => "text_vq_adapter",
        }
    }

    pub(crate) fn fragment(self) -> ConfigFragment {
        match self {
            Modality::Vision => ConfigFragment::VisionAdapter,
            Modality::Text => ConfigFragment::TextAdapter,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Vision => f.write_str("vision"),
            Modality::Text => f.write_str("text"),
        }
    }
}

/// Adapter attachment point for one modality.
#[derive(Debug)]
pub enum AdapterSlot {
    Active(Box<dyn Quantizer>),
    Passthrough,
}

impl AdapterSlot {
    /// Build a `VqAdapter` from `config` or a passthrough when absent.
    pub(crate) fn build(
        config: Option<&AdapterConfig>,
        modality: Modality,
        vb: &VarBuilder,
    ) -> VqClipResult<Self> {
        match config {
            Some(config) => {
                let adapter = VqAdapter::new(vb.pp(modality.param_prefix()), config, modality)?;
                Ok(AdapterSlot::Active(Box::new(adapter)))
            }
            None => Ok(AdapterSlot::Passthrough),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AdapterSlot::Active(_))
    }

    /// Quantize `embeds` if active; `None` for a passthrough.
    pub fn apply(&self, embeds: &Tensor, return_perplexity: bool) -> VqClipResult<Option<Quantized>> {
        match self {
            AdapterSlot::Active(quantizer) => Ok(Some(quantizer.quantize(embeds, return_perplexity)?)),
            AdapterSlot::Passthrough => Ok(None),
        }
    }
}
