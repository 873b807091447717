//! Codebook vector quantizer.
//!
//! Pipeline per call:
//! 1. `in_proj`: embed_dim -> heads * codebook_dim
//! 2. Split into `heads` sub-vectors; assign each to its nearest code
//! 3. Straight-through estimator so gradients reach `in_proj`
//! 4. `out_proj`: heads * codebook_dim -> embed_dim

use candle_core::{DType, Module, Tensor, D};
use candle_nn::loss::mse;
use candle_nn::{linear, Init, Linear, VarBuilder};

use crate::config::AdapterConfig;
use crate::error::{VqClipError, VqClipResult};
use crate::ops::l2_normalize;

use super::{Modality, Quantized, Quantizer};

/// Floor inside the entropy log so unused codes contribute zero.
const ENTROPY_EPS: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct VqAdapter {
    in_proj: Linear,
    codebook: Tensor,
    out_proj: Linear,
    config: AdapterConfig,
}

impl VqAdapter {
    /// # Errors
    /// - `ConfigError` naming the adapter fragment if any size is zero
    pub fn new(vb: VarBuilder, config: &AdapterConfig, modality: Modality) -> VqClipResult<Self> {
        for (name, size) in [
            ("embed_dim", config.embed_dim),
            ("codebook_size", config.codebook_size),
            ("codebook_dim", config.codebook_dim),
            ("heads", config.heads),
        ] {
            if size == 0 {
                return Err(VqClipError::config(
                    modality.fragment(),
                    format!("{} must be positive", name),
                ));
            }
        }

        let inner = config.inner_dim();
        Ok(Self {
            in_proj: linear(config.embed_dim, inner, vb.pp("in_proj"))?,
            codebook: vb.get_with_hints(
                (config.codebook_size, config.codebook_dim),
                "codebook",
                Init::Randn {
                    mean: 0.0,
                    stdev: 1.0,
                },
            )?,
            out_proj: linear(inner, config.embed_dim, vb.pp("out_proj"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Nearest-code index for each row of `h` `[M, codebook_dim]`.
    fn assign(&self, h: &Tensor, codebook: &Tensor) -> VqClipResult<Tensor> {
        if self.config.use_cosine_sim {
            // Both sides are unit-norm: highest similarity wins.
            let sim = h.matmul(&codebook.t()?)?;
            return Ok(sim.argmax(D::Minus1)?);
        }
        // |h|^2 - 2 h.c + |c|^2
        let h_sq = h.sqr()?.sum_keepdim(D::Minus1)?;
        let c_sq = codebook.sqr()?.sum(D::Minus1)?.unsqueeze(0)?;
        let cross = h.matmul(&codebook.t()?)?;
        let dist = h_sq
            .broadcast_sub(&(cross * 2.0)?)?
            .broadcast_add(&c_sq)?;
        Ok(dist.argmin(D::Minus1)?)
    }

    /// `exp(entropy)` of the batch's code-usage distribution.
    fn perplexity(&self, codes: &Tensor) -> VqClipResult<Tensor> {
        let k = self.config.codebook_size as u32;
        let all_codes = Tensor::arange(0u32, k, codes.device())?.unsqueeze(0)?;
        let one_hot = codes
            .unsqueeze(1)?
            .broadcast_eq(&all_codes)?
            .to_dtype(DType::F32)?;
        let probs = one_hot.mean(0)?;
        let entropy = (&probs * (&probs + ENTROPY_EPS)?.log()?)?.sum_all()?.neg()?;
        Ok(entropy.exp()?)
    }
}

impl Quantizer for VqAdapter {
    fn quantize(&self, embeds: &Tensor, return_perplexity: bool) -> VqClipResult<Quantized> {
        let (n, width) = embeds.dims2()?;
        if width != self.config.embed_dim {
            return Err(VqClipError::InvalidInput(format!(
                "adapter expects {}-dim embeddings, got {}",
                self.config.embed_dim, width
            )));
        }
        let heads = self.config.heads;
        let cd = self.config.codebook_dim;

        let h = self
            .in_proj
            .forward(embeds)?
            .reshape((n * heads, cd))?;
        let (h, codebook) = if self.config.use_cosine_sim {
            (l2_normalize(&h)?, l2_normalize(&self.codebook)?)
        } else {
            (h, self.codebook.clone())
        };

        let codes = self.assign(&h, &codebook)?;
        let q = codebook.index_select(&codes, 0)?;

        let commitment = mse(&h, &q.detach())?;
        let codebook_loss = mse(&q, &h.detach())?;
        let loss = ((commitment * self.config.commitment_weight)?
            + (codebook_loss * self.config.codebook_weight)?)?;

        let straight_through = (&h + (&q - &h)?.detach())?;
        let z = self
            .out_proj
            .forward(&straight_through.reshape((n, heads * cd))?)?;

        let perplexity = if return_perplexity {
            Some(self.perplexity(&codes)?)
        } else {
            None
        };

        Ok(Quantized {
            z,
            codes: codes.reshape((n, heads))?,
            loss,
            perplexity,
        })
    }
}
