//! Transformer building blocks shared by the text and vision towers.
//!
//! Pre-norm encoder layers: LayerNorm -> self-attention -> residual,
//! LayerNorm -> MLP -> residual.

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use crate::config::HiddenAct;
use crate::error::{ConfigFragment, VqClipError, VqClipResult};

/// Multi-head self-attention.
#[derive(Debug, Clone)]
pub(crate) struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub(crate) fn new(vb: VarBuilder, hidden_size: usize, num_heads: usize) -> VqClipResult<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(VqClipError::config(
                ConfigFragment::Backbone,
                format!(
                    "hidden_size {} is not divisible by num_attention_heads {}",
                    hidden_size, num_heads
                ),
            ));
        }
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    /// Returns the attention output `[batch, seq, hidden]` and the attention
    /// probabilities `[batch, heads, seq, seq]`.
    pub(crate) fn forward(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
    ) -> VqClipResult<(Tensor, Tensor)> {
        let (batch, seq_len, hidden_size) = hidden_states.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(hidden_states)?, batch, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(hidden_states)?, batch, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(hidden_states)?, batch, seq_len)?;

        // Q @ K^T / sqrt(head_dim)
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k_t)? / scale)?;
        let scores = match mask {
            Some(m) => scores.broadcast_add(m)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let attn_output = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden_size))?;
        let output = self.out_proj.forward(&attn_output)?;

        Ok((output, probs))
    }

    /// `[batch, seq, hidden]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> VqClipResult<Tensor> {
        Ok(x
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// MLP block: FC1 -> activation -> FC2.
#[derive(Debug, Clone)]
pub(crate) struct Mlp {
    fc1: Linear,
    fc2: Linear,
    act: HiddenAct,
}

impl Mlp {
    pub(crate) fn new(
        vb: VarBuilder,
        hidden_size: usize,
        intermediate_size: usize,
        act: HiddenAct,
    ) -> VqClipResult<Self> {
        Ok(Self {
            fc1: linear(hidden_size, intermediate_size, vb.pp("fc1"))?,
            fc2: linear(intermediate_size, hidden_size, vb.pp("fc2"))?,
            act,
        })
    }

    pub(crate) fn forward(&self, hidden_states: &Tensor) -> VqClipResult<Tensor> {
        let hidden = self.fc1.forward(hidden_states)?;
        let hidden = match self.act {
            HiddenAct::QuickGelu => quick_gelu(&hidden)?,
            HiddenAct::Gelu => hidden.gelu_erf()?,
        };
        Ok(self.fc2.forward(&hidden)?)
    }
}

/// QuickGELU activation: x * sigmoid(1.702 * x)
fn quick_gelu(hidden: &Tensor) -> candle_core::Result<Tensor> {
    let gate = candle_nn::ops::sigmoid(&(hidden * 1.702)?)?;
    hidden * gate
}

/// One pre-norm transformer encoder layer.
#[derive(Debug, Clone)]
pub(crate) struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: SelfAttention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderLayer {
    pub(crate) fn new(vb: VarBuilder, dims: EncoderDims) -> VqClipResult<Self> {
        Ok(Self {
            layer_norm1: layer_norm(dims.hidden_size, dims.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: SelfAttention::new(vb.pp("self_attn"), dims.hidden_size, dims.num_heads)?,
            layer_norm2: layer_norm(dims.hidden_size, dims.layer_norm_eps, vb.pp("layer_norm2"))?,
            mlp: Mlp::new(vb.pp("mlp"), dims.hidden_size, dims.intermediate_size, dims.act)?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask: Option<&Tensor>) -> VqClipResult<(Tensor, Tensor)> {
        let normed = self.layer_norm1.forward(hidden_states)?;
        let (attn_output, probs) = self.self_attn.forward(&normed, mask)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.layer_norm2.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        Ok(((hidden_states + mlp_output)?, probs))
    }
}

/// Sizes shared by every layer of one encoder stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EncoderDims {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub layer_norm_eps: f64,
    pub act: HiddenAct,
}

/// Per-call diagnostics switches for a tower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TowerOptions {
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

/// Result of running an encoder stack.
pub(crate) struct EncoderOutput {
    pub last_hidden_state: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// Stack of encoder layers.
#[derive(Debug, Clone)]
pub(crate) struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub(crate) fn new(vb: VarBuilder, dims: EncoderDims) -> VqClipResult<Self> {
        let vb = vb.pp("layers");
        let layers = (0..dims.num_layers)
            .map(|idx| EncoderLayer::new(vb.pp(idx.to_string()), dims))
            .collect::<VqClipResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Hidden states, when collected, hold the embedding output followed by
    /// every layer's output.
    pub(crate) fn forward(
        &self,
        embeddings: Tensor,
        mask: Option<&Tensor>,
        options: TowerOptions,
    ) -> VqClipResult<EncoderOutput> {
        let mut hidden_states = options
            .output_hidden_states
            .then(|| Vec::with_capacity(self.layers.len() + 1));
        let mut attentions = options
            .output_attentions
            .then(|| Vec::with_capacity(self.layers.len()));

        let mut x = embeddings;
        for layer in &self.layers {
            if let Some(states) = hidden_states.as_mut() {
                states.push(x.clone());
            }
            let (next, probs) = layer.forward(&x, mask)?;
            if let Some(attn) = attentions.as_mut() {
                attn.push(probs);
            }
            x = next;
        }
        if let Some(states) = hidden_states.as_mut() {
            states.push(x.clone());
        }

        Ok(EncoderOutput {
            last_hidden_state: x,
            hidden_states,
            attentions,
        })
    }
}

/// Causal attention mask `[1, 1, seq_len, seq_len]`: 0 where attending,
/// -inf above the diagonal.
pub(crate) fn causal_mask(seq_len: usize, device: &Device) -> VqClipResult<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_slice(&mask, (1, 1, seq_len, seq_len), device)?)
}
