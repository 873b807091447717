//! Quantization-adapter configuration.

use serde::{Deserialize, Serialize};

/// Configuration for one vector-quantization adapter.
///
/// The adapter maps an `embed_dim` embedding into `heads` sub-vectors of
/// `codebook_dim`, snaps each to the nearest of `codebook_size` codes, and
/// maps the result back to `embed_dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Input and output width. Must equal the backbone `projection_dim`.
    pub embed_dim: usize,
    /// Number of codes in the codebook.
    pub codebook_size: usize,
    /// Width of each code vector.
    pub codebook_dim: usize,
    /// Number of codes emitted per embedding.
    pub heads: usize,
    /// Weight of the encoder-side commitment term.
    pub commitment_weight: f64,
    /// Weight of the codebook-side term.
    pub codebook_weight: f64,
    /// Assign codes by cosine similarity instead of Euclidean distance.
    pub use_cosine_sim: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            embed_dim: 512,
            codebook_size: 64,
            codebook_dim: 32,
            heads: 1,
            commitment_weight: 0.25,
            codebook_weight: 1.0,
            use_cosine_sim: false,
        }
    }
}

impl AdapterConfig {
    /// Width of the projected space fed to the codebook (`heads * codebook_dim`).
    pub fn inner_dim(&self) -> usize {
        self.heads * self.codebook_dim
    }
}
