//! Shared fixtures: tiny backbones and adapters that run in milliseconds on CPU.

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use vq_clip::{AdapterConfig, BackboneConfig, CompositeConfig, TextTowerConfig, VisionTowerConfig};

pub const PROJECTION_DIM: usize = 6;

pub fn tiny_backbone() -> BackboneConfig {
    BackboneConfig {
        text_config: TextTowerConfig {
            vocab_size: 40,
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            max_position_embeddings: 8,
            ..TextTowerConfig::default()
        },
        vision_config: VisionTowerConfig {
            hidden_size: 12,
            intermediate_size: 24,
            num_hidden_layers: 2,
            num_attention_heads: 3,
            image_size: 8,
            patch_size: 4,
            ..VisionTowerConfig::default()
        },
        projection_dim: PROJECTION_DIM,
        ..BackboneConfig::default()
    }
}

pub fn tiny_adapter(codebook_size: usize) -> AdapterConfig {
    AdapterConfig {
        embed_dim: PROJECTION_DIM,
        codebook_size,
        codebook_dim: 3,
        ..AdapterConfig::default()
    }
}

pub fn composite(vision: bool, text: bool) -> CompositeConfig {
    CompositeConfig::from_parts(
        tiny_backbone(),
        vision.then(|| tiny_adapter(8)),
        text.then(|| tiny_adapter(4)),
    )
}

/// Two captions, end-of-text token 39, zero padding.
pub fn token_batch() -> (Tensor, Tensor) {
    let ids = Tensor::new(&[[1u32, 7, 12, 39, 0], [2, 39, 0, 0, 0]], &Device::Cpu).unwrap();
    let mask = Tensor::new(&[[1u32, 1, 1, 1, 0], [1, 1, 0, 0, 0]], &Device::Cpu).unwrap();
    (ids, mask)
}

pub fn pixel_batch(n: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (n, 3, 8, 8), &Device::Cpu).unwrap()
}

pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    let (a, b) = (to_vec(a), to_vec(b));
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        assert!((x - y).abs() <= tol, "element {}: {} vs {}", i, x, y);
    }
}

pub fn scalar(t: &Tensor) -> f32 {
    to_vec(t)[0]
}
