//! VQ-CLIP: a CLIP dual encoder composed with vector-quantization adapters.
//!
//! Each modality's normalized embedding can be routed through a codebook
//! quantizer, turning it into a short sequence of discrete codes while
//! keeping the contrastive objective intact.
//!
//! # Architecture
//!
//! - **CompositeConfig**: backbone fragment plus optional adapter fragments
//! - **ClipBackbone**: text and vision towers ([`DualEncoder`])
//! - **VqAdapter**: codebook bottleneck ([`Quantizer`])
//! - **VqClipModel**: forward pass, loss blending and selective persistence
//!
//! # Example
//!
//! ```rust,ignore
//! use vq_clip::{ForwardOptions, TextInputs, VqClipModel};
//!
//! let model = VqClipModel::from_parts("./vq-vit-l-14-k64-d32", "./clip-vit-large-patch14", &device)?;
//! let out = model
//!     .forward(&TextInputs::new(&input_ids), &pixel_values, &ForwardOptions::new().with_loss())?
//!     .into_structured()
//!     .expect("structured by default");
//! println!("codes: {:?}", out.image_codes);
//! ```

pub mod adapter;
pub mod backbone;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod ops;
pub mod output;

pub use adapter::{AdapterSlot, Modality, Quantized, Quantizer, VqAdapter};
pub use backbone::{ClipBackbone, DualEncoder, TextInputs, TowerOptions, TowerOutput};
pub use checkpoint::CheckpointSummary;
pub use config::{
    ActiveModalities, AdapterConfig, BackboneConfig, CompositeConfig, RuntimeSettings,
    TextTowerConfig, VisionTowerConfig,
};
pub use error::{ConfigFragment, VqClipError, VqClipResult};
pub use loss::LossComponents;
pub use model::{ForwardOptions, VqClipModel};
pub use output::{FlatItem, FlatOutput, ForwardOutput, ForwardResult};
