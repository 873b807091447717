//! Configuration for the VQ-CLIP model.
//!
//! A [`CompositeConfig`] merges three independently versioned fragments:
//!
//! - the backbone (dual-encoder) configuration, always present
//! - an optional vision-adapter configuration
//! - an optional text-adapter configuration
//!
//! An absent adapter fragment means that modality is not quantized.
//!
//! # JSON Structure
//!
//! ```json
//! {
//!   "model_type": "VQCLIP",
//!   "clip_config_dict": { "projection_dim": 512, "text_config": {}, "vision_config": {} },
//!   "vision_vq_adapter_config_dict": { "embed_dim": 512, "codebook_size": 64 },
//!   "text_vq_adapter_config_dict": null
//! }
//! ```
//!
//! # Design Principles
//!
//! - **FAIL FAST**: a fragment that does not parse returns `ConfigError`
//!   naming that fragment, never a silent default
//! - **EXPLICIT CROSS-CHECKS**: parsing checks shape only; adapter widths
//!   against the backbone are checked by [`CompositeConfig::validate`]

mod adapter;
mod backbone;
mod settings;

pub use adapter::AdapterConfig;
pub use backbone::{BackboneConfig, HiddenAct, TextTowerConfig, VisionTowerConfig};
pub use settings::{CheckpointSettings, DeviceKind, DeviceSettings, RuntimeSettings};

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ConfigFragment, VqClipError, VqClipResult};

/// Value written under `model_type`.
pub const MODEL_TYPE: &str = "VQCLIP";

const BACKBONE_KEY: &str = "clip_config_dict";
const VISION_ADAPTER_KEY: &str = "vision_vq_adapter_config_dict";
const TEXT_ADAPTER_KEY: &str = "text_vq_adapter_config_dict";
const MODEL_TYPE_KEY: &str = "model_type";

/// Composite configuration: one backbone fragment plus optional adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeConfig {
    /// Backbone fragment. Fixed once the model is constructed.
    pub backbone: BackboneConfig,
    /// Vision adapter fragment; `None` leaves image embeddings unquantized.
    pub vision_adapter: Option<AdapterConfig>,
    /// Text adapter fragment; `None` leaves text embeddings unquantized.
    pub text_adapter: Option<AdapterConfig>,
}

impl Default for CompositeConfig {
    /// Default backbone, default vision adapter, no text adapter.
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            vision_adapter: Some(AdapterConfig::default()),
            text_adapter: None,
        }
    }
}

/// Which modalities carry an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveModalities {
    pub vision: bool,
    pub text: bool,
}

impl ActiveModalities {
    /// Number of active adapters.
    pub fn count(&self) -> usize {
        usize::from(self.vision) + usize::from(self.text)
    }
}

impl CompositeConfig {
    /// Compose a configuration from its parts.
    pub fn from_parts(
        backbone: BackboneConfig,
        vision_adapter: Option<AdapterConfig>,
        text_adapter: Option<AdapterConfig>,
    ) -> Self {
        Self {
            backbone,
            vision_adapter,
            text_adapter,
        }
    }

    /// Which adapters this configuration instantiates.
    pub fn active_modalities(&self) -> ActiveModalities {
        ActiveModalities {
            vision: self.vision_adapter.is_some(),
            text: self.text_adapter.is_some(),
        }
    }

    /// Rebuild from a nested mapping.
    ///
    /// A missing backbone fragment takes the default backbone. A missing,
    /// `null` or empty adapter fragment leaves that adapter absent.
    ///
    /// # Errors
    /// - `ConfigError { fragment: Document }` if `value` is not a mapping
    /// - `ConfigError { fragment }` naming the fragment that failed to parse
    pub fn from_value(value: &Value) -> VqClipResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            VqClipError::config(
                ConfigFragment::Document,
                format!("expected a mapping, found {}", json_kind(value)),
            )
        })?;

        let backbone = match fragment(map, BACKBONE_KEY) {
            Some(v) => parse_fragment(v, ConfigFragment::Backbone)?,
            None => BackboneConfig::default(),
        };
        let vision_adapter = fragment(map, VISION_ADAPTER_KEY)
            .map(|v| parse_fragment(v, ConfigFragment::VisionAdapter))
            .transpose()?;
        let text_adapter = fragment(map, TEXT_ADAPTER_KEY)
            .map(|v| parse_fragment(v, ConfigFragment::TextAdapter))
            .transpose()?;

        Ok(Self {
            backbone,
            vision_adapter,
            text_adapter,
        })
    }

    /// Serialize to a nested mapping. Absent adapters are written as `null`.
    pub fn to_value(&self) -> VqClipResult<Value> {
        let mut map = Map::new();
        map.insert(MODEL_TYPE_KEY.to_string(), Value::from(MODEL_TYPE));
        map.insert(
            BACKBONE_KEY.to_string(),
            fragment_value(&self.backbone, ConfigFragment::Backbone)?,
        );
        map.insert(
            VISION_ADAPTER_KEY.to_string(),
            optional_fragment_value(self.vision_adapter.as_ref(), ConfigFragment::VisionAdapter)?,
        );
        map.insert(
            TEXT_ADAPTER_KEY.to_string(),
            optional_fragment_value(self.text_adapter.as_ref(), ConfigFragment::TextAdapter)?,
        );
        Ok(Value::Object(map))
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> VqClipResult<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| {
            VqClipError::config(ConfigFragment::Document, format!("invalid JSON: {}", e))
        })?;
        Self::from_value(&value)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> VqClipResult<String> {
        serde_json::to_string_pretty(&self.to_value()?).map_err(|e| {
            VqClipError::config(ConfigFragment::Document, format!("serialization failed: {}", e))
        })
    }

    /// Load from a `config.json` file.
    ///
    /// # Errors
    /// - `LoadError` if the file cannot be read
    /// - `ConfigError` if it does not parse
    pub fn from_file(path: impl AsRef<Path>) -> VqClipResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| VqClipError::load(path, e))?;
        Self::from_json_str(&contents)
    }

    /// Write to a `config.json` file.
    pub fn save(&self, path: impl AsRef<Path>) -> VqClipResult<()> {
        let path = path.as_ref();
        let json = self.to_json_string()?;
        std::fs::write(path, json).map_err(|e| VqClipError::save(path, e))
    }

    /// Check the backbone sizes and that every adapter consumes the
    /// backbone's projection width.
    ///
    /// # Errors
    /// - `ConfigError { fragment: Backbone }` for unusable tower sizes
    /// - `ConfigError` naming the first adapter whose `embed_dim` differs
    ///   from `projection_dim`
    pub fn validate(&self) -> VqClipResult<()> {
        self.backbone.validate()?;
        self.check_adapter_widths(self.backbone.projection_dim)
    }

    /// Adapter widths against a given projection width.
    pub(crate) fn check_adapter_widths(&self, projection_dim: usize) -> VqClipResult<()> {
        for (which, adapter) in [
            (ConfigFragment::VisionAdapter, self.vision_adapter.as_ref()),
            (ConfigFragment::TextAdapter, self.text_adapter.as_ref()),
        ] {
            if let Some(adapter) = adapter {
                if adapter.embed_dim != projection_dim {
                    return Err(VqClipError::config(
                        which,
                        format!(
                            "embed_dim {} does not match backbone projection_dim {}",
                            adapter.embed_dim, projection_dim
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// True if `value` looks like a composite document rather than a plain
    /// backbone config.
    pub fn is_composite_document(value: &Value) -> bool {
        value
            .as_object()
            .map(|m| {
                m.contains_key(BACKBONE_KEY)
                    || m.get(MODEL_TYPE_KEY).and_then(Value::as_str) == Some(MODEL_TYPE)
            })
            .unwrap_or(false)
    }
}

impl BackboneConfig {
    /// Read a standalone backbone config file.
    ///
    /// Accepts a plain CLIP config or a composite document, in which case
    /// the backbone fragment is taken.
    pub fn from_file(path: impl AsRef<Path>) -> VqClipResult<Self> {
        let path = path.as_ref();
        let value = read_json(path)?;
        if CompositeConfig::is_composite_document(&value) {
            Ok(CompositeConfig::from_value(&value)?.backbone)
        } else {
            parse_fragment(&value, ConfigFragment::Backbone)
        }
    }
}

impl AdapterConfig {
    /// Read a standalone adapter config file. `which` names the fragment in
    /// errors.
    pub fn from_file(path: impl AsRef<Path>, which: ConfigFragment) -> VqClipResult<Self> {
        parse_fragment(&read_json(path.as_ref())?, which)
    }
}

fn read_json(path: &Path) -> VqClipResult<Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| VqClipError::load(path, e))?;
    serde_json::from_str(&contents).map_err(|e| VqClipError::load(path, e))
}

/// Look up a fragment, treating `null` and `{}` as absent.
fn fragment<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Object(inner)) if inner.is_empty() => None,
        Some(v) => Some(v),
    }
}

/// Parse one fragment, tagging failures with the fragment name.
pub(crate) fn parse_fragment<T: DeserializeOwned>(
    value: &Value,
    which: ConfigFragment,
) -> VqClipResult<T> {
    if !value.is_object() {
        return Err(VqClipError::config(
            which,
            format!("expected a mapping, found {}", json_kind(value)),
        ));
    }
    T::deserialize(value).map_err(|e| VqClipError::config(which, e.to_string()))
}

fn fragment_value<T: Serialize>(fragment: &T, which: ConfigFragment) -> VqClipResult<Value> {
    serde_json::to_value(fragment).map_err(|e| VqClipError::config(which, e.to_string()))
}

fn optional_fragment_value<T: Serialize>(
    fragment: Option<&T>,
    which: ConfigFragment,
) -> VqClipResult<Value> {
    fragment.map_or(Ok(Value::Null), |f| fragment_value(f, which))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
