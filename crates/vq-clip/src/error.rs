//! Error types for VQ-CLIP operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which configuration fragment failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFragment {
    /// The backbone (dual-encoder) fragment.
    Backbone,
    /// The vision-adapter fragment.
    VisionAdapter,
    /// The text-adapter fragment.
    TextAdapter,
    /// The enclosing composite document.
    Document,
    /// Runtime settings (TOML).
    Settings,
}

impl fmt::Display for ConfigFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigFragment::Backbone => "backbone",
            ConfigFragment::VisionAdapter => "vision_adapter",
            ConfigFragment::TextAdapter => "text_adapter",
            ConfigFragment::Document => "document",
            ConfigFragment::Settings => "settings",
        };
        f.write_str(name)
    }
}

/// VQ-CLIP errors.
#[derive(Debug, Error)]
pub enum VqClipError {
    /// A configuration fragment is unparseable or structurally incompatible.
    #[error("Invalid {fragment} configuration: {message}")]
    ConfigError {
        fragment: ConfigFragment,
        message: String,
    },

    /// A checkpoint or config file could not be located or deserialized.
    #[error("Failed to load '{}': {message}", path.display())]
    LoadError { path: PathBuf, message: String },

    /// A checkpoint could not be written.
    #[error("Failed to save '{}': {message}", path.display())]
    SaveError { path: PathBuf, message: String },

    /// Caller-supplied inputs are structurally invalid.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Numeric-layer failure (shape mismatch, dtype, device).
    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VqClipError {
    pub(crate) fn config(fragment: ConfigFragment, message: impl Into<String>) -> Self {
        Self::ConfigError {
            fragment,
            message: message.into(),
        }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::LoadError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn save(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::SaveError {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for VQ-CLIP operations.
pub type VqClipResult<T> = Result<T, VqClipError>;
