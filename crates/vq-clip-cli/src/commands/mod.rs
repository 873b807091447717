//! CLI command handlers
//!
//! # Modules
//!
//! - `compose`: build a composite config.json from fragments
//! - `graft`: adapter checkpoint + pretrained backbone -> full checkpoint
//! - `strip`: full checkpoint -> adapter-only checkpoint
//! - `inspect`: checkpoint summary

pub mod compose;
pub mod graft;
pub mod inspect;
pub mod strip;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Pick the command-line path, else the settings path, else fail naming both.
pub(crate) fn path_or_setting(
    arg: Option<&Path>,
    setting: Option<&Path>,
    flag: &str,
    key: &str,
) -> Result<PathBuf> {
    arg.or(setting)
        .map(Path::to_path_buf)
        .with_context(|| format!("no path given: pass {} or set {} in settings", flag, key))
}
