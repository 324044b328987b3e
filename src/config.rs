//! Build Context - explicit, immutable engine settings
//!
//! Threaded by reference through every engine call instead of process-wide
//! mode flags.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// What the engine is being asked to do. Decides which validation
/// severities abort and how unknown node kinds are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Produce a binary.
    #[default]
    Build,
    /// Recover settings from an existing binary.
    Decompose,
    /// Interactive configuration edits; build-only errors do not abort.
    Edit,
}

/// What to do when a duplicate Set dependency's value does not fit its
/// destination bit range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    /// Skip that one target, log a warning, continue the batch.
    #[default]
    Skip,
    /// Abort the whole propagation.
    Fail,
}

/// Key-size policy for signatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// RSA-3072.
    #[default]
    Current,
    /// RSA-2048, for images consumed by older loaders.
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BuildContext {
    pub mode: ToolMode,
    /// Buffer capacity in bytes; writing beyond it is an error.
    pub capacity: usize,
    pub max_layout_passes: usize,
    pub max_propagation_rounds: usize,
    pub range_policy: RangePolicy,
    pub external_timeout_ms: u64,
    pub pad_byte: u8,
    pub key_policy: KeyPolicy,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            mode: ToolMode::Build,
            capacity: 16 * 1024 * 1024,
            max_layout_passes: 8,
            max_propagation_rounds: 32,
            range_policy: RangePolicy::Skip,
            external_timeout_ms: 30_000,
            pad_byte: 0x00,
            key_policy: KeyPolicy::Current,
        }
    }
}

impl BuildContext {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| BuildError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_mode(&self, mode: ToolMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    pub fn is_decompose_only(&self) -> bool {
        self.mode == ToolMode::Decompose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let ctx: BuildContext =
            serde_json::from_str(r#"{"mode": "edit", "range_policy": "fail"}"#).unwrap();
        assert_eq!(ctx.mode, ToolMode::Edit);
        assert_eq!(ctx.range_policy, RangePolicy::Fail);
        assert_eq!(ctx.capacity, 16 * 1024 * 1024);
        assert_eq!(ctx.max_layout_passes, 8);
    }

    #[test]
    fn test_with_mode_leaves_original_untouched() {
        let ctx = BuildContext::default();
        let edit = ctx.with_mode(ToolMode::Edit);
        assert_eq!(ctx.mode, ToolMode::Build);
        assert_eq!(edit.mode, ToolMode::Edit);
    }
}
