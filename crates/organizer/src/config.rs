use crate::error::{OrganizerError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 5;
pub const MAX_CONCURRENT_OPS: usize = 64;
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_UNDO_BATCHES: usize = 20;
pub const DEFAULT_UNCATEGORIZED_FOLDER: &str = "Uncategorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizeMode {
    #[default]
    Move,
    Copy,
    Symlink,
}

impl OrganizeMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Symlink => "symlink",
        }
    }
}

impl FromStr for OrganizeMode {
    type Err = OrganizerError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            "symlink" | "link" => Ok(Self::Symlink),
            other => Err(OrganizerError::InvalidConfig(format!(
                "unknown organize mode '{other}' (expected move, copy or symlink)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionStyle {
    /// `name (1).ext`
    #[default]
    #[serde(rename = "macos")]
    MacOs,
    /// `name-1.ext`
    Numbered,
    /// `name_20240301-101500.ext`, then `name_20240301-101500-2.ext`
    Timestamped,
}

impl FromStr for CollisionStyle {
    type Err = OrganizerError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "macos" | "mac" => Ok(Self::MacOs),
            "numbered" => Ok(Self::Numbered),
            "timestamped" | "timestamp" => Ok(Self::Timestamped),
            other => Err(OrganizerError::InvalidConfig(format!(
                "unknown collision style '{other}' (expected macos, numbered or timestamped)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizerConfig {
    pub mode: OrganizeMode,
    pub collision_style: CollisionStyle,
    pub uncategorized_folder: String,
    pub max_concurrent_ops: usize,
    pub op_timeout_ms: u64,
    /// Forbids the copy-then-delete fallback for cross-volume moves.
    pub no_delete: bool,
    pub enable_undo: bool,
    pub max_undo_batches: usize,
    /// Overwrite existing destinations instead of renaming around them.
    pub replace_existing: bool,
}

impl Default for OrganizerConfig {
    fn default() -> Self {
        Self {
            mode: OrganizeMode::Move,
            collision_style: CollisionStyle::MacOs,
            uncategorized_folder: DEFAULT_UNCATEGORIZED_FOLDER.to_string(),
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            op_timeout_ms: DEFAULT_OP_TIMEOUT_MS,
            no_delete: false,
            enable_undo: true,
            max_undo_batches: DEFAULT_MAX_UNDO_BATCHES,
            replace_existing: false,
        }
    }
}

impl OrganizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_ops == 0 || self.max_concurrent_ops > MAX_CONCURRENT_OPS {
            return Err(OrganizerError::InvalidConfig(format!(
                "max_concurrent_ops must be in 1..={MAX_CONCURRENT_OPS}, got {}",
                self.max_concurrent_ops
            )));
        }
        if self.op_timeout_ms == 0 {
            return Err(OrganizerError::InvalidConfig(
                "op_timeout_ms must be positive".to_string(),
            ));
        }
        if self.enable_undo && self.max_undo_batches == 0 {
            return Err(OrganizerError::InvalidConfig(
                "max_undo_batches must be at least 1 when undo is enabled".to_string(),
            ));
        }
        let folder = self.uncategorized_folder.trim();
        if folder.is_empty() || folder == "." || folder == ".." || folder.contains(['/', '\\']) {
            return Err(OrganizerError::InvalidConfig(format!(
                "uncategorized_folder must be a single folder name, got '{}'",
                self.uncategorized_folder
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}
