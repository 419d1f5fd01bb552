//! Shared types passed between the sift crates and their collaborators.
//!
//! The scanner produces [`ScannedFile`] batches, the classifier turns them into
//! [`FileAssignment`]s that point at taxonomy nodes by [`NodeId`], and the
//! organizer consumes both to plan file operations.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const PROTOCOL_SCHEMA_VERSION: u32 = 1;

/// Stable identifier of a file inside one classification run.
///
/// Derived from the absolute source path so repeated scans of the same tree
/// yield the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arena identifier of a taxonomy node. Survives renames and moves.
/// The default id is the root's.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A file handed over by the content scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub url: PathBuf,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    pub size: u64,
    pub modified_at_unix_ms: u64,
}

impl ScannedFile {
    /// Builds a record from a path alone; size and mtime are left at zero.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        Self {
            url: path.to_path_buf(),
            filename,
            extension,
            size: 0,
            modified_at_unix_ms: 0,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, size: u64, modified_at_unix_ms: u64) -> Self {
        self.size = size;
        self.modified_at_unix_ms = modified_at_unix_ms;
        self
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        let mut raw = self.url.to_string_lossy().to_string();
        if raw.contains('\\') {
            raw = raw.replace('\\', "/");
        }
        FileId(raw)
    }

    /// Filename without its final extension.
    #[must_use]
    pub fn stem(&self) -> &str {
        match self.extension.as_deref() {
            Some(ext) if !ext.is_empty() => {
                let cut = self.filename.len().saturating_sub(ext.len() + 1);
                self.filename.get(..cut).unwrap_or(&self.filename)
            }
            _ => &self.filename,
        }
    }

    /// Name of the folder currently holding the file, if any.
    #[must_use]
    pub fn parent_folder(&self) -> Option<String> {
        self.url
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty())
    }
}

/// Provenance of a category decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Filename,
    Content,
    User,
    Memory,
    #[serde(rename = "graph_rag")]
    GraphRag,
}

impl AssignmentSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filename => "filename",
            Self::Content => "content",
            Self::User => "user",
            Self::Memory => "memory",
            Self::GraphRag => "graph_rag",
        }
    }
}

/// The decision that places one file under one taxonomy node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAssignment {
    pub file_id: FileId,
    pub category_id: NodeId,
    pub url: PathBuf,
    pub filename: String,
    pub confidence: f32,
    pub source: AssignmentSource,
    #[serde(default)]
    pub needs_deep_analysis: bool,
}

impl FileAssignment {
    pub fn for_file(
        file: &ScannedFile,
        category_id: NodeId,
        confidence: f32,
        source: AssignmentSource,
    ) -> Self {
        Self {
            file_id: file.file_id(),
            category_id,
            url: file.url.clone(),
            filename: file.filename.clone(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            needs_deep_analysis: false,
        }
    }
}

/// Machine-readable failure emitted by the CLI in `--json` mode.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

pub fn serialize_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scanned_file_splits_name_parts() {
        let file = ScannedFile::from_path("/home/me/Invoices/march.PDF");
        assert_eq!(file.filename, "march.PDF");
        assert_eq!(file.extension.as_deref(), Some("pdf"));
        assert_eq!(file.stem(), "march");
        assert_eq!(file.parent_folder().as_deref(), Some("Invoices"));
    }

    #[test]
    fn stem_without_extension_is_whole_name() {
        let file = ScannedFile::from_path("/tmp/Makefile");
        assert_eq!(file.extension, None);
        assert_eq!(file.stem(), "Makefile");
    }

    #[test]
    fn assignment_source_uses_snake_case_on_the_wire() {
        let raw = serialize_json(&AssignmentSource::GraphRag).unwrap();
        assert_eq!(raw, "\"graph_rag\"");
        let back: AssignmentSource = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(back, AssignmentSource::Memory);
    }

    #[test]
    fn assignment_confidence_is_clamped() {
        let file = ScannedFile::from_path("/a/b.txt");
        let assignment = FileAssignment::for_file(&file, NodeId(3), 1.7, AssignmentSource::Filename);
        assert_eq!(assignment.confidence, 1.0);
        assert_eq!(assignment.file_id.as_str(), "/a/b.txt");
    }
}
