use serde::{Deserialize, Serialize};
use sift_classifier::{Outcome, ScorerStats};
use sift_protocol::{AssignmentSource, FileAssignment, FileId, NodeId};
use sift_taxonomy::TaxonomyStats;
use std::path::PathBuf;

/// How one file got its category during `classify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyDecision {
    pub file_id: FileId,
    pub category_path: String,
    pub confidence: f32,
    /// `None` for learned-pattern hits, which skip scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub source: AssignmentSource,
    pub clustered: bool,
    pub explanation: String,
}

/// A file `classify` could not place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyFailure {
    pub file_id: FileId,
    pub url: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifyReport {
    pub assignments: Vec<FileAssignment>,
    pub decisions: Vec<ClassifyDecision>,
    pub failures: Vec<ClassifyFailure>,
    pub memory_hits: usize,
    pub clustered: usize,
    pub duration_ms: u64,
}

/// Row of the `processing` table: the last decision made about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub file_id: FileId,
    pub url: PathBuf,
    pub category_path: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub source: AssignmentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub processed_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub was_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
    pub category_path: String,
    pub created_category: bool,
}

/// Result of approving a split: the new children and how many files moved into them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitReport {
    pub node: NodeId,
    pub created: Vec<NodeId>,
    pub created_paths: Vec<String>,
    pub reassigned: usize,
    pub kept: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub scorer: ScorerStats,
    pub taxonomy: TaxonomyStats,
    pub prototypes: usize,
    pub patterns: usize,
    pub pending_updates: usize,
    pub pending_merges: usize,
    pub pending_splits: usize,
}
