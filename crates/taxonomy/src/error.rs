use crate::depth::DepthCheck;
use crate::guardrail::GuardrailDecision;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaxonomyError>;

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Malformed category path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("Category not found: {0}")]
    NodeNotFound(String),

    #[error("Suggestion not found or no longer applicable: {0}")]
    SuggestionNotFound(u64),

    #[error("A category named '{0}' already exists here")]
    AlreadyExists(String),

    #[error("Edit refused: {}", .0.reason)]
    Refused(GuardrailDecision),

    #[error("Depth policy refused the edit: {}", .0.reason)]
    DepthRefused(DepthCheck),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sift_vector_store::VectorStoreError),
}

impl TaxonomyError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
