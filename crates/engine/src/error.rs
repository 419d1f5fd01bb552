use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Vector store error: {0}")]
    VectorStore(#[from] sift_vector_store::VectorStoreError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] sift_classifier::ClassifierError),

    #[error("Taxonomy error: {0}")]
    Taxonomy(#[from] sift_taxonomy::TaxonomyError),

    #[error("Organizer error: {0}")]
    Organizer(#[from] sift_organizer::OrganizerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse config {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Stable code used in machine-readable error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use sift_organizer::OrganizerError;
        use sift_taxonomy::TaxonomyError;
        match self {
            Self::VectorStore(sift_vector_store::VectorStoreError::InvalidDimension { .. }) => {
                "dimension_mismatch"
            }
            Self::VectorStore(_) => "vector_store",
            Self::Classifier(_) => "classifier",
            Self::Taxonomy(TaxonomyError::MalformedPath { .. }) => "malformed_path",
            Self::Taxonomy(TaxonomyError::NodeNotFound(_)) => "node_not_found",
            Self::Taxonomy(TaxonomyError::SuggestionNotFound(_)) => "suggestion_not_found",
            Self::Taxonomy(TaxonomyError::Refused(_) | TaxonomyError::DepthRefused(_)) => "refused",
            Self::Taxonomy(_) => "taxonomy",
            Self::Organizer(OrganizerError::UndoNotEnabled) => "undo_not_enabled",
            Self::Organizer(OrganizerError::NothingToUndo) => "nothing_to_undo",
            Self::Organizer(OrganizerError::NothingToRedo) => "nothing_to_redo",
            Self::Organizer(OrganizerError::Busy(_)) => "busy",
            Self::Organizer(OrganizerError::InvalidOperation(_)) => "invalid_operation",
            Self::Organizer(_) => "organizer",
            Self::InvalidConfig(_) | Self::ConfigParse { .. } => "invalid_config",
            Self::Store(_) => "store",
            Self::UnknownFile(_) => "unknown_file",
            Self::IoError(_) => "io",
            Self::SerializationError(_) => "serialization",
            Self::Other(_) => "internal",
        }
    }
}
