use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] sift_vector_store::VectorStoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown confidence preset '{0}' (expected conservative, balanced or aggressive)")]
    UnknownPreset(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("{0}")]
    Other(String),
}
