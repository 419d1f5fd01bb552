//! # Sift Vector Store
//!
//! Similarity search and the online category model behind classification.
//!
//! ## Features
//!
//! - **Cosine k-NN** over an exact scan or a random-projection index
//! - **Category prototypes** updated by exponential moving average
//! - **Learned patterns** remembering exact files by content checksum
//! - **Deterministic embedder** for offline use and tests
//!
//! ## Architecture
//!
//! ```text
//! filename / text
//!     │
//!     ├──> Embedder (HashEmbedder or a model-backed impl)
//!     │      └─> unit Vector[dim]
//!     │
//!     ├──> PrototypeStore ──> VectorIndex (exact | projection)
//!     │      └─> best category by similarity × confidence
//!     │
//!     └──> PatternMemory
//!            └─> checksum → remembered label
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use sift_vector_store::{Embedder, HashEmbedder, PrototypeStore, DEFAULT_EMA_ALPHA};
//!
//! #[tokio::main]
//! async fn main() -> sift_vector_store::Result<()> {
//!     let embedder = HashEmbedder::new(128);
//!     let mut prototypes = PrototypeStore::new(128, DEFAULT_EMA_ALPHA)?;
//!
//!     let invoice = embedder.embed("invoice_2024_03.pdf").await?;
//!     prototypes.update_prototype("Finance/Invoices", &invoice)?;
//!
//!     let query = embedder.embed("invoice_2024_04.pdf").await?;
//!     if let Some(hit) = prototypes.classify(&query, 0.3)? {
//!         println!("{} ({:.2})", hit.category_path, hit.score());
//!     }
//!     Ok(())
//! }
//! ```

mod embeddings;
mod error;
mod index;
pub mod paths;
mod patterns;
mod persist;
mod prototype;
mod store;
mod types;

pub use embeddings::{
    cosine_distance, cosine_of, cosine_similarity, embedding_dimension_from_env, ensure_dimension,
    is_unit, l2_norm, normalize, normalized, tokenize, Embedder, HashEmbedder,
    DEFAULT_EMBEDDING_DIMENSION,
};
pub use error::{Result, VectorStoreError};
pub use index::{ExactIndex, ProjectionIndex, VectorBackend, DEFAULT_PROJECTION_BITS};
pub use patterns::{
    checksum_of, content_checksum, LearnedPattern, PatternMemory, CHECKSUM_PREFIX_BYTES,
    PATTERN_MEMORY_SCHEMA_VERSION,
};
pub use persist::{current_unix_ms, read_versioned_json, write_versioned_json};
pub use prototype::{
    category_path_key, confidence_for_samples, CategoryPrototype, PrototypeMatch,
    PrototypeStore, DEFAULT_EMA_ALPHA, PROTOTYPE_STORE_SCHEMA_VERSION,
};
pub use store::VectorIndex;
pub use types::SearchHit;
