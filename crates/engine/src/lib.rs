//! Classification and organization engine for sift.
//!
//! ```text
//! ScannedFile ── Embedder ── PatternMemory (checksum hit?)
//!                   │
//!   ConfidenceScorer over PrototypeStore (bounded fan-out)
//!                   │ auto_place / review / deep_analysis
//!        Clusterer themes for the unplaced
//!                   │
//!          SharedTaxonomy (atomic mutate) ── MergeSplitGatekeeper
//!                   │                              │
//!          UpdateQueue ── flush ── PrototypeStore   TaxonomyRefiner
//!                   │
//!   SafeFileOrganizer (plan / execute / undo / redo)
//! ```
//!
//! Classification never writes prototypes directly. Learned samples queue up
//! in [`UpdateQueue`] and are blended in by [`Engine::flush_updates`] under
//! the prototype write lock. Every structural edit of the tree runs on a
//! scratch copy and is published only when it succeeds.

mod config;
mod engine;
mod error;
mod limits;
mod queue;
mod refiner;
mod store;
mod types;

pub use config::{
    ConfidenceSection, EmbeddingConfig, EngineConfig, PrototypeConfig, WorkerConfig,
};
pub use engine::{Engine, DEFAULT_ROOT_NAME};
pub use error::{EngineError, Result};
pub use limits::MAX_CLASSIFY_CONCURRENCY;
pub use queue::{PrototypeUpdate, UpdateQueue};
pub use refiner::{MergeCandidate, RefineReport, RefinerConfig, SplitCandidate, TaxonomyRefiner};
pub use store::{JsonFileStore, MemoryStore, Store, Table, WriteOp, STORE_SCHEMA_VERSION};
pub use types::{
    ClassifyDecision, ClassifyFailure, ClassifyReport, EngineStats, FeedbackOutcome,
    ProcessingRecord, SplitReport,
};
