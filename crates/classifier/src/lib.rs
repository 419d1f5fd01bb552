//! Confidence scoring and clustering over file embeddings.
//!
//! [`ConfidenceScorer`] turns prototype matches into a capped, additive
//! confidence and an auto-place / review / deep-analysis outcome.
//! [`Clusterer`] groups embeddings that no prototype claims: flat spherical
//! k-means, a recursive hierarchy, or keyword-named semantic themes.

mod clusterer;
mod confidence;
mod error;
mod file_types;
mod hierarchical;
mod kmeans;
mod scorer;
mod themes;

pub use clusterer::{suggested_k, Clusterer, ClusteringConfig};
pub use confidence::{ConfidenceConfig, ConfidencePreset, Outcome, SignalCaps, SignalWeights};
pub use error::{ClassifierError, Result};
pub use file_types::FileKind;
pub use hierarchical::{cluster_hierarchy, ClusterNode, HierarchicalConfig};
pub use kmeans::{coherence, KMeansConfig, KMeansResult, SphericalKMeans};
pub use scorer::{
    folder_match, ConfidenceBreakdown, ConfidenceScorer, OutcomeCounts, ScoredCategory,
    ScorerStats, ScoringInput,
};
pub use themes::{
    cluster_themes, keyword_tokens, theme_name, FileTypeGroup, SemanticTheme, ThemeClustering,
    ThemeConfig, ThemeItem, ThemeStrategy,
};
