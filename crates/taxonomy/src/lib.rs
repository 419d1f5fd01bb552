//! Category taxonomy for sift.
//!
//! [`TaxonomyTree`] is an arena of nodes addressed by stable [`NodeId`]s.
//! Structural edits consult the user-edit [`guardrail`] and the configured
//! [`DepthPolicy`]; automatic proposals wait in the [`MergeSplitGatekeeper`]
//! until a human approves them. [`SharedTaxonomy`] serializes writers.
//!
//! [`NodeId`]: sift_protocol::NodeId

mod depth;
mod error;
mod gatekeeper;
pub mod guardrail;
mod shared;
mod tree;

pub use depth::{DepthCheck, DepthMode, DepthPolicy, DepthViolation};
pub use error::{Result, TaxonomyError};
pub use gatekeeper::{MergeSplitGatekeeper, MergeSuggestion, SplitSuggestion, SuggestionStatus};
pub use guardrail::{EditOrigin, GuardrailDecision, RefinementState};
pub use shared::SharedTaxonomy;
pub use tree::{
    parse_category_path, MergeReport, TaxonomyNode, TaxonomyStats, TaxonomyTree,
    TAXONOMY_SCHEMA_VERSION,
};
