//! Approval queue for automatically proposed merges and splits.

use crate::error::{Result, TaxonomyError};
use crate::guardrail::EditOrigin;
use crate::tree::{MergeReport, TaxonomyTree};
use serde::{Deserialize, Serialize};
use sift_protocol::NodeId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub id: u64,
    pub sources: Vec<NodeId>,
    pub target: NodeId,
    pub reason: String,
    pub confidence: f32,
    pub status: SuggestionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSuggestion {
    pub id: u64,
    pub node: NodeId,
    pub proposed_subcategories: Vec<String>,
    pub reason: String,
    pub confidence: f32,
    pub status: SuggestionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeSplitGatekeeper {
    next_id: u64,
    merges: BTreeMap<u64, MergeSuggestion>,
    splits: BTreeMap<u64, SplitSuggestion>,
}

impl MergeSplitGatekeeper {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    /// Queues a merge. An identical pending suggestion is returned instead of a duplicate.
    pub fn suggest_merge(
        &mut self,
        sources: Vec<NodeId>,
        target: NodeId,
        reason: impl Into<String>,
        confidence: f32,
    ) -> u64 {
        let mut sorted = sources;
        sorted.sort();
        sorted.dedup();
        if let Some(existing) = self.merges.values().find(|s| {
            s.status == SuggestionStatus::Pending && s.target == target && s.sources == sorted
        }) {
            return existing.id;
        }
        let id = self.allocate();
        self.merges.insert(
            id,
            MergeSuggestion {
                id,
                sources: sorted,
                target,
                reason: reason.into(),
                confidence: confidence.clamp(0.0, 1.0),
                status: SuggestionStatus::Pending,
            },
        );
        id
    }

    pub fn suggest_split(
        &mut self,
        node: NodeId,
        proposed_subcategories: Vec<String>,
        reason: impl Into<String>,
        confidence: f32,
    ) -> u64 {
        if let Some(existing) = self
            .splits
            .values()
            .find(|s| s.status == SuggestionStatus::Pending && s.node == node)
        {
            return existing.id;
        }
        let id = self.allocate();
        self.splits.insert(
            id,
            SplitSuggestion {
                id,
                node,
                proposed_subcategories,
                reason: reason.into(),
                confidence: confidence.clamp(0.0, 1.0),
                status: SuggestionStatus::Pending,
            },
        );
        id
    }

    #[must_use]
    pub fn pending_merges(&self) -> Vec<MergeSuggestion> {
        self.merges
            .values()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn pending_splits(&self) -> Vec<SplitSuggestion> {
        self.splits
            .values()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn merge(&self, id: u64) -> Option<&MergeSuggestion> {
        self.merges.get(&id)
    }

    #[must_use]
    pub fn split(&self, id: u64) -> Option<&SplitSuggestion> {
        self.splits.get(&id)
    }

    fn pending_merge(&self, id: u64) -> Result<&MergeSuggestion> {
        self.merges
            .get(&id)
            .filter(|s| s.status == SuggestionStatus::Pending)
            .ok_or(TaxonomyError::SuggestionNotFound(id))
    }

    fn pending_split(&self, id: u64) -> Result<&SplitSuggestion> {
        self.splits
            .get(&id)
            .filter(|s| s.status == SuggestionStatus::Pending)
            .ok_or(TaxonomyError::SuggestionNotFound(id))
    }

    /// Applies a pending merge as an explicit approval and marks it applied.
    ///
    /// A suggestion whose nodes have disappeared is dropped and reported as
    /// [`TaxonomyError::SuggestionNotFound`].
    pub fn approve_merge(&mut self, id: u64, tree: &mut TaxonomyTree) -> Result<MergeReport> {
        let suggestion = self.pending_merge(id)?.clone();
        let stale = !tree.contains(suggestion.target)
            || suggestion.sources.iter().any(|s| !tree.contains(*s));
        if stale {
            log::warn!("merge suggestion {id} references deleted categories; discarding");
            self.merges.remove(&id);
            return Err(TaxonomyError::SuggestionNotFound(id));
        }
        self.set_merge_status(id, SuggestionStatus::Approved);
        match tree.merge_categories(&suggestion.sources, suggestion.target, EditOrigin::Approved) {
            Ok(report) => {
                self.set_merge_status(id, SuggestionStatus::Applied);
                self.invalidate_removed(&report.removed_nodes);
                Ok(report)
            }
            Err(err) => {
                self.set_merge_status(id, SuggestionStatus::Pending);
                Err(err)
            }
        }
    }

    pub fn reject_merge(&mut self, id: u64) -> Result<()> {
        self.pending_merge(id)?;
        self.set_merge_status(id, SuggestionStatus::Rejected);
        Ok(())
    }

    /// Creates the proposed children as an explicit approval.
    pub fn approve_split(&mut self, id: u64, tree: &mut TaxonomyTree) -> Result<Vec<NodeId>> {
        let suggestion = self.pending_split(id)?.clone();
        if !tree.contains(suggestion.node) {
            log::warn!("split suggestion {id} references a deleted category; discarding");
            self.splits.remove(&id);
            return Err(TaxonomyError::SuggestionNotFound(id));
        }
        let created = tree.split_category(
            suggestion.node,
            &suggestion.proposed_subcategories,
            EditOrigin::Approved,
        )?;
        if let Some(s) = self.splits.get_mut(&id) {
            s.status = SuggestionStatus::Applied;
        }
        Ok(created)
    }

    pub fn reject_split(&mut self, id: u64) -> Result<()> {
        self.pending_split(id)?;
        if let Some(s) = self.splits.get_mut(&id) {
            s.status = SuggestionStatus::Rejected;
        }
        Ok(())
    }

    fn set_merge_status(&mut self, id: u64, status: SuggestionStatus) {
        if let Some(s) = self.merges.get_mut(&id) {
            s.status = status;
        }
    }

    /// Drops pending suggestions that point at nodes which no longer exist.
    fn invalidate_removed(&mut self, removed: &[NodeId]) {
        self.merges.retain(|_, s| {
            s.status != SuggestionStatus::Pending
                || !(removed.contains(&s.target) || s.sources.iter().any(|n| removed.contains(n)))
        });
        self.splits
            .retain(|_, s| s.status != SuggestionStatus::Pending || !removed.contains(&s.node));
    }

    /// Drops every pending suggestion that references a node missing from `tree`.
    pub fn prune_stale(&mut self, tree: &TaxonomyTree) -> usize {
        let before = self.merges.len() + self.splits.len();
        self.merges.retain(|_, s| {
            s.status != SuggestionStatus::Pending
                || (tree.contains(s.target) && s.sources.iter().all(|n| tree.contains(*n)))
        });
        self.splits
            .retain(|_, s| s.status != SuggestionStatus::Pending || tree.contains(s.node));
        before - (self.merges.len() + self.splits.len())
    }
}
