//! Arena-backed category tree.
//!
//! Nodes live in one id-keyed map that doubles as the flat lookup index;
//! children are id lists and `parent` is a plain id. Every structural edit
//! validates first and mutates second, so a refused edit leaves the tree
//! untouched.

use crate::depth::{DepthCheck, DepthPolicy};
use crate::error::{Result, TaxonomyError};
use crate::guardrail::{evaluate, EditOrigin, GuardrailDecision, RefinementState};
use serde::{Deserialize, Serialize};
use sift_protocol::{FileAssignment, FileId, NodeId};
use std::collections::{BTreeMap, HashMap};

const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub assigned_files: Vec<FileAssignment>,
    pub is_user_created: bool,
    pub refinement_state: RefinementState,
}

impl TaxonomyNode {
    fn new(id: NodeId, name: String, parent: Option<NodeId>, user: bool) -> Self {
        Self {
            id,
            name,
            parent,
            children: Vec::new(),
            assigned_files: Vec::new(),
            is_user_created: user,
            refinement_state: if user {
                RefinementState::UserEdited
            } else {
                RefinementState::Auto
            },
        }
    }

    #[must_use]
    pub fn is_user_edited(&self) -> bool {
        self.refinement_state == RefinementState::UserEdited
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub target: NodeId,
    pub moved_files: usize,
    pub removed_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyStats {
    /// Includes the root.
    pub node_count: usize,
    pub category_count: usize,
    pub max_depth: usize,
    pub total_files: usize,
    pub root_files: usize,
    pub files_per_category: BTreeMap<String, usize>,
    pub largest_categories: Vec<(String, usize)>,
    pub empty_categories: Vec<String>,
    pub user_edited_categories: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTaxonomy {
    root: NodeId,
    next_id: u64,
    policy: DepthPolicy,
    nodes: Vec<TaxonomyNode>,
}

pub const TAXONOMY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct TaxonomyTree {
    root: NodeId,
    nodes: BTreeMap<NodeId, TaxonomyNode>,
    next_id: u64,
    policy: DepthPolicy,
    file_index: HashMap<FileId, NodeId>,
}

/// Splits `path` into validated segments. The empty path names the root.
pub fn parse_category_path(path: &str) -> Result<Vec<String>> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed.split('/').map(|raw| validate_segment(path, raw)).collect()
}

fn validate_segment(path: &str, raw: &str) -> Result<String> {
    let segment = raw.trim();
    if segment.is_empty() {
        return Err(TaxonomyError::malformed(path, "empty path segment"));
    }
    if segment == "." || segment == ".." {
        return Err(TaxonomyError::malformed(path, "relative segments are not allowed"));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(TaxonomyError::malformed(path, "segment longer than 255 bytes"));
    }
    if segment
        .chars()
        .any(|c| c.is_control() || matches!(c, '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
    {
        return Err(TaxonomyError::malformed(
            path,
            format!("segment '{segment}' contains a reserved character"),
        ));
    }
    Ok(segment.to_string())
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

impl TaxonomyTree {
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = NodeId(0);
        let mut nodes = BTreeMap::new();
        nodes.insert(root, TaxonomyNode::new(root, root_name.into(), None, false));
        Self {
            root,
            nodes,
            next_id: 1,
            policy: DepthPolicy::default(),
            file_index: HashMap::new(),
        }
    }

    pub fn with_policy(root_name: impl Into<String>, policy: DepthPolicy) -> Result<Self> {
        policy.validate()?;
        let mut tree = Self::new(root_name);
        tree.policy = policy;
        Ok(tree)
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn root_name(&self) -> &str {
        self.nodes.get(&self.root).map_or("", |n| n.name.as_str())
    }

    #[must_use]
    pub const fn policy(&self) -> &DepthPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: DepthPolicy) -> Result<()> {
        policy.validate()?;
        self.policy = policy;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TaxonomyNode> {
        self.nodes.get(&id)
    }

    fn get(&self, id: NodeId) -> Result<&TaxonomyNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TaxonomyError::NodeNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut TaxonomyNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| TaxonomyError::NodeNotFound(id.to_string()))
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    #[must_use]
    pub fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes.get(&parent)?.children.iter().copied().find(|child| {
            self.nodes
                .get(child)
                .is_some_and(|node| same_name(&node.name, name))
        })
    }

    /// Node addressed by `path`, if present.
    pub fn find(&self, path: &str) -> Result<Option<NodeId>> {
        let mut current = self.root;
        for segment in parse_category_path(path)? {
            match self.child_named(current, &segment) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        self.find(path)?
            .ok_or_else(|| TaxonomyError::NodeNotFound(path.to_string()))
    }

    /// Category path of `id` without the root name; the root maps to "".
    pub fn path_of(&self, id: NodeId) -> Result<String> {
        Ok(self.segments_of(id)?.join("/"))
    }

    fn segments_of(&self, id: NodeId) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            segments.push(current.name.clone());
            current = self.get(parent)?;
            if segments.len() > self.nodes.len() {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "cycle detected above {id}"
                )));
            }
        }
        segments.reverse();
        Ok(segments)
    }

    pub fn depth_of(&self, id: NodeId) -> Result<usize> {
        Ok(self.segments_of(id)?.len())
    }

    #[must_use]
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Every node below `id`, depth first.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(&id)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// All categories (root excluded) with their paths, depth first.
    #[must_use]
    pub fn categories(&self) -> Vec<(NodeId, String)> {
        self.descendants(self.root)
            .into_iter()
            .filter_map(|id| self.path_of(id).ok().map(|path| (id, path)))
            .collect()
    }

    #[must_use]
    pub fn check_depth(&self, depth: usize) -> DepthCheck {
        self.policy.check(depth)
    }

    fn enforce_depth(&self, depth: usize) -> Result<()> {
        let check = self.policy.check(depth);
        if !check.allowed {
            return Err(TaxonomyError::DepthRefused(check));
        }
        if check.violation.is_some() {
            log::warn!("taxonomy depth advisory: {}", check.reason);
        }
        Ok(())
    }

    #[must_use]
    pub fn can_auto_modify(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.is_user_edited())
    }

    pub fn mark_user_edited(&mut self, id: NodeId) -> Result<()> {
        self.get_mut(id)?.refinement_state = RefinementState::UserEdited;
        Ok(())
    }

    fn protected_names(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.is_user_edited())
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn check_merge(
        &self,
        sources: &[NodeId],
        target: NodeId,
        origin: EditOrigin,
    ) -> GuardrailDecision {
        let mut touched = sources.to_vec();
        touched.push(target);
        evaluate("merge", &self.protected_names(&touched), origin)
    }

    pub fn check_split(&self, node: NodeId, origin: EditOrigin) -> GuardrailDecision {
        evaluate("split", &self.protected_names(&[node]), origin)
    }

    pub fn check_rename(&self, node: NodeId, origin: EditOrigin) -> GuardrailDecision {
        evaluate("rename", &self.protected_names(&[node]), origin)
    }

    fn enforce(decision: GuardrailDecision) -> Result<()> {
        if decision.allowed {
            Ok(())
        } else {
            Err(TaxonomyError::Refused(decision))
        }
    }

    /// Creates `path` and any missing ancestors. Existing paths are returned as-is.
    pub fn add_category(&mut self, path: &str) -> Result<NodeId> {
        self.add_path(path, false)
    }

    /// Like [`Self::add_category`], but new nodes start out user-edited.
    pub fn add_user_category(&mut self, path: &str) -> Result<NodeId> {
        let id = self.add_path(path, true)?;
        self.mark_user_edited(id)?;
        Ok(id)
    }

    fn add_path(&mut self, path: &str, user: bool) -> Result<NodeId> {
        let segments = parse_category_path(path)?;
        if let Some(existing) = self.find(path)? {
            return Ok(existing);
        }
        self.enforce_depth(segments.len())?;
        let mut current = self.root;
        for segment in segments {
            current = match self.child_named(current, &segment) {
                Some(child) => child,
                None => self.push_child(current, segment, user),
            };
        }
        Ok(current)
    }

    fn push_child(&mut self, parent: NodeId, name: String, user: bool) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes
            .insert(id, TaxonomyNode::new(id, name, Some(parent), user));
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        id
    }

    /// Removes the category at `path`; its files and sub-categories move to the parent.
    pub fn remove_category(&mut self, path: &str) -> Result<MergeReport> {
        let id = self.resolve(path)?;
        let parent = self
            .get(id)?
            .parent
            .ok_or_else(|| TaxonomyError::InvalidOperation("cannot remove the root".to_string()))?;
        self.enforce_fold_depth(id, parent)?;
        let mut report = MergeReport {
            target: parent,
            ..MergeReport::default()
        };
        self.fold_into(id, parent, &mut report);
        log::info!(
            "removed category '{path}': {} files moved to parent",
            report.moved_files
        );
        Ok(report)
    }

    pub fn rename(&mut self, path: &str, new_name: &str, origin: EditOrigin) -> Result<NodeId> {
        let id = self.resolve(path)?;
        let name = validate_segment(new_name, new_name)?;
        let parent = self
            .get(id)?
            .parent
            .ok_or_else(|| TaxonomyError::InvalidOperation("cannot rename the root".to_string()))?;
        if let Some(existing) = self.child_named(parent, &name) {
            if existing != id {
                return Err(TaxonomyError::AlreadyExists(name));
            }
        }
        Self::enforce(self.check_rename(id, origin))?;

        let node = self.get_mut(id)?;
        node.name = name;
        if origin == EditOrigin::User {
            node.refinement_state = RefinementState::UserEdited;
        }
        Ok(id)
    }

    /// Moves all files (and sub-categories) of `sources` into `target` and
    /// detaches the sources.
    pub fn merge_categories(
        &mut self,
        sources: &[NodeId],
        target: NodeId,
        origin: EditOrigin,
    ) -> Result<MergeReport> {
        self.get(target)?;
        if sources.is_empty() {
            return Err(TaxonomyError::InvalidOperation(
                "merge needs at least one source".to_string(),
            ));
        }
        for (i, source) in sources.iter().enumerate() {
            self.get(*source)?;
            if *source == self.root {
                return Err(TaxonomyError::InvalidOperation(
                    "the root cannot be merged away".to_string(),
                ));
            }
            if *source == target {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "{source} cannot be merged into itself"
                )));
            }
            if self.is_ancestor(*source, target) {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "{source} is an ancestor of the merge target {target}"
                )));
            }
            if sources[..i].contains(source) {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "{source} listed twice"
                )));
            }
        }
        // Nested sources would be folded twice.
        for a in sources {
            for b in sources {
                if a != b && self.is_ancestor(*a, *b) {
                    return Err(TaxonomyError::InvalidOperation(format!(
                        "{a} and {b} are nested; merge the outer one only"
                    )));
                }
            }
        }
        Self::enforce(self.check_merge(sources, target, origin))?;
        for source in sources {
            self.enforce_fold_depth(*source, target)?;
        }

        let mut report = MergeReport {
            target,
            ..MergeReport::default()
        };
        for source in sources {
            self.fold_into(*source, target, &mut report);
        }
        if origin == EditOrigin::User {
            if let Some(node) = self.nodes.get_mut(&target) {
                node.refinement_state = RefinementState::UserEdited;
            }
        }
        log::info!(
            "merged {} categories into {target}: {} files moved",
            sources.len(),
            report.moved_files
        );
        Ok(report)
    }

    /// Creates named children under `node`. Files stay put until reclassified.
    pub fn split_category(
        &mut self,
        node: NodeId,
        names: &[String],
        origin: EditOrigin,
    ) -> Result<Vec<NodeId>> {
        let depth = self.depth_of(node)?;
        if names.is_empty() {
            return Err(TaxonomyError::InvalidOperation(
                "split needs at least one subcategory name".to_string(),
            ));
        }
        let validated: Vec<String> = names
            .iter()
            .map(|name| validate_segment(name, name))
            .collect::<Result<_>>()?;
        self.enforce_depth(depth + 1)?;
        Self::enforce(self.check_split(node, origin))?;

        let user = origin == EditOrigin::User;
        let mut created = Vec::with_capacity(validated.len());
        for name in validated {
            let id = match self.child_named(node, &name) {
                Some(existing) => existing,
                None => self.push_child(node, name, user),
            };
            if !created.contains(&id) {
                created.push(id);
            }
        }
        Ok(created)
    }

    /// Re-parents `node` under `new_parent`.
    pub fn move_category(&mut self, node: NodeId, new_parent: NodeId, origin: EditOrigin) -> Result<()> {
        self.get(new_parent)?;
        let old_parent = self
            .get(node)?
            .parent
            .ok_or_else(|| TaxonomyError::InvalidOperation("cannot move the root".to_string()))?;
        if node == new_parent || self.is_ancestor(node, new_parent) {
            return Err(TaxonomyError::InvalidOperation(format!(
                "{node} cannot move below itself"
            )));
        }
        let name = self.get(node)?.name.clone();
        if self.child_named(new_parent, &name).is_some_and(|c| c != node) {
            return Err(TaxonomyError::AlreadyExists(name));
        }
        let subtree_height = self
            .descendants(node)
            .into_iter()
            .filter_map(|d| self.depth_of(d).ok())
            .max()
            .map_or(0, |deepest| deepest - self.depth_of(node).unwrap_or(deepest));
        self.enforce_depth(self.depth_of(new_parent)? + 1 + subtree_height)?;
        Self::enforce(evaluate("move", &self.protected_names(&[node]), origin))?;

        if let Some(parent) = self.nodes.get_mut(&old_parent) {
            parent.children.retain(|c| *c != node);
        }
        if let Some(parent) = self.nodes.get_mut(&new_parent) {
            parent.children.push(node);
        }
        if let Some(moved) = self.nodes.get_mut(&node) {
            moved.parent = Some(new_parent);
            if origin == EditOrigin::User {
                moved.refinement_state = RefinementState::UserEdited;
            }
        }
        Ok(())
    }

    /// Shallowest and deepest depth the descendants of `source` land at once
    /// folded into `target`. `None` when `source` has no sub-categories.
    fn folded_depths(&self, source: NodeId, target: NodeId) -> Result<Option<(usize, usize)>> {
        let base = self.depth_of(source)?;
        let target_depth = self.depth_of(target)?;
        let mut range: Option<(usize, usize)> = None;
        for descendant in self.descendants(source) {
            let depth = target_depth + self.depth_of(descendant)?.saturating_sub(base);
            range = Some(match range {
                Some((lo, hi)) => (lo.min(depth), hi.max(depth)),
                None => (depth, depth),
            });
        }
        Ok(range)
    }

    fn enforce_fold_depth(&self, source: NodeId, target: NodeId) -> Result<()> {
        if let Some((shallowest, deepest)) = self.folded_depths(source, target)? {
            self.enforce_depth(deepest)?;
            self.enforce_depth(shallowest)?;
        }
        Ok(())
    }

    /// Moves the files and children of `source` into `target`, then drops `source`.
    ///
    /// Same-named children are merged recursively. Callers guarantee that
    /// `target` is not inside `source`.
    fn fold_into(&mut self, source: NodeId, target: NodeId, report: &mut MergeReport) {
        let Some(mut node) = self.nodes.remove(&source) else {
            return;
        };
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != source);
        }

        let files = std::mem::take(&mut node.assigned_files);
        report.moved_files += files.len();
        for mut assignment in files {
            assignment.category_id = target;
            self.file_index.insert(assignment.file_id.clone(), target);
            if let Some(t) = self.nodes.get_mut(&target) {
                t.assigned_files.push(assignment);
            }
        }

        for child in std::mem::take(&mut node.children) {
            let child_name = match self.nodes.get(&child) {
                Some(c) => c.name.clone(),
                None => continue,
            };
            match self.child_named(target, &child_name) {
                Some(existing) => self.fold_into(child, existing, report),
                None => {
                    if let Some(c) = self.nodes.get_mut(&child) {
                        c.parent = Some(target);
                    }
                    if let Some(t) = self.nodes.get_mut(&target) {
                        t.children.push(child);
                    }
                }
            }
        }
        report.removed_nodes.push(source);
    }

    /// Places a file under `assignment.category_id`, replacing any earlier placement.
    pub fn assign(&mut self, assignment: FileAssignment) -> Result<()> {
        let target = assignment.category_id;
        self.get(target)?;
        self.unassign(&assignment.file_id);
        self.file_index.insert(assignment.file_id.clone(), target);
        self.get_mut(target)?.assigned_files.push(assignment);
        Ok(())
    }

    pub fn unassign(&mut self, file_id: &FileId) -> Option<FileAssignment> {
        let node_id = self.file_index.remove(file_id)?;
        let node = self.nodes.get_mut(&node_id)?;
        let pos = node
            .assigned_files
            .iter()
            .position(|a| &a.file_id == file_id)?;
        Some(node.assigned_files.remove(pos))
    }

    #[must_use]
    pub fn assignment(&self, file_id: &FileId) -> Option<&FileAssignment> {
        let node = self.nodes.get(self.file_index.get(file_id)?)?;
        node.assigned_files.iter().find(|a| &a.file_id == file_id)
    }

    #[must_use]
    pub fn files_in(&self, id: NodeId) -> &[FileAssignment] {
        self.nodes
            .get(&id)
            .map_or(&[][..], |n| n.assigned_files.as_slice())
    }

    /// Every assignment in depth-first node order.
    #[must_use]
    pub fn assignments(&self) -> Vec<FileAssignment> {
        std::iter::once(self.root)
            .chain(self.descendants(self.root))
            .flat_map(|id| self.files_in(id).iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn total_file_count(&self) -> usize {
        self.nodes.values().map(|n| n.assigned_files.len()).sum()
    }

    /// Files at or below `id`.
    #[must_use]
    pub fn subtree_file_count(&self, id: NodeId) -> usize {
        self.files_in(id).len()
            + self
                .descendants(id)
                .into_iter()
                .map(|d| self.files_in(d).len())
                .sum::<usize>()
    }

    #[must_use]
    pub fn statistics(&self) -> TaxonomyStats {
        let categories = self.categories();
        let mut files_per_category = BTreeMap::new();
        let mut empty_categories = Vec::new();
        let mut max_depth = 0;
        let mut user_edited_categories = 0;
        for (id, path) in &categories {
            let direct = self.files_in(*id).len();
            max_depth = max_depth.max(path.split('/').count());
            if self.subtree_file_count(*id) == 0 {
                empty_categories.push(path.clone());
            }
            if self.nodes.get(id).is_some_and(TaxonomyNode::is_user_edited) {
                user_edited_categories += 1;
            }
            files_per_category.insert(path.clone(), direct);
        }
        let mut largest: Vec<(String, usize)> = files_per_category
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(path, count)| (path.clone(), *count))
            .collect();
        largest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        largest.truncate(5);
        TaxonomyStats {
            node_count: self.nodes.len(),
            category_count: categories.len(),
            max_depth,
            total_files: self.total_file_count(),
            root_files: self.files_in(self.root).len(),
            files_per_category,
            largest_categories: largest,
            empty_categories,
            user_edited_categories,
        }
    }

    /// Checks parent/child links, reachability and the file index.
    pub fn verify_integrity(&self) -> Result<()> {
        let reachable = self.descendants(self.root);
        if reachable.len() + 1 != self.nodes.len() {
            return Err(TaxonomyError::InvalidOperation(format!(
                "{} nodes stored but {} reachable",
                self.nodes.len(),
                reachable.len() + 1
            )));
        }
        for id in reachable {
            let node = self.get(id)?;
            let parent = node
                .parent
                .ok_or_else(|| TaxonomyError::InvalidOperation(format!("{id} has no parent")))?;
            if !self.get(parent)?.children.contains(&id) {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "{parent} does not list child {id}"
                )));
            }
        }
        let indexed: usize = self.file_index.len();
        if indexed != self.total_file_count() {
            return Err(TaxonomyError::InvalidOperation(format!(
                "file index holds {indexed} entries for {} files",
                self.total_file_count()
            )));
        }
        for (file, node) in &self.file_index {
            let held = self
                .files_in(*node)
                .iter()
                .any(|a| &a.file_id == file && a.category_id == *node);
            if !held {
                return Err(TaxonomyError::InvalidOperation(format!(
                    "file index points {file} at {node} which does not hold it"
                )));
            }
        }
        Ok(())
    }

    pub async fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let persisted = PersistedTaxonomy {
            root: self.root,
            next_id: self.next_id,
            policy: self.policy.clone(),
            nodes: self.nodes.values().cloned().collect(),
        };
        sift_vector_store::write_versioned_json(path.as_ref(), TAXONOMY_SCHEMA_VERSION, &persisted)
            .await?;
        Ok(())
    }

    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let persisted: PersistedTaxonomy = sift_vector_store::read_versioned_json(
            path.as_ref(),
            "taxonomy",
            TAXONOMY_SCHEMA_VERSION,
        )
        .await?;
        let mut file_index = HashMap::new();
        let mut nodes = BTreeMap::new();
        for node in persisted.nodes {
            for assignment in &node.assigned_files {
                file_index.insert(assignment.file_id.clone(), node.id);
            }
            nodes.insert(node.id, node);
        }
        let tree = Self {
            root: persisted.root,
            nodes,
            next_id: persisted.next_id,
            policy: persisted.policy,
            file_index,
        };
        tree.get(tree.root)?;
        tree.verify_integrity()?;
        Ok(tree)
    }
}
