//! Automatic merge and split proposals for the gatekeeper.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sift_classifier::{Clusterer, ClusteringConfig, ThemeItem};
use sift_protocol::NodeId;
use sift_taxonomy::TaxonomyTree;
use sift_vector_store::{cosine_of, PrototypeStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    /// Sibling prototypes at least this similar are proposed for merging.
    pub merge_similarity: f32,
    /// Leaf categories holding more files than this are proposed for splitting.
    pub split_min_files: usize,
    /// Upper bound on subcategories proposed by one split.
    pub split_max_parts: usize,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            merge_similarity: 0.9,
            split_min_files: 40,
            split_max_parts: 4,
        }
    }
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.merge_similarity) {
            return Err(EngineError::InvalidConfig(format!(
                "refiner.merge_similarity must be in [0, 1], got {}",
                self.merge_similarity
            )));
        }
        if self.split_max_parts < 2 {
            return Err(EngineError::InvalidConfig(
                "refiner.split_max_parts must be >= 2".to_string(),
            ));
        }
        if self.split_min_files < self.split_max_parts {
            return Err(EngineError::InvalidConfig(format!(
                "refiner.split_min_files ({}) must be >= split_max_parts ({})",
                self.split_min_files, self.split_max_parts
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub sources: Vec<NodeId>,
    pub target: NodeId,
    pub similarity: f32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCandidate {
    pub node: NodeId,
    pub names: Vec<String>,
    pub confidence: f32,
    pub reason: String,
}

/// Queued suggestion ids from one refinement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefineReport {
    pub merges: Vec<u64>,
    pub splits: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct TaxonomyRefiner {
    config: RefinerConfig,
}

impl TaxonomyRefiner {
    pub fn new(config: RefinerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &RefinerConfig {
        &self.config
    }

    /// Sibling pairs whose prototypes nearly coincide. The category with
    /// fewer files is folded into the larger one; each node appears in at
    /// most one candidate.
    pub fn merge_candidates(
        &self,
        tree: &TaxonomyTree,
        prototypes: &PrototypeStore,
    ) -> Result<Vec<MergeCandidate>> {
        let categories = tree.categories();
        let mut pairs = Vec::new();
        for (i, (a, a_path)) in categories.iter().enumerate() {
            let Some(a_proto) = prototypes.get(a_path) else {
                continue;
            };
            let a_parent = tree.node(*a).and_then(|n| n.parent);
            for (b, b_path) in categories.iter().skip(i + 1) {
                if tree.node(*b).and_then(|n| n.parent) != a_parent {
                    continue;
                }
                let Some(b_proto) = prototypes.get(b_path) else {
                    continue;
                };
                let similarity = cosine_of(&a_proto.embedding, &b_proto.embedding);
                if similarity >= self.config.merge_similarity {
                    pairs.push((similarity, *a, a_path.clone(), *b, b_path.clone()));
                }
            }
        }
        pairs.sort_by(|x, y| y.0.total_cmp(&x.0));

        let mut used: Vec<NodeId> = Vec::new();
        let mut candidates = Vec::new();
        for (similarity, a, a_path, b, b_path) in pairs {
            if used.contains(&a) || used.contains(&b) {
                continue;
            }
            let (source, source_path, target, target_path) =
                if tree.subtree_file_count(a) >= tree.subtree_file_count(b) {
                    (b, b_path, a, a_path)
                } else {
                    (a, a_path, b, b_path)
                };
            used.extend([a, b]);
            candidates.push(MergeCandidate {
                sources: vec![source],
                target,
                similarity,
                reason: format!(
                    "'{source_path}' and '{target_path}' have prototype similarity {similarity:.2}"
                ),
            });
        }
        Ok(candidates)
    }

    /// Leaf categories large enough to be worth splitting.
    #[must_use]
    pub fn oversized(&self, tree: &TaxonomyTree) -> Vec<NodeId> {
        tree.categories()
            .into_iter()
            .filter(|(id, _)| {
                tree.node(*id).is_some_and(|n| n.children.is_empty())
                    && tree.files_in(*id).len() > self.config.split_min_files
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Names subcategories for `node` from semantic themes of its files.
    ///
    /// Returns `None` when the files do not separate into at least two
    /// distinct themes.
    pub fn split_candidate(
        &self,
        node: NodeId,
        items: &[ThemeItem<'_>],
        clustering: &ClusteringConfig,
    ) -> Result<Option<SplitCandidate>> {
        if items.len() <= self.config.split_min_files {
            return Ok(None);
        }
        let config = ClusteringConfig {
            separate_file_types: false,
            ..clustering.with_k(self.config.split_max_parts)
        };
        let clustering = Clusterer::new(config)?.themes(items)?;
        let themes: Vec<_> = clustering
            .themes
            .iter()
            .filter(|t| !t.keywords.is_empty())
            .collect();
        if themes.len() < 2 {
            return Ok(None);
        }
        let names: Vec<String> = themes.iter().map(|t| t.name.clone()).collect();
        #[allow(clippy::cast_precision_loss)]
        let confidence = themes.iter().map(|t| t.coherence).sum::<f32>() / themes.len() as f32;
        Ok(Some(SplitCandidate {
            node,
            reason: format!(
                "{} files separate into {} themes: {}",
                items.len(),
                names.len(),
                names.join(", ")
            ),
            names,
            confidence: confidence.clamp(0.0, 1.0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sift_protocol::{AssignmentSource, FileAssignment, ScannedFile};
    use sift_vector_store::{HashEmbedder, DEFAULT_EMA_ALPHA};

    fn assign(tree: &mut TaxonomyTree, node: NodeId, name: &str) {
        let file = ScannedFile::from_path(format!("/in/{name}"));
        tree.assign(FileAssignment::for_file(&file, node, 0.9, AssignmentSource::Content))
            .unwrap();
    }

    #[test]
    fn near_identical_siblings_merge_small_into_large() {
        let mut tree = TaxonomyTree::new("Root");
        let photos = tree.add_category("Media/Photos").unwrap();
        let pictures = tree.add_category("Media/Pictures").unwrap();
        let taxes = tree.add_category("Finance/Taxes").unwrap();
        assign(&mut tree, photos, "a.jpg");
        assign(&mut tree, photos, "b.jpg");
        assign(&mut tree, pictures, "c.jpg");

        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        store.update_prototype("Media/Photos", &[1.0, 0.0, 0.0]).unwrap();
        store.update_prototype("Media/Pictures", &[0.99, 0.05, 0.0]).unwrap();
        store.update_prototype("Finance/Taxes", &[0.99, 0.0, 0.05]).unwrap();

        let refiner = TaxonomyRefiner::new(RefinerConfig::default()).unwrap();
        let candidates = refiner.merge_candidates(&tree, &store).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sources, vec![pictures]);
        assert_eq!(candidates[0].target, photos);
        assert!(!candidates[0].sources.contains(&taxes));
    }

    #[test]
    fn large_leaf_splits_into_named_themes() {
        let mut tree = TaxonomyTree::new("Root");
        let docs = tree.add_category("Documents").unwrap();
        let embedder = HashEmbedder::new(128);
        let mut names = Vec::new();
        for i in 0..6 {
            names.push(format!("invoice_acme_{i}.pdf"));
            names.push(format!("recipe_pasta_{i}.pdf"));
        }
        for name in &names {
            assign(&mut tree, docs, name);
        }
        let embeddings: Vec<Vec<f32>> = names.iter().map(|n| embedder.embed_sync(n)).collect();
        let items: Vec<ThemeItem<'_>> = names
            .iter()
            .zip(&embeddings)
            .map(|(name, embedding)| ThemeItem {
                filename: name,
                extension: Some("pdf"),
                embedding,
            })
            .collect();

        let refiner = TaxonomyRefiner::new(RefinerConfig {
            split_min_files: 10,
            split_max_parts: 2,
            ..RefinerConfig::default()
        })
        .unwrap();
        assert_eq!(refiner.oversized(&tree), vec![docs]);
        let candidate = refiner
            .split_candidate(docs, &items, &ClusteringConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(candidate.names.len(), 2);
        let joined = candidate.names.join(" ").to_lowercase();
        assert!(joined.contains("invoice") || joined.contains("acme"));
        assert!(joined.contains("recipe") || joined.contains("pasta"));
    }

    #[test]
    fn small_categories_are_left_alone() {
        let refiner = TaxonomyRefiner::new(RefinerConfig::default()).unwrap();
        let out = refiner
            .split_candidate(NodeId(1), &[], &ClusteringConfig::default())
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn rejects_inconsistent_split_limits() {
        let err = TaxonomyRefiner::new(RefinerConfig {
            split_min_files: 1,
            split_max_parts: 3,
            ..RefinerConfig::default()
        });
        assert!(err.is_err());
    }
}
