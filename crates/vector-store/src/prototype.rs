//! Online-updated category centroids.
//!
//! Each category path owns one unit-length centroid blended with an
//! exponential moving average: `new = normalize(alpha * sample + (1 - alpha) * old)`.
//! Prototypes are only removed through [`PrototypeStore::delete`].

use crate::embeddings::{cosine_of, ensure_dimension, normalized};
use crate::error::{Result, VectorStoreError};
use crate::persist::{current_unix_ms, read_versioned_json, write_versioned_json};
use crate::store::VectorIndex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub const PROTOTYPE_STORE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_EMA_ALPHA: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPrototype {
    pub category_path: String,
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub sample_count: u64,
    #[serde(default)]
    pub updated_at_unix_ms: u64,
    /// Moving average of how closely new samples agree with the centroid,
    /// in `[0, 1]`. Unknown until a second sample arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohesion: Option<f32>,
}

/// A prototype ranked against a query embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrototypeMatch {
    pub category_path: String,
    pub similarity: f32,
    pub prototype_confidence: f32,
    pub sample_count: u64,
    pub cohesion: Option<f32>,
}

impl PrototypeMatch {
    /// Similarity weighted by how much the prototype has been trained.
    #[must_use]
    pub fn score(&self) -> f32 {
        self.similarity.max(0.0) * self.prototype_confidence
    }
}

/// Confidence implied by a sample count: 0.5 at one sample, approaching 1.
#[must_use]
pub fn confidence_for_samples(sample_count: u64) -> f32 {
    if sample_count == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = sample_count as f32;
    (1.0 - 0.5 / n.sqrt()).clamp(0.0, 1.0)
}

/// Stable storage key for a category path.
#[must_use]
pub fn category_path_key(category_path: &str) -> String {
    let digest = Sha256::digest(category_path.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPrototypes {
    dimension: usize,
    ema_alpha: f32,
    prototypes: Vec<CategoryPrototype>,
}

pub struct PrototypeStore {
    dimension: usize,
    alpha: f32,
    prototypes: BTreeMap<String, CategoryPrototype>,
    index: VectorIndex,
}

impl PrototypeStore {
    pub fn new(dimension: usize, alpha: f32) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(VectorStoreError::InvalidConfig(format!(
                "ema alpha must be in (0, 1], got {alpha}"
            )));
        }
        if dimension == 0 {
            return Err(VectorStoreError::InvalidConfig(
                "prototype dimension must be > 0".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            alpha,
            prototypes: BTreeMap::new(),
            index: VectorIndex::exact(dimension),
        })
    }

    /// Blend `embedding` into the category centroid, creating it on first use.
    pub fn update_prototype(
        &mut self,
        category_path: &str,
        embedding: &[f32],
    ) -> Result<&CategoryPrototype> {
        ensure_dimension(embedding, self.dimension)?;
        let sample = normalized(embedding.to_vec());
        let alpha = self.alpha;

        let entry = self
            .prototypes
            .entry(category_path.to_string())
            .and_modify(|proto| {
                let agreement = cosine_of(&sample, &proto.embedding).clamp(0.0, 1.0);
                proto.cohesion = Some(match proto.cohesion {
                    Some(previous) => alpha * agreement + (1.0 - alpha) * previous,
                    None => agreement,
                });
                let blended: Vec<f32> = sample
                    .iter()
                    .zip(proto.embedding.iter())
                    .map(|(new, old)| alpha * new + (1.0 - alpha) * old)
                    .collect();
                let blended = normalized(blended);
                // Opposite samples can cancel out; keep the last usable direction.
                if blended.iter().any(|v| *v != 0.0) {
                    proto.embedding = blended;
                }
                proto.sample_count += 1;
                proto.confidence = proto
                    .confidence
                    .max(confidence_for_samples(proto.sample_count));
                proto.updated_at_unix_ms = current_unix_ms();
            })
            .or_insert_with(|| CategoryPrototype {
                category_path: category_path.to_string(),
                embedding: sample.clone(),
                confidence: confidence_for_samples(1),
                sample_count: 1,
                updated_at_unix_ms: current_unix_ms(),
                cohesion: None,
            });

        self.index.add(category_path, &entry.embedding)?;
        log::debug!(
            "prototype '{}' updated (samples={})",
            category_path,
            entry.sample_count
        );
        Ok(entry)
    }

    /// Insert a fully-formed prototype, replacing any existing one for the path.
    pub fn insert(&mut self, mut prototype: CategoryPrototype) -> Result<()> {
        ensure_dimension(&prototype.embedding, self.dimension)?;
        prototype.embedding = normalized(prototype.embedding);
        prototype.confidence = prototype.confidence.clamp(0.0, 1.0);
        prototype.cohesion = prototype.cohesion.map(|c| c.clamp(0.0, 1.0));
        self.index
            .add(prototype.category_path.clone(), &prototype.embedding)?;
        self.prototypes
            .insert(prototype.category_path.clone(), prototype);
        Ok(())
    }

    pub fn set_confidence(&mut self, category_path: &str, confidence: f32) -> Result<()> {
        let proto = self
            .prototypes
            .get_mut(category_path)
            .ok_or_else(|| VectorStoreError::NotFound(category_path.to_string()))?;
        proto.confidence = confidence.clamp(0.0, 1.0);
        Ok(())
    }

    /// Prototypes ranked by cosine similarity of their centroid to `query`.
    pub fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<PrototypeMatch>> {
        let hits = self.index.search(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                self.prototypes.get(&hit.id).map(|proto| PrototypeMatch {
                    category_path: proto.category_path.clone(),
                    similarity: hit.score,
                    prototype_confidence: proto.confidence,
                    sample_count: proto.sample_count,
                    cohesion: proto.cohesion,
                })
            })
            .collect())
    }

    /// Best category whose `similarity * confidence` reaches `min_confidence`.
    ///
    /// Returns `None` rather than forcing a weak match.
    pub fn classify(&self, embedding: &[f32], min_confidence: f32) -> Result<Option<PrototypeMatch>> {
        let ranked = self.find_similar(embedding, self.prototypes.len())?;
        let mut best: Option<PrototypeMatch> = None;
        for candidate in ranked {
            let better = best
                .as_ref()
                .map_or(true, |current| candidate.score() > current.score());
            if better {
                best = Some(candidate);
            }
        }
        Ok(best.filter(|m| m.score() >= min_confidence))
    }

    #[must_use]
    pub fn get(&self, category_path: &str) -> Option<&CategoryPrototype> {
        self.prototypes.get(category_path)
    }

    pub fn delete(&mut self, category_path: &str) -> bool {
        self.index.remove(category_path);
        self.prototypes.remove(category_path).is_some()
    }

    /// Re-keys every prototype at or under `old_prefix` to live under `new_prefix`.
    ///
    /// An empty `new_prefix` lifts descendants to the top level and drops the
    /// prototype of `old_prefix` itself.
    pub fn rename_prefix(&mut self, old_prefix: &str, new_prefix: &str) -> Result<usize> {
        let affected: Vec<String> = self
            .prototypes
            .keys()
            .filter(|path| is_same_or_descendant(path, old_prefix))
            .cloned()
            .collect();
        for old_path in &affected {
            let Some(mut proto) = self.prototypes.remove(old_path) else {
                continue;
            };
            self.index.remove(old_path);
            let rest = &old_path[old_prefix.len()..];
            let new_path = if new_prefix.is_empty() {
                rest.trim_start_matches('/').to_string()
            } else {
                format!("{new_prefix}{rest}")
            };
            if new_path.is_empty() {
                continue;
            }
            proto.category_path = new_path.clone();
            match self.prototypes.remove(&new_path) {
                // Renaming onto an existing category folds the two centroids together.
                Some(existing) => {
                    self.index.remove(&new_path);
                    let merged = merge_prototypes(existing, proto);
                    self.insert(merged)?;
                }
                None => self.insert(proto)?,
            }
        }
        Ok(affected.len())
    }

    #[must_use]
    pub fn category_paths(&self) -> Vec<String> {
        self.prototypes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryPrototype> {
        self.prototypes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub const fn ema_alpha(&self) -> f32 {
        self.alpha
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let persisted = PersistedPrototypes {
            dimension: self.dimension,
            ema_alpha: self.alpha,
            prototypes: self.prototypes.values().cloned().collect(),
        };
        write_versioned_json(path.as_ref(), PROTOTYPE_STORE_SCHEMA_VERSION, &persisted).await?;
        log::info!(
            "Saved {} prototypes to {}",
            self.prototypes.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Loads a persisted store; the stored dimension must match `dimension`.
    pub async fn load(path: impl AsRef<Path>, dimension: usize, alpha: f32) -> Result<Self> {
        let persisted: PersistedPrototypes = read_versioned_json(
            path.as_ref(),
            "prototype store",
            PROTOTYPE_STORE_SCHEMA_VERSION,
        )
        .await?;
        if persisted.dimension != dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: dimension,
                actual: persisted.dimension,
            });
        }
        let mut store = Self::new(dimension, alpha)?;
        for proto in persisted.prototypes {
            store.insert(proto)?;
        }
        log::info!("Loaded {} prototypes", store.len());
        Ok(store)
    }
}

impl Clone for PrototypeStore {
    fn clone(&self) -> Self {
        let mut copy = Self {
            dimension: self.dimension,
            alpha: self.alpha,
            prototypes: BTreeMap::new(),
            index: VectorIndex::exact(self.dimension),
        };
        for proto in self.prototypes.values() {
            // Dimensions were validated on the way in.
            let _ = copy.insert(proto.clone());
        }
        copy
    }
}

impl std::fmt::Debug for PrototypeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrototypeStore")
            .field("dimension", &self.dimension)
            .field("alpha", &self.alpha)
            .field("prototypes", &self.prototypes.len())
            .finish()
    }
}

fn is_same_or_descendant(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn merge_prototypes(a: CategoryPrototype, b: CategoryPrototype) -> CategoryPrototype {
    let total = (a.sample_count + b.sample_count).max(1);
    #[allow(clippy::cast_precision_loss)]
    let (wa, wb) = (
        a.sample_count as f32 / total as f32,
        b.sample_count as f32 / total as f32,
    );
    let embedding = normalized(
        a.embedding
            .iter()
            .zip(b.embedding.iter())
            .map(|(x, y)| wa * x + wb * y)
            .collect(),
    );
    let cohesion = match (a.cohesion, b.cohesion) {
        (Some(x), Some(y)) => Some(wa * x + wb * y),
        (one, other) => one.or(other),
    };
    CategoryPrototype {
        category_path: a.category_path,
        embedding,
        confidence: a.confidence.max(b.confidence),
        sample_count: a.sample_count + b.sample_count,
        updated_at_unix_ms: current_unix_ms(),
        cohesion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::is_unit;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn proto(path: &str, embedding: Vec<f32>, confidence: f32) -> CategoryPrototype {
        CategoryPrototype {
            category_path: path.to_string(),
            embedding,
            confidence,
            sample_count: 10,
            updated_at_unix_ms: 0,
            cohesion: None,
        }
    }

    #[test]
    fn first_update_creates_with_one_sample() {
        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        let p = store.update_prototype("Documents", &[2.0, 0.0, 0.0]).unwrap();
        assert_eq!(p.sample_count, 1);
        assert_eq!(p.embedding, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn ema_update_increments_and_stays_normalized() {
        let mut store = PrototypeStore::new(3, 0.3).unwrap();
        store.update_prototype("Images", &[1.0, 0.0, 0.0]).unwrap();
        let p = store.update_prototype("Images", &[0.0, 1.0, 0.0]).unwrap();
        assert_eq!(p.sample_count, 2);
        assert!(is_unit(&p.embedding, 1e-3));
        // 0.3 * new + 0.7 * old, normalized.
        let expected = normalized(vec![0.7, 0.3, 0.0]);
        for (a, b) in p.embedding.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn cohesion_tracks_how_well_samples_agree() {
        let mut store = PrototypeStore::new(2, 0.5).unwrap();
        let first = store.update_prototype("Tight", &[1.0, 0.0]).unwrap();
        assert_eq!(first.cohesion, None);
        store.update_prototype("Tight", &[1.0, 0.0]).unwrap();
        let tight = store.update_prototype("Tight", &[0.99, 0.01]).unwrap();
        assert!(tight.cohesion.unwrap() > 0.99);

        store.update_prototype("Loose", &[1.0, 0.0]).unwrap();
        store.update_prototype("Loose", &[0.0, 1.0]).unwrap();
        let loose = store.update_prototype("Loose", &[0.0, -1.0]).unwrap();
        let loose = loose.cohesion.unwrap();
        assert!(loose < 0.2, "loose cohesion {loose}");

        let hit = &store.find_similar(&[1.0, 0.0], 2).unwrap()[0];
        assert_eq!(hit.category_path, "Tight");
        assert!(hit.cohesion.unwrap() > 0.99);
    }

    #[test]
    fn classify_picks_documents_for_nearby_query() {
        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        store
            .insert(proto("Documents", vec![1.0, 0.0, 0.0], 0.9))
            .unwrap();
        store
            .insert(proto("Images", vec![0.0, 1.0, 0.0], 0.9))
            .unwrap();
        let hit = store
            .classify(&[0.95, 0.05, 0.0], 0.3)
            .unwrap()
            .expect("match");
        assert_eq!(hit.category_path, "Documents");
        assert!(hit.score() > 0.3);
    }

    #[test]
    fn classify_refuses_weak_matches() {
        let mut store = PrototypeStore::new(2, DEFAULT_EMA_ALPHA).unwrap();
        store.insert(proto("Music", vec![1.0, 0.0], 0.4)).unwrap();
        assert!(store.classify(&[0.0, 1.0], 0.1).unwrap().is_none());
        assert!(store.classify(&[1.0, 0.0], 0.5).unwrap().is_none());
        assert!(store.classify(&[1.0, 0.0], 0.35).unwrap().is_some());
    }

    #[test]
    fn classify_is_repeatable() {
        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        store.update_prototype("A", &[1.0, 0.2, 0.0]).unwrap();
        store.update_prototype("B", &[0.0, 1.0, 0.3]).unwrap();
        let first = store.classify(&[0.9, 0.3, 0.0], 0.1).unwrap();
        let second = store.classify(&[0.9, 0.3, 0.0], 0.1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        assert!(store.update_prototype("A", &[1.0, 0.0]).is_err());
        assert!(store.classify(&[1.0], 0.0).is_err());
    }

    #[test]
    fn rejects_bad_alpha() {
        assert!(PrototypeStore::new(3, 0.0).is_err());
        assert!(PrototypeStore::new(3, 1.5).is_err());
        assert!(PrototypeStore::new(3, 1.0).is_ok());
    }

    #[test]
    fn rename_prefix_moves_descendants_and_merges_collisions() {
        let mut store = PrototypeStore::new(2, DEFAULT_EMA_ALPHA).unwrap();
        store.insert(proto("Work", vec![1.0, 0.0], 0.8)).unwrap();
        store.insert(proto("Work/Taxes", vec![1.0, 0.0], 0.8)).unwrap();
        store.insert(proto("Workshop", vec![0.0, 1.0], 0.8)).unwrap();
        store.insert(proto("Jobs/Taxes", vec![0.0, 1.0], 0.6)).unwrap();

        let moved = store.rename_prefix("Work", "Jobs").unwrap();
        assert_eq!(moved, 2);
        assert_eq!(
            store.category_paths(),
            vec!["Jobs".to_string(), "Jobs/Taxes".to_string(), "Workshop".to_string()]
        );
        let merged = store.get("Jobs/Taxes").unwrap();
        assert_eq!(merged.sample_count, 20);
        assert_eq!(merged.confidence, 0.8);
    }

    #[test]
    fn rename_to_empty_prefix_lifts_children() {
        let mut store = PrototypeStore::new(2, DEFAULT_EMA_ALPHA).unwrap();
        store.insert(proto("Misc", vec![1.0, 0.0], 0.8)).unwrap();
        store.insert(proto("Misc/Old", vec![0.0, 1.0], 0.8)).unwrap();
        assert_eq!(store.rename_prefix("Misc", "").unwrap(), 2);
        assert_eq!(store.category_paths(), vec!["Old".to_string()]);
    }

    #[test]
    fn delete_is_explicit() {
        let mut store = PrototypeStore::new(2, DEFAULT_EMA_ALPHA).unwrap();
        store.update_prototype("A", &[1.0, 0.0]).unwrap();
        assert!(store.delete("A"));
        assert!(!store.delete("A"));
        assert!(store.find_similar(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn path_key_is_stable_hex() {
        let key = category_path_key("Documents/Taxes");
        assert_eq!(key.len(), 64);
        assert_eq!(key, category_path_key("Documents/Taxes"));
        assert_ne!(key, category_path_key("Documents"));
    }

    #[tokio::test]
    async fn save_load_preserves_prototypes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".sift").join("prototypes.json");
        let mut store = PrototypeStore::new(3, DEFAULT_EMA_ALPHA).unwrap();
        store.update_prototype("A", &[1.0, 0.0, 0.0]).unwrap();
        store.update_prototype("A", &[0.0, 1.0, 0.0]).unwrap();
        store.save(&path).await.unwrap();

        let loaded = PrototypeStore::load(&path, 3, DEFAULT_EMA_ALPHA).await.unwrap();
        assert_eq!(loaded.get("A"), store.get("A"));

        let err = PrototypeStore::load(&path, 4, DEFAULT_EMA_ALPHA)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::InvalidDimension { .. }));
    }
}
