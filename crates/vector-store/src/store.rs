use crate::embeddings::{ensure_dimension, normalized};
use crate::error::Result;
use crate::index::{ExactIndex, ProjectionIndex, VectorBackend};
use crate::types::SearchHit;
use std::collections::{BTreeMap, HashMap};

/// Identifier-keyed vector index with cosine k-NN search.
///
/// Every vector is L2-normalized on the way in. The backend is pluggable: the
/// exact scan is the default; [`ProjectionIndex`] trades recall for speed on
/// large populations without changing this contract.
pub struct VectorIndex {
    dimension: usize,
    backend: Box<dyn VectorBackend>,
    slots: HashMap<String, usize>,
    ids: BTreeMap<usize, String>,
    next_slot: usize,
}

impl VectorIndex {
    #[must_use]
    pub fn exact(dimension: usize) -> Self {
        Self::with_backend(Box::new(ExactIndex::new(dimension)))
    }

    pub fn projection(dimension: usize, bits: usize, seed: u64) -> Result<Self> {
        Ok(Self::with_backend(Box::new(ProjectionIndex::new(
            dimension, bits, seed,
        )?)))
    }

    #[must_use]
    pub fn with_backend(backend: Box<dyn VectorBackend>) -> Self {
        Self {
            dimension: backend.dimension(),
            backend,
            slots: HashMap::new(),
            ids: BTreeMap::new(),
            next_slot: 0,
        }
    }

    /// Insert or replace the vector stored under `id`.
    ///
    /// Replacing keeps the original insertion position for tie-breaking.
    pub fn add(&mut self, id: impl Into<String>, vector: &[f32]) -> Result<()> {
        ensure_dimension(vector, self.dimension)?;
        let id = id.into();
        let slot = match self.slots.get(&id) {
            Some(slot) => *slot,
            None => {
                let slot = self.next_slot;
                self.next_slot += 1;
                self.slots.insert(id.clone(), slot);
                self.ids.insert(slot, id);
                slot
            }
        };
        self.backend.insert(slot, normalized(vector.to_vec()));
        Ok(())
    }

    /// Nearest neighbours by descending cosine similarity; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        ensure_dimension(query, self.dimension)?;
        if k == 0 || self.backend.is_empty() {
            return Ok(Vec::new());
        }
        let query = normalized(query.to_vec());
        let hits = self
            .backend
            .search(&query, k)
            .into_iter()
            .filter_map(|(slot, score)| {
                self.ids.get(&slot).map(|id| SearchHit {
                    id: id.clone(),
                    score,
                })
            })
            .collect();
        Ok(hits)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        self.ids.remove(&slot);
        self.backend.remove(slot)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.ids.values().cloned().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn clear(&mut self) {
        self.backend.clear();
        self.slots.clear();
        self.ids.clear();
        self.next_slot = 0;
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("backend", &self.backend.name())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VectorStoreError;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_search_remove_count() {
        let mut index = VectorIndex::exact(3);
        index.add("a", &[1.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 2.0, 0.0]).unwrap();
        index.add("c", &[0.7, 0.7, 0.0]).unwrap();
        assert_eq!(index.count(), 3);

        let hits = index.search(&[1.0, 0.1, 0.0], 2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(hits[0].distance() < hits[1].distance());

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.count(), 2);
        let hits = index.search(&[1.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "c");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mut index = VectorIndex::exact(3);
        let err = index.add("a", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::InvalidDimension {
                expected: 3,
                actual: 2
            }
        ));
        index.add("a", &[1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn ties_are_broken_by_insertion_order_even_after_replace() {
        let mut index = VectorIndex::exact(2);
        index.add("first", &[1.0, 0.0]).unwrap();
        index.add("second", &[1.0, 0.0]).unwrap();
        index.add("first", &[2.0, 0.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, "first");
        assert_eq!(hits[1].id, "second");
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn zero_query_scores_zero() {
        let mut index = VectorIndex::exact(2);
        index.add("a", &[1.0, 0.0]).unwrap();
        let hits = index.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn backends_are_interchangeable() {
        let vectors: Vec<(String, Vec<f32>)> = (0..20)
            .map(|i| {
                let angle = i as f32 * 0.15;
                (format!("v{i}"), vec![angle.cos(), angle.sin(), 0.1])
            })
            .collect();
        let mut exact = VectorIndex::exact(3);
        let mut approx = VectorIndex::projection(3, 6, 7).unwrap();
        for (id, v) in &vectors {
            exact.add(id.clone(), v).unwrap();
            approx.add(id.clone(), v).unwrap();
        }
        assert_eq!(approx.backend_name(), "projection");
        let query = [1.0, 0.0, 0.1];
        let top_exact = exact.search(&query, 1).unwrap();
        let top_approx = approx.search(&query, 1).unwrap();
        assert_eq!(top_exact[0].id, "v0");
        // Full-population k always agrees because the projection index falls back to a scan.
        assert_eq!(
            exact.search(&query, 20).unwrap(),
            approx.search(&query, 20).unwrap()
        );
        assert!(top_approx[0].score <= top_exact[0].score + 1e-6);
    }
}
