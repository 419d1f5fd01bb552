use crate::embeddings::cosine_of;
use crate::error::{Result, VectorStoreError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Storage/search strategy behind [`crate::VectorIndex`].
///
/// Slots are assigned in insertion order by the caller, so returning hits with
/// ties ordered by ascending slot preserves insertion order. Vectors handed to
/// a backend are already unit-normalized and dimension-checked.
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    fn insert(&mut self, slot: usize, vector: Vec<f32>);

    fn remove(&mut self, slot: usize) -> bool;

    /// Returns `(slot, similarity)` sorted by similarity descending.
    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Exact brute-force scan. O(n) per query; the correctness baseline.
pub struct ExactIndex {
    dimension: usize,
    vectors: BTreeMap<usize, Vec<f32>>,
}

impl ExactIndex {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: BTreeMap::new(),
        }
    }

    fn rank<'a>(
        query: &[f32],
        candidates: impl Iterator<Item = (usize, &'a Vec<f32>)>,
        k: usize,
    ) -> Vec<(usize, f32)> {
        // BTreeMap iteration is slot-ascending and sort_by is stable, so equal
        // scores keep insertion order.
        let mut scores: Vec<(usize, f32)> = candidates
            .map(|(slot, vector)| (slot, cosine_of(query, vector)))
            .collect();
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(k);
        scores
    }
}

impl VectorBackend for ExactIndex {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn insert(&mut self, slot: usize, vector: Vec<f32>) {
        self.vectors.insert(slot, vector);
    }

    fn remove(&mut self, slot: usize) -> bool {
        self.vectors.remove(&slot).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        Self::rank(query, self.vectors.iter().map(|(s, v)| (*s, v)), k)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        self.vectors.clear();
    }
}

/// Approximate index using random-hyperplane signatures (SimHash buckets).
///
/// A query scans its own bucket and every bucket one bit away; candidates are
/// re-ranked exactly. When probing yields fewer than `k` candidates the search
/// falls back to a full scan, so results never come back short.
pub struct ProjectionIndex {
    dimension: usize,
    planes: Vec<Vec<f32>>,
    buckets: HashMap<u64, BTreeSet<usize>>,
    signatures: HashMap<usize, u64>,
    vectors: BTreeMap<usize, Vec<f32>>,
}

pub const DEFAULT_PROJECTION_BITS: usize = 12;
const MAX_PROJECTION_BITS: usize = 63;

impl ProjectionIndex {
    pub fn new(dimension: usize, bits: usize, seed: u64) -> Result<Self> {
        if bits == 0 || bits > MAX_PROJECTION_BITS {
            return Err(VectorStoreError::InvalidConfig(format!(
                "projection bits must be in 1..={MAX_PROJECTION_BITS}, got {bits}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let planes = (0..bits)
            .map(|_| {
                (0..dimension)
                    .map(|_| rng.gen_range(-1.0f32..1.0))
                    .collect::<Vec<f32>>()
            })
            .collect();
        Ok(Self {
            dimension,
            planes,
            buckets: HashMap::new(),
            signatures: HashMap::new(),
            vectors: BTreeMap::new(),
        })
    }

    fn signature(&self, vector: &[f32]) -> u64 {
        let mut sig = 0u64;
        for (bit, plane) in self.planes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(vector).map(|(p, v)| p * v).sum();
            if dot >= 0.0 {
                sig |= 1u64 << bit;
            }
        }
        sig
    }

    fn nearby_slots(&self, sig: u64) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        if let Some(bucket) = self.buckets.get(&sig) {
            out.extend(bucket.iter().copied());
        }
        for bit in 0..self.planes.len() {
            if let Some(bucket) = self.buckets.get(&(sig ^ (1u64 << bit))) {
                out.extend(bucket.iter().copied());
            }
        }
        out
    }
}

impl VectorBackend for ProjectionIndex {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn insert(&mut self, slot: usize, vector: Vec<f32>) {
        self.remove(slot);
        let sig = self.signature(&vector);
        self.buckets.entry(sig).or_default().insert(slot);
        self.signatures.insert(slot, sig);
        self.vectors.insert(slot, vector);
    }

    fn remove(&mut self, slot: usize) -> bool {
        let Some(sig) = self.signatures.remove(&slot) else {
            return false;
        };
        if let Some(bucket) = self.buckets.get_mut(&sig) {
            bucket.remove(&slot);
            if bucket.is_empty() {
                self.buckets.remove(&sig);
            }
        }
        self.vectors.remove(&slot).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let candidates = self.nearby_slots(self.signature(query));
        if candidates.len() < k {
            log::debug!(
                "projection lookup found {} candidates (< k={k}); scanning all {}",
                candidates.len(),
                self.vectors.len()
            );
            return ExactIndex::rank(query, self.vectors.iter().map(|(s, v)| (*s, v)), k);
        }
        ExactIndex::rank(
            query,
            candidates
                .into_iter()
                .filter_map(|slot| self.vectors.get(&slot).map(|v| (slot, v))),
            k,
        )
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.signatures.clear();
        self.vectors.clear();
    }
}
