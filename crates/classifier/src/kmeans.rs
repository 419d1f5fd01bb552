//! Spherical k-means over unit vectors.
//!
//! Points are assigned to the centroid with the highest cosine similarity and
//! centroids are re-estimated as the normalized mean of their members. Runs
//! are seeded (k-means++ style) from a fixed RNG seed, so identical input and
//! config always produce identical clusters.

use crate::error::{ClassifierError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansConfig {
    pub k: usize,
    pub max_iterations: usize,
    /// Stop once no centroid moves further than this (euclidean).
    pub tolerance: f32,
    /// Independent restarts; the run with the lowest inertia wins.
    pub n_init: usize,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 8,
            max_iterations: 100,
            tolerance: 1e-4,
            n_init: 3,
            seed: 42,
        }
    }
}

impl KMeansConfig {
    pub fn with_k(k: usize) -> Result<Self> {
        let config = Self {
            k,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(ClassifierError::InvalidConfig("k must be > 0".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(ClassifierError::InvalidConfig(
                "max_iterations must be > 0".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(ClassifierError::InvalidConfig(
                "tolerance must be a finite positive number".to_string(),
            ));
        }
        if self.n_init == 0 {
            return Err(ClassifierError::InvalidConfig("n_init must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansResult {
    /// Cluster index per input point.
    pub assignments: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    /// Sum over points of `1 - cos(point, centroid)`.
    pub inertia: f32,
    pub iterations: usize,
    pub converged: bool,
}

impl KMeansResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            assignments: Vec::new(),
            centroids: Vec::new(),
            inertia: 0.0,
            iterations: 0,
            converged: true,
        }
    }

    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Member indices grouped per cluster.
    #[must_use]
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.centroids.len()];
        for (point, cluster) in self.assignments.iter().enumerate() {
            if let Some(group) = groups.get_mut(*cluster) {
                group.push(point);
            }
        }
        groups
    }
}

#[derive(Debug, Clone)]
pub struct SphericalKMeans {
    config: KMeansConfig,
}

impl SphericalKMeans {
    pub fn new(config: KMeansConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &KMeansConfig {
        &self.config
    }

    pub fn fit(&self, vectors: &[Vec<f32>]) -> Result<KMeansResult> {
        self.fit_until(vectors, None)
    }

    /// Like [`Self::fit`], but stops refining once `deadline` passes and
    /// returns the best run so far (`converged == false`).
    pub fn fit_until(&self, vectors: &[Vec<f32>], deadline: Option<Instant>) -> Result<KMeansResult> {
        if vectors.is_empty() {
            return Ok(KMeansResult::empty());
        }
        let data = to_matrix(vectors)?;
        let n = data.nrows();
        if n <= self.config.k {
            return Ok(one_cluster_per_point(&data));
        }

        let mut best: Option<KMeansResult> = None;
        for run in 0..self.config.n_init {
            let seed = self.config.seed.wrapping_add(run as u64);
            let result = self.run_once(&data, seed, deadline);
            log::debug!(
                "k-means run {run}: k={} inertia={:.4} iterations={} converged={}",
                self.config.k,
                result.inertia,
                result.iterations,
                result.converged
            );
            let better = best.as_ref().map_or(true, |b| result.inertia < b.inertia);
            if better {
                best = Some(result);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::debug!("k-means time budget exhausted after {} runs", run + 1);
                break;
            }
        }
        Ok(best.unwrap_or_else(KMeansResult::empty))
    }

    fn run_once(&self, data: &Array2<f32>, seed: u64, deadline: Option<Instant>) -> KMeansResult {
        let k = self.config.k;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = plus_plus_init(data, k, &mut rng);
        let mut assignments = vec![0usize; data.nrows()];
        let mut iterations = 0;
        let mut converged = false;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;
            assign(data, &centroids, &mut assignments);
            let next = recompute(data, &assignments, &centroids);
            let movement = max_movement(&centroids, &next);
            centroids = next;
            if movement < self.config.tolerance {
                converged = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
        // Final assignment against the final centroids.
        assign(data, &centroids, &mut assignments);
        let inertia = inertia(data, &centroids, &assignments);
        KMeansResult {
            assignments,
            centroids: centroids.outer_iter().map(|row| row.to_vec()).collect(),
            inertia,
            iterations,
            converged,
        }
    }
}

fn to_matrix(vectors: &[Vec<f32>]) -> Result<Array2<f32>> {
    let dim = vectors.first().map_or(0, Vec::len);
    if dim == 0 {
        return Err(ClassifierError::InvalidConfig(
            "cannot cluster zero-dimensional vectors".to_string(),
        ));
    }
    let mut data = Array2::<f32>::zeros((vectors.len(), dim));
    for (mut row, vector) in data.outer_iter_mut().zip(vectors) {
        if vector.len() != dim {
            return Err(ClassifierError::InvalidDimension {
                expected: dim,
                actual: vector.len(),
            });
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        for (slot, value) in row.iter_mut().zip(vector) {
            *slot = if norm > 0.0 { value / norm } else { 0.0 };
        }
    }
    Ok(data)
}

fn one_cluster_per_point(data: &Array2<f32>) -> KMeansResult {
    KMeansResult {
        assignments: (0..data.nrows()).collect(),
        centroids: data.outer_iter().map(|row| row.to_vec()).collect(),
        inertia: 0.0,
        iterations: 0,
        converged: true,
    }
}

fn plus_plus_init(data: &Array2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {
    let n = data.nrows();
    let mut chosen = vec![rng.gen_range(0..n)];
    while chosen.len() < k {
        let distances: Vec<f32> = data
            .outer_iter()
            .map(|point| {
                chosen
                    .iter()
                    .map(|c| 1.0 - point.dot(&data.row(*c)))
                    .fold(f32::MAX, f32::min)
                    .max(0.0)
                    .powi(2)
            })
            .collect();
        let total: f32 = distances.iter().sum();
        let next = if total <= 0.0 {
            // Every point coincides with a chosen centroid; take the first unused one.
            (0..n).find(|i| !chosen.contains(i)).unwrap_or(0)
        } else {
            let threshold = rng.gen::<f32>() * total;
            let mut cumulative = 0.0;
            let mut pick = n - 1;
            for (i, d) in distances.iter().enumerate() {
                cumulative += d;
                if cumulative >= threshold && *d > 0.0 {
                    pick = i;
                    break;
                }
            }
            pick
        };
        chosen.push(next);
    }
    data.select(Axis(0), &chosen)
}

fn assign(data: &Array2<f32>, centroids: &Array2<f32>, assignments: &mut [usize]) {
    let similarities = data.dot(&centroids.t());
    for (row, slot) in similarities.outer_iter().zip(assignments.iter_mut()) {
        *slot = argmax(row);
    }
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::MIN;
    for (i, value) in row.iter().enumerate() {
        if *value > best_value {
            best_value = *value;
            best = i;
        }
    }
    best
}

fn recompute(data: &Array2<f32>, assignments: &[usize], previous: &Array2<f32>) -> Array2<f32> {
    let k = previous.nrows();
    let mut sums = Array2::<f32>::zeros((k, data.ncols()));
    let mut counts = vec![0usize; k];
    for (point, cluster) in data.outer_iter().zip(assignments) {
        let mut row = sums.row_mut(*cluster);
        row += &point;
        counts[*cluster] += 1;
    }

    let mut taken: Vec<usize> = Vec::new();
    for cluster in 0..k {
        let mut row = sums.row_mut(cluster);
        if counts[cluster] == 0 {
            // Empty cluster: reseed at the point worst served by its centroid.
            let worst = worst_served(data, previous, assignments, &taken);
            taken.push(worst);
            row.assign(&data.row(worst));
            continue;
        }
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        } else {
            row.assign(&previous.row(cluster));
        }
    }
    sums
}

fn worst_served(
    data: &Array2<f32>,
    centroids: &Array2<f32>,
    assignments: &[usize],
    taken: &[usize],
) -> usize {
    let mut worst = 0;
    let mut worst_sim = f32::MAX;
    for (i, (point, cluster)) in data.outer_iter().zip(assignments).enumerate() {
        if taken.contains(&i) {
            continue;
        }
        let sim = point.dot(&centroids.row(*cluster));
        if sim < worst_sim {
            worst_sim = sim;
            worst = i;
        }
    }
    worst
}

fn max_movement(old: &Array2<f32>, new: &Array2<f32>) -> f32 {
    old.outer_iter()
        .zip(new.outer_iter())
        .map(|(a, b)| {
            let diff = &a - &b;
            diff.dot(&diff).sqrt()
        })
        .fold(0.0, f32::max)
}

fn inertia(data: &Array2<f32>, centroids: &Array2<f32>, assignments: &[usize]) -> f32 {
    data.outer_iter()
        .zip(assignments)
        .map(|(point, cluster)| 1.0 - point.dot(&centroids.row(*cluster)))
        .sum()
}

/// Mean cosine similarity of members to their normalized mean, in `[0, 1]`.
#[must_use]
pub fn coherence(vectors: &[&[f32]]) -> f32 {
    let Some(first) = vectors.first() else {
        return 0.0;
    };
    let mut mean = vec![0.0f32; first.len()];
    for vector in vectors {
        for (slot, value) in mean.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }
    let mean = sift_vector_store::normalized(mean);
    let total: f32 = vectors
        .iter()
        .map(|v| sift_vector_store::cosine_of(v, &mean))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let avg = total / vectors.len() as f32;
    avg.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_groups() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.1, 0.0],
            vec![0.9, 0.0, 0.1],
            vec![1.0, 0.05, 0.05],
            vec![0.0, 1.0, 0.1],
            vec![0.1, 0.9, 0.0],
            vec![0.05, 1.0, 0.05],
        ]
    }

    #[test]
    fn separates_two_obvious_groups() {
        let kmeans = SphericalKMeans::new(KMeansConfig::with_k(2).unwrap()).unwrap();
        let result = kmeans.fit(&two_groups()).unwrap();
        let a = &result.assignments;
        assert_eq!(a[0], a[1]);
        assert_eq!(a[1], a[2]);
        assert_eq!(a[3], a[4]);
        assert_eq!(a[4], a[5]);
        assert_ne!(a[0], a[3]);
        assert!(result.converged);
        for centroid in &result.centroids {
            assert!(sift_vector_store::is_unit(centroid, 1e-3));
        }
    }

    #[test]
    fn same_seed_same_result() {
        let config = KMeansConfig {
            k: 3,
            seed: 7,
            ..KMeansConfig::default()
        };
        let kmeans = SphericalKMeans::new(config).unwrap();
        let data: Vec<Vec<f32>> = (0..30)
            .map(|i| {
                let angle = i as f32 * 0.21;
                vec![angle.cos(), angle.sin(), (i % 3) as f32 * 0.1]
            })
            .collect();
        assert_eq!(kmeans.fit(&data).unwrap(), kmeans.fit(&data).unwrap());
    }

    #[test]
    fn fewer_points_than_k_is_one_cluster_each() {
        let kmeans = SphericalKMeans::new(KMeansConfig::with_k(5).unwrap()).unwrap();
        let result = kmeans.fit(&[vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
        assert_eq!(result.assignments, vec![0, 1]);
        assert_eq!(result.centroids, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(result.converged);
    }

    #[test]
    fn zero_points_is_empty_and_converged() {
        let kmeans = SphericalKMeans::new(KMeansConfig::default()).unwrap();
        let result = kmeans.fit(&[]).unwrap();
        assert_eq!(result, KMeansResult::empty());
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let kmeans = SphericalKMeans::new(KMeansConfig::with_k(1).unwrap()).unwrap();
        let err = kmeans
            .fit(&[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]])
            .unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::InvalidDimension {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn invalid_configs_fail_fast() {
        assert!(KMeansConfig::with_k(0).is_err());
        let bad = KMeansConfig {
            tolerance: 0.0,
            ..KMeansConfig::default()
        };
        assert!(SphericalKMeans::new(bad).is_err());
    }

    #[test]
    fn expired_deadline_still_returns_assignments() {
        let kmeans = SphericalKMeans::new(KMeansConfig::with_k(2).unwrap()).unwrap();
        let result = kmeans
            .fit_until(&two_groups(), Some(Instant::now()))
            .unwrap();
        assert_eq!(result.assignments.len(), 6);
    }

    #[test]
    fn coherence_of_identical_vectors_is_one() {
        let v = [0.6f32, 0.8];
        assert!((coherence(&[&v, &v]) - 1.0).abs() < 1e-5);
        assert_eq!(coherence(&[]), 0.0);
    }
}
