use crate::error::{ClassifierError, Result};
use crate::hierarchical::{cluster_hierarchy, ClusterNode, HierarchicalConfig};
use crate::kmeans::{KMeansConfig, KMeansResult, SphericalKMeans};
use crate::themes::{cluster_themes, ThemeClustering, ThemeConfig, ThemeItem};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Flat clustering settings as they appear in the `[clustering]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f32,
    pub n_init: usize,
    pub seed: u64,
    pub max_depth: usize,
    pub min_cluster_size: usize,
    pub separate_file_types: bool,
    pub time_budget_ms: u64,
    pub single_pass_threshold: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        let kmeans = KMeansConfig::default();
        let themes = ThemeConfig::default();
        Self {
            k: kmeans.k,
            max_iterations: kmeans.max_iterations,
            tolerance: kmeans.tolerance,
            n_init: kmeans.n_init,
            seed: kmeans.seed,
            max_depth: 2,
            min_cluster_size: 4,
            separate_file_types: themes.separate_file_types,
            time_budget_ms: themes.time_budget_ms,
            single_pass_threshold: themes.single_pass_threshold,
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        self.kmeans().validate()?;
        if self.max_depth == 0 {
            return Err(ClassifierError::InvalidConfig(
                "max_depth must be >= 1".to_string(),
            ));
        }
        self.themes().validate()
    }

    #[must_use]
    pub fn kmeans(&self) -> KMeansConfig {
        KMeansConfig {
            k: self.k,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            n_init: self.n_init,
            seed: self.seed,
        }
    }

    #[must_use]
    pub fn hierarchical(&self) -> HierarchicalConfig {
        HierarchicalConfig {
            kmeans: self.kmeans(),
            max_depth: self.max_depth,
            min_cluster_size: self.min_cluster_size,
        }
    }

    #[must_use]
    pub fn themes(&self) -> ThemeConfig {
        ThemeConfig {
            kmeans: self.kmeans(),
            separate_file_types: self.separate_file_types,
            time_budget_ms: self.time_budget_ms,
            single_pass_threshold: self.single_pass_threshold,
            ..ThemeConfig::default()
        }
    }

    #[must_use]
    pub fn with_k(&self, k: usize) -> Self {
        Self {
            k: k.max(1),
            ..self.clone()
        }
    }
}

/// Cluster count for `n` items when the caller did not ask for one.
#[must_use]
pub fn suggested_k(n: usize) -> usize {
    if n < 2 {
        return n.max(1);
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let root = ((n as f64) / 2.0).sqrt().round() as usize;
    root.clamp(2, 12).min(n)
}

#[derive(Debug, Clone)]
pub struct Clusterer {
    config: ClusteringConfig,
}

impl Clusterer {
    pub fn new(config: ClusteringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.time_budget_ms)
    }

    pub fn cluster(&self, vectors: &[Vec<f32>]) -> Result<KMeansResult> {
        SphericalKMeans::new(self.config.kmeans())?.fit_until(vectors, Some(self.deadline()))
    }

    pub fn hierarchy(&self, vectors: &[Vec<f32>]) -> Result<ClusterNode> {
        cluster_hierarchy(vectors, &self.config.hierarchical(), Some(self.deadline()))
    }

    pub fn themes(&self, items: &[ThemeItem<'_>]) -> Result<ThemeClustering> {
        cluster_themes(items, &self.config.themes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggested_k_grows_slowly() {
        assert_eq!(suggested_k(0), 1);
        assert_eq!(suggested_k(1), 1);
        assert_eq!(suggested_k(2), 2);
        assert_eq!(suggested_k(50), 5);
        assert_eq!(suggested_k(10_000), 12);
    }

    #[test]
    fn flat_config_maps_onto_algorithms() {
        let config = ClusteringConfig {
            k: 3,
            max_depth: 4,
            separate_file_types: false,
            ..ClusteringConfig::default()
        };
        assert_eq!(config.kmeans().k, 3);
        assert_eq!(config.hierarchical().max_depth, 4);
        assert!(!config.themes().separate_file_types);
        assert!(Clusterer::new(config).is_ok());
        assert!(Clusterer::new(ClusteringConfig {
            n_init: 0,
            ..ClusteringConfig::default()
        })
        .is_err());
    }

    #[test]
    fn clusterer_runs_flat_kmeans_within_budget() {
        let clusterer = Clusterer::new(ClusteringConfig::default().with_k(2)).unwrap();
        let data = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        let result = clusterer.cluster(&data).unwrap();
        assert_eq!(result.assignments[0], result.assignments[1]);
        assert_ne!(result.assignments[0], result.assignments[2]);
    }
}
