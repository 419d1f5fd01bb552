//! Engine configuration: built-in defaults, then `sift.toml`, then `SIFT_*` env.

use crate::error::{EngineError, Result};
use crate::limits::{
    default_classify_concurrency, parse_flag, parse_limit, parse_u64, MAX_CLASSIFY_CONCURRENCY,
};
use crate::refiner::RefinerConfig;
use serde::{Deserialize, Serialize};
use sift_classifier::{
    ClusteringConfig, ConfidenceConfig, ConfidencePreset, SignalCaps, SignalWeights,
};
use sift_organizer::{OrganizerConfig, MAX_CONCURRENT_OPS};
use sift_taxonomy::DepthPolicy;
use sift_vector_store::{paths::config_path_for_root, DEFAULT_EMA_ALPHA, DEFAULT_EMBEDDING_DIMENSION};
use std::path::{Path, PathBuf};

const MAX_EMBEDDING_DIMENSION: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrototypeConfig {
    pub ema_alpha: f32,
    /// Floor for `similarity * prototype confidence` in direct prototype lookups.
    pub min_confidence: f32,
    /// Apply queued prototype updates at the end of every `classify` call.
    pub auto_flush: bool,
}

impl Default for PrototypeConfig {
    fn default() -> Self {
        Self {
            ema_alpha: DEFAULT_EMA_ALPHA,
            min_confidence: 0.3,
            auto_flush: true,
        }
    }
}

/// `[confidence]`: a preset, optionally with individual values overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceSection {
    pub preset: ConfidencePreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_place_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<SignalWeights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<SignalCaps>,
}

impl ConfidenceSection {
    pub fn resolve(&self) -> Result<ConfidenceConfig> {
        let mut config = ConfidenceConfig::from_preset(self.preset);
        if let Some(value) = self.auto_place_threshold {
            config.auto_place_threshold = value;
        }
        if let Some(value) = self.review_threshold {
            config.review_threshold = value;
        }
        if let Some(weights) = self.weights {
            config.weights = weights;
        }
        if let Some(caps) = self.caps {
            config.caps = caps;
        }
        if let Some(count) = self.candidate_count {
            config.candidate_count = count;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Files scored concurrently during `classify`.
    pub classify_concurrency: usize,
    /// Hash file content to consult and feed the learned-pattern memory.
    pub content_checksum: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            classify_concurrency: default_classify_concurrency(),
            content_checksum: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub embedding: EmbeddingConfig,
    pub prototypes: PrototypeConfig,
    pub confidence: ConfidenceSection,
    pub clustering: ClusteringConfig,
    pub taxonomy: DepthPolicy,
    pub organizer: OrganizerConfig,
    pub worker: WorkerConfig,
    pub refiner: RefinerConfig,
}

impl EngineConfig {
    /// Defaults, then the TOML file (explicit path, else `<root>/.sift/sift.toml`
    /// if present), then `SIFT_*` environment overrides.
    pub fn load(explicit: Option<&Path>, root: Option<&Path>) -> Result<Self> {
        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| root.map(config_path_for_root).filter(|p| p.is_file()));
        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| EngineError::ConfigParse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let config = Self::from_toml(&raw).map_err(|err| match err {
            EngineError::ConfigParse { message, .. } => EngineError::ConfigParse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| EngineError::ConfigParse {
            path: "<inline>".to_string(),
            message: err.to_string(),
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| EngineError::Other(err.to_string()))
    }

    /// Applies `SIFT_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SIFT_EMBEDDING_DIM") {
            self.embedding.dimension = parse_limit(
                Some(&raw),
                self.embedding.dimension,
                MAX_EMBEDDING_DIMENSION,
            );
        }
        if let Some(raw) = lookup("SIFT_CONFIDENCE_PRESET") {
            match raw.parse::<ConfidencePreset>() {
                Ok(preset) => self.confidence.preset = preset,
                Err(err) => log::warn!("Ignoring SIFT_CONFIDENCE_PRESET: {err}"),
            }
        }
        if let Some(raw) = lookup("SIFT_CLASSIFY_CONCURRENCY") {
            self.worker.classify_concurrency = parse_limit(
                Some(&raw),
                self.worker.classify_concurrency,
                MAX_CLASSIFY_CONCURRENCY,
            );
        }
        if let Some(raw) = lookup("SIFT_MAX_CONCURRENT_OPS") {
            self.organizer.max_concurrent_ops = parse_limit(
                Some(&raw),
                self.organizer.max_concurrent_ops,
                MAX_CONCURRENT_OPS,
            );
        }
        if let Some(raw) = lookup("SIFT_OP_TIMEOUT_MS") {
            self.organizer.op_timeout_ms = parse_u64(Some(&raw), self.organizer.op_timeout_ms);
        }
        if let Some(raw) = lookup("SIFT_ORGANIZE_MODE") {
            match raw.parse() {
                Ok(mode) => self.organizer.mode = mode,
                Err(err) => log::warn!("Ignoring SIFT_ORGANIZE_MODE: {err}"),
            }
        }
        if let Some(raw) = lookup("SIFT_ENABLE_UNDO") {
            self.organizer.enable_undo = parse_flag(Some(&raw), self.organizer.enable_undo);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 || self.embedding.dimension > MAX_EMBEDDING_DIMENSION {
            return Err(EngineError::InvalidConfig(format!(
                "embedding.dimension must be in 1..={MAX_EMBEDDING_DIMENSION}, got {}",
                self.embedding.dimension
            )));
        }
        let alpha = self.prototypes.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "prototypes.ema_alpha must be in (0, 1], got {alpha}"
            )));
        }
        if !(0.0..=1.0).contains(&self.prototypes.min_confidence) {
            return Err(EngineError::InvalidConfig(format!(
                "prototypes.min_confidence must be in [0, 1], got {}",
                self.prototypes.min_confidence
            )));
        }
        if self.worker.classify_concurrency == 0
            || self.worker.classify_concurrency > MAX_CLASSIFY_CONCURRENCY
        {
            return Err(EngineError::InvalidConfig(format!(
                "worker.classify_concurrency must be in 1..={MAX_CLASSIFY_CONCURRENCY}, got {}",
                self.worker.classify_concurrency
            )));
        }
        self.confidence.resolve()?;
        self.clustering.validate()?;
        self.taxonomy.validate()?;
        self.organizer.validate()?;
        self.refiner.validate()?;
        Ok(())
    }

    /// The scorer configuration this file resolves to.
    pub fn confidence_config(&self) -> Result<ConfidenceConfig> {
        self.confidence.resolve()
    }

    /// Where [`Self::load`] would look for a config file under `root`.
    #[must_use]
    pub fn default_path(root: &Path) -> PathBuf {
        config_path_for_root(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sift_organizer::OrganizeMode;
    use sift_taxonomy::DepthMode;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        let confidence = config.confidence_config().unwrap();
        assert_eq!(confidence.auto_place_threshold, 0.80);
        assert_eq!(confidence.review_threshold, 0.55);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let raw = r#"
            [embedding]
            dimension = 64

            [confidence]
            preset = "conservative"
            review_threshold = 0.6

            [taxonomy]
            min_depth = 1
            max_depth = 2
            depth_mode = "strict"

            [organizer]
            mode = "copy"
            collision_style = "numbered"
            max_concurrent_ops = 3
        "#;
        let config = EngineConfig::from_toml(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.embedding.dimension, 64);
        let confidence = config.confidence_config().unwrap();
        assert_eq!(confidence.auto_place_threshold, 0.90);
        assert_eq!(confidence.review_threshold, 0.6);
        assert_eq!(config.taxonomy.mode, DepthMode::Strict);
        assert_eq!(config.organizer.mode, OrganizeMode::Copy);
        assert_eq!(config.organizer.max_concurrent_ops, 3);
        assert_eq!(config.organizer.uncategorized_folder, "Uncategorized");
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let raw = "[confidence]\nauto_place_threshold = 0.5\nreview_threshold = 0.7\n";
        let config = EngineConfig::from_toml(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_are_parsed_and_clamped() {
        let env: HashMap<&str, &str> = [
            ("SIFT_MAX_CONCURRENT_OPS", "999"),
            ("SIFT_CONFIDENCE_PRESET", "aggressive"),
            ("SIFT_CLASSIFY_CONCURRENCY", "  "),
            ("SIFT_ORGANIZE_MODE", "teleport"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        let before = config.worker.classify_concurrency;
        config.apply_env(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.organizer.max_concurrent_ops, MAX_CONCURRENT_OPS);
        assert_eq!(config.confidence.preset, ConfidencePreset::Aggressive);
        assert_eq!(config.worker.classify_concurrency, before);
        assert_eq!(config.organizer.mode, OrganizeMode::Move);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_toml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.toml");
        std::fs::write(&path, "[embedding\ndimension = 3").unwrap();
        let err = EngineConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("sift.toml"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EngineConfig::default();
        let raw = config.to_toml().unwrap();
        let back = EngineConfig::from_toml(&raw).unwrap();
        assert_eq!(back, config);
    }
}
