use crate::confidence::{ConfidenceConfig, Outcome};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sift_vector_store::{tokenize, PrototypeMatch, PrototypeStore};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Everything the scorer knows about one file.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub embedding: &'a [f32],
    pub filename: &'a str,
    pub parent_folder: Option<&'a str>,
    pub extension: Option<&'a str>,
    pub cluster_density: Option<f32>,
}

impl<'a> ScoringInput<'a> {
    #[must_use]
    pub const fn new(embedding: &'a [f32], filename: &'a str) -> Self {
        Self {
            embedding,
            filename,
            parent_folder: None,
            extension: None,
            cluster_density: None,
        }
    }

    #[must_use]
    pub const fn parent_folder(mut self, folder: Option<&'a str>) -> Self {
        self.parent_folder = folder;
        self
    }

    #[must_use]
    pub const fn extension(mut self, extension: Option<&'a str>) -> Self {
        self.extension = extension;
        self
    }

    #[must_use]
    pub const fn cluster_density(mut self, density: Option<f32>) -> Self {
        self.cluster_density = density;
        self
    }
}

/// Capped contribution of each signal. Sums to the confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub prototype_similarity: f32,
    pub cluster_density: f32,
    pub extension_bonus: f32,
    pub parent_folder_bonus: f32,
}

impl ConfidenceBreakdown {
    #[must_use]
    pub fn total(&self) -> f32 {
        (self.prototype_similarity
            + self.cluster_density
            + self.extension_bonus
            + self.parent_folder_bonus)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCategory {
    pub category_path: Option<String>,
    pub confidence: f32,
    pub breakdown: ConfidenceBreakdown,
    pub outcome: Outcome,
    pub explanation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub auto_place: u64,
    pub review: u64,
    pub deep_analysis: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScorerStats {
    pub total: u64,
    pub correct: u64,
    pub auto_place_total: u64,
    pub auto_place_correct: u64,
    pub overall_precision: f32,
    pub auto_place_precision: f32,
    pub outcome_counts: OutcomeCounts,
}

impl ScorerStats {
    fn refresh_precision(&mut self) {
        self.overall_precision = ratio(self.correct, self.total);
        self.auto_place_precision = ratio(self.auto_place_correct, self.auto_place_total);
    }
}

fn ratio(num: u64, den: u64) -> f32 {
    if den == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let value = num as f32 / den as f32;
    value
}

/// Combines prototype similarity with density, extension and folder priors.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
    extension_counts: HashMap<String, BTreeMap<String, u64>>,
    stats: ScorerStats,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            extension_counts: HashMap::new(),
            stats: ScorerStats::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ConfidenceConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Scores `input` against the best few prototypes and keeps the strongest.
    pub fn calculate_confidence(
        &self,
        prototypes: &PrototypeStore,
        input: &ScoringInput<'_>,
    ) -> Result<ScoredCategory> {
        let candidates = prototypes.find_similar(input.embedding, self.config.candidate_count)?;
        let best = candidates
            .iter()
            .map(|candidate| (candidate, self.breakdown_for(candidate, input)))
            .fold(None::<(&PrototypeMatch, ConfidenceBreakdown)>, |best, next| match best {
                Some(current) if current.1.total() >= next.1.total() => Some(current),
                _ => Some(next),
            });

        let Some((matched, breakdown)) = best else {
            return Ok(ScoredCategory {
                category_path: None,
                confidence: 0.0,
                breakdown: ConfidenceBreakdown::default(),
                outcome: Outcome::DeepAnalysis,
                explanation: format!("'{}': no category prototypes yet", input.filename),
            });
        };

        let confidence = breakdown.total();
        let outcome = Outcome::for_confidence(confidence, &self.config);
        let explanation = self.explain(input.filename, &matched.category_path, &breakdown, outcome);
        log::debug!("{explanation}");
        Ok(ScoredCategory {
            category_path: Some(matched.category_path.clone()),
            confidence,
            breakdown,
            outcome,
            explanation,
        })
    }

    fn breakdown_for(&self, candidate: &PrototypeMatch, input: &ScoringInput<'_>) -> ConfidenceBreakdown {
        let weights = self.config.weights;
        let caps = self.config.caps;
        let bounded = |raw: f32, weight: f32, cap: f32| (raw.clamp(0.0, 1.0) * weight).clamp(0.0, cap);

        let density = input
            .cluster_density
            .or(candidate.cohesion)
            .unwrap_or(candidate.prototype_confidence);
        let extension = input
            .extension
            .map_or(0.0, |ext| self.extension_affinity(&candidate.category_path, ext));
        let folder = input
            .parent_folder
            .map_or(0.0, |folder| folder_match(folder, &candidate.category_path));

        ConfidenceBreakdown {
            prototype_similarity: bounded(candidate.similarity, weights.prototype, caps.prototype),
            cluster_density: bounded(density, weights.density, caps.density),
            extension_bonus: bounded(extension, weights.extension, caps.extension),
            parent_folder_bonus: bounded(folder, weights.parent_folder, caps.parent_folder),
        }
    }

    fn explain(
        &self,
        filename: &str,
        category: &str,
        b: &ConfidenceBreakdown,
        outcome: Outcome,
    ) -> String {
        let threshold = match outcome {
            Outcome::AutoPlace => format!(">= {:.2}", self.config.auto_place_threshold),
            Outcome::Review => format!(">= {:.2}", self.config.review_threshold),
            Outcome::DeepAnalysis => format!("< {:.2}", self.config.review_threshold),
        };
        format!(
            "'{filename}' -> {category}: similarity {:.2} + density {:.2} + extension {:.2} + folder {:.2} = {:.2} ({} {threshold})",
            b.prototype_similarity,
            b.cluster_density,
            b.extension_bonus,
            b.parent_folder_bonus,
            b.total(),
            outcome.as_str(),
        )
    }

    /// Share of files already in `category` that carry `extension`.
    #[must_use]
    pub fn extension_affinity(&self, category: &str, extension: &str) -> f32 {
        let Some(counts) = self.extension_counts.get(category) else {
            return 0.0;
        };
        let total: u64 = counts.values().sum();
        let hits = counts
            .get(&extension.to_ascii_lowercase())
            .copied()
            .unwrap_or(0);
        ratio(hits, total)
    }

    pub fn observe_extension(&mut self, category: &str, extension: &str) {
        *self
            .extension_counts
            .entry(category.to_string())
            .or_default()
            .entry(extension.to_ascii_lowercase())
            .or_insert(0) += 1;
    }

    pub fn forget_category(&mut self, category: &str) {
        self.extension_counts.remove(category);
    }

    /// Folds the extension history of `from` into `into`.
    pub fn merge_extension_history(&mut self, from: &str, into: &str) {
        if from == into {
            return;
        }
        if let Some(counts) = self.extension_counts.remove(from) {
            let target = self.extension_counts.entry(into.to_string()).or_default();
            for (ext, count) in counts {
                *target.entry(ext).or_insert(0) += count;
            }
        }
    }

    pub fn record_decision(&mut self, outcome: Outcome) {
        let counts = &mut self.stats.outcome_counts;
        match outcome {
            Outcome::AutoPlace => counts.auto_place += 1,
            Outcome::Review => counts.review += 1,
            Outcome::DeepAnalysis => counts.deep_analysis += 1,
        }
    }

    /// Feedback on a past decision. Precision is reported, never auto-tuned.
    pub fn record_outcome(&mut self, was_correct: bool, was_auto_place: bool) {
        self.stats.total += 1;
        if was_correct {
            self.stats.correct += 1;
        }
        if was_auto_place {
            self.stats.auto_place_total += 1;
            if was_correct {
                self.stats.auto_place_correct += 1;
            }
        }
        self.stats.refresh_precision();
    }

    #[must_use]
    pub fn stats(&self) -> ScorerStats {
        self.stats.clone()
    }

    pub fn restore_stats(&mut self, mut stats: ScorerStats) {
        stats.refresh_precision();
        self.stats = stats;
    }
}

/// Textual match between a folder name and the last segment of a category path.
#[must_use]
pub fn folder_match(folder: &str, category_path: &str) -> f32 {
    let leaf = category_path.rsplit('/').next().unwrap_or(category_path);
    let folder_tokens: BTreeSet<String> = tokenize(folder).into_iter().map(singular).collect();
    let leaf_tokens: BTreeSet<String> = tokenize(leaf).into_iter().map(singular).collect();
    if folder_tokens.is_empty() || leaf_tokens.is_empty() {
        return 0.0;
    }
    let shared = folder_tokens.intersection(&leaf_tokens).count();
    let union = folder_tokens.union(&leaf_tokens).count();
    #[allow(clippy::cast_precision_loss)]
    let jaccard = shared as f32 / union as f32;
    jaccard
}

fn singular(token: String) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceConfig;
    use pretty_assertions::assert_eq;
    use sift_vector_store::CategoryPrototype;

    fn store() -> PrototypeStore {
        let mut store = PrototypeStore::new(3, 0.3).unwrap();
        for (path, v) in [
            ("Documents", vec![1.0, 0.0, 0.0]),
            ("Images", vec![0.0, 1.0, 0.0]),
        ] {
            store
                .insert(CategoryPrototype {
                    category_path: path.to_string(),
                    embedding: v,
                    confidence: 0.9,
                    sample_count: 20,
                    updated_at_unix_ms: 0,
                    cohesion: None,
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn signals_are_capped_and_summed() {
        let mut scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        for _ in 0..4 {
            scorer.observe_extension("Documents", "pdf");
        }
        let input = ScoringInput::new(&[0.95, 0.05, 0.0], "report.pdf")
            .extension(Some("pdf"))
            .parent_folder(Some("documents"))
            .cluster_density(Some(5.0));
        let scored = scorer.calculate_confidence(&store(), &input).unwrap();
        let caps = scorer.config().caps;
        assert_eq!(scored.category_path.as_deref(), Some("Documents"));
        assert!(scored.breakdown.prototype_similarity <= caps.prototype);
        assert!(scored.breakdown.cluster_density <= caps.density);
        assert_eq!(scored.breakdown.extension_bonus, 0.10);
        assert_eq!(scored.breakdown.parent_folder_bonus, caps.parent_folder);
        assert!((scored.confidence - scored.breakdown.total()).abs() < 1e-6);
        assert_eq!(scored.outcome, Outcome::AutoPlace);
        assert!(scored.explanation.contains("Documents"));
    }

    #[test]
    fn density_follows_prototype_cohesion() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        let mut prototypes = PrototypeStore::new(2, 0.5).unwrap();
        for sample in [[1.0, 0.0], [1.0, 0.0], [1.0, 0.02]] {
            prototypes.update_prototype("Tight", &sample).unwrap();
        }
        for sample in [[0.0, 1.0], [0.0, -1.0], [0.1, 1.0]] {
            prototypes.update_prototype("Loose", &sample).unwrap();
        }
        let tight = scorer
            .calculate_confidence(&prototypes, &ScoringInput::new(&[1.0, 0.0], "a.txt"))
            .unwrap();
        let loose = scorer
            .calculate_confidence(&prototypes, &ScoringInput::new(&[0.0, 1.0], "b.txt"))
            .unwrap();
        assert_eq!(tight.category_path.as_deref(), Some("Tight"));
        assert_eq!(loose.category_path.as_deref(), Some("Loose"));
        assert!(tight.breakdown.cluster_density > loose.breakdown.cluster_density);

        let overridden = scorer
            .calculate_confidence(
                &prototypes,
                &ScoringInput::new(&[1.0, 0.0], "a.txt").cluster_density(Some(0.0)),
            )
            .unwrap();
        assert_eq!(overridden.breakdown.cluster_density, 0.0);
    }

    #[test]
    fn unrelated_embedding_goes_to_deep_analysis() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        let input = ScoringInput::new(&[0.0, 0.0, 1.0], "mystery.bin").cluster_density(Some(0.0));
        let scored = scorer.calculate_confidence(&store(), &input).unwrap();
        assert_eq!(scored.outcome, Outcome::DeepAnalysis);
    }

    #[test]
    fn empty_store_yields_no_category() {
        let scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        let empty = PrototypeStore::new(3, 0.3).unwrap();
        let scored = scorer
            .calculate_confidence(&empty, &ScoringInput::new(&[1.0, 0.0, 0.0], "a.txt"))
            .unwrap();
        assert_eq!(scored.category_path, None);
        assert_eq!(scored.outcome, Outcome::DeepAnalysis);
    }

    #[test]
    fn precision_statistics_accumulate() {
        let mut scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        scorer.record_outcome(true, true);
        scorer.record_outcome(false, true);
        scorer.record_outcome(true, false);
        scorer.record_outcome(true, false);
        scorer.record_decision(Outcome::Review);
        let stats = scorer.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.correct, 3);
        assert_eq!(stats.overall_precision, 0.75);
        assert_eq!(stats.auto_place_precision, 0.5);
        assert_eq!(stats.outcome_counts.review, 1);
    }

    #[test]
    fn folder_match_ignores_plural_and_case() {
        assert_eq!(folder_match("Invoices", "Finance/Invoice"), 1.0);
        assert_eq!(folder_match("Downloads", "Finance/Invoice"), 0.0);
        assert!(folder_match("tax_invoices", "Finance/Invoices") > 0.0);
    }

    #[test]
    fn extension_history_merges() {
        let mut scorer = ConfidenceScorer::new(ConfidenceConfig::balanced()).unwrap();
        scorer.observe_extension("A", "JPG");
        scorer.observe_extension("B", "png");
        scorer.merge_extension_history("A", "B");
        assert_eq!(scorer.extension_affinity("B", "jpg"), 0.5);
        assert_eq!(scorer.extension_affinity("A", "jpg"), 0.0);
    }
}
