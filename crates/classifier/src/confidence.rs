//! Named, validated threshold presets for the confidence scorer.

use crate::error::{ClassifierError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidencePreset {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl ConfidencePreset {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for ConfidencePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidencePreset {
    type Err = ClassifierError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "balanced" | "default" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(ClassifierError::UnknownPreset(other.to_string())),
        }
    }
}

/// Multipliers applied to each raw signal in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub prototype: f32,
    pub density: f32,
    pub extension: f32,
    pub parent_folder: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            prototype: 0.75,
            density: 0.10,
            extension: 0.10,
            parent_folder: 0.10,
        }
    }
}

/// Upper bound of each weighted signal's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalCaps {
    pub prototype: f32,
    pub density: f32,
    pub extension: f32,
    pub parent_folder: f32,
}

impl Default for SignalCaps {
    fn default() -> Self {
        Self {
            prototype: 0.75,
            density: 0.10,
            extension: 0.10,
            parent_folder: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub preset: ConfidencePreset,
    pub auto_place_threshold: f32,
    pub review_threshold: f32,
    pub weights: SignalWeights,
    pub caps: SignalCaps,
    /// Prototypes considered per file before signals pick the winner.
    pub candidate_count: usize,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl ConfidenceConfig {
    #[must_use]
    pub fn conservative() -> Self {
        Self::with_thresholds(ConfidencePreset::Conservative, 0.90, 0.70)
    }

    #[must_use]
    pub fn balanced() -> Self {
        Self::with_thresholds(ConfidencePreset::Balanced, 0.80, 0.55)
    }

    #[must_use]
    pub fn aggressive() -> Self {
        Self::with_thresholds(ConfidencePreset::Aggressive, 0.65, 0.40)
    }

    #[must_use]
    pub fn from_preset(preset: ConfidencePreset) -> Self {
        match preset {
            ConfidencePreset::Conservative => Self::conservative(),
            ConfidencePreset::Balanced => Self::balanced(),
            ConfidencePreset::Aggressive => Self::aggressive(),
        }
    }

    /// Builds a config with explicit thresholds, rejecting inconsistent ones.
    pub fn custom(auto_place_threshold: f32, review_threshold: f32) -> Result<Self> {
        let config = Self {
            auto_place_threshold,
            review_threshold,
            ..Self::balanced()
        };
        config.validate()?;
        Ok(config)
    }

    fn with_thresholds(preset: ConfidencePreset, auto_place: f32, review: f32) -> Self {
        Self {
            preset,
            auto_place_threshold: auto_place,
            review_threshold: review,
            weights: SignalWeights::default(),
            caps: SignalCaps::default(),
            candidate_count: 3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.auto_place_threshold) || !in_unit(self.review_threshold) {
            return Err(ClassifierError::InvalidConfig(format!(
                "thresholds must be in [0, 1] (auto_place={}, review={})",
                self.auto_place_threshold, self.review_threshold
            )));
        }
        if self.auto_place_threshold <= self.review_threshold {
            return Err(ClassifierError::InvalidConfig(format!(
                "auto_place_threshold ({}) must be greater than review_threshold ({})",
                self.auto_place_threshold, self.review_threshold
            )));
        }
        let w = self.weights;
        let c = self.caps;
        for (name, value) in [
            ("weights.prototype", w.prototype),
            ("weights.density", w.density),
            ("weights.extension", w.extension),
            ("weights.parent_folder", w.parent_folder),
            ("caps.prototype", c.prototype),
            ("caps.density", c.density),
            ("caps.extension", c.extension),
            ("caps.parent_folder", c.parent_folder),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ClassifierError::InvalidConfig(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }
        if c.prototype <= 0.0 {
            return Err(ClassifierError::InvalidConfig(
                "caps.prototype must be > 0".to_string(),
            ));
        }
        if self.candidate_count == 0 {
            return Err(ClassifierError::InvalidConfig(
                "candidate_count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ternary decision derived from a confidence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    AutoPlace,
    Review,
    DeepAnalysis,
}

impl Outcome {
    #[must_use]
    pub fn for_confidence(confidence: f32, config: &ConfidenceConfig) -> Self {
        if confidence >= config.auto_place_threshold {
            Self::AutoPlace
        } else if confidence >= config.review_threshold {
            Self::Review
        } else {
            Self::DeepAnalysis
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoPlace => "auto-place",
            Self::Review => "review",
            Self::DeepAnalysis => "deep-analysis",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid_and_ordered() {
        for preset in [
            ConfidencePreset::Conservative,
            ConfidencePreset::Balanced,
            ConfidencePreset::Aggressive,
        ] {
            ConfidenceConfig::from_preset(preset).validate().unwrap();
        }
        assert!(
            ConfidenceConfig::conservative().auto_place_threshold
                > ConfidenceConfig::aggressive().auto_place_threshold
        );
        assert_eq!(ConfidenceConfig::default().preset, ConfidencePreset::Balanced);
    }

    #[test]
    fn custom_rejects_inverted_thresholds() {
        assert!(ConfidenceConfig::custom(0.5, 0.6).is_err());
        assert!(ConfidenceConfig::custom(0.5, 0.5).is_err());
        assert!(ConfidenceConfig::custom(1.2, 0.5).is_err());
        assert!(ConfidenceConfig::custom(0.7, 0.4).is_ok());
    }

    #[test]
    fn preset_parses_case_insensitively() {
        assert_eq!(
            " Aggressive ".parse::<ConfidencePreset>().unwrap(),
            ConfidencePreset::Aggressive
        );
        assert!(matches!(
            "reckless".parse::<ConfidencePreset>(),
            Err(ClassifierError::UnknownPreset(_))
        ));
    }

    #[test]
    fn outcome_follows_thresholds() {
        let config = ConfidenceConfig::balanced();
        assert_eq!(Outcome::for_confidence(0.80, &config), Outcome::AutoPlace);
        assert_eq!(Outcome::for_confidence(0.60, &config), Outcome::Review);
        assert_eq!(Outcome::for_confidence(0.10, &config), Outcome::DeepAnalysis);
    }
}
