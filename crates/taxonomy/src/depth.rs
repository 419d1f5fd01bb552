use crate::error::{Result, TaxonomyError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthMode {
    /// Violations are reported but never block.
    #[default]
    Advisory,
    /// Violations refuse the edit.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthViolation {
    TooShallow,
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthCheck {
    pub allowed: bool,
    pub depth: usize,
    pub violation: Option<DepthViolation>,
    pub suggested_depth: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthPolicy {
    pub min_depth: usize,
    pub max_depth: usize,
    #[serde(alias = "depth_mode")]
    pub mode: DepthMode,
    /// Segment used to pad paths that are too shallow.
    pub padding_segment: String,
}

impl Default for DepthPolicy {
    fn default() -> Self {
        Self {
            min_depth: 1,
            max_depth: 4,
            mode: DepthMode::Advisory,
            padding_segment: "General".to_string(),
        }
    }
}

impl DepthPolicy {
    pub fn new(min_depth: usize, max_depth: usize, mode: DepthMode) -> Result<Self> {
        let policy = Self {
            min_depth,
            max_depth,
            mode,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(TaxonomyError::InvalidOperation(
                "max_depth must be >= 1".to_string(),
            ));
        }
        if self.min_depth > self.max_depth {
            return Err(TaxonomyError::InvalidOperation(format!(
                "min_depth ({}) must not exceed max_depth ({})",
                self.min_depth, self.max_depth
            )));
        }
        if self.padding_segment.trim().is_empty() || self.padding_segment.contains('/') {
            return Err(TaxonomyError::InvalidOperation(
                "padding_segment must be a single non-empty path segment".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks a category depth (root = 0, top-level category = 1).
    #[must_use]
    pub fn check(&self, depth: usize) -> DepthCheck {
        let violation = if depth > self.max_depth {
            Some(DepthViolation::TooDeep)
        } else if depth < self.min_depth {
            Some(DepthViolation::TooShallow)
        } else {
            None
        };
        let suggested_depth = depth.clamp(self.min_depth, self.max_depth);
        let (allowed, reason) = match violation {
            None => (true, format!("depth {depth} is within [{}, {}]", self.min_depth, self.max_depth)),
            Some(kind) => {
                let what = match kind {
                    DepthViolation::TooDeep => "exceeds max_depth",
                    DepthViolation::TooShallow => "is below min_depth",
                };
                let allowed = self.mode == DepthMode::Advisory;
                (
                    allowed,
                    format!(
                        "depth {depth} {what} [{}, {}]; suggested depth {suggested_depth}",
                        self.min_depth, self.max_depth
                    ),
                )
            }
        };
        DepthCheck {
            allowed,
            depth,
            violation,
            suggested_depth,
            reason,
        }
    }

    /// Truncates or pads `segments` so the path lands within the policy.
    #[must_use]
    pub fn snap_segments(&self, segments: &[String]) -> Vec<String> {
        let mut out: Vec<String> = segments.iter().take(self.max_depth).cloned().collect();
        while out.len() < self.min_depth {
            out.push(self.padding_segment.clone());
        }
        out
    }

    #[must_use]
    pub fn snap_path(&self, path: &str) -> String {
        let segments: Vec<String> = path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.snap_segments(&segments).join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn advisory_reports_without_blocking() {
        let policy = DepthPolicy::new(2, 3, DepthMode::Advisory).unwrap();
        let check = policy.check(5);
        assert!(check.allowed);
        assert_eq!(check.violation, Some(DepthViolation::TooDeep));
        assert_eq!(check.suggested_depth, 3);
    }

    #[test]
    fn strict_refuses_and_suggests_a_snap() {
        let policy = DepthPolicy::new(2, 3, DepthMode::Strict).unwrap();
        let shallow = policy.check(1);
        assert!(!shallow.allowed);
        assert_eq!(shallow.violation, Some(DepthViolation::TooShallow));
        assert_eq!(shallow.suggested_depth, 2);
        assert!(policy.check(2).allowed);
    }

    #[test]
    fn snap_path_truncates_and_pads() {
        let policy = DepthPolicy::new(2, 3, DepthMode::Strict).unwrap();
        assert_eq!(policy.snap_path("A/B/C/D"), "A/B/C");
        assert_eq!(policy.snap_path("A"), "A/General");
        assert_eq!(policy.snap_path("A/B"), "A/B");
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(DepthPolicy::new(3, 2, DepthMode::Strict).is_err());
        assert!(DepthPolicy::new(0, 0, DepthMode::Strict).is_err());
    }
}
