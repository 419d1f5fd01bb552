//! Deterministic renaming around occupied destinations.

use crate::config::CollisionStyle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on rename attempts before giving up on a destination.
pub const MAX_COLLISION_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionReason {
    /// A file already sits at the requested destination.
    ExistingFile,
    /// Another operation in the same plan claimed the destination first.
    PlannedTwice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collision {
    pub requested: PathBuf,
    pub resolved: PathBuf,
    pub reason: CollisionReason,
    pub attempt: u32,
}

/// Produces candidate names for one plan. The timestamp is fixed at
/// construction so the same plan input always resolves to the same names.
#[derive(Debug, Clone)]
pub struct CollisionResolver {
    style: CollisionStyle,
    stamp: String,
}

impl CollisionResolver {
    #[must_use]
    pub fn new(style: CollisionStyle, at: DateTime<Utc>) -> Self {
        Self {
            style,
            stamp: at.format("%Y%m%d-%H%M%S").to_string(),
        }
    }

    #[must_use]
    pub fn style(&self) -> CollisionStyle {
        self.style
    }

    /// The `attempt`-th alternative for `filename` (attempt starts at 1).
    #[must_use]
    pub fn candidate_name(&self, filename: &str, attempt: u32) -> String {
        let (stem, ext) = split_filename(filename);
        let suffix = match ext {
            Some(ext) => format!(".{ext}"),
            None => String::new(),
        };
        match self.style {
            CollisionStyle::MacOs => format!("{stem} ({attempt}){suffix}"),
            CollisionStyle::Numbered => format!("{stem}-{attempt}{suffix}"),
            CollisionStyle::Timestamped if attempt <= 1 => {
                format!("{stem}_{}{suffix}", self.stamp)
            }
            CollisionStyle::Timestamped => format!("{stem}_{}-{attempt}{suffix}", self.stamp),
        }
    }

    /// Walks candidates until `occupied` reports a free path.
    ///
    /// Returns `None` only when every attempt up to [`MAX_COLLISION_ATTEMPTS`]
    /// is taken.
    pub fn resolve(
        &self,
        requested: &Path,
        mut occupied: impl FnMut(&Path) -> Option<CollisionReason>,
    ) -> Option<(PathBuf, Option<Collision>)> {
        let Some(first_reason) = occupied(requested) else {
            return Some((requested.to_path_buf(), None));
        };
        let parent = requested.parent().unwrap_or_else(|| Path::new(""));
        let filename = requested
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        for attempt in 1..=MAX_COLLISION_ATTEMPTS {
            let candidate = parent.join(self.candidate_name(&filename, attempt));
            if occupied(&candidate).is_none() {
                return Some((
                    candidate.clone(),
                    Some(Collision {
                        requested: requested.to_path_buf(),
                        resolved: candidate,
                        reason: first_reason,
                        attempt,
                    }),
                ));
            }
        }
        None
    }
}

/// Splits on the last dot. Dotfiles such as `.bashrc` have no extension.
fn split_filename(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(0) | None => (filename, None),
        Some(idx) if idx + 1 == filename.len() => (filename, None),
        Some(idx) => (&filename[..idx], Some(&filename[idx + 1..])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
    }

    #[test]
    fn candidate_names_per_style() {
        let mac = CollisionResolver::new(CollisionStyle::MacOs, at());
        assert_eq!(mac.candidate_name("report.pdf", 1), "report (1).pdf");
        let numbered = CollisionResolver::new(CollisionStyle::Numbered, at());
        assert_eq!(numbered.candidate_name("report.pdf", 2), "report-2.pdf");
        let stamped = CollisionResolver::new(CollisionStyle::Timestamped, at());
        assert_eq!(
            stamped.candidate_name("report.pdf", 1),
            "report_20240301-101500.pdf"
        );
        assert_eq!(
            stamped.candidate_name("report.pdf", 2),
            "report_20240301-101500-2.pdf"
        );
        assert_eq!(mac.candidate_name(".bashrc", 1), ".bashrc (1)");
        assert_eq!(mac.candidate_name("archive.tar.gz", 1), "archive.tar (1).gz");
    }

    #[test]
    fn resolve_skips_every_taken_candidate() {
        let resolver = CollisionResolver::new(CollisionStyle::MacOs, at());
        let taken: HashSet<PathBuf> = [
            PathBuf::from("/out/a.txt"),
            PathBuf::from("/out/a (1).txt"),
            PathBuf::from("/out/a (2).txt"),
        ]
        .into_iter()
        .collect();
        let (path, collision) = resolver
            .resolve(Path::new("/out/a.txt"), |p| {
                taken.contains(p).then_some(CollisionReason::ExistingFile)
            })
            .unwrap();
        assert_eq!(path, PathBuf::from("/out/a (3).txt"));
        let collision = collision.unwrap();
        assert_eq!(collision.attempt, 3);
        assert_eq!(collision.reason, CollisionReason::ExistingFile);
    }

    #[test]
    fn free_path_is_returned_unchanged() {
        let resolver = CollisionResolver::new(CollisionStyle::Numbered, at());
        let (path, collision) = resolver.resolve(Path::new("/out/b.txt"), |_| None).unwrap();
        assert_eq!(path, PathBuf::from("/out/b.txt"));
        assert!(collision.is_none());
    }
}
