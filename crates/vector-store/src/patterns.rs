//! Exact-file memory keyed by content checksum.

use crate::embeddings::{ensure_dimension, normalized};
use crate::error::{Result, VectorStoreError};
use crate::persist::{current_unix_ms, read_versioned_json, write_versioned_json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncReadExt;

pub const PATTERN_MEMORY_SCHEMA_VERSION: u32 = 1;

/// Bytes of file content mixed into a checksum.
pub const CHECKSUM_PREFIX_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: u64,
    pub checksum: String,
    pub embedding: Vec<f32>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_label: Option<String>,
    pub confidence: f32,
    pub hit_count: u64,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPatterns {
    next_id: u64,
    patterns: Vec<LearnedPattern>,
}

#[derive(Debug, Clone)]
pub struct PatternMemory {
    dimension: usize,
    next_id: u64,
    by_checksum: BTreeMap<String, LearnedPattern>,
}

impl PatternMemory {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            next_id: 1,
            by_checksum: BTreeMap::new(),
        }
    }

    /// Remembers the first classification of a file. An existing pattern for
    /// the checksum is kept and its label is left alone.
    pub fn record(
        &mut self,
        checksum: &str,
        embedding: &[f32],
        label: &str,
        confidence: f32,
    ) -> Result<&LearnedPattern> {
        ensure_dimension(embedding, self.dimension)?;
        if !self.by_checksum.contains_key(checksum) {
            let pattern = LearnedPattern {
                id: self.next_id,
                checksum: checksum.to_string(),
                embedding: normalized(embedding.to_vec()),
                label: label.to_string(),
                original_label: None,
                confidence: confidence.clamp(0.0, 1.0),
                hit_count: 0,
                created_at_unix_ms: current_unix_ms(),
            };
            self.next_id += 1;
            self.by_checksum.insert(checksum.to_string(), pattern);
        }
        self.by_checksum
            .get(checksum)
            .ok_or_else(|| VectorStoreError::NotFound(checksum.to_string()))
    }

    /// Restores a previously persisted pattern, replacing any with the same checksum.
    pub fn insert(&mut self, mut pattern: LearnedPattern) -> Result<()> {
        ensure_dimension(&pattern.embedding, self.dimension)?;
        pattern.embedding = normalized(pattern.embedding);
        self.next_id = self.next_id.max(pattern.id + 1);
        self.by_checksum.insert(pattern.checksum.clone(), pattern);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, checksum: &str) -> Option<&LearnedPattern> {
        self.by_checksum.get(checksum)
    }

    /// Returns a pattern whose confidence reaches `min_confidence`, counting the hit.
    pub fn lookup(&mut self, checksum: &str, min_confidence: f32) -> Option<LearnedPattern> {
        let pattern = self.by_checksum.get_mut(checksum)?;
        if pattern.confidence < min_confidence {
            return None;
        }
        pattern.hit_count += 1;
        Some(pattern.clone())
    }

    /// Relabels a remembered file after a user correction.
    pub fn correct(&mut self, checksum: &str, new_label: &str) -> Result<()> {
        let pattern = self
            .by_checksum
            .get_mut(checksum)
            .ok_or_else(|| VectorStoreError::NotFound(checksum.to_string()))?;
        if pattern.label != new_label {
            if pattern.original_label.is_none() {
                pattern.original_label = Some(pattern.label.clone());
            }
            pattern.label = new_label.to_string();
        }
        // A human said so.
        pattern.confidence = 1.0;
        Ok(())
    }

    /// Drops patterns below `min_confidence` that never matched again.
    pub fn prune(&mut self, min_confidence: f32) -> usize {
        let before = self.by_checksum.len();
        self.by_checksum
            .retain(|_, p| p.hit_count > 0 || p.confidence >= min_confidence);
        let removed = before - self.by_checksum.len();
        if removed > 0 {
            log::info!("Pruned {removed} learned patterns");
        }
        removed
    }

    /// Removes every pattern labelled `label` or a descendant of it.
    pub fn remove_label(&mut self, label: &str) -> usize {
        let before = self.by_checksum.len();
        self.by_checksum.retain(|_, p| {
            !(p.label == label
                || p
                    .label
                    .strip_prefix(label)
                    .is_some_and(|rest| rest.starts_with('/')))
        });
        before - self.by_checksum.len()
    }

    /// Rewrites labels at or under `old_prefix` to `new_prefix`.
    ///
    /// With an empty `new_prefix`, patterns labelled exactly `old_prefix` are
    /// dropped and descendants move to the top level.
    pub fn relabel_prefix(&mut self, old_prefix: &str, new_prefix: &str) -> usize {
        let mut changed = 0;
        let mut orphaned = Vec::new();
        for pattern in self.by_checksum.values_mut() {
            let rest = if pattern.label == old_prefix {
                Some("")
            } else {
                pattern
                    .label
                    .strip_prefix(old_prefix)
                    .filter(|rest| rest.starts_with('/'))
            };
            let Some(rest) = rest else {
                continue;
            };
            let label = if new_prefix.is_empty() {
                rest.trim_start_matches('/').to_string()
            } else {
                format!("{new_prefix}{rest}")
            };
            if label.is_empty() {
                orphaned.push(pattern.checksum.clone());
            } else {
                pattern.label = label;
            }
            changed += 1;
        }
        for checksum in orphaned {
            self.by_checksum.remove(&checksum);
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = &LearnedPattern> {
        self.by_checksum.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_checksum.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_checksum.is_empty()
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let persisted = PersistedPatterns {
            next_id: self.next_id,
            patterns: self.by_checksum.values().cloned().collect(),
        };
        write_versioned_json(path.as_ref(), PATTERN_MEMORY_SCHEMA_VERSION, &persisted).await
    }

    pub async fn load(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let persisted: PersistedPatterns =
            read_versioned_json(path.as_ref(), "pattern memory", PATTERN_MEMORY_SCHEMA_VERSION)
                .await?;
        let mut memory = Self::new(dimension);
        for pattern in persisted.patterns {
            ensure_dimension(&pattern.embedding, dimension)?;
            memory.next_id = memory.next_id.max(pattern.id + 1);
            memory.by_checksum.insert(pattern.checksum.clone(), pattern);
        }
        memory.next_id = memory.next_id.max(persisted.next_id);
        Ok(memory)
    }
}

/// sha256 over the file size, its name and the first 64 KiB of content.
pub async fn content_checksum(path: &Path, size: u64, filename: &str) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut prefix = Vec::new();
    file.take(CHECKSUM_PREFIX_BYTES)
        .read_to_end(&mut prefix)
        .await?;
    Ok(checksum_of(size, filename, &prefix))
}

#[must_use]
pub fn checksum_of(size: u64, filename: &str, prefix: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(filename.as_bytes());
    hasher.update([0u8]);
    hasher.update(prefix);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn record_keeps_first_label() {
        let mut memory = PatternMemory::new(2);
        memory.record("abc", &[1.0, 0.0], "Docs", 0.8).unwrap();
        let again = memory.record("abc", &[0.0, 1.0], "Images", 0.9).unwrap();
        assert_eq!(again.label, "Docs");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn lookup_counts_hits_above_threshold() {
        let mut memory = PatternMemory::new(2);
        memory.record("abc", &[1.0, 0.0], "Docs", 0.6).unwrap();
        assert!(memory.lookup("abc", 0.7).is_none());
        assert_eq!(memory.get("abc").unwrap().hit_count, 0);
        let hit = memory.lookup("abc", 0.5).unwrap();
        assert_eq!(hit.hit_count, 1);
        assert!(memory.lookup("missing", 0.0).is_none());
    }

    #[test]
    fn correct_remembers_the_original_label() {
        let mut memory = PatternMemory::new(2);
        memory.record("abc", &[1.0, 0.0], "Docs", 0.6).unwrap();
        memory.correct("abc", "Work/Taxes").unwrap();
        memory.correct("abc", "Work/Receipts").unwrap();
        let pattern = memory.get("abc").unwrap();
        assert_eq!(pattern.label, "Work/Receipts");
        assert_eq!(pattern.original_label.as_deref(), Some("Docs"));
        assert_eq!(pattern.confidence, 1.0);
        assert!(memory.correct("nope", "X").is_err());
    }

    #[test]
    fn prune_spares_patterns_that_were_hit() {
        let mut memory = PatternMemory::new(2);
        memory.record("low", &[1.0, 0.0], "A", 0.2).unwrap();
        memory.record("low-hit", &[1.0, 0.0], "A", 0.2).unwrap();
        memory.record("high", &[1.0, 0.0], "A", 0.9).unwrap();
        memory.lookup("low-hit", 0.0);
        assert_eq!(memory.prune(0.5), 1);
        assert!(memory.get("low").is_none());
        assert!(memory.get("low-hit").is_some());
    }

    #[test]
    fn label_cascade_helpers_match_whole_segments() {
        let mut memory = PatternMemory::new(2);
        memory.record("1", &[1.0, 0.0], "Work", 0.9).unwrap();
        memory.record("2", &[1.0, 0.0], "Work/Taxes", 0.9).unwrap();
        memory.record("3", &[1.0, 0.0], "Workshop", 0.9).unwrap();
        assert_eq!(memory.relabel_prefix("Work", "Jobs"), 2);
        assert_eq!(memory.get("2").unwrap().label, "Jobs/Taxes");
        assert_eq!(memory.remove_label("Jobs"), 2);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn relabel_to_root_drops_exact_matches() {
        let mut memory = PatternMemory::new(2);
        memory.record("1", &[1.0, 0.0], "Misc", 0.9).unwrap();
        memory.record("2", &[1.0, 0.0], "Misc/Old", 0.9).unwrap();
        assert_eq!(memory.relabel_prefix("Misc", ""), 2);
        assert!(memory.get("1").is_none());
        assert_eq!(memory.get("2").unwrap().label, "Old");
    }

    #[test]
    fn checksum_depends_on_name_and_content() {
        let a = checksum_of(3, "a.txt", b"abc");
        assert_eq!(a, checksum_of(3, "a.txt", b"abc"));
        assert_ne!(a, checksum_of(3, "b.txt", b"abc"));
        assert_ne!(a, checksum_of(3, "a.txt", b"abd"));
    }

    #[tokio::test]
    async fn content_checksum_reads_only_the_prefix() {
        let tmp = TempDir::new().unwrap();
        let big = tmp.path().join("big.bin");
        let mut bytes = vec![7u8; (CHECKSUM_PREFIX_BYTES as usize) + 10];
        tokio::fs::write(&big, &bytes).await.unwrap();
        let first = content_checksum(&big, bytes.len() as u64, "big.bin").await.unwrap();
        // Changing bytes past the prefix does not change the checksum.
        let last = bytes.len() - 1;
        bytes[last] = 9;
        tokio::fs::write(&big, &bytes).await.unwrap();
        let second = content_checksum(&big, bytes.len() as u64, "big.bin").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("patterns.json");
        let mut memory = PatternMemory::new(2);
        memory.record("abc", &[1.0, 0.0], "Docs", 0.7).unwrap();
        memory.save(&path).await.unwrap();
        let mut loaded = PatternMemory::load(&path, 2).await.unwrap();
        assert_eq!(loaded.get("abc"), memory.get("abc"));
        let next = loaded.record("def", &[0.0, 1.0], "Images", 0.7).unwrap();
        assert_eq!(next.id, 2);
    }
}
