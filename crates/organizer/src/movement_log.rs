//! Append-only JSON-lines record of executed file operations.
//!
//! Every state change is a [`LogRecord`] line; the in-memory undo and redo
//! stacks are a fold over those lines, so reopening the file after a restart
//! reproduces exactly the history that was live when the process stopped.

use crate::error::{OrganizerError, Result};
use crate::plan::SafeOrganizationOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// What the filesystem looked like before an operation ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorFileState {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at_unix_ms: u64,
    /// Directories the operation created, deepest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_dirs: Vec<PathBuf>,
    /// Where a replaced destination file was parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displaced: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementLogEntry {
    pub operation_id: Uuid,
    pub batch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: SafeOrganizationOperation,
    pub prior: PriorFileState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Applied {
        entry: Box<MovementLogEntry>,
    },
    Reverted {
        batch_id: Uuid,
        operation_id: Uuid,
        at: DateTime<Utc>,
    },
    Undone {
        batch_id: Uuid,
        at: DateTime<Utc>,
    },
    Redone {
        batch_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// One `execute` call's worth of operations, undone and redone as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Operations currently in effect, in application order.
    pub applied: Vec<MovementLogEntry>,
    /// Operations already reverted, available for redo.
    pub reverted: Vec<MovementLogEntry>,
}

impl Batch {
    fn new(id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            applied: Vec::new(),
            reverted: Vec::new(),
        }
    }

    /// Reverted operations in their original application order.
    #[must_use]
    pub fn redo_order(&self) -> Vec<&MovementLogEntry> {
        let mut entries: Vec<_> = self.reverted.iter().collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }
}

#[derive(Debug)]
pub struct MovementLog {
    path: Option<PathBuf>,
    max_batches: usize,
    undo: VecDeque<Batch>,
    redo: Vec<Batch>,
    dropped_batches: usize,
}

impl MovementLog {
    /// A log that is never written to disk.
    #[must_use]
    pub fn in_memory(max_batches: usize) -> Self {
        Self {
            path: None,
            max_batches: max_batches.max(1),
            undo: VecDeque::new(),
            redo: Vec::new(),
            dropped_batches: 0,
        }
    }

    /// Replays the file at `path` if it exists. Torn or unreadable lines are
    /// skipped and the file is rewritten without them.
    pub async fn open(path: impl Into<PathBuf>, max_batches: usize) -> Result<Self> {
        let path = path.into();
        let mut history = Self::in_memory(max_batches);
        let mut needs_compaction = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                for (lineno, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let replayed = serde_json::from_str::<LogRecord>(line)
                        .map_err(OrganizerError::from)
                        .and_then(|record| history.apply(record));
                    if let Err(err) = replayed {
                        log::warn!(
                            "skipping movement log line {} in {}: {err}",
                            lineno + 1,
                            path.display()
                        );
                        needs_compaction = true;
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        needs_compaction |= history.dropped_batches > 0;
        history.path = Some(path);
        if needs_compaction {
            history.compact().await?;
        }
        log::debug!(
            "movement log loaded: {} undoable, {} redoable batches",
            history.undo.len(),
            history.redo.len()
        );
        Ok(history)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    /// The batch `undo` would act on.
    #[must_use]
    pub fn last_batch(&self) -> Option<&Batch> {
        self.undo.back()
    }

    /// The batch `redo` would act on.
    #[must_use]
    pub fn next_redo(&self) -> Option<&Batch> {
        self.redo.last()
    }

    /// Undoable batches, oldest first.
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.undo.iter()
    }

    /// Every operation currently in effect, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &MovementLogEntry> {
        self.undo.iter().flat_map(|b| b.applied.iter())
    }

    pub async fn append(&mut self, entry: MovementLogEntry) -> Result<()> {
        self.record(LogRecord::Applied {
            entry: Box::new(entry),
        })
        .await
    }

    pub async fn mark_reverted(&mut self, batch_id: Uuid, operation_id: Uuid) -> Result<()> {
        self.record(LogRecord::Reverted {
            batch_id,
            operation_id,
            at: Utc::now(),
        })
        .await
    }

    pub async fn mark_undone(&mut self, batch_id: Uuid) -> Result<()> {
        self.record(LogRecord::Undone {
            batch_id,
            at: Utc::now(),
        })
        .await
    }

    pub async fn mark_redone(&mut self, batch_id: Uuid) -> Result<()> {
        self.record(LogRecord::Redone {
            batch_id,
            at: Utc::now(),
        })
        .await
    }

    async fn record(&mut self, record: LogRecord) -> Result<()> {
        // A refused record is never written.
        self.check(&record)?;
        if let Some(path) = &self.path {
            append_line(path, &record).await?;
        }
        self.apply(record)?;
        if self.dropped_batches > 0 && self.path.is_some() {
            self.compact().await?;
        }
        Ok(())
    }

    fn check(&self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Applied { .. } => Ok(()),
            LogRecord::Reverted {
                batch_id,
                operation_id,
                ..
            } => {
                let known = self
                    .undo
                    .iter()
                    .find(|b| b.id == *batch_id)
                    .is_some_and(|b| b.applied.iter().any(|e| e.operation_id == *operation_id));
                if known {
                    Ok(())
                } else {
                    Err(OrganizerError::InvalidOperation(format!(
                        "operation {operation_id} is not in effect in batch {batch_id}"
                    )))
                }
            }
            LogRecord::Undone { batch_id, .. } => match self.undo.back() {
                Some(top) if top.id == *batch_id => Ok(()),
                _ => Err(OrganizerError::InvalidOperation(format!(
                    "batch {batch_id} is not the most recent undoable batch"
                ))),
            },
            LogRecord::Redone { batch_id, .. } => match self.redo.last() {
                Some(top) if top.id == *batch_id => Ok(()),
                _ => Err(OrganizerError::InvalidOperation(format!(
                    "batch {batch_id} is not the next redoable batch"
                ))),
            },
        }
    }

    fn apply(&mut self, record: LogRecord) -> Result<()> {
        self.check(&record)?;
        match record {
            LogRecord::Applied { entry } => {
                let entry = *entry;
                let continues = self
                    .undo
                    .back()
                    .is_some_and(|top| top.id == entry.batch_id);
                if !continues {
                    self.redo.clear();
                    self.undo.push_back(Batch::new(entry.batch_id, entry.timestamp));
                    while self.undo.len() > self.max_batches {
                        self.undo.pop_front();
                        self.dropped_batches += 1;
                    }
                }
                let batch = self
                    .undo
                    .back_mut()
                    .ok_or_else(|| OrganizerError::Other("empty undo stack".to_string()))?;
                batch.reverted.retain(|e| e.operation_id != entry.operation_id);
                batch.applied.push(entry);
            }
            LogRecord::Reverted {
                batch_id,
                operation_id,
                ..
            } => {
                if let Some(batch) = self.undo.iter_mut().find(|b| b.id == batch_id) {
                    if let Some(pos) = batch
                        .applied
                        .iter()
                        .position(|e| e.operation_id == operation_id)
                    {
                        let entry = batch.applied.remove(pos);
                        batch.reverted.push(entry);
                    }
                }
            }
            LogRecord::Undone { .. } => {
                if let Some(batch) = self.undo.pop_back() {
                    self.redo.push(batch);
                }
            }
            LogRecord::Redone { .. } => {
                if let Some(batch) = self.redo.pop() {
                    self.undo.push_back(batch);
                }
            }
        }
        Ok(())
    }

    /// Rewrites the file so it holds only the live history.
    pub async fn compact(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dropped_batches = 0;
            return Ok(());
        };
        let mut lines = Vec::new();
        let mut push = |record: &LogRecord| -> Result<()> {
            lines.push(serde_json::to_string(record)?);
            Ok(())
        };
        let write_batch = |batch: &Batch, push: &mut dyn FnMut(&LogRecord) -> Result<()>| {
            let mut all: Vec<&MovementLogEntry> =
                batch.applied.iter().chain(batch.reverted.iter()).collect();
            all.sort_by_key(|e| e.timestamp);
            for entry in all {
                push(&LogRecord::Applied {
                    entry: Box::new(entry.clone()),
                })?;
            }
            for entry in &batch.reverted {
                push(&LogRecord::Reverted {
                    batch_id: batch.id,
                    operation_id: entry.operation_id,
                    at: entry.timestamp,
                })?;
            }
            Ok::<(), OrganizerError>(())
        };
        for batch in &self.undo {
            write_batch(batch, &mut push)?;
        }
        for batch in self.redo.iter().rev() {
            write_batch(batch, &mut push)?;
        }
        for batch in &self.redo {
            push(&LogRecord::Undone {
                batch_id: batch.id,
                at: batch.started_at,
            })?;
        }

        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        self.dropped_batches = 0;
        Ok(())
    }
}

async fn append_line(path: &Path, record: &LogRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.sync_data().await?;
    Ok(())
}
