//! Execution front end with undo and redo over one output root.

use crate::config::OrganizerConfig;
use crate::error::{FailureKind, OperationFailure, OrganizerError, Result};
use crate::executor::{
    await_with_deadline, CancellationFlag, Deadline, Executor, OrganizationResult, Phase,
    ProgressCallback,
};
use crate::fs_ops;
use crate::lock::acquire_organize_lock;
use crate::movement_log::{Batch, MovementLog};
use crate::plan::OrganizationPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_vector_store::paths::movement_log_path_for_root;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Summary of one undoable batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub operations: usize,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.id,
            started_at: batch.started_at,
            operations: batch.applied.len(),
        }
    }
}

/// Runs plans against one output root and keeps the history needed to
/// reverse them.
///
/// Execute, undo and redo exclude each other in-process through a mutex and
/// across processes through the lock file in the state directory.
#[derive(Debug)]
pub struct SafeFileOrganizer {
    output_root: PathBuf,
    config: OrganizerConfig,
    history: Arc<Mutex<MovementLog>>,
    exclusive: Mutex<()>,
    undo_enabled: AtomicBool,
    last_run_logged: AtomicBool,
    lock_wait: Duration,
}

impl SafeFileOrganizer {
    /// History lives only as long as this value.
    pub fn in_memory(output_root: impl Into<PathBuf>, config: OrganizerConfig) -> Result<Self> {
        config.validate()?;
        let history = MovementLog::in_memory(config.max_undo_batches);
        Ok(Self::with_history(output_root.into(), config, history))
    }

    /// Reloads the movement log from the output root's state directory.
    pub async fn open(output_root: impl Into<PathBuf>, config: OrganizerConfig) -> Result<Self> {
        config.validate()?;
        let output_root = output_root.into();
        let history = MovementLog::open(
            movement_log_path_for_root(&output_root),
            config.max_undo_batches,
        )
        .await?;
        Ok(Self::with_history(output_root, config, history))
    }

    fn with_history(output_root: PathBuf, config: OrganizerConfig, history: MovementLog) -> Self {
        let undo_enabled = config.enable_undo;
        Self {
            output_root,
            config,
            history: Arc::new(Mutex::new(history)),
            exclusive: Mutex::new(()),
            undo_enabled: AtomicBool::new(undo_enabled),
            last_run_logged: AtomicBool::new(undo_enabled),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// How long to wait for another process holding the output root.
    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    #[must_use]
    pub fn config(&self) -> &OrganizerConfig {
        &self.config
    }

    /// Turns movement logging on or off for subsequent runs.
    pub fn set_undo_enabled(&self, enabled: bool) {
        self.undo_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn execute(
        &self,
        plan: &OrganizationPlan,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationFlag,
    ) -> Result<OrganizationResult> {
        if plan.output_root != self.output_root {
            return Err(OrganizerError::InvalidOperation(format!(
                "plan targets {} but this organizer owns {}",
                plan.output_root.display(),
                self.output_root.display()
            )));
        }
        let _exclusive = self.claim()?;
        let _lock = acquire_organize_lock(&self.output_root, self.lock_wait).await?;

        let logging = self.undo_enabled.load(Ordering::SeqCst);
        let history = logging.then(|| self.history.clone());
        let executor = Executor::new(self.config.clone())?;
        let result = executor
            .execute(plan, Uuid::new_v4(), history, on_progress, cancel)
            .await?;
        if result.success_count > 0 {
            self.last_run_logged.store(logging, Ordering::SeqCst);
        }
        Ok(result)
    }

    /// Reverses the most recent batch, newest operation first.
    ///
    /// Operations that cannot be reverted stay in the log and are reported;
    /// calling again retries only those.
    pub async fn undo_last_operation(&self) -> Result<OrganizationResult> {
        if !self.undo_enabled.load(Ordering::SeqCst) || !self.last_run_logged.load(Ordering::SeqCst)
        {
            return Err(OrganizerError::UndoNotEnabled);
        }
        let _exclusive = self.claim()?;
        let _lock = acquire_organize_lock(&self.output_root, self.lock_wait).await?;
        let started = Instant::now();

        let mut history = self.history.lock().await;
        let batch = history
            .last_batch()
            .cloned()
            .ok_or(OrganizerError::NothingToUndo)?;
        log::info!(
            "undoing batch {} ({} operations)",
            batch.id,
            batch.applied.len()
        );

        let mut result = OrganizationResult {
            batch_id: Some(batch.id),
            logged: true,
            ..OrganizationResult::default()
        };
        let timeout = self.config.op_timeout();
        for entry in batch.applied.iter().rev() {
            let task = tokio::spawn({
                let entry = entry.clone();
                async move { fs_ops::revert_entry(&entry).await }
            });
            let destination = &entry.operation.destination;
            let reverted =
                match await_with_deadline(task, timeout, destination, &entry.prior.path).await {
                    Deadline::Met(reverted) => reverted,
                    Deadline::Missed(Ok(())) => {
                        log::warn!(
                            "undo of {} finished after {} ms",
                            destination.display(),
                            self.config.op_timeout_ms
                        );
                        Ok(())
                    }
                    Deadline::Missed(Err(cause)) => Err(OperationFailure::new(
                        destination,
                        &entry.prior.path,
                        FailureKind::Timeout,
                        format!(
                            "undo exceeded {} ms and then failed: {}",
                            self.config.op_timeout_ms, cause.reason
                        ),
                    )),
                };
            match reverted {
                Ok(()) => {
                    history.mark_reverted(batch.id, entry.operation_id).await?;
                    result.success_count += 1;
                }
                Err(failure) => {
                    log::warn!("undo {}: {}", failure.source.display(), failure.reason);
                    result.failure_count += 1;
                    result.failures.push(failure);
                }
            }
        }
        if result.failure_count == 0 {
            history.mark_undone(batch.id).await?;
        }
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log::info!(
            "{:?} batch {}: {} restored, {} failed",
            Phase::Undoing,
            batch.id,
            result.success_count,
            result.failure_count
        );
        Ok(result)
    }

    /// Re-applies the most recently undone batch under its original id.
    pub async fn redo(&self) -> Result<OrganizationResult> {
        if !self.undo_enabled.load(Ordering::SeqCst) {
            return Err(OrganizerError::UndoNotEnabled);
        }
        let _exclusive = self.claim()?;
        let _lock = acquire_organize_lock(&self.output_root, self.lock_wait).await?;

        let batch = {
            let mut history = self.history.lock().await;
            let batch = history
                .next_redo()
                .cloned()
                .ok_or(OrganizerError::NothingToRedo)?;
            history.mark_redone(batch.id).await?;
            batch
        };
        let operations = batch
            .redo_order()
            .into_iter()
            .map(|entry| (entry.operation_id, entry.operation.clone()))
            .collect();
        let executor = Executor::new(self.config.clone())?;
        let result = executor
            .run(
                operations,
                self.output_root.clone(),
                batch.id,
                Some(self.history.clone()),
                None,
                &CancellationFlag::new(),
                Phase::Redoing,
            )
            .await?;

        let mut history = self.history.lock().await;
        let nothing_applied = history
            .last_batch()
            .is_some_and(|top| top.id == batch.id && top.applied.is_empty());
        if nothing_applied {
            history.mark_undone(batch.id).await?;
        }
        if result.success_count > 0 {
            self.last_run_logged.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    pub async fn can_undo(&self) -> bool {
        self.undo_enabled.load(Ordering::SeqCst)
            && self.last_run_logged.load(Ordering::SeqCst)
            && self.history.lock().await.undo_depth() > 0
    }

    pub async fn can_redo(&self) -> bool {
        self.undo_enabled.load(Ordering::SeqCst) && self.history.lock().await.redo_depth() > 0
    }

    /// Undoable batches, newest first.
    pub async fn history(&self) -> Vec<BatchSummary> {
        let history = self.history.lock().await;
        let mut batches: Vec<BatchSummary> = history.batches().map(BatchSummary::from).collect();
        batches.reverse();
        batches
    }

    /// Shared handle to the movement log.
    #[must_use]
    pub fn movement_log(&self) -> Arc<Mutex<MovementLog>> {
        self.history.clone()
    }

    fn claim(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.exclusive.try_lock().map_err(|_| {
            OrganizerError::Busy(format!(
                "an execute, undo or redo is already running on {}",
                self.output_root.display()
            ))
        })
    }
}
