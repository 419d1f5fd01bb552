//! Bounded-concurrency execution of an [`OrganizationPlan`].

use crate::config::OrganizerConfig;
use crate::error::{FailureKind, OperationFailure, OrganizerError, Result};
use crate::fs_ops::{self, OpResult, OpSettings};
use crate::movement_log::{MovementLog, MovementLogEntry, PriorFileState};
use crate::plan::{OrganizationPlan, SafeOrganizationOperation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use uuid::Uuid;

const DISPLACED_DIR_NAME: &str = "displaced";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Executing,
    Undoing,
    Redoing,
    Finished,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub current_file: PathBuf,
    pub phase: Phase,
}

/// Invoked from worker tasks; must tolerate concurrent calls.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Cooperative stop signal. In-flight operations finish; nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub success_count: usize,
    pub failure_count: usize,
    pub collision_count: usize,
    pub skipped_count: usize,
    pub cancelled: bool,
    pub failures: Vec<OperationFailure>,
    pub duration_ms: u64,
    /// Whether the successful operations were recorded for undo.
    pub logged: bool,
}

impl OrganizationResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failure_count == 0
    }

    fn push_failure(&mut self, failure: OperationFailure) {
        log::warn!(
            "{} -> {}: {}",
            failure.source.display(),
            failure.destination.display(),
            failure.reason
        );
        self.failure_count += 1;
        self.failures.push(failure);
    }
}

struct TaskOutcome {
    collided: bool,
    result: std::result::Result<(), OperationFailure>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    config: OrganizerConfig,
}

impl Executor {
    pub fn new(config: OrganizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs every operation of `plan` as one batch.
    ///
    /// Per-file failures land in the result; only a broken worker pool
    /// fails the call itself.
    pub async fn execute(
        &self,
        plan: &OrganizationPlan,
        batch_id: Uuid,
        history: Option<Arc<Mutex<MovementLog>>>,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationFlag,
    ) -> Result<OrganizationResult> {
        let operations = plan
            .operations
            .iter()
            .cloned()
            .map(|op| (Uuid::new_v4(), op))
            .collect();
        let mut result = self
            .run(
                operations,
                plan.output_root.clone(),
                batch_id,
                history,
                on_progress,
                cancel,
                Phase::Executing,
            )
            .await?;
        result.skipped_count += plan.unchanged.len();
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        &self,
        operations: Vec<(Uuid, SafeOrganizationOperation)>,
        output_root: PathBuf,
        batch_id: Uuid,
        history: Option<Arc<Mutex<MovementLog>>>,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationFlag,
        phase: Phase,
    ) -> Result<OrganizationResult> {
        let started = Instant::now();
        let total = operations.len();
        let mut result = OrganizationResult {
            batch_id: Some(batch_id),
            logged: history.is_some(),
            ..OrganizationResult::default()
        };
        if total == 0 {
            return Ok(result);
        }

        let settings = Arc::new(OpSettings {
            no_delete: self.config.no_delete,
            displaced_dir: sift_vector_store::paths::state_dir_for_root(&output_root)
                .join(DISPLACED_DIR_NAME),
        });
        let parallelism = self.config.max_concurrent_ops.max(1).min(total);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let completed = Arc::new(AtomicUsize::new(0));
        let timeout = self.config.op_timeout();
        let timeout_ms = self.config.op_timeout_ms;
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        log::info!("{phase:?}: {total} operations with {parallelism} workers");

        let mut scheduled = 0usize;
        for (operation_id, op) in operations {
            if cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| OrganizerError::Other("organizer worker pool closed".to_string()))?;
            if cancel.is_cancelled() {
                break;
            }
            scheduled += 1;
            let settings = settings.clone();
            let history = history.clone();
            let on_progress = on_progress.clone();
            let completed = completed.clone();

            join_set.spawn(async move {
                let _permit = permit;
                log::debug!("{} -> {}", op.source.display(), op.destination.display());
                let task = tokio::spawn({
                    let op = op.clone();
                    let settings = settings.clone();
                    async move { fs_ops::apply_operation(&op, operation_id, &settings).await }
                });
                let deadline = await_with_deadline(task, timeout, &op.source, &op.destination).await;
                let entry = |prior: PriorFileState| MovementLogEntry {
                    operation_id,
                    batch_id,
                    timestamp: Utc::now(),
                    operation: op.clone(),
                    prior,
                };

                let result = match deadline {
                    Deadline::Met(Ok(prior)) => match history {
                        Some(history) => {
                            let entry = entry(prior);
                            let appended = history.lock().await.append(entry.clone()).await;
                            match appended {
                                Ok(()) => Ok(()),
                                Err(err) => Err(roll_back_unlogged(&entry, &err).await),
                            }
                        }
                        None => Ok(()),
                    },
                    Deadline::Met(Err(failure)) => Err(failure),
                    Deadline::Missed(Ok(prior)) => {
                        Err(settle_late(&entry(prior), history.as_ref(), timeout_ms).await)
                    }
                    Deadline::Missed(Err(cause)) => Err(OperationFailure::new(
                        &op.source,
                        &op.destination,
                        FailureKind::Timeout,
                        format!(
                            "operation exceeded {timeout_ms} ms and then failed: {}",
                            cause.reason
                        ),
                    )),
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = &on_progress {
                    callback(Progress {
                        completed: done,
                        total,
                        current_file: op.source.clone(),
                        phase,
                    });
                }
                TaskOutcome {
                    collided: op.collision.is_some(),
                    result,
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(TaskOutcome {
                    collided,
                    result: Ok(()),
                }) => {
                    result.success_count += 1;
                    if collided {
                        result.collision_count += 1;
                    }
                }
                Ok(TaskOutcome {
                    result: Err(failure),
                    ..
                }) => result.push_failure(failure),
                Err(err) => result.push_failure(OperationFailure::new(
                    PathBuf::new(),
                    PathBuf::new(),
                    FailureKind::Other,
                    format!("worker task failed: {err}"),
                )),
            }
        }

        result.skipped_count = total - scheduled;
        result.cancelled = scheduled < total;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(callback) = &on_progress {
            callback(Progress {
                completed: completed.load(Ordering::SeqCst),
                total,
                current_file: PathBuf::new(),
                phase: if result.cancelled {
                    Phase::Cancelled
                } else {
                    Phase::Finished
                },
            });
        }
        log::info!(
            "{phase:?} done: {} ok, {} failed, {} skipped in {} ms",
            result.success_count,
            result.failure_count,
            result.skipped_count,
            result.duration_ms
        );
        Ok(result)
    }
}

/// How a spawned filesystem task ended relative to its deadline.
#[derive(Debug)]
pub(crate) enum Deadline<T> {
    Met(OpResult<T>),
    /// The deadline passed and the task was still awaited to completion.
    Missed(OpResult<T>),
}

/// Waits up to `timeout` for `task`, then keeps waiting. The task is never
/// dropped mid-flight, so its effect on disk is always known to the caller.
pub(crate) async fn await_with_deadline<T>(
    mut task: JoinHandle<OpResult<T>>,
    timeout: Duration,
    source: &Path,
    destination: &Path,
) -> Deadline<T> {
    let joined = |joined: std::result::Result<OpResult<T>, JoinError>| {
        joined.unwrap_or_else(|err| {
            Err(OperationFailure::new(
                source,
                destination,
                FailureKind::Other,
                format!("filesystem task failed: {err}"),
            ))
        })
    };
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(result) => Deadline::Met(joined(result)),
        Err(_) => {
            log::warn!(
                "{} -> {} passed its deadline; waiting for it to settle",
                source.display(),
                destination.display()
            );
            Deadline::Missed(joined(task.await))
        }
    }
}

/// A late success is rolled back so the timeout report stays true. When the
/// rollback fails the change is logged instead, keeping it reachable by undo.
async fn settle_late(
    entry: &MovementLogEntry,
    history: Option<&Arc<Mutex<MovementLog>>>,
    timeout_ms: u64,
) -> OperationFailure {
    let op = &entry.operation;
    let failure = |reason: String| {
        OperationFailure::new(&op.source, &op.destination, FailureKind::Timeout, reason)
    };
    let rollback = match fs_ops::revert_entry(entry).await {
        Ok(()) => {
            return failure(format!(
                "operation exceeded {timeout_ms} ms and was rolled back"
            ))
        }
        Err(rollback) => rollback,
    };
    let Some(history) = history else {
        return failure(format!(
            "operation exceeded {timeout_ms} ms, finished late and could not be rolled back: {}",
            rollback.reason
        ));
    };
    match history.lock().await.append(entry.clone()).await {
        Ok(()) => failure(format!(
            "operation exceeded {timeout_ms} ms and finished late; recorded for undo ({})",
            rollback.reason
        )),
        Err(err) => failure(format!(
            "operation exceeded {timeout_ms} ms, finished late and is neither \
             rolled back ({}) nor logged ({err})",
            rollback.reason
        )),
    }
}

/// An operation whose log append failed cannot be undone later, so it is
/// reverted immediately.
async fn roll_back_unlogged(entry: &MovementLogEntry, err: &OrganizerError) -> OperationFailure {
    let op = &entry.operation;
    match fs_ops::revert_entry(entry).await {
        Ok(()) => OperationFailure::new(
            &op.source,
            &op.destination,
            FailureKind::Other,
            format!("movement log write failed, operation rolled back: {err}"),
        ),
        Err(rollback) => OperationFailure::new(
            &op.source,
            &op.destination,
            rollback.kind,
            format!(
                "movement log write failed ({err}) and rollback failed: {}",
                rollback.reason
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrganizeMode;
    use sift_protocol::FileId;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn plan_for(tmp: &TempDir, names: &[&str]) -> OrganizationPlan {
        let out = tmp.path().join("out");
        let operations = names
            .iter()
            .map(|name| {
                let source = tmp.path().join(name);
                std::fs::write(&source, name.as_bytes()).unwrap();
                SafeOrganizationOperation {
                    file_id: FileId::new(source.to_string_lossy()),
                    source,
                    destination: out.join("Docs").join(name),
                    mode: OrganizeMode::Move,
                    category: Some("Docs".to_string()),
                    confidence: 0.9,
                    collision: None,
                    replace: false,
                }
            })
            .collect();
        OrganizationPlan {
            output_root: out,
            mode: OrganizeMode::Move,
            created_at: Utc::now(),
            operations,
            conflicts: Vec::new(),
            unchanged: Vec::new(),
        }
    }

    #[tokio::test]
    async fn failures_are_collected_and_the_batch_continues() {
        let tmp = TempDir::new().unwrap();
        let mut plan = plan_for(&tmp, &["a.txt", "b.txt", "c.txt"]);
        std::fs::remove_file(&plan.operations[1].source).unwrap();
        plan.operations[1].source = tmp.path().join("missing.txt");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p: Progress| {
            sink.lock().unwrap().push(p);
        });
        let log = Arc::new(Mutex::new(MovementLog::in_memory(5)));
        let executor = Executor::new(OrganizerConfig::default()).unwrap();
        let result = executor
            .execute(
                &plan,
                Uuid::new_v4(),
                Some(log.clone()),
                Some(callback),
                &CancellationFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.failures[0].kind, FailureKind::NotFound);
        assert!(!result.cancelled);
        assert_eq!(log.lock().await.entries().count(), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last().unwrap().phase, Phase::Finished);
    }

    #[tokio::test]
    async fn a_missed_deadline_still_waits_for_the_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, OperationFailure>(7)
        });
        let outcome =
            await_with_deadline(task, Duration::from_millis(1), Path::new("a"), Path::new("b"))
                .await;
        assert!(matches!(outcome, Deadline::Missed(Ok(7))));
        assert!(finished.load(Ordering::SeqCst));

        let quick = tokio::spawn(async { Ok::<_, OperationFailure>(1) });
        let outcome =
            await_with_deadline(quick, Duration::from_secs(5), Path::new("a"), Path::new("b"))
                .await;
        assert!(matches!(outcome, Deadline::Met(Ok(1))));
    }

    #[tokio::test]
    async fn late_success_is_rolled_back_and_reported_as_timeout() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_for(&tmp, &["late.txt"]);
        let op = plan.operations[0].clone();
        let settings = OpSettings {
            no_delete: false,
            displaced_dir: tmp.path().join("displaced"),
        };
        let prior = fs_ops::apply_operation(&op, Uuid::new_v4(), &settings)
            .await
            .unwrap();
        assert!(op.destination.exists());
        let entry = MovementLogEntry {
            operation_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: op.clone(),
            prior,
        };
        let log = Arc::new(Mutex::new(MovementLog::in_memory(5)));

        let failure = settle_late(&entry, Some(&log), 10).await;
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.retryable);
        assert!(failure.reason.contains("rolled back"));
        assert!(op.source.exists());
        assert!(!op.destination.exists());
        assert_eq!(log.lock().await.entries().count(), 0);
    }

    #[tokio::test]
    async fn late_success_that_cannot_be_rolled_back_is_logged() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_for(&tmp, &["stuck.txt"]);
        let op = plan.operations[0].clone();
        let settings = OpSettings {
            no_delete: false,
            displaced_dir: tmp.path().join("displaced"),
        };
        let prior = fs_ops::apply_operation(&op, Uuid::new_v4(), &settings)
            .await
            .unwrap();
        std::fs::write(&op.source, b"someone else").unwrap();
        let entry = MovementLogEntry {
            operation_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: op.clone(),
            prior,
        };
        let log = Arc::new(Mutex::new(MovementLog::in_memory(5)));

        let failure = settle_late(&entry, Some(&log), 10).await;
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.reason.contains("recorded for undo"));
        assert!(op.destination.exists());
        assert_eq!(log.lock().await.entries().count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_schedules_nothing() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_for(&tmp, &["a.txt", "b.txt"]);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let executor = Executor::new(OrganizerConfig::default()).unwrap();
        let result = executor
            .execute(&plan, Uuid::new_v4(), None, None, &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.skipped_count, 2);
        assert_eq!(result.success_count, 0);
        assert!(plan.operations[0].source.exists());
    }

    #[tokio::test]
    async fn cancelling_mid_batch_lets_in_flight_work_finish() {
        let tmp = TempDir::new().unwrap();
        let names: Vec<String> = (0..20).map(|i| format!("f{i}.txt")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let plan = plan_for(&tmp, &refs);
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        let callback: ProgressCallback = Arc::new(move |p: Progress| {
            if p.completed >= 3 {
                trigger.cancel();
            }
        });
        let config = OrganizerConfig {
            max_concurrent_ops: 1,
            ..OrganizerConfig::default()
        };
        let log = Arc::new(Mutex::new(MovementLog::in_memory(5)));
        let result = Executor::new(config)
            .unwrap()
            .execute(&plan, Uuid::new_v4(), Some(log.clone()), Some(callback), &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(result.success_count >= 3);
        assert_eq!(result.success_count + result.skipped_count, 20);
        assert_eq!(log.lock().await.entries().count(), result.success_count);
    }
}
