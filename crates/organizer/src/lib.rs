//! Safe materialization of a taxonomy on disk.
//!
//! ```text
//! files + assignments + tree
//!          │
//!   OrganizationPlanner ── CollisionResolver
//!          │ OrganizationPlan
//!   SafeFileOrganizer ── organize.lock
//!          │
//!      Executor (Semaphore + JoinSet, per-op timeout)
//!          │ MovementLogEntry
//!     MovementLog (JSON lines) ── undo / redo
//! ```
//!
//! Planning only checks for existing destinations. Execution never
//! overwrites a file unless the plan asked for replacement, and every
//! successful operation is logged with enough prior state to reverse it.

mod collision;
mod config;
mod error;
mod executor;
mod fs_ops;
mod lock;
mod movement_log;
mod plan;
mod report;
mod safe;

pub use collision::{Collision, CollisionReason, CollisionResolver, MAX_COLLISION_ATTEMPTS};
pub use config::{
    CollisionStyle, OrganizeMode, OrganizerConfig, DEFAULT_MAX_CONCURRENT_OPS,
    DEFAULT_MAX_UNDO_BATCHES, DEFAULT_OP_TIMEOUT_MS, DEFAULT_UNCATEGORIZED_FOLDER,
    MAX_CONCURRENT_OPS,
};
pub use error::{FailureKind, OperationFailure, OrganizerError, Result};
pub use executor::{
    CancellationFlag, Executor, OrganizationResult, Phase, Progress, ProgressCallback,
};
pub use lock::{
    acquire_organize_lock, organize_lock_wait_ms_last, organize_lock_wait_ms_max, OrganizeLock,
};
pub use movement_log::{Batch, MovementLog, MovementLogEntry, PriorFileState};
pub use plan::{
    plan_organization, sanitize_segment, OrganizationPlan, OrganizationPlanner, PlanConflict,
    SafeOrganizationOperation,
};
pub use report::{render_plan, render_result};
pub use safe::{BatchSummary, SafeFileOrganizer};
