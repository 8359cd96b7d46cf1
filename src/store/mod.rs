//! Governance storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing and single-process use)
//! - `sqlite`: SQLite database shared by every process of a deployment
//!
//! The store is the source of truth for tasks, their blocker edges and
//! review records. Every mutation of a task's `blocked_by` set or a review's
//! verdict happens inside one write transaction.

#[cfg(test)]
pub(crate) mod faulty;
mod memory;
mod sqlite;

pub use memory::InMemoryGovernanceStore;
pub use sqlite::{SqliteGovernanceStore, DB_FILE_NAME};

use crate::task::{
    FindingId, NewTask, NewTrackedFinding, ReviewId, ReviewRecord, ReviewStatus, ReviewType,
    ReviewVerdict, Task, TaskId, TaskStatus, TrackedFinding, Verdict,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Subject prefix of review tasks created by the pairing step.
pub const REVIEW_SUBJECT_PREFIX: &str = "[review] ";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Governance store unavailable: {0}")]
    Unavailable(String),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Review {0} not found")]
    ReviewNotFound(ReviewId),

    #[error("Finding {0} not found")]
    FindingNotFound(FindingId),

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task} still has {remaining} unresolved review blocker(s)")]
    BlockersRemaining { task: TaskId, remaining: usize },

    #[error("Review {review} was already completed with verdict {first}")]
    AlreadyCompleted { review: ReviewId, first: ReviewStatus },

    #[error("Finding {0} was already dismissed")]
    AlreadyDismissed(FindingId),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("Task join error: {}", e))
    }
}

/// The result of pairing a work task with its individual review.
#[derive(Debug, Clone)]
pub struct Pairing {
    /// The governed task, with the new blocker in `blocked_by`
    pub task: Task,
    /// The review task acting as blocker
    pub review_task: Task,
    pub review: ReviewRecord,
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task with no blockers.
    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError>;

    /// Get a single task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Attach `blocker_id` to `task_id`. Adding an existing blocker is a no-op.
    async fn add_blocker(&self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError>;

    /// Detach `blocker_id` from `task_id`. Removing an absent blocker is a no-op.
    async fn remove_blocker(&self, task_id: TaskId, blocker_id: TaskId)
        -> Result<(), StoreError>;

    /// Tasks in a session, oldest first, optionally excluding one task.
    async fn list_siblings(
        &self,
        session_id: &str,
        exclude: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Work tasks of a session that are not terminal and still carry at
    /// least one blocker, oldest first. Unbounded.
    async fn list_awaiting_review(&self, session_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Move a task through its state machine.
    ///
    /// Refuses `Completed` while any blocker remains.
    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<Task, StoreError>;
}

/// Review record persistence.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn create_individual_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError>;

    async fn create_holistic_review(
        &self,
        session_id: &str,
        task_ids: &[TaskId],
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError>;

    /// Record the terminal verdict. A second call for the same review is
    /// rejected with `AlreadyCompleted` and leaves the first verdict intact.
    async fn complete_review(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError>;

    async fn get_review(&self, review_id: ReviewId) -> Result<Option<ReviewRecord>, StoreError>;

    /// Reviews targeting the task or attached to it as review task, oldest first.
    async fn get_by_task(&self, task_id: TaskId) -> Result<Vec<ReviewRecord>, StoreError>;

    async fn list_session_reviews(&self, session_id: &str)
        -> Result<Vec<ReviewRecord>, StoreError>;
}

/// Findings audit log.
#[async_trait]
pub trait FindingLog: Send + Sync {
    async fn record_finding(
        &self,
        session_id: &str,
        finding: NewTrackedFinding,
    ) -> Result<TrackedFinding, StoreError>;

    /// Dismiss a finding. The justification must not be blank.
    async fn dismiss_finding(
        &self,
        id: FindingId,
        justification: &str,
    ) -> Result<TrackedFinding, StoreError>;

    async fn list_findings(&self, session_id: &str) -> Result<Vec<TrackedFinding>, StoreError>;
}

/// Combined store with the multi-record operations that must be atomic.
#[async_trait]
pub trait GovernanceStore: TaskStore + ReviewStore + FindingLog {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a work task together with its review blocker in one transaction.
    async fn create_governed_task(
        &self,
        new: NewTask,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError>;

    /// Pair an existing task with a new review task, individual review record
    /// and blocker edge, in one transaction.
    ///
    /// Blockers whose review ended `blocked`/`needs_human_review` are
    /// superseded by the new review and detached.
    async fn pair_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError>;

    /// Complete a review and apply the verdict to the tasks it targets.
    ///
    /// Approved: the review task's blocker edge is removed and the review task
    /// completed. Otherwise the edge stays and the targets become `Blocked`.
    async fn resolve_review_blocker(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError>;
}

/// Store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a governance store based on type and data directory.
pub async fn create_store(
    store_type: StoreType,
    data_dir: PathBuf,
) -> Result<Arc<dyn GovernanceStore>, StoreError> {
    match store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryGovernanceStore::new())),
        StoreType::Sqlite => {
            let store = SqliteGovernanceStore::new(data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Subject of the review task paired with `subject`.
pub(crate) fn review_subject(subject: &str) -> String {
    format!("{}{}", REVIEW_SUBJECT_PREFIX, subject)
}

/// Validate a status change against the state machine and the blocker invariant.
pub(crate) fn check_transition(task: &Task, next: TaskStatus) -> Result<(), StoreError> {
    if task.status == next && !next.is_terminal() {
        return Ok(());
    }
    if !task.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            task: task.id,
            from: task.status,
            to: next,
        });
    }
    if next == TaskStatus::Completed && task.is_blocked() {
        return Err(StoreError::BlockersRemaining {
            task: task.id,
            remaining: task.blocked_by.len(),
        });
    }
    Ok(())
}

/// Apply an already validated status change.
pub(crate) fn apply_status(task: &mut Task, next: TaskStatus, now: DateTime<Utc>) {
    task.status = next;
    if next.is_terminal() {
        task.completed_at = Some(now);
    }
}

/// The status a target task takes after a review verdict lands.
///
/// Blockers must already reflect the verdict (approved edges removed).
pub(crate) fn status_after_verdict(task: &Task, verdict: Verdict) -> TaskStatus {
    if task.status.is_terminal() {
        return task.status;
    }
    match verdict {
        Verdict::Approved => {
            if !task.is_blocked() && matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked)
            {
                TaskStatus::Approved
            } else {
                task.status
            }
        }
        Verdict::Blocked | Verdict::NeedsHumanReview => TaskStatus::Blocked,
    }
}

/// The status a task takes when a fresh review blocker is attached.
pub(crate) fn status_after_new_blocker(task: &Task) -> TaskStatus {
    match task.status {
        TaskStatus::Approved | TaskStatus::Blocked | TaskStatus::InProgress => TaskStatus::Pending,
        other => other,
    }
}

/// Context recorded on a review task paired with `task`.
pub(crate) fn pairing_description(task: &Task, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Review of task {} ({}).\n\n{}", task.id, task.subject, ctx)
        }
        _ => format!("Review of task {} ({}).", task.id, task.subject),
    }
}

pub(crate) fn validate_justification(justification: &str) -> Result<(), StoreError> {
    if justification.trim().is_empty() {
        return Err(StoreError::Validation(
            "dismissing a finding requires a justification".to_string(),
        ));
    }
    Ok(())
}
