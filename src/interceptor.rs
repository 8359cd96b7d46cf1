//! Task-creation interceptor.
//!
//! Runs for every newly created task:
//! 1. Review tasks are skipped, so reviews never get reviewed themselves
//! 2. Work tasks are paired with an individual review blocker (one store transaction)
//! 3. The session flag is raised or its marker moved, and a settle
//!    coordinator is spawned for the task
//!
//! Pairing failures are fatal to the call. Flag failures are not: the task is
//! already governed through its blocker.

use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;

use crate::flag::{FlagStore, RaiseOutcome};
use crate::settle::SettleCoordinator;
use crate::store::{GovernanceStore, StoreError};
use crate::task::{ReviewKind, ReviewStatus, ReviewType, Task, TaskId};

/// Default naming convention for review tasks.
pub const DEFAULT_REVIEW_PATTERN: &str = r"(?i)^\s*\[?review\b";

/// Siblings listed in a review task's context.
const SIBLING_CONTEXT_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Failed to pair task with a review: {0}")]
    Store(#[from] StoreError),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InterceptOutcome {
    /// The task is itself a review.
    Skipped,
    Paired {
        review_task_id: TaskId,
        /// `None` when the flag could not be written
        flag: Option<RaiseOutcome>,
    },
}

/// Starts a settle coordinator instance for `(session, task)`.
pub trait SettleSpawner: Send + Sync {
    fn spawn(&self, session_id: &str, task_id: TaskId);
}

/// Runs coordinators as tokio tasks in this process.
pub struct TokioSpawner {
    coordinator: Arc<SettleCoordinator>,
}

impl TokioSpawner {
    pub fn new(coordinator: Arc<SettleCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl SettleSpawner for TokioSpawner {
    fn spawn(&self, session_id: &str, task_id: TaskId) {
        let coordinator = self.coordinator.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match coordinator.run(&session_id, task_id).await {
                Ok(outcome) => {
                    tracing::debug!(session_id = %session_id, task_id = %task_id, ?outcome, "Settle finished")
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, task_id = %task_id, "Settle failed: {}", e)
                }
            }
        });
    }
}

/// Runs each coordinator as a detached `<program> settle` process, so it
/// outlives the short-lived hook invocation that spawned it.
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SettleSpawner for ProcessSpawner {
    fn spawn(&self, session_id: &str, task_id: TaskId) {
        let result = std::process::Command::new(&self.program)
            .arg("settle")
            .arg("--session")
            .arg(session_id)
            .arg("--task")
            .arg(task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match result {
            Ok(child) => tracing::debug!(
                session_id = %session_id,
                task_id = %task_id,
                pid = child.id(),
                "Spawned settle process"
            ),
            Err(e) => tracing::error!(
                session_id = %session_id,
                task_id = %task_id,
                "Failed to spawn settle process {}: {}",
                self.program.display(),
                e
            ),
        }
    }
}

/// Spawns nothing. Settling is driven explicitly.
pub struct NoSpawn;

impl SettleSpawner for NoSpawn {
    fn spawn(&self, _session_id: &str, _task_id: TaskId) {}
}

pub struct Interceptor {
    store: Arc<dyn GovernanceStore>,
    flags: FlagStore,
    spawner: Arc<dyn SettleSpawner>,
    review_pattern: Regex,
}

impl Interceptor {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        flags: FlagStore,
        spawner: Arc<dyn SettleSpawner>,
        review_pattern: Regex,
    ) -> Self {
        Self {
            store,
            flags,
            spawner,
            review_pattern,
        }
    }

    /// Review tasks are recognized by kind or by naming convention.
    pub fn is_review_task(&self, task: &Task) -> bool {
        task.is_review() || self.review_pattern.is_match(&task.subject)
    }

    /// Intercept a task by id.
    pub async fn intercept(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<InterceptOutcome, InterceptError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(InterceptError::TaskNotFound(task_id))?;
        self.on_task_created(&task, review_type, context).await
    }

    pub async fn on_task_created(
        &self,
        task: &Task,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<InterceptOutcome, InterceptError> {
        if self.is_review_task(task) {
            tracing::debug!(task_id = %task.id, subject = %task.subject, "Skipping review task");
            return Ok(InterceptOutcome::Skipped);
        }

        let review_task_id = match self.pending_blocker(task).await? {
            Some(id) => id,
            None => {
                let context = self.pairing_context(task, context).await?;
                let pairing = self
                    .store
                    .pair_review(task.id, review_type, Some(&context))
                    .await?;
                tracing::info!(
                    task_id = %task.id,
                    review_task_id = %pairing.review_task.id,
                    review_id = %pairing.review.id,
                    "Paired task with review blocker"
                );
                pairing.review_task.id
            }
        };

        let flag = self.signal(&task.session_id, task.id).await;
        Ok(InterceptOutcome::Paired {
            review_task_id,
            flag,
        })
    }

    /// Raise or fold the session flag and spawn a coordinator for the task.
    pub async fn signal(&self, session_id: &str, task_id: TaskId) -> Option<RaiseOutcome> {
        let session = session_id.to_string();
        let outcome = self
            .flags
            .run(move |flags| flags.raise_or_fold(&session, task_id))
            .await;
        match outcome {
            Ok((outcome, flag)) => {
                tracing::info!(
                    session_id = %session_id,
                    task_id = %task_id,
                    sequence = flag.sequence,
                    ?outcome,
                    "Session flag updated"
                );
                self.spawner.spawn(session_id, task_id);
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    task_id = %task_id,
                    "Failed to update session flag, task stays governed by its blocker: {}",
                    e
                );
                None
            }
        }
    }

    /// The review task of an existing pending individual review blocker.
    async fn pending_blocker(&self, task: &Task) -> Result<Option<TaskId>, StoreError> {
        if task.blocked_by.is_empty() {
            return Ok(None);
        }
        let reviews = self.store.get_by_task(task.id).await?;
        Ok(reviews
            .iter()
            .filter(|r| r.kind == ReviewKind::Individual && r.status == ReviewStatus::Pending)
            .filter_map(|r| r.review_task_id)
            .find(|id| task.blocked_by.contains(id)))
    }

    async fn pairing_context(
        &self,
        task: &Task,
        context: Option<&str>,
    ) -> Result<String, StoreError> {
        let siblings = self
            .store
            .list_siblings(&task.session_id, Some(task.id), SIBLING_CONTEXT_LIMIT)
            .await?;
        let mut out = String::new();
        if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
            out.push_str(ctx.trim());
            out.push_str("\n\n");
        }
        let siblings: Vec<_> = siblings.iter().filter(|t| !self.is_review_task(t)).collect();
        if siblings.is_empty() {
            out.push_str("No other tasks in this session.");
        } else {
            out.push_str("Other tasks in this session:");
            for sibling in siblings {
                out.push_str(&format!("\n- {} ({})", sibling.subject, sibling.status));
            }
        }
        Ok(out)
    }
}
