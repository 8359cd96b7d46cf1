//! Actor-facing governance API.
//!
//! `GovernanceService` wires the store, flag store, interceptor, settle
//! coordinator and gate together. The HTTP routes and the hook binary are
//! thin wrappers around it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::flag::{FlagError, FlagStatus, FlagStore, RaiseOutcome};
use crate::gate::{ExecutionGate, GateAction, GateDecision, GateRequest};
use crate::interceptor::{
    InterceptError, InterceptOutcome, Interceptor, NoSpawn, ProcessSpawner, SettleSpawner,
    TokioSpawner,
};
use crate::reviewer::{CommandReviewer, NoReviewer, Reviewer};
use crate::settle::{latest_holistic_rejection, SettleCoordinator, SettleError, SettleOutcome, SettleSettings};
use crate::standards::{DirectoryStandards, NoStandards, StandardsSource};
use crate::store::{create_store, GovernanceStore, StoreError};
use crate::task::{
    FindingId, NewTask, NewTrackedFinding, ReviewId, ReviewKind, ReviewRecord, ReviewStatus,
    ReviewType, ReviewVerdict, Task, TaskId, TaskStatus, TrackedFinding,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Intercept(#[from] InterceptError),

    #[error(transparent)]
    Settle(#[from] SettleError),

    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{reason}")]
    Denied {
        reason: String,
        status: Option<FlagStatus>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// How settle coordinators are started.
#[derive(Debug, Clone)]
pub enum SpawnMode {
    /// tokio tasks in this process (the server)
    InProcess,
    /// detached `<program> settle` processes (the hook binary)
    Detached { program: PathBuf },
    /// never; settling is driven by hand
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGovernedTask {
    pub session_id: String,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Free text handed to the reviewer
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub review_type: ReviewType,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernedTask {
    pub task_id: TaskId,
    pub review_task_id: TaskId,
    pub flag: Option<RaiseOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockerStatus {
    pub review_task_id: TaskId,
    pub review_id: Option<ReviewId>,
    pub status: Option<ReviewStatus>,
    pub review_type: Option<ReviewType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReviewStatus {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub blockers: Vec<BlockerStatus>,
    pub can_execute: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct GovernanceService {
    store: Arc<dyn GovernanceStore>,
    flags: FlagStore,
    interceptor: Interceptor,
    coordinator: Arc<SettleCoordinator>,
    gate: ExecutionGate,
}

impl GovernanceService {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        flags: FlagStore,
        reviewer: Arc<dyn Reviewer>,
        standards: Arc<dyn StandardsSource>,
        settings: SettleSettings,
        review_pattern: regex::Regex,
        spawn: SpawnMode,
    ) -> Self {
        let coordinator = Arc::new(SettleCoordinator::new(
            store.clone(),
            flags.clone(),
            reviewer,
            standards,
            settings,
        ));
        let spawner: Arc<dyn SettleSpawner> = match spawn {
            SpawnMode::InProcess => Arc::new(TokioSpawner::new(coordinator.clone())),
            SpawnMode::Detached { program } => Arc::new(ProcessSpawner::new(program)),
            SpawnMode::Disabled => Arc::new(NoSpawn),
        };
        let interceptor =
            Interceptor::new(store.clone(), flags.clone(), spawner, review_pattern);
        let gate = ExecutionGate::new(store.clone(), flags.clone());

        Self {
            store,
            flags,
            interceptor,
            coordinator,
            gate,
        }
    }

    pub async fn from_config(config: &Config, spawn: SpawnMode) -> Result<Self, ServiceError> {
        let store = create_store(config.store_type, config.data_dir.clone()).await?;
        let flags = FlagStore::new(config.flags_dir(), config.stale_after);

        let reviewer: Arc<dyn Reviewer> = match &config.reviewer_command {
            Some(command) => Arc::new(CommandReviewer::new(command.clone())),
            None => {
                tracing::warn!("No reviewer command configured, holistic reviews will need a human");
                Arc::new(NoReviewer)
            }
        };
        let standards: Arc<dyn StandardsSource> = match &config.standards_dir {
            Some(dir) => Arc::new(DirectoryStandards::new(dir.clone())),
            None => Arc::new(NoStandards),
        };
        let review_pattern = Config::compile_pattern(&config.review_pattern)?;

        Ok(Self::new(
            store,
            flags,
            reviewer,
            standards,
            SettleSettings {
                quiet_period: config.quiet_period,
                review_timeout: config.review_timeout,
            },
            review_pattern,
            spawn,
        ))
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    /// Create a work task already paired with its review blocker, then raise
    /// or fold the session flag.
    pub async fn create_governed_task(
        &self,
        request: CreateGovernedTask,
    ) -> Result<GovernedTask, ServiceError> {
        if request.session_id.trim().is_empty() {
            return Err(ServiceError::Invalid("session_id must not be empty".to_string()));
        }
        if request.subject.trim().is_empty() {
            return Err(ServiceError::Invalid("subject must not be empty".to_string()));
        }

        let mut new = NewTask::work(request.session_id, request.subject);
        new.description = request.description;
        let pairing = self
            .store
            .create_governed_task(new, request.review_type.clone(), request.context.as_deref())
            .await?;
        tracing::info!(
            task_id = %pairing.task.id,
            review_task_id = %pairing.review_task.id,
            session_id = %pairing.task.session_id,
            "Created governed task"
        );

        let flag = match self
            .interceptor
            .on_task_created(&pairing.task, request.review_type, request.context.as_deref())
            .await?
        {
            InterceptOutcome::Paired { flag, .. } => flag,
            InterceptOutcome::Skipped => None,
        };

        Ok(GovernedTask {
            task_id: pairing.task.id,
            review_task_id: pairing.review_task.id,
            flag,
        })
    }

    /// Create a task without pairing it. Call `intercept` to govern it.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, ServiceError> {
        Ok(self.store.create_task(new).await?)
    }

    pub async fn intercept(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<InterceptOutcome, ServiceError> {
        Ok(self
            .interceptor
            .intercept(task_id, review_type, context)
            .await?)
    }

    /// Attach a fresh review blocker to an existing task (e.g. after fixing
    /// what a blocked review asked for). Returns the new review task.
    pub async fn add_review_blocker(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<TaskId, ServiceError> {
        let pairing = self.store.pair_review(task_id, review_type, context).await?;
        tracing::info!(
            task_id = %task_id,
            review_task_id = %pairing.review_task.id,
            "Added review blocker"
        );
        self.interceptor
            .signal(&pairing.task.session_id, task_id)
            .await;
        Ok(pairing.review_task.id)
    }

    /// Record the verdict for the review attached to `review_task_id`.
    ///
    /// Returns `false` when the review already had a verdict; the first one
    /// is kept.
    pub async fn complete_task_review(
        &self,
        review_task_id: TaskId,
        verdict: ReviewVerdict,
    ) -> Result<bool, ServiceError> {
        let review = self
            .store
            .get_by_task(review_task_id)
            .await?
            .into_iter()
            .filter(|r| {
                r.kind == ReviewKind::Individual && r.review_task_id == Some(review_task_id)
            })
            .last()
            .ok_or_else(|| ServiceError::NotFound(format!("Review for task {}", review_task_id)))?;

        match self.store.resolve_review_blocker(review.id, &verdict).await {
            Ok(record) => {
                tracing::info!(
                    review_id = %record.id,
                    review_task_id = %review_task_id,
                    verdict = %verdict.verdict,
                    "Review completed"
                );
                Ok(true)
            }
            Err(StoreError::AlreadyCompleted { review, first }) => {
                tracing::warn!(
                    review_id = %review,
                    first = %first,
                    ignored = %verdict.verdict,
                    "Duplicate review completion ignored"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, ServiceError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Task {}", task_id)))
    }

    pub async fn get_task_review_status(
        &self,
        task_id: TaskId,
    ) -> Result<TaskReviewStatus, ServiceError> {
        let task = self.get_task(task_id).await?;
        let reviews = self.store.get_by_task(task_id).await?;

        let blockers: Vec<BlockerStatus> = task
            .blocked_by
            .iter()
            .map(|blocker| {
                let review = attached_review(&reviews, *blocker);
                BlockerStatus {
                    review_task_id: *blocker,
                    review_id: review.map(|r| r.id),
                    status: review.map(|r| r.status),
                    review_type: review.map(|r| r.review_type.clone()),
                    guidance: review.and_then(|r| r.guidance.clone()),
                }
            })
            .collect();

        let mut reasons: Vec<String> = blockers
            .iter()
            .filter(|b| {
                matches!(
                    b.status,
                    Some(ReviewStatus::Blocked | ReviewStatus::NeedsHumanReview)
                )
            })
            .filter_map(|b| b.guidance.clone())
            .collect();
        if task.status == TaskStatus::Blocked {
            if let Some(guidance) =
                latest_holistic_rejection(&reviews).and_then(|r| r.guidance.clone())
            {
                reasons.push(guidance);
            }
        }

        let can_execute = blockers.is_empty();
        let reason = if !reasons.is_empty() {
            Some(reasons.join("; "))
        } else if !can_execute {
            Some(format!(
                "Waiting for {} review(s) to complete",
                blockers.len()
            ))
        } else {
            None
        };

        Ok(TaskReviewStatus {
            task_id,
            status: task.status,
            blockers,
            can_execute,
            reason,
        })
    }

    pub async fn check_gate(&self, request: &GateRequest) -> GateDecision {
        self.gate.check(request).await
    }

    /// Move a task to `in_progress` if the gate allows mutation.
    pub async fn start_task(&self, task_id: TaskId) -> Result<Task, ServiceError> {
        self.gated_transition(task_id, GateAction::Mutate, TaskStatus::InProgress)
            .await
    }

    /// Complete a task if the gate allows it.
    pub async fn complete_task(&self, task_id: TaskId) -> Result<Task, ServiceError> {
        self.gated_transition(task_id, GateAction::Complete, TaskStatus::Completed)
            .await
    }

    async fn gated_transition(
        &self,
        task_id: TaskId,
        action: GateAction,
        next: TaskStatus,
    ) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id).await?;
        let decision = self
            .gate
            .check(&GateRequest {
                session_id: task.session_id.clone(),
                task_id: Some(task_id),
                action,
            })
            .await;
        if !decision.allow {
            return Err(ServiceError::Denied {
                reason: decision.reason,
                status: decision.status,
            });
        }
        Ok(self.store.update_status(task_id, next).await?)
    }

    pub async fn list_session_reviews(
        &self,
        session_id: &str,
    ) -> Result<Vec<ReviewRecord>, ServiceError> {
        Ok(self.store.list_session_reviews(session_id).await?)
    }

    pub async fn record_finding(
        &self,
        session_id: &str,
        finding: NewTrackedFinding,
    ) -> Result<TrackedFinding, ServiceError> {
        Ok(self.store.record_finding(session_id, finding).await?)
    }

    pub async fn dismiss_finding(
        &self,
        id: FindingId,
        justification: &str,
    ) -> Result<TrackedFinding, ServiceError> {
        let finding = self.store.dismiss_finding(id, justification).await?;
        tracing::info!(finding_id = %id, "Finding dismissed: {}", justification.trim());
        Ok(finding)
    }

    pub async fn list_findings(&self, session_id: &str) -> Result<Vec<TrackedFinding>, ServiceError> {
        Ok(self.store.list_findings(session_id).await?)
    }

    /// Human override: drop the session flag. Task blockers are untouched.
    pub async fn clear_flag(&self, session_id: &str) -> Result<bool, ServiceError> {
        let session = session_id.to_string();
        let cleared = self.flags.run(move |flags| flags.clear(&session)).await?;
        if cleared {
            tracing::info!(session_id = %session_id, "Session flag cleared");
        }
        Ok(cleared)
    }

    /// Run one settle coordinator instance to completion.
    pub async fn settle(
        &self,
        session_id: &str,
        task_id: TaskId,
    ) -> Result<SettleOutcome, ServiceError> {
        Ok(self.coordinator.run(session_id, task_id).await?)
    }
}

/// The latest individual review attached to `review_task_id`.
fn attached_review(reviews: &[ReviewRecord], review_task_id: TaskId) -> Option<&ReviewRecord> {
    reviews
        .iter()
        .filter(|r| r.kind == ReviewKind::Individual && r.review_task_id == Some(review_task_id))
        .last()
}
