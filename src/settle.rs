//! Settle coordinator: debounced holistic review of a session's task burst.
//!
//! Every interception spawns one coordinator for `(session, task)`. Each
//! sleeps for the quiet period and then tries to claim the session flag.
//! Only the instance whose task is still the flag's latest marker wins the
//! claim; every other instance defers without side effects.
//!
//! The winner reviews every task of the session that is still waiting on its
//! individual review, as one holistic review. An approval releases all of
//! their individual blockers by inheritance; any other verdict is written to
//! the flag and stays there until a new task supersedes it or someone clears it.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::flag::{ClaimOutcome, FinishOutcome, FlagError, FlagStore, SettleClaim};
use crate::reviewer::{obtain_verdict, ReviewRequest, ReviewSubject, Reviewer};
use crate::standards::StandardsSource;
use crate::store::{GovernanceStore, StoreError};
use crate::task::{
    ReviewKind, ReviewRecord, ReviewStatus, ReviewType, ReviewVerdict, Task, TaskId, TaskStatus,
    Verdict,
};

#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Flag(#[from] FlagError),
}

#[derive(Debug, Clone, Copy)]
pub struct SettleSettings {
    /// How long a session must be quiet before its burst is reviewed
    pub quiet_period: Duration,
    /// Ceiling on one reviewer call, and on waiting for another instance's claim
    pub review_timeout: Duration,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(5),
            review_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The flag is gone or expired.
    NoFlag,
    /// A newer task owns the marker.
    NewerTask,
    /// The flag already carries a verdict.
    AlreadyResolved,
    /// Another instance held its claim past the review timeout.
    ClaimTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Deferred(DeferReason),
    /// The flag was claimed but no task was waiting for review.
    NothingToReview { flag: FinishOutcome },
    Reviewed {
        review_id: crate::task::ReviewId,
        verdict: Verdict,
        tasks: Vec<TaskId>,
        flag: FinishOutcome,
    },
}

/// A task waiting on its individual review, with those reviews.
struct Waiting {
    task: Task,
    reviews: Vec<ReviewRecord>,
}

pub struct SettleCoordinator {
    store: Arc<dyn GovernanceStore>,
    flags: FlagStore,
    reviewer: Arc<dyn Reviewer>,
    standards: Arc<dyn StandardsSource>,
    settings: SettleSettings,
}

impl SettleCoordinator {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        flags: FlagStore,
        reviewer: Arc<dyn Reviewer>,
        standards: Arc<dyn StandardsSource>,
        settings: SettleSettings,
    ) -> Self {
        Self {
            store,
            flags,
            reviewer,
            standards,
            settings,
        }
    }

    pub fn settings(&self) -> SettleSettings {
        self.settings
    }

    /// One coordinator instance, spawned for `task_at_spawn`.
    pub async fn run(
        &self,
        session_id: &str,
        task_at_spawn: TaskId,
    ) -> Result<SettleOutcome, SettleError> {
        tokio::time::sleep(self.settings.quiet_period).await;
        let deadline = Instant::now() + self.settings.review_timeout;

        loop {
            let session = session_id.to_string();
            let claim = self
                .flags
                .run(move |flags| flags.try_claim(&session, task_at_spawn))
                .await?;

            let reason = match claim {
                ClaimOutcome::Claimed(claim) => return self.settle(session_id, claim).await,
                ClaimOutcome::Busy if Instant::now() < deadline => {
                    tracing::debug!(
                        session_id = %session_id,
                        task_id = %task_at_spawn,
                        "Review in flight, waiting another quiet period"
                    );
                    tokio::time::sleep(self.settings.quiet_period).await;
                    continue;
                }
                ClaimOutcome::Busy => DeferReason::ClaimTimeout,
                ClaimOutcome::NotLatest => DeferReason::NewerTask,
                ClaimOutcome::Resolved(_) => DeferReason::AlreadyResolved,
                ClaimOutcome::Missing => DeferReason::NoFlag,
            };
            tracing::debug!(
                session_id = %session_id,
                task_id = %task_at_spawn,
                ?reason,
                "Settle deferred"
            );
            return Ok(SettleOutcome::Deferred(reason));
        }
    }

    /// Review the batch under `claim`. Any failure hands the claim back so
    /// the next coordinator of the session can retry.
    async fn settle(
        &self,
        session_id: &str,
        claim: SettleClaim,
    ) -> Result<SettleOutcome, SettleError> {
        match self.review_claimed(session_id, &claim).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Settle failed, releasing claim: {}", e);
                let session = session_id.to_string();
                match self
                    .flags
                    .run(move |flags| flags.release_claim(&session, &claim))
                    .await
                {
                    Ok(released) => {
                        tracing::debug!(session_id = %session_id, released, "Claim handed back")
                    }
                    Err(release_err) => tracing::warn!(
                        session_id = %session_id,
                        "Failed to release claim: {}",
                        release_err
                    ),
                }
                Err(e)
            }
        }
    }

    async fn review_claimed(
        &self,
        session_id: &str,
        claim: &SettleClaim,
    ) -> Result<SettleOutcome, SettleError> {
        let batch = self.waiting_tasks(session_id).await?;

        if batch.is_empty() {
            let flag = self
                .finish(session_id, claim, Verdict::Approved, None, None)
                .await?;
            tracing::info!(session_id = %session_id, ?flag, "Nothing waiting for review");
            return Ok(SettleOutcome::NothingToReview { flag });
        }

        let task_ids: Vec<TaskId> = batch.iter().map(|w| w.task.id).collect();
        let context = format!(
            "Holistic review of {} task(s) created in session {}",
            task_ids.len(),
            session_id
        );
        let holistic = self
            .store
            .create_holistic_review(session_id, &task_ids, Some(&context))
            .await?;
        tracing::info!(
            session_id = %session_id,
            review_id = %holistic.id,
            tasks = task_ids.len(),
            "Starting holistic review"
        );

        let standards = self.standards.applicable(session_id, Some(&context)).await;
        let request = ReviewRequest {
            review_id: holistic.id,
            session_id: session_id.to_string(),
            kind: ReviewKind::Holistic,
            review_type: ReviewType::General,
            tasks: batch
                .iter()
                .map(|w| ReviewSubject {
                    task_id: w.task.id,
                    subject: w.task.subject.clone(),
                    description: w.task.description.clone(),
                })
                .collect(),
            context: Some(context),
            standards,
        };

        let mut verdict =
            obtain_verdict(self.reviewer.as_ref(), &request, self.settings.review_timeout).await;
        if verdict.standards.is_empty() {
            verdict.standards = request.standards.clone();
        }
        self.store.complete_review(holistic.id, &verdict).await?;

        match verdict.verdict {
            Verdict::Approved => self.release_individuals(&holistic, &batch).await?,
            Verdict::Blocked | Verdict::NeedsHumanReview => {
                self.mark_blocked(&batch).await?;
            }
        }

        let flag = self
            .finish(
                session_id,
                claim,
                verdict.verdict,
                Some(verdict.guidance.clone()),
                verdict.strengths.clone(),
            )
            .await?;
        tracing::info!(
            session_id = %session_id,
            review_id = %holistic.id,
            verdict = %verdict.verdict,
            ?flag,
            "Holistic review settled"
        );

        Ok(SettleOutcome::Reviewed {
            review_id: holistic.id,
            verdict: verdict.verdict,
            tasks: task_ids,
            flag,
        })
    }

    /// Work tasks of the session whose every blocker is a pending individual review.
    async fn waiting_tasks(&self, session_id: &str) -> Result<Vec<Waiting>, StoreError> {
        let tasks = self.store.list_awaiting_review(session_id).await?;

        let mut waiting = Vec::new();
        for task in tasks {
            let reviews: Vec<ReviewRecord> = self
                .store
                .get_by_task(task.id)
                .await?
                .into_iter()
                .filter(|r| task.blocked_by.iter().any(|b| r.is_pending_blocker(*b)))
                .collect();
            let all_pending = task
                .blocked_by
                .iter()
                .all(|b| reviews.iter().any(|r| r.review_task_id == Some(*b)));
            if all_pending {
                waiting.push(Waiting { task, reviews });
            }
        }
        Ok(waiting)
    }

    async fn release_individuals(
        &self,
        holistic: &ReviewRecord,
        batch: &[Waiting],
    ) -> Result<(), StoreError> {
        let inherited = ReviewVerdict::approved(format!("approved via holistic review {}", holistic.id));
        for waiting in batch {
            for review in &waiting.reviews {
                match self.store.resolve_review_blocker(review.id, &inherited).await {
                    Ok(_) => {}
                    Err(StoreError::AlreadyCompleted { review, first }) => {
                        tracing::warn!(
                            review_id = %review,
                            first = %first,
                            "Individual review completed during holistic review, keeping its verdict"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn mark_blocked(&self, batch: &[Waiting]) -> Result<(), StoreError> {
        for waiting in batch {
            match self
                .store
                .update_status(waiting.task.id, TaskStatus::Blocked)
                .await
            {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { task, from, .. }) => {
                    tracing::debug!(task_id = %task, from = %from, "Task left as is after holistic verdict");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        session_id: &str,
        claim: &SettleClaim,
        verdict: Verdict,
        guidance: Option<String>,
        strengths: Option<String>,
    ) -> Result<FinishOutcome, FlagError> {
        let session = session_id.to_string();
        let claim = claim.clone();
        self.flags
            .run(move |flags| flags.finish(&session, &claim, verdict, guidance, strengths))
            .await
    }
}

/// The latest terminal non-approved holistic verdict targeting a task.
pub(crate) fn latest_holistic_rejection(reviews: &[ReviewRecord]) -> Option<&ReviewRecord> {
    reviews
        .iter()
        .filter(|r| {
            r.kind == ReviewKind::Holistic
                && matches!(r.status, ReviewStatus::Blocked | ReviewStatus::NeedsHumanReview)
        })
        .max_by_key(|r| r.completed_at)
}
