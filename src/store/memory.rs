//! In-memory governance store (non-persistent).
//!
//! One `RwLock` guards the whole state, so every multi-record operation
//! (pairing, verdict propagation) runs under a single write guard.

use super::{
    apply_status, check_transition, pairing_description, review_subject, status_after_new_blocker,
    status_after_verdict, validate_justification, FindingLog, GovernanceStore, Pairing,
    ReviewStore, StoreError, TaskStore,
};
use crate::task::task::push_unique;
use crate::task::{
    FindingId, NewTask, NewTrackedFinding, ReviewId, ReviewRecord, ReviewStatus, ReviewType,
    ReviewVerdict, Task, TaskId, TaskKind, TaskStatus, TrackedFinding, Verdict,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    task_order: Vec<TaskId>,
    reviews: HashMap<ReviewId, ReviewRecord>,
    review_order: Vec<ReviewId>,
    findings: HashMap<FindingId, TrackedFinding>,
    finding_order: Vec<FindingId>,
}

impl MemoryState {
    fn insert_task(&mut self, task: Task) {
        self.task_order.push(task.id);
        self.tasks.insert(task.id, task);
    }

    fn insert_review(&mut self, review: ReviewRecord) {
        self.review_order.push(review.id);
        self.reviews.insert(review.id, review);
    }

    fn task(&self, id: TaskId) -> Result<&Task, StoreError> {
        self.tasks.get(&id).ok_or(StoreError::TaskNotFound(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))
    }

    fn add_edge(&mut self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
        self.task(task_id)?;
        self.task(blocker_id)?;
        push_unique(&mut self.task_mut(task_id)?.blocked_by, blocker_id);
        push_unique(&mut self.task_mut(blocker_id)?.blocks, task_id);
        Ok(())
    }

    fn remove_edge(&mut self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
        self.task_mut(task_id)?.blocked_by.retain(|id| *id != blocker_id);
        if let Some(blocker) = self.tasks.get_mut(&blocker_id) {
            blocker.blocks.retain(|id| *id != task_id);
        }
        Ok(())
    }

    fn complete(
        &mut self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        let review = self
            .reviews
            .get_mut(&review_id)
            .ok_or(StoreError::ReviewNotFound(review_id))?;
        if review.is_completed() {
            return Err(StoreError::AlreadyCompleted {
                review: review_id,
                first: review.status,
            });
        }
        review.apply_verdict(verdict, Utc::now());
        Ok(review.clone())
    }

    fn pair(
        &mut self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        let task = self.task(task_id)?.clone();
        if task.status.is_terminal() {
            return Err(StoreError::Validation(format!(
                "task {} is {} and cannot take a new review blocker",
                task.id, task.status
            )));
        }
        if task.is_review() {
            return Err(StoreError::Validation(format!(
                "task {} is a review task and is never paired",
                task.id
            )));
        }

        // Blockers whose review already ended in a non-approved verdict are superseded.
        let superseded: Vec<TaskId> = task
            .blocked_by
            .iter()
            .copied()
            .filter(|blocker| {
                self.reviews.values().any(|r| {
                    r.review_task_id == Some(*blocker)
                        && matches!(
                            r.status,
                            ReviewStatus::Blocked | ReviewStatus::NeedsHumanReview
                        )
                })
            })
            .collect();
        for blocker in superseded {
            self.remove_edge(task_id, blocker)?;
        }

        let review_task = Task::from_new(
            NewTask::review(task.session_id.clone(), review_subject(&task.subject))
                .with_description(pairing_description(&task, context)),
        );
        let review = ReviewRecord::individual(
            task.session_id.clone(),
            task.id,
            Some(review_task.id),
            review_type,
            context.map(|s| s.to_string()),
        );
        let review_task_id = review_task.id;
        self.insert_task(review_task);
        self.insert_review(review.clone());
        self.add_edge(task_id, review_task_id)?;

        let now = Utc::now();
        let governed = self.task_mut(task_id)?;
        let next = status_after_new_blocker(governed);
        apply_status(governed, next, now);

        Ok(Pairing {
            task: self.task(task_id)?.clone(),
            review_task: self.task(review_task_id)?.clone(),
            review,
        })
    }

    fn resolve(
        &mut self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        let review = self.complete(review_id, verdict)?;
        let now = Utc::now();

        for target in &review.target_task_ids {
            if let (Some(review_task_id), Verdict::Approved) = (review.review_task_id, verdict.verdict)
            {
                self.remove_edge(*target, review_task_id)?;
            }
            let task = self.task_mut(*target)?;
            let next = status_after_verdict(task, verdict.verdict);
            apply_status(task, next, now);
        }

        if let Some(review_task_id) = review.review_task_id {
            let review_task = self.task_mut(review_task_id)?;
            if !review_task.status.is_terminal() {
                apply_status(review_task, TaskStatus::Completed, now);
            }
        }
        Ok(review)
    }
}

#[derive(Clone)]
pub struct InMemoryGovernanceStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryGovernanceStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }
}

impl Default for InMemoryGovernanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryGovernanceStore {
    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = Task::from_new(new);
        self.state.write().await.insert_task(task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn add_blocker(&self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
        self.state.write().await.add_edge(task_id, blocker_id)
    }

    async fn remove_blocker(
        &self,
        task_id: TaskId,
        blocker_id: TaskId,
    ) -> Result<(), StoreError> {
        self.state.write().await.remove_edge(task_id, blocker_id)
    }

    async fn list_siblings(
        &self,
        session_id: &str,
        exclude: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.session_id == session_id && Some(t.id) != exclude)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_awaiting_review(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| {
                t.session_id == session_id
                    && t.kind == TaskKind::Work
                    && !t.status.is_terminal()
                    && t.is_blocked()
            })
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        check_transition(task, status)?;
        apply_status(task, status, Utc::now());
        Ok(task.clone())
    }
}

#[async_trait]
impl ReviewStore for InMemoryGovernanceStore {
    async fn create_individual_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        let mut state = self.state.write().await;
        let session_id = state.task(task_id)?.session_id.clone();
        let review = ReviewRecord::individual(
            session_id,
            task_id,
            None,
            review_type,
            context.map(|s| s.to_string()),
        );
        state.insert_review(review.clone());
        Ok(review)
    }

    async fn create_holistic_review(
        &self,
        session_id: &str,
        task_ids: &[TaskId],
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        let mut state = self.state.write().await;
        for id in task_ids {
            state.task(*id)?;
        }
        let review = ReviewRecord::holistic(
            session_id,
            task_ids.to_vec(),
            context.map(|s| s.to_string()),
        );
        state.insert_review(review.clone());
        Ok(review)
    }

    async fn complete_review(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        self.state.write().await.complete(review_id, verdict)
    }

    async fn get_review(&self, review_id: ReviewId) -> Result<Option<ReviewRecord>, StoreError> {
        Ok(self.state.read().await.reviews.get(&review_id).cloned())
    }

    async fn get_by_task(&self, task_id: TaskId) -> Result<Vec<ReviewRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .review_order
            .iter()
            .filter_map(|id| state.reviews.get(id))
            .filter(|r| r.review_task_id == Some(task_id) || r.target_task_ids.contains(&task_id))
            .cloned()
            .collect())
    }

    async fn list_session_reviews(
        &self,
        session_id: &str,
    ) -> Result<Vec<ReviewRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .review_order
            .iter()
            .filter_map(|id| state.reviews.get(id))
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FindingLog for InMemoryGovernanceStore {
    async fn record_finding(
        &self,
        session_id: &str,
        finding: NewTrackedFinding,
    ) -> Result<TrackedFinding, StoreError> {
        let finding = TrackedFinding::from_new(session_id, finding);
        let mut state = self.state.write().await;
        state.finding_order.push(finding.id);
        state.findings.insert(finding.id, finding.clone());
        Ok(finding)
    }

    async fn dismiss_finding(
        &self,
        id: FindingId,
        justification: &str,
    ) -> Result<TrackedFinding, StoreError> {
        validate_justification(justification)?;
        let mut state = self.state.write().await;
        let finding = state
            .findings
            .get_mut(&id)
            .ok_or(StoreError::FindingNotFound(id))?;
        if finding.dismissed {
            return Err(StoreError::AlreadyDismissed(id));
        }
        finding.dismissed = true;
        finding.justification = Some(justification.trim().to_string());
        finding.dismissed_at = Some(Utc::now());
        Ok(finding.clone())
    }

    async fn list_findings(&self, session_id: &str) -> Result<Vec<TrackedFinding>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .finding_order
            .iter()
            .filter_map(|id| state.findings.get(id))
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GovernanceStore for InMemoryGovernanceStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_governed_task(
        &self,
        new: NewTask,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        let mut state = self.state.write().await;
        let task = Task::from_new(new);
        let task_id = task.id;
        state.insert_task(task);
        match state.pair(task_id, review_type, context) {
            Ok(pairing) => Ok(pairing),
            Err(e) => {
                // Roll back the unpaired task.
                state.tasks.remove(&task_id);
                state.task_order.retain(|id| *id != task_id);
                Err(e)
            }
        }
    }

    async fn pair_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        self.state.write().await.pair(task_id, review_type, context)
    }

    async fn resolve_review_blocker(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        self.state.write().await.resolve(review_id, verdict)
    }
}
