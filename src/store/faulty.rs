//! Test wrapper over the in-memory store that fails chosen operations.

use super::{
    FindingLog, GovernanceStore, InMemoryGovernanceStore, Pairing, ReviewStore, StoreError,
    TaskStore,
};
use crate::task::{
    FindingId, NewTask, NewTrackedFinding, ReviewId, ReviewRecord, ReviewType, ReviewVerdict,
    Task, TaskId, TaskStatus, TrackedFinding,
};
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Faults {
    pub create_governed_task: bool,
    pub pair_review: bool,
    pub create_holistic_review: bool,
}

pub(crate) struct FaultyStore {
    inner: InMemoryGovernanceStore,
    faults: Faults,
}

impl FaultyStore {
    pub(crate) fn new(faults: Faults) -> Self {
        Self {
            inner: InMemoryGovernanceStore::new(),
            faults,
        }
    }
}

fn injected(op: &str) -> StoreError {
    StoreError::Unavailable(format!("injected failure in {}", op))
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        self.inner.create_task(new).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get(id).await
    }

    async fn add_blocker(&self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
        self.inner.add_blocker(task_id, blocker_id).await
    }

    async fn remove_blocker(
        &self,
        task_id: TaskId,
        blocker_id: TaskId,
    ) -> Result<(), StoreError> {
        self.inner.remove_blocker(task_id, blocker_id).await
    }

    async fn list_siblings(
        &self,
        session_id: &str,
        exclude: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.list_siblings(session_id, exclude, limit).await
    }

    async fn list_awaiting_review(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        self.inner.list_awaiting_review(session_id).await
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<Task, StoreError> {
        self.inner.update_status(id, status).await
    }
}

#[async_trait]
impl ReviewStore for FaultyStore {
    async fn create_individual_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        self.inner
            .create_individual_review(task_id, review_type, context)
            .await
    }

    async fn create_holistic_review(
        &self,
        session_id: &str,
        task_ids: &[TaskId],
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        if self.faults.create_holistic_review {
            return Err(injected("create_holistic_review"));
        }
        self.inner
            .create_holistic_review(session_id, task_ids, context)
            .await
    }

    async fn complete_review(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        self.inner.complete_review(review_id, verdict).await
    }

    async fn get_review(&self, review_id: ReviewId) -> Result<Option<ReviewRecord>, StoreError> {
        self.inner.get_review(review_id).await
    }

    async fn get_by_task(&self, task_id: TaskId) -> Result<Vec<ReviewRecord>, StoreError> {
        self.inner.get_by_task(task_id).await
    }

    async fn list_session_reviews(
        &self,
        session_id: &str,
    ) -> Result<Vec<ReviewRecord>, StoreError> {
        self.inner.list_session_reviews(session_id).await
    }
}

#[async_trait]
impl FindingLog for FaultyStore {
    async fn record_finding(
        &self,
        session_id: &str,
        finding: NewTrackedFinding,
    ) -> Result<TrackedFinding, StoreError> {
        self.inner.record_finding(session_id, finding).await
    }

    async fn dismiss_finding(
        &self,
        id: FindingId,
        justification: &str,
    ) -> Result<TrackedFinding, StoreError> {
        self.inner.dismiss_finding(id, justification).await
    }

    async fn list_findings(&self, session_id: &str) -> Result<Vec<TrackedFinding>, StoreError> {
        self.inner.list_findings(session_id).await
    }
}

#[async_trait]
impl GovernanceStore for FaultyStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_governed_task(
        &self,
        new: NewTask,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        if self.faults.create_governed_task {
            return Err(injected("create_governed_task"));
        }
        self.inner
            .create_governed_task(new, review_type, context)
            .await
    }

    async fn pair_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        if self.faults.pair_review {
            return Err(injected("pair_review"));
        }
        self.inner.pair_review(task_id, review_type, context).await
    }

    async fn resolve_review_blocker(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        self.inner.resolve_review_blocker(review_id, verdict).await
    }
}
