//! Execution gate.
//!
//! Consulted before any mutating action and before a task is completed.
//! The fast path is a single file existence check plus the task's blocker
//! list; only when either is non-empty does the gate read the flag and the
//! review records and resolve the most restrictive status.
//!
//! Governance storage being down never blocks work: store errors fail open.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::flag::{FlagStatus, FlagStore};
use crate::settle::latest_holistic_rejection;
use crate::store::GovernanceStore;
use crate::task::{ReviewKind, ReviewRecord, ReviewStatus, Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// Any mutating operation
    #[default]
    Mutate,
    /// Marking the task completed
    Complete,
}

impl std::str::FromStr for GateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mutate" => Ok(GateAction::Mutate),
            "complete" => Ok(GateAction::Complete),
            other => Err(format!("unknown gate action '{}', expected mutate or complete", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    pub session_id: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub action: GateAction,
}

/// Where a restriction came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestrictionSource {
    SessionFlag,
    Blocker { review_task_id: TaskId },
    HolisticReview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Restriction {
    pub status: FlagStatus,
    pub source: RestrictionSource,
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FlagStatus>,
    pub reason: String,
}

impl GateDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            status: None,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            status: None,
            reason: reason.into(),
        }
    }

    fn deny(restriction: &Restriction) -> Self {
        let headline = match restriction.status {
            FlagStatus::Blocked => "Blocked by review",
            FlagStatus::NeedsHumanReview => "Waiting for human review",
            FlagStatus::Pending => "Review pending",
        };
        let detail = restriction
            .guidance
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match restriction.status {
                FlagStatus::Pending => {
                    "Wait for the review to finish before continuing.".to_string()
                }
                _ => "Ask a human reviewer to approve or clear the review.".to_string(),
            });
        Self {
            allow: false,
            status: Some(restriction.status),
            reason: format!("{}: {}", headline, detail),
        }
    }
}

/// The most restrictive entry: `blocked > needs_human_review > pending`.
/// Ties keep the first entry.
pub fn resolve_priority(restrictions: &[Restriction]) -> Option<&Restriction> {
    restrictions.iter().fold(None, |best: Option<&Restriction>, r| match best {
        Some(b) if b.status.priority() >= r.status.priority() => Some(b),
        _ => Some(r),
    })
}

pub struct ExecutionGate {
    store: Arc<dyn GovernanceStore>,
    flags: FlagStore,
}

impl ExecutionGate {
    pub fn new(store: Arc<dyn GovernanceStore>, flags: FlagStore) -> Self {
        Self { store, flags }
    }

    pub async fn check(&self, request: &GateRequest) -> GateDecision {
        let task = match request.task_id {
            Some(id) => match self.store.get(id).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(
                        session_id = %request.session_id,
                        task_id = %id,
                        "Governance store unavailable, allowing: {}",
                        e
                    );
                    return GateDecision::allow("governance store unavailable");
                }
            },
            None => None,
        };

        if let Some(task) = task
            .as_ref()
            .filter(|t| t.session_id != request.session_id)
        {
            tracing::warn!(
                session_id = %request.session_id,
                task_id = %task.id,
                task_session = %task.session_id,
                "Gate check names a task of another session"
            );
            return GateDecision::reject(format!(
                "Task {} does not belong to session {}",
                task.id, request.session_id
            ));
        }

        let flag_present = self.flags.exists(&request.session_id);
        let task_blocked = task.as_ref().is_some_and(Task::is_blocked);
        if !flag_present && !task_blocked {
            tracing::debug!(session_id = %request.session_id, "Gate fast path");
            return GateDecision::allow("no active review");
        }

        let mut restrictions = Vec::new();
        if flag_present {
            if let Some(r) = self.flag_restriction(&request.session_id).await {
                restrictions.push(r);
            }
        }
        if let Some(task) = task.as_ref().filter(|t| t.is_blocked()) {
            match self.store.get_by_task(task.id).await {
                Ok(reviews) => {
                    restrictions.extend(task_restrictions(task, &reviews, request.action))
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        "Governance store unavailable, allowing: {}",
                        e
                    );
                    return GateDecision::allow("governance store unavailable");
                }
            }
        }

        match resolve_priority(&restrictions) {
            Some(winner) => {
                let decision = GateDecision::deny(winner);
                tracing::info!(
                    session_id = %request.session_id,
                    task_id = ?request.task_id,
                    action = ?request.action,
                    status = %winner.status,
                    "Gate denied"
                );
                decision
            }
            None => GateDecision::allow("no blocking review"),
        }
    }

    async fn flag_restriction(&self, session_id: &str) -> Option<Restriction> {
        let session = session_id.to_string();
        match self.flags.run(move |flags| flags.read_live(&session)).await {
            Ok(Some(flag)) => Some(Restriction {
                status: flag.status,
                source: RestrictionSource::SessionFlag,
                guidance: flag.guidance,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Unreadable session flag, ignoring: {}", e);
                None
            }
        }
    }
}

/// Restrictions contributed by a blocked task's own review records.
fn task_restrictions(task: &Task, reviews: &[ReviewRecord], action: GateAction) -> Vec<Restriction> {
    let mut out = Vec::new();
    for blocker in &task.blocked_by {
        let review = reviews
            .iter()
            .filter(|r| r.kind == ReviewKind::Individual && r.review_task_id == Some(*blocker))
            .last();
        let status = match review.map(|r| r.status) {
            Some(ReviewStatus::Blocked) => Some(FlagStatus::Blocked),
            Some(ReviewStatus::NeedsHumanReview) => Some(FlagStatus::NeedsHumanReview),
            _ if action == GateAction::Complete => Some(FlagStatus::Pending),
            _ => None,
        };
        if let Some(status) = status {
            out.push(Restriction {
                status,
                source: RestrictionSource::Blocker {
                    review_task_id: *blocker,
                },
                guidance: review.and_then(|r| r.guidance.clone()),
            });
        }
    }

    if task.status == TaskStatus::Blocked {
        if let Some(holistic) = latest_holistic_rejection(reviews) {
            out.push(Restriction {
                status: match holistic.status {
                    ReviewStatus::NeedsHumanReview => FlagStatus::NeedsHumanReview,
                    _ => FlagStatus::Blocked,
                },
                source: RestrictionSource::HolisticReview,
                guidance: holistic.guidance.clone(),
            });
        }
    }
    out
}
