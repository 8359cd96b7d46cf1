//! Core Task type and its status state machine.
//!
//! # Invariants
//! - `blocked_by` and `blocks` are duplicate-free and keep insertion order
//! - A task with a non-empty `blocked_by` never reaches `Completed`
//! - Tasks are never deleted, only completed or abandoned

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique across sessions
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// What a task is for.
///
/// Review tasks are the blockers attached to work tasks; they are never
/// paired with a review of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Work,
    Review,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Work => "work",
            TaskKind::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "work" => Some(TaskKind::Work),
            "review" => Some(TaskKind::Review),
            _ => None,
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending ──▶ InProgress ──▶ Completed
///    │ ▲          │
///    ▼ │          ▼
/// Blocked ◀───────┘
///    │
///    ▼
/// Approved ──▶ InProgress
///
/// any non-terminal ──▶ Abandoned
/// ```
///
/// `Completed` and `Abandoned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Approved,
    Completed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Approved => "approved",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "approved" => Some(TaskStatus::Approved),
            "completed" => Some(TaskStatus::Completed),
            "abandoned" => Some(TaskStatus::Abandoned),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed for non-terminal states.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Abandoned) => true,
            (Pending, InProgress | Blocked | Approved | Completed) => true,
            (Blocked, Pending | Approved) => true,
            (Approved, Pending | InProgress | Blocked | Completed) => true,
            (InProgress, Pending | Blocked | Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work created by an actor within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Actor/run grouping; holistic reviews are scoped to one session
    pub session_id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Review tasks that must resolve before this task may complete
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
    /// Tasks this one blocks (set on review tasks)
    #[serde(default)]
    pub blocks: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh pending task from a creation request.
    pub fn from_new(new: NewTask) -> Self {
        Self {
            id: TaskId::new(),
            session_id: new.session_id,
            subject: new.subject,
            description: new.description,
            kind: new.kind,
            status: TaskStatus::Pending,
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether any blocker is still attached.
    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }

    pub fn is_review(&self) -> bool {
        self.kind == TaskKind::Review
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub session_id: String,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: TaskKind,
}

impl NewTask {
    /// A work task (the kind that gets governed).
    pub fn work(session_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            subject: subject.into(),
            description: None,
            kind: TaskKind::Work,
        }
    }

    /// A review task (a blocker for some work task).
    pub fn review(session_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Review,
            ..Self::work(session_id, subject)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Push `id` unless it is already present. Returns whether it was added.
pub(crate) fn push_unique(ids: &mut Vec<TaskId>, id: TaskId) -> bool {
    if ids.contains(&id) {
        false
    } else {
        ids.push(id);
        true
    }
}
