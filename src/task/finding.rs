//! Lint/test findings tracked per session.
//!
//! A finding can be dismissed only with a written justification, so the log
//! never records a state change nobody can explain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::review::Severity;
use super::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FindingId(Uuid);

impl FindingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FindingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A finding to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrackedFinding {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Tool or check that produced it (e.g. "clippy", "cargo test")
    pub source: String,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
}

/// An entry in the findings audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFinding {
    pub id: FindingId,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub source: String,
    pub severity: Severity,
    pub description: String,
    pub dismissed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl TrackedFinding {
    pub fn from_new(session_id: impl Into<String>, new: NewTrackedFinding) -> Self {
        Self {
            id: FindingId::new(),
            session_id: session_id.into(),
            task_id: new.task_id,
            source: new.source,
            severity: new.severity,
            description: new.description,
            dismissed: false,
            justification: None,
            created_at: Utc::now(),
            dismissed_at: None,
        }
    }
}
