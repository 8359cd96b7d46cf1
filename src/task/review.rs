//! Review records: individual and holistic reviews and their verdicts.
//!
//! # Invariants
//! - A review record receives exactly one terminal verdict
//! - A completed record is immutable

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskId;

/// Unique identifier for a review record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(Uuid);

impl ReviewId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReviewId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReviewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReviewId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Whether a review covers one task or a session batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Individual,
    Holistic,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Individual => "individual",
            ReviewKind::Holistic => "holistic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(ReviewKind::Individual),
            "holistic" => Some(ReviewKind::Holistic),
            _ => None,
        }
    }
}

/// Review focus tag. Unknown tags are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReviewType {
    #[default]
    General,
    Security,
    Architecture,
    Performance,
    Other(String),
}

impl ReviewType {
    pub fn as_str(&self) -> &str {
        match self {
            ReviewType::General => "general",
            ReviewType::Security => "security",
            ReviewType::Architecture => "architecture",
            ReviewType::Performance => "performance",
            ReviewType::Other(tag) => tag,
        }
    }
}

impl From<String> for ReviewType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "general" => ReviewType::General,
            "security" => ReviewType::Security,
            "architecture" => ReviewType::Architecture,
            "performance" => ReviewType::Performance,
            _ => ReviewType::Other(s.trim().to_string()),
        }
    }
}

impl From<&str> for ReviewType {
    fn from(s: &str) -> Self {
        ReviewType::from(s.to_string())
    }
}

impl From<ReviewType> for String {
    fn from(t: ReviewType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for ReviewType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a review record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Blocked,
    NeedsHumanReview,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Blocked => "blocked",
            ReviewStatus::NeedsHumanReview => "needs_human_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            other => Verdict::parse(other).map(ReviewStatus::from),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal review outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Blocked,
    NeedsHumanReview,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        ReviewStatus::from(*self).as_str()
    }

    /// Parse a verdict, tolerating case and `-`/space separators.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "approved" | "approve" => Some(Verdict::Approved),
            "blocked" | "block" | "rejected" => Some(Verdict::Blocked),
            "needs_human_review" | "needs_human" => Some(Verdict::NeedsHumanReview),
            _ => None,
        }
    }
}

impl From<Verdict> for ReviewStatus {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Approved => ReviewStatus::Approved,
            Verdict::Blocked => ReviewStatus::Blocked,
            Verdict::NeedsHumanReview => ReviewStatus::NeedsHumanReview,
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verdict::parse(s).ok_or_else(|| {
            format!(
                "unknown verdict '{}', expected approved, blocked or needs_human_review",
                s
            )
        })
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// A structured reviewer finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// 1 = must fix, 2 = should fix, 3 = consider
    #[serde(default = "default_tier")]
    pub tier: u8,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// What the fix must not break
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve: Option<String>,
}

fn default_tier() -> u8 {
    2
}

/// The payload recorded when a review completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    #[serde(default)]
    pub guidance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strengths: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Standards the reviewer consulted
    #[serde(default)]
    pub standards: Vec<String>,
}

impl ReviewVerdict {
    pub fn new(verdict: Verdict, guidance: impl Into<String>) -> Self {
        Self {
            verdict,
            guidance: guidance.into(),
            strengths: None,
            findings: Vec::new(),
            standards: Vec::new(),
        }
    }

    pub fn approved(guidance: impl Into<String>) -> Self {
        Self::new(Verdict::Approved, guidance)
    }

    pub fn blocked(guidance: impl Into<String>) -> Self {
        Self::new(Verdict::Blocked, guidance)
    }

    pub fn needs_human_review(guidance: impl Into<String>) -> Self {
        Self::new(Verdict::NeedsHumanReview, guidance)
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_strengths(mut self, strengths: impl Into<String>) -> Self {
        self.strengths = Some(strengths.into());
        self
    }

    pub fn with_standards(mut self, standards: Vec<String>) -> Self {
        self.standards = standards;
        self
    }
}

/// A persisted review request and, once completed, its verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: ReviewId,
    pub kind: ReviewKind,
    /// The blocker task an individual review is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_task_id: Option<TaskId>,
    pub session_id: String,
    pub target_task_ids: Vec<TaskId>,
    pub review_type: ReviewType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strengths: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub standards: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReviewRecord {
    /// A pending individual review attached to `review_task_id`.
    pub fn individual(
        session_id: impl Into<String>,
        target: TaskId,
        review_task_id: Option<TaskId>,
        review_type: ReviewType,
        context: Option<String>,
    ) -> Self {
        Self {
            id: ReviewId::new(),
            kind: ReviewKind::Individual,
            review_task_id,
            session_id: session_id.into(),
            target_task_ids: vec![target],
            review_type,
            context,
            status: ReviewStatus::Pending,
            guidance: None,
            strengths: None,
            findings: Vec::new(),
            standards: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A pending holistic review over a session batch.
    pub fn holistic(
        session_id: impl Into<String>,
        targets: Vec<TaskId>,
        context: Option<String>,
    ) -> Self {
        Self {
            kind: ReviewKind::Holistic,
            target_task_ids: targets,
            ..Self::individual(session_id, TaskId::new(), None, ReviewType::General, context)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this is the pending individual review attached to `blocker`.
    pub fn is_pending_blocker(&self, blocker: TaskId) -> bool {
        self.kind == ReviewKind::Individual
            && self.review_task_id == Some(blocker)
            && self.status == ReviewStatus::Pending
    }

    /// Record the verdict. Callers must check `is_completed` first.
    pub(crate) fn apply_verdict(&mut self, verdict: &ReviewVerdict, now: DateTime<Utc>) {
        self.status = verdict.verdict.into();
        self.guidance = Some(verdict.guidance.clone());
        self.strengths = verdict.strengths.clone();
        self.findings = verdict.findings.clone();
        self.standards = verdict.standards.clone();
        self.completed_at = Some(now);
    }
}
