//! API request and response types.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::service::ServiceError;
use crate::store::StoreError;
use crate::interceptor::InterceptError;
use crate::task::{Finding, NewTrackedFinding, ReviewType, ReviewVerdict, Verdict};

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether reviews survive a restart
    pub persistent: bool,
}

/// Request to attach a new review blocker to an existing task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddBlockerRequest {
    #[serde(default)]
    pub review_type: ReviewType,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddBlockerResponse {
    pub review_task_id: crate::task::TaskId,
}

/// A verdict for one review task.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteReviewRequest {
    pub verdict: Verdict,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub strengths: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl From<CompleteReviewRequest> for ReviewVerdict {
    fn from(req: CompleteReviewRequest) -> Self {
        let mut verdict = ReviewVerdict::new(req.verdict, req.guidance).with_findings(req.findings);
        if let Some(strengths) = req.strengths {
            verdict = verdict.with_strengths(strengths);
        }
        verdict
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteReviewResponse {
    /// `false` when the review already had a verdict
    pub recorded: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordFindingRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub finding: NewTrackedFinding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DismissFindingRequest {
    pub justification: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearFlagResponse {
    pub cleared: bool,
}

/// Map a service error onto an HTTP status.
pub fn error_response(e: ServiceError) -> (StatusCode, String) {
    let status = match &e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
        ServiceError::Denied { .. } => StatusCode::FORBIDDEN,
        ServiceError::Store(err) | ServiceError::Intercept(InterceptError::Store(err)) => {
            store_status(err)
        }
        ServiceError::Intercept(InterceptError::TaskNotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::Settle(_) | ServiceError::Flag(_) | ServiceError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::TaskNotFound(_)
        | StoreError::ReviewNotFound(_)
        | StoreError::FindingNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        StoreError::InvalidTransition { .. }
        | StoreError::BlockersRemaining { .. }
        | StoreError::AlreadyCompleted { .. }
        | StoreError::AlreadyDismissed(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) | StoreError::Corrupt(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Parse an id from a path segment.
pub(crate) fn parse_id<T>(raw: &str, what: &str) -> Result<T, (StatusCode, String)>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid {} id '{}': {}", what, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::FlagStatus;
    use crate::task::{TaskId, TaskStatus};

    #[test]
    fn test_error_status_mapping() {
        let id = TaskId::new();
        assert_eq!(
            error_response(ServiceError::Store(StoreError::TaskNotFound(id))).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(ServiceError::Store(StoreError::InvalidTransition {
                task: id,
                from: TaskStatus::Completed,
                to: TaskStatus::Pending,
            }))
            .0,
            StatusCode::CONFLICT
        );
        let (status, body) = error_response(ServiceError::Denied {
            reason: "Blocked by review: fix X".to_string(),
            status: Some(FlagStatus::Blocked),
        });
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("fix X"));
        assert_eq!(
            error_response(ServiceError::Intercept(InterceptError::TaskNotFound(id))).0,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_complete_review_request_into_verdict() {
        let req: CompleteReviewRequest = serde_json::from_str(
            r#"{"verdict": "blocked", "guidance": "fix X", "strengths": "tidy"}"#,
        )
        .unwrap();
        let verdict: ReviewVerdict = req.into();
        assert_eq!(verdict.verdict, Verdict::Blocked);
        assert_eq!(verdict.guidance, "fix X");
        assert_eq!(verdict.strengths.as_deref(), Some("tidy"));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        let err = parse_id::<TaskId>("nope", "task").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(parse_id::<TaskId>(&TaskId::new().to_string(), "task").is_ok());
    }
}
