//! External reviewer integration.
//!
//! The reviewer is whatever produces verdicts: a human-driven tool, an LLM
//! wrapper script, a CI job. `CommandReviewer` runs a shell command, writes the
//! request as JSON on stdin and expects a JSON verdict on stdout:
//!
//! ```json
//! {"verdict": "approved", "guidance": "...", "strengths": "...", "findings": []}
//! ```
//!
//! Anything that is not a well-formed verdict is an error, and every error is
//! turned into `needs_human_review` by [`obtain_verdict`]. A reviewer failure
//! never approves work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::task::{Finding, ReviewId, ReviewKind, ReviewType, ReviewVerdict, TaskId, Verdict};

#[derive(Debug, Error)]
pub enum ReviewerError {
    #[error("No reviewer configured")]
    NotConfigured,

    #[error("Failed to start reviewer command: {0}")]
    Spawn(std::io::Error),

    #[error("Reviewer exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Malformed reviewer verdict: {0}")]
    Malformed(String),

    #[error("Reviewer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A task as presented to the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubject {
    pub task_id: TaskId,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What the reviewer is asked to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub review_id: ReviewId,
    pub session_id: String,
    pub kind: ReviewKind,
    pub review_type: ReviewType,
    pub tasks: Vec<ReviewSubject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Project standards the verdict should be checked against
    #[serde(default)]
    pub standards: Vec<String>,
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewVerdict, ReviewerError>;
}

/// Placeholder used when no reviewer command is configured.
pub struct NoReviewer;

#[async_trait]
impl Reviewer for NoReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<ReviewVerdict, ReviewerError> {
        Err(ReviewerError::NotConfigured)
    }
}

/// Runs `sh -c <command>` per review.
pub struct CommandReviewer {
    command: String,
}

impl CommandReviewer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewVerdict, ReviewerError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ReviewerError::Malformed(format!("request encoding: {}", e)))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ReviewerError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            // A reviewer that ignores stdin may exit before reading it.
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReviewerError::NonZeroExit {
                code: output.status.code(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        parse_verdict(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    guidance: Option<String>,
    #[serde(default)]
    strengths: Option<String>,
    #[serde(default)]
    findings: Vec<Finding>,
    #[serde(default)]
    standards: Vec<String>,
}

/// Parse a verdict from reviewer output, tolerating prose around the JSON.
pub fn parse_verdict(output: &str) -> Result<ReviewVerdict, ReviewerError> {
    let trimmed = output.trim();
    let raw: RawVerdict = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(first_err) => {
            let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
                return Err(ReviewerError::Malformed(format!(
                    "no JSON object in output: {}",
                    first_err
                )));
            };
            if end < start {
                return Err(ReviewerError::Malformed("unbalanced JSON object".to_string()));
            }
            serde_json::from_str(&trimmed[start..=end])
                .map_err(|e| ReviewerError::Malformed(e.to_string()))?
        }
    };

    let verdict: Verdict = raw.verdict.parse().map_err(ReviewerError::Malformed)?;
    let mut result = ReviewVerdict::new(verdict, raw.guidance.unwrap_or_default())
        .with_findings(raw.findings)
        .with_standards(raw.standards);
    if let Some(strengths) = raw.strengths {
        result = result.with_strengths(strengths);
    }
    Ok(result)
}

/// Ask the reviewer, bounded by `timeout`. Failures become `needs_human_review`.
pub async fn obtain_verdict(
    reviewer: &dyn Reviewer,
    request: &ReviewRequest,
    timeout: Duration,
) -> ReviewVerdict {
    match tokio::time::timeout(timeout, reviewer.review(request)).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            tracing::warn!(
                review_id = %request.review_id,
                session_id = %request.session_id,
                "Reviewer failed, escalating to human review: {}",
                e
            );
            ReviewVerdict::needs_human_review(format!(
                "Automated review could not complete ({}). A human must review these tasks \
                 before work continues.",
                e
            ))
        }
        Err(_) => {
            tracing::warn!(
                review_id = %request.review_id,
                session_id = %request.session_id,
                "Reviewer timed out after {:?}",
                timeout
            );
            ReviewVerdict::needs_human_review(format!(
                "Automated review did not finish within {}s. A human must review these tasks \
                 before work continues.",
                timeout.as_secs()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ReviewRequest {
        ReviewRequest {
            review_id: ReviewId::new(),
            session_id: "s1".to_string(),
            kind: ReviewKind::Holistic,
            review_type: ReviewType::General,
            tasks: vec![ReviewSubject {
                task_id: TaskId::new(),
                subject: "Add login form".to_string(),
                description: None,
            }],
            context: None,
            standards: vec!["No unwrap in library code".to_string()],
        }
    }

    #[tokio::test]
    async fn test_command_reviewer_parses_json_verdict() {
        let reviewer = CommandReviewer::new(
            r#"cat >/dev/null; echo '{"verdict": "approved", "guidance": "looks good", "strengths": "small diff"}'"#,
        );
        let verdict = reviewer.review(&request()).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Approved);
        assert_eq!(verdict.guidance, "looks good");
        assert_eq!(verdict.strengths.as_deref(), Some("small diff"));
    }

    /// The reviewer sees the request on stdin.
    #[tokio::test]
    async fn test_command_reviewer_receives_request() {
        let reviewer = CommandReviewer::new(
            r#"if grep -q "Add login form"; then echo '{"verdict":"blocked","guidance":"fix X"}'; else echo '{"verdict":"approved"}'; fi"#,
        );
        let verdict = reviewer.review(&request()).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Blocked);
        assert_eq!(verdict.guidance, "fix X");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let reviewer = CommandReviewer::new("echo boom >&2; exit 3");
        let err = reviewer.review(&request()).await.unwrap_err();
        match err {
            ReviewerError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_verdict_tolerates_surrounding_prose() {
        let verdict = parse_verdict(
            "Here is my assessment:\n{\"verdict\": \"needs-human-review\", \"guidance\": \"unclear\"}\nThanks",
        )
        .unwrap();
        assert_eq!(verdict.verdict, Verdict::NeedsHumanReview);
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert!(matches!(
            parse_verdict("LGTM!"),
            Err(ReviewerError::Malformed(_))
        ));
        assert!(matches!(
            parse_verdict(r#"{"verdict": "probably fine"}"#),
            Err(ReviewerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_crashing_reviewer_needs_human_review() {
        let reviewer = CommandReviewer::new("exit 3");
        let verdict = obtain_verdict(&reviewer, &request(), Duration::from_secs(5)).await;
        assert_eq!(verdict.verdict, Verdict::NeedsHumanReview);
    }

    #[tokio::test]
    async fn test_garbage_output_needs_human_review() {
        let reviewer = CommandReviewer::new("echo 'ship it'");
        let verdict = obtain_verdict(&reviewer, &request(), Duration::from_secs(5)).await;
        assert_eq!(verdict.verdict, Verdict::NeedsHumanReview);
    }

    #[tokio::test]
    async fn test_timeout_needs_human_review() {
        let reviewer = CommandReviewer::new("sleep 5; echo '{\"verdict\":\"approved\"}'");
        let verdict = obtain_verdict(&reviewer, &request(), Duration::from_millis(200)).await;
        assert_eq!(verdict.verdict, Verdict::NeedsHumanReview);
        assert!(verdict.guidance.contains("did not finish"));
    }

    #[tokio::test]
    async fn test_missing_reviewer_needs_human_review() {
        let verdict = obtain_verdict(&NoReviewer, &request(), Duration::from_secs(1)).await;
        assert_eq!(verdict.verdict, Verdict::NeedsHumanReview);
    }
}
