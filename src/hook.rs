//! Agent hook commands.
//!
//! The `review-gate-hook` binary parses a [`Cli`], builds a
//! [`GovernanceService`] over the shared data directory and hands the
//! command to [`dispatch`]. Each command answers with a JSON body for stdout
//! and a process exit code.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

use crate::gate::{GateAction, GateRequest};
use crate::interceptor::InterceptOutcome;
use crate::service::{CreateGovernedTask, GovernanceService, SpawnMode};
use crate::task::{Finding, NewTask, ReviewType, ReviewVerdict, TaskId, Verdict};

/// Exit code of a denied gate check.
pub const EXIT_DENIED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "review-gate-hook", version, about = "Review gate hooks for agent task lifecycles")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a task and pair it with a review blocker.
    Intercept(InterceptArgs),
    /// Ask whether the session may proceed. Exits 0 to allow, 2 to deny.
    CheckGate(CheckGateArgs),
    /// Run one settle coordinator for a session.
    Settle(SettleArgs),
    /// Record the verdict of a review task.
    CompleteReview(CompleteReviewArgs),
    /// Print the review status of a task.
    Status(StatusArgs),
    /// Drop the session flag (human override).
    ClearFlag(ClearFlagArgs),
}

impl Command {
    /// Only interception starts settle coordinators; they run as detached
    /// copies of the current executable.
    pub fn spawn_mode(&self) -> std::io::Result<SpawnMode> {
        match self {
            Command::Intercept(_) => Ok(SpawnMode::Detached {
                program: std::env::current_exe()?,
            }),
            _ => Ok(SpawnMode::Disabled),
        }
    }
}

#[derive(Args, Debug)]
pub struct InterceptArgs {
    #[arg(long)]
    pub session: String,

    #[arg(long)]
    pub subject: String,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long, value_enum, default_value = "work")]
    pub kind: CliTaskKind,

    /// Review type requested for the blocker (general, security, ...).
    #[arg(long, default_value = "general")]
    pub review_type: String,

    /// Context handed to the reviewer.
    #[arg(long)]
    pub context: Option<String>,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum CliTaskKind {
    Work,
    Review,
}

#[derive(Args, Debug)]
pub struct CheckGateArgs {
    #[arg(long)]
    pub session: String,

    #[arg(long)]
    pub task: Option<TaskId>,

    /// mutate or complete
    #[arg(long, default_value = "mutate")]
    pub action: GateAction,
}

#[derive(Args, Debug)]
pub struct SettleArgs {
    #[arg(long)]
    pub session: String,

    /// The task whose creation spawned this coordinator.
    #[arg(long)]
    pub task: TaskId,
}

#[derive(Args, Debug)]
pub struct CompleteReviewArgs {
    #[arg(long)]
    pub review_task: TaskId,

    /// approved, blocked or needs_human_review
    #[arg(long)]
    pub verdict: Verdict,

    #[arg(long, default_value = "")]
    pub guidance: String,

    /// What the reviewed work does well.
    #[arg(long)]
    pub strengths: Option<String>,

    /// JSON array of findings, e.g. `[{"tier":1,"description":"..."}]`.
    #[arg(long, value_parser = parse_findings)]
    pub findings: Option<FindingList>,
}

/// Findings passed as one JSON argument.
#[derive(Clone, Debug)]
pub struct FindingList(pub Vec<Finding>);

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long)]
    pub task: TaskId,
}

#[derive(Args, Debug)]
pub struct ClearFlagArgs {
    #[arg(long)]
    pub session: String,
}

fn parse_findings(raw: &str) -> Result<FindingList, String> {
    serde_json::from_str(raw)
        .map(FindingList)
        .map_err(|e| format!("invalid findings JSON: {}", e))
}

#[derive(Debug, Serialize)]
struct InterceptResponse {
    task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    review_task_id: Option<TaskId>,
    outcome: InterceptOutcome,
}

/// What a hook prints and how it exits.
#[derive(Debug)]
pub struct HookReply {
    /// Printed to stdout unless `Null`
    pub body: Value,
    pub exit_code: u8,
}

impl HookReply {
    fn ok(body: impl Serialize) -> anyhow::Result<Self> {
        Ok(Self {
            body: serde_json::to_value(body)?,
            exit_code: 0,
        })
    }
}

/// Run one hook command against `service`.
pub async fn dispatch(service: &GovernanceService, command: Command) -> anyhow::Result<HookReply> {
    match command {
        Command::Intercept(args) => intercept(service, args).await,
        Command::CheckGate(args) => {
            let decision = service
                .check_gate(&GateRequest {
                    session_id: args.session,
                    task_id: args.task,
                    action: args.action,
                })
                .await;
            let exit_code = if decision.allow { 0 } else { EXIT_DENIED };
            Ok(HookReply {
                body: serde_json::to_value(&decision)?,
                exit_code,
            })
        }
        Command::Settle(args) => {
            let outcome = service.settle(&args.session, args.task).await?;
            tracing::info!(session_id = %args.session, task_id = %args.task, ?outcome, "Settle finished");
            Ok(HookReply {
                body: Value::Null,
                exit_code: 0,
            })
        }
        Command::CompleteReview(args) => {
            let mut verdict = ReviewVerdict::new(args.verdict, args.guidance)
                .with_findings(args.findings.map(|list| list.0).unwrap_or_default());
            if let Some(strengths) = args.strengths {
                verdict = verdict.with_strengths(strengths);
            }
            let recorded = service
                .complete_task_review(args.review_task, verdict)
                .await?;
            HookReply::ok(serde_json::json!({ "recorded": recorded }))
        }
        Command::Status(args) => {
            HookReply::ok(service.get_task_review_status(args.task).await?)
        }
        Command::ClearFlag(args) => {
            let cleared = service.clear_flag(&args.session).await?;
            HookReply::ok(serde_json::json!({ "cleared": cleared }))
        }
    }
}

/// Work tasks are created already paired, in one store transaction, so a
/// failed pairing never leaves an ungoverned task behind.
async fn intercept(service: &GovernanceService, args: InterceptArgs) -> anyhow::Result<HookReply> {
    let review_type = ReviewType::from(args.review_type);
    let response = match args.kind {
        CliTaskKind::Work => {
            let created = service
                .create_governed_task(CreateGovernedTask {
                    session_id: args.session,
                    subject: args.subject,
                    description: args.description,
                    context: args.context,
                    review_type,
                })
                .await?;
            InterceptResponse {
                task_id: created.task_id,
                review_task_id: Some(created.review_task_id),
                outcome: InterceptOutcome::Paired {
                    review_task_id: created.review_task_id,
                    flag: created.flag,
                },
            }
        }
        CliTaskKind::Review => {
            let mut new = NewTask::review(args.session, args.subject);
            new.description = args.description;
            let task = service.create_task(new).await?;
            let outcome = service
                .intercept(task.id, review_type, args.context.as_deref())
                .await?;
            let review_task_id = match &outcome {
                InterceptOutcome::Paired { review_task_id, .. } => Some(*review_task_id),
                InterceptOutcome::Skipped => None,
            };
            InterceptResponse {
                task_id: task.id,
                review_task_id,
                outcome,
            }
        }
    };
    HookReply::ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flag::{FlagStore, RaiseOutcome};
    use crate::reviewer::NoReviewer;
    use crate::settle::SettleSettings;
    use crate::standards::NoStandards;
    use crate::store::faulty::{Faults, FaultyStore};
    use crate::store::{GovernanceStore, InMemoryGovernanceStore, ReviewStore, TaskStore};
    use crate::task::{ReviewKind, TaskStatus};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir, store: Arc<dyn GovernanceStore>) -> GovernanceService {
        GovernanceService::new(
            store,
            FlagStore::new(dir.path().join("flags"), Duration::from_secs(600)),
            Arc::new(NoReviewer),
            Arc::new(NoStandards),
            SettleSettings {
                quiet_period: Duration::from_millis(10),
                review_timeout: Duration::from_secs(2),
            },
            Config::compile_pattern(&Config::for_data_dir(dir.path()).review_pattern).unwrap(),
            SpawnMode::Disabled,
        )
    }

    fn parse(args: &[&str]) -> Command {
        let argv = std::iter::once("review-gate-hook").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap().command
    }

    fn id_at(body: &Value, key: &str) -> TaskId {
        body[key].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_intercept_work_creates_paired_task() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Arc::new(InMemoryGovernanceStore::new()));

        let reply = dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"]))
            .await
            .unwrap();
        assert_eq!(reply.exit_code, 0);
        assert_eq!(reply.body["outcome"]["outcome"], "paired");

        let task = svc.get_task(id_at(&reply.body, "task_id")).await.unwrap();
        assert_eq!(task.blocked_by, vec![id_at(&reply.body, "review_task_id")]);
        assert_eq!(svc.flags().read("s1").unwrap().unwrap().latest_task_id, task.id);
    }

    /// Interception must not go through the separate create-then-pair path,
    /// which would leave the task unblocked when pairing fails.
    #[tokio::test]
    async fn test_intercept_work_does_not_pair_after_the_fact() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(Faults {
            pair_review: true,
            ..Faults::default()
        }));
        let svc = service(&dir, store);

        let reply = dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"]))
            .await
            .unwrap();
        let task = svc.get_task(id_at(&reply.body, "task_id")).await.unwrap();
        assert_eq!(task.blocked_by.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_intercept_leaves_no_task() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(Faults {
            create_governed_task: true,
            ..Faults::default()
        }));
        let svc = service(&dir, store.clone());

        let result = dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"])).await;
        assert!(result.is_err());
        assert!(store.list_siblings("s1", None, 100).await.unwrap().is_empty());
        assert!(!svc.flags().exists("s1"));
    }

    #[tokio::test]
    async fn test_intercept_review_is_not_paired() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Arc::new(InMemoryGovernanceStore::new()));

        let reply = dispatch(
            &svc,
            parse(&["intercept", "--session", "s1", "--subject", "look at T1", "--kind", "review"]),
        )
        .await
        .unwrap();
        assert_eq!(reply.body["outcome"]["outcome"], "skipped");
        assert!(reply.body.get("review_task_id").is_none());
        assert!(!svc.flags().exists("s1"));
    }

    #[tokio::test]
    async fn test_check_gate_exit_codes() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Arc::new(InMemoryGovernanceStore::new()));

        let allowed = dispatch(&svc, parse(&["check-gate", "--session", "s1"]))
            .await
            .unwrap();
        assert_eq!(allowed.exit_code, 0);
        assert_eq!(allowed.body["allow"], true);

        dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"]))
            .await
            .unwrap();
        let denied = dispatch(&svc, parse(&["check-gate", "--session", "s1"]))
            .await
            .unwrap();
        assert_eq!(denied.exit_code, EXIT_DENIED);
        assert_eq!(denied.body["allow"], false);
        assert_eq!(denied.body["status"], "pending");
    }

    #[tokio::test]
    async fn test_complete_review_records_findings_and_strengths() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Arc::new(InMemoryGovernanceStore::new()));
        let created = dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"]))
            .await
            .unwrap();
        let task_id = id_at(&created.body, "task_id");
        let review_task = id_at(&created.body, "review_task_id").to_string();

        let reply = dispatch(
            &svc,
            parse(&[
                "complete-review",
                "--review-task",
                &review_task,
                "--verdict",
                "blocked",
                "--guidance",
                "fix X",
                "--strengths",
                "clear naming",
                "--findings",
                r#"[{"tier":1,"description":"X is unchecked","remediation":"check X"}]"#,
            ]),
        )
        .await
        .unwrap();
        assert_eq!(reply.body["recorded"], true);

        let review = svc
            .store()
            .get_by_task(task_id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.kind == ReviewKind::Individual)
            .unwrap();
        assert_eq!(review.strengths.as_deref(), Some("clear naming"));
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].tier, 1);
        assert_eq!(review.findings[0].remediation.as_deref(), Some("check X"));

        let status = dispatch(&svc, parse(&["status", "--task", &task_id.to_string()]))
            .await
            .unwrap();
        assert_eq!(status.body["can_execute"], false);
        assert_eq!(svc.get_task(task_id).await.unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn test_malformed_findings_are_rejected_by_the_parser() {
        let result = Cli::try_parse_from([
            "review-gate-hook",
            "complete-review",
            "--review-task",
            &TaskId::new().to_string(),
            "--verdict",
            "blocked",
            "--findings",
            "not json",
        ]);
        assert!(result.is_err());
    }

    /// Without a reviewer the batch escalates; clearing the flag is the
    /// human override.
    #[tokio::test]
    async fn test_settle_then_clear_flag() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Arc::new(InMemoryGovernanceStore::new()));
        let created = dispatch(&svc, parse(&["intercept", "--session", "s1", "--subject", "T1"]))
            .await
            .unwrap();
        assert_eq!(created.body["outcome"]["flag"], serde_json::json!(RaiseOutcome::Raised));
        let task = id_at(&created.body, "task_id").to_string();

        let settled = dispatch(&svc, parse(&["settle", "--session", "s1", "--task", &task]))
            .await
            .unwrap();
        assert!(settled.body.is_null());
        assert_eq!(
            svc.flags().read("s1").unwrap().unwrap().status,
            crate::flag::FlagStatus::NeedsHumanReview
        );

        let cleared = dispatch(&svc, parse(&["clear-flag", "--session", "s1"]))
            .await
            .unwrap();
        assert_eq!(cleared.body["cleared"], true);
        assert!(!svc.flags().exists("s1"));
    }
}
