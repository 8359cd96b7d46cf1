//! End-to-end governance flows through `GovernanceService`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use review_gate::flag::{FlagStatus, FlagStore, RaiseOutcome};
use review_gate::gate::{GateAction, GateRequest};
use review_gate::reviewer::{CommandReviewer, Reviewer, ReviewerError, ReviewRequest};
use review_gate::service::{CreateGovernedTask, GovernanceService, SpawnMode};
use review_gate::settle::{SettleOutcome, SettleSettings};
use review_gate::standards::NoStandards;
use review_gate::store::{create_store, StoreType};
use review_gate::task::{
    ReviewKind, ReviewStatus, ReviewType, ReviewVerdict, TaskStatus, Verdict,
};
use review_gate::Config;

struct CountingReviewer {
    verdict: ReviewVerdict,
    calls: AtomicUsize,
    batch_sizes: std::sync::Mutex<Vec<usize>>,
}

impl CountingReviewer {
    fn new(verdict: ReviewVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            calls: AtomicUsize::new(0),
            batch_sizes: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Reviewer for CountingReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewVerdict, ReviewerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(request.tasks.len());
        Ok(self.verdict.clone())
    }
}

async fn sqlite_service(
    dir: &TempDir,
    reviewer: Arc<dyn Reviewer>,
    settings: SettleSettings,
    spawn: SpawnMode,
) -> GovernanceService {
    let store = create_store(StoreType::Sqlite, dir.path().to_path_buf())
        .await
        .unwrap();
    GovernanceService::new(
        store,
        FlagStore::new(dir.path().join("flags"), Duration::from_secs(600)),
        reviewer,
        Arc::new(NoStandards),
        settings,
        Config::compile_pattern(&Config::for_data_dir(dir.path()).review_pattern).unwrap(),
        spawn,
    )
}

fn task(session: &str, subject: &str) -> CreateGovernedTask {
    CreateGovernedTask {
        session_id: session.to_string(),
        subject: subject.to_string(),
        description: None,
        context: None,
        review_type: ReviewType::General,
    }
}

async fn wait_for_flag_cleared(service: &GovernanceService, session: &str) {
    for _ in 0..100 {
        if !service.flags().exists(session) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session flag for {} was never released", session);
}

/// Five tasks created inside one quiet period get one holistic review, and
/// its approval releases every blocker.
#[tokio::test]
async fn test_burst_is_reviewed_once() {
    let dir = TempDir::new().unwrap();
    let reviewer = CountingReviewer::new(ReviewVerdict::approved("all good"));
    let service = sqlite_service(
        &dir,
        reviewer.clone(),
        SettleSettings {
            quiet_period: Duration::from_millis(200),
            review_timeout: Duration::from_secs(5),
        },
        SpawnMode::InProcess,
    )
    .await;

    let mut ids = Vec::new();
    for i in 1..=5 {
        let created = service
            .create_governed_task(task("burst", &format!("T{}", i)))
            .await
            .unwrap();
        let expected = if i == 1 {
            RaiseOutcome::Raised
        } else {
            RaiseOutcome::Folded
        };
        assert_eq!(created.flag, Some(expected));
        ids.push(created.task_id);
    }

    wait_for_flag_cleared(&service, "burst").await;
    // Let the deferred coordinators finish their sleeps.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(reviewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*reviewer.batch_sizes.lock().unwrap(), vec![5]);

    let reviews = service.list_session_reviews("burst").await.unwrap();
    let holistic: Vec<_> = reviews
        .iter()
        .filter(|r| r.kind == ReviewKind::Holistic)
        .collect();
    assert_eq!(holistic.len(), 1);
    assert_eq!(holistic[0].status, ReviewStatus::Approved);
    assert_eq!(holistic[0].target_task_ids.len(), 5);

    for id in ids {
        let task = service.get_task(id).await.unwrap();
        assert!(task.blocked_by.is_empty(), "{} still blocked", task.subject);
        let status = service.get_task_review_status(id).await.unwrap();
        assert!(status.can_execute);
    }
}

#[tokio::test]
async fn test_blocked_review_explains_itself() {
    let dir = TempDir::new().unwrap();
    let service = sqlite_service(
        &dir,
        CountingReviewer::new(ReviewVerdict::approved("unused")),
        SettleSettings::default(),
        SpawnMode::Disabled,
    )
    .await;

    let created = service.create_governed_task(task("s1", "T1")).await.unwrap();
    assert!(service
        .complete_task_review(created.review_task_id, ReviewVerdict::blocked("fix X"))
        .await
        .unwrap());

    let status = service.get_task_review_status(created.task_id).await.unwrap();
    assert!(!status.can_execute);
    assert_eq!(status.status, TaskStatus::Blocked);
    assert!(status.reason.as_deref().unwrap_or_default().contains("fix X"));

    let decision = service
        .check_gate(&GateRequest {
            session_id: "s1".to_string(),
            task_id: Some(created.task_id),
            action: GateAction::Complete,
        })
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.status, Some(FlagStatus::Blocked));
    assert!(decision.reason.contains("fix X"));
}

/// A reviewer that crashes never approves anything.
#[tokio::test]
async fn test_reviewer_crash_needs_human_review() {
    let dir = TempDir::new().unwrap();
    let service = sqlite_service(
        &dir,
        Arc::new(CommandReviewer::new("echo boom >&2; exit 3")),
        SettleSettings {
            quiet_period: Duration::from_millis(10),
            review_timeout: Duration::from_secs(5),
        },
        SpawnMode::Disabled,
    )
    .await;

    let created = service.create_governed_task(task("s1", "T1")).await.unwrap();
    let outcome = service.settle("s1", created.task_id).await.unwrap();
    match outcome {
        SettleOutcome::Reviewed { verdict, tasks, .. } => {
            assert_eq!(verdict, Verdict::NeedsHumanReview);
            assert_eq!(tasks, vec![created.task_id]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let status = service.get_task_review_status(created.task_id).await.unwrap();
    assert!(!status.can_execute);
    let decision = service
        .check_gate(&GateRequest {
            session_id: "s1".to_string(),
            task_id: None,
            action: GateAction::Mutate,
        })
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.status, Some(FlagStatus::NeedsHumanReview));
}

#[tokio::test]
async fn test_reviewer_timeout_needs_human_review() {
    let dir = TempDir::new().unwrap();
    let service = sqlite_service(
        &dir,
        Arc::new(CommandReviewer::new("sleep 5")),
        SettleSettings {
            quiet_period: Duration::from_millis(10),
            review_timeout: Duration::from_millis(200),
        },
        SpawnMode::Disabled,
    )
    .await;

    let created = service.create_governed_task(task("s1", "T1")).await.unwrap();
    let outcome = service.settle("s1", created.task_id).await.unwrap();
    let review_id = match outcome {
        SettleOutcome::Reviewed {
            verdict, review_id, ..
        } => {
            assert_eq!(verdict, Verdict::NeedsHumanReview);
            review_id
        }
        other => panic!("unexpected outcome {:?}", other),
    };

    let review = service
        .store()
        .get_review(review_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(review.status, ReviewStatus::NeedsHumanReview);
    assert!(review.guidance.unwrap().contains("did not finish"));
}

/// Concurrent creation in one session leaves exactly one flag.
#[tokio::test]
async fn test_concurrent_creation_raises_one_flag() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(
        sqlite_service(
            &dir,
            CountingReviewer::new(ReviewVerdict::approved("unused")),
            SettleSettings::default(),
            SpawnMode::Disabled,
        )
        .await,
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .create_governed_task(task("race", &format!("T{}", i)))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut raised = 0;
    for handle in handles {
        let created = handle.await.unwrap();
        assert!(created.flag.is_some());
        if created.flag == Some(RaiseOutcome::Raised) {
            raised += 1;
        }
        let task = service.get_task(created.task_id).await.unwrap();
        assert_eq!(task.blocked_by, vec![created.review_task_id]);
    }
    assert_eq!(raised, 1);

    let flag = service.flags().read("race").unwrap().unwrap();
    assert_eq!(flag.sequence, 8);
    let flag_files = std::fs::read_dir(dir.path().join("flags"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
        .count();
    assert_eq!(flag_files, 1);
}

/// A second service over the same data directory sees the first one's state,
/// the way separate hook processes do.
#[tokio::test]
async fn test_state_is_shared_across_service_instances() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::for_data_dir(dir.path());
    config.quiet_period = Duration::from_millis(10);

    let first = GovernanceService::from_config(&config, SpawnMode::Disabled)
        .await
        .unwrap();
    let created = first.create_governed_task(task("shared", "T1")).await.unwrap();

    let second = GovernanceService::from_config(&config, SpawnMode::Disabled)
        .await
        .unwrap();
    let decision = second
        .check_gate(&GateRequest {
            session_id: "shared".to_string(),
            task_id: Some(created.task_id),
            action: GateAction::Mutate,
        })
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.status, Some(FlagStatus::Pending));

    // No reviewer is configured, so the batch escalates to a human.
    let outcome = second.settle("shared", created.task_id).await.unwrap();
    assert!(matches!(
        outcome,
        SettleOutcome::Reviewed {
            verdict: Verdict::NeedsHumanReview,
            ..
        }
    ));

    assert!(first.clear_flag("shared").await.unwrap());
    assert!(first
        .complete_task_review(created.review_task_id, ReviewVerdict::approved("checked by hand"))
        .await
        .unwrap());
    let done = second.complete_task(created.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}
