//! SQLite-based governance store shared by every process of a deployment.
//!
//! Writes run in `BEGIN IMMEDIATE` transactions so concurrent processes
//! serialize on the database write lock instead of interleaving blocker
//! updates. WAL mode plus a busy timeout keeps readers unblocked.

use super::{
    apply_status, check_transition, pairing_description, review_subject, status_after_new_blocker,
    status_after_verdict, validate_justification, FindingLog, GovernanceStore, Pairing,
    ReviewStore, StoreError, TaskStore,
};
use crate::task::{
    Finding, FindingId, NewTask, NewTrackedFinding, ReviewId, ReviewKind, ReviewRecord,
    ReviewStatus, ReviewType, ReviewVerdict, Severity, Task, TaskId, TaskKind, TaskStatus,
    TrackedFinding, Verdict,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Database file inside the data directory.
pub const DB_FILE_NAME: &str = "review_gate.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    description TEXT,
    kind TEXT NOT NULL DEFAULT 'work',
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id, created_at);

CREATE TABLE IF NOT EXISTS task_blockers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    blocker_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (task_id, blocker_id),
    FOREIGN KEY (task_id) REFERENCES tasks(id),
    FOREIGN KEY (blocker_id) REFERENCES tasks(id)
);

CREATE INDEX IF NOT EXISTS idx_blockers_blocker ON task_blockers(blocker_id);

CREATE TABLE IF NOT EXISTS reviews (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    review_task_id TEXT,
    session_id TEXT NOT NULL,
    review_type TEXT NOT NULL DEFAULT 'general',
    context TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    guidance TEXT,
    strengths TEXT,
    findings TEXT NOT NULL DEFAULT '[]',
    standards TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    FOREIGN KEY (review_task_id) REFERENCES tasks(id)
);

CREATE INDEX IF NOT EXISTS idx_reviews_session ON reviews(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_reviews_review_task ON reviews(review_task_id) WHERE review_task_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS review_targets (
    review_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (review_id, task_id),
    FOREIGN KEY (review_id) REFERENCES reviews(id),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE INDEX IF NOT EXISTS idx_review_targets_task ON review_targets(task_id);

CREATE TABLE IF NOT EXISTS findings (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    task_id TEXT,
    source TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    dismissed INTEGER NOT NULL DEFAULT 0,
    justification TEXT,
    created_at TEXT NOT NULL,
    dismissed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_findings_session ON findings(session_id, created_at);
"#;

const TASK_COLUMNS: &str =
    "id, session_id, subject, description, kind, status, created_at, completed_at";

const REVIEW_COLUMNS: &str = "id, kind, review_task_id, session_id, review_type, context, status,
     guidance, strengths, findings, standards, created_at, completed_at";

const FINDING_COLUMNS: &str = "id, session_id, task_id, source, severity, description, dismissed,
     justification, created_at, dismissed_at";

pub struct SqliteGovernanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGovernanceStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create governance data dir: {}", e))
        })?;
        let db_path = data_dir.join(DB_FILE_NAME);

        // Open database in blocking task
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            tracing::debug!("Opened governance store at {}", db_path.display());
            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection in a blocking task.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut *conn)
        })
        .await?
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    async fn in_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_id<T>(s: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| StoreError::Corrupt(format!("invalid id '{}': {}", s, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

struct TaskRow {
    id: String,
    session_id: String,
    subject: String,
    description: Option<String>,
    kind: String,
    status: String,
    created_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            subject: row.get(2)?,
            description: row.get(3)?,
            kind: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_task(self, conn: &Connection) -> Result<Task, StoreError> {
        let blocked_by = edge_ids(
            conn,
            "SELECT blocker_id FROM task_blockers WHERE task_id = ?1 ORDER BY id",
            &self.id,
        )?;
        let blocks = edge_ids(
            conn,
            "SELECT task_id FROM task_blockers WHERE blocker_id = ?1 ORDER BY id",
            &self.id,
        )?;
        Ok(Task {
            id: parse_id(&self.id)?,
            session_id: self.session_id,
            subject: self.subject,
            description: self.description,
            kind: TaskKind::parse(&self.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown task kind '{}'", self.kind)))?,
            status: TaskStatus::parse(&self.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown task status '{}'", self.status))
            })?,
            blocked_by,
            blocks,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

fn edge_ids(conn: &Connection, sql: &str, id: &str) -> Result<Vec<TaskId>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.iter().map(|s| parse_id(s)).collect()
}

fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tasks (id, session_id, subject, description, kind, status, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id.to_string(),
            task.session_id,
            task.subject,
            task.description,
            task.kind.as_str(),
            task.status.as_str(),
            ts(&task.created_at),
            task.completed_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

fn load_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id.to_string()],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(|r| r.into_task(conn)).transpose()
}

fn require_task(conn: &Connection, id: TaskId) -> Result<Task, StoreError> {
    load_task(conn, id)?.ok_or(StoreError::TaskNotFound(id))
}

fn write_status(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tasks SET status = ?1, completed_at = ?2 WHERE id = ?3",
        params![
            task.status.as_str(),
            task.completed_at.as_ref().map(ts),
            task.id.to_string(),
        ],
    )?;
    Ok(())
}

fn insert_edge(conn: &Connection, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO task_blockers (task_id, blocker_id, created_at) VALUES (?1, ?2, ?3)",
        params![task_id.to_string(), blocker_id.to_string(), ts(&Utc::now())],
    )?;
    Ok(())
}

fn delete_edge(conn: &Connection, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM task_blockers WHERE task_id = ?1 AND blocker_id = ?2",
        params![task_id.to_string(), blocker_id.to_string()],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Reviews
// ─────────────────────────────────────────────────────────────────────────────

struct ReviewRow {
    id: String,
    kind: String,
    review_task_id: Option<String>,
    session_id: String,
    review_type: String,
    context: Option<String>,
    status: String,
    guidance: Option<String>,
    strengths: Option<String>,
    findings: String,
    standards: String,
    created_at: String,
    completed_at: Option<String>,
}

impl ReviewRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            review_task_id: row.get(2)?,
            session_id: row.get(3)?,
            review_type: row.get(4)?,
            context: row.get(5)?,
            status: row.get(6)?,
            guidance: row.get(7)?,
            strengths: row.get(8)?,
            findings: row.get(9)?,
            standards: row.get(10)?,
            created_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_review(self, conn: &Connection) -> Result<ReviewRecord, StoreError> {
        let target_task_ids = edge_ids(
            conn,
            "SELECT task_id FROM review_targets WHERE review_id = ?1 ORDER BY position",
            &self.id,
        )?;
        let findings: Vec<Finding> = serde_json::from_str(&self.findings)
            .map_err(|e| StoreError::Corrupt(format!("review {} findings: {}", self.id, e)))?;
        let standards: Vec<String> = serde_json::from_str(&self.standards)
            .map_err(|e| StoreError::Corrupt(format!("review {} standards: {}", self.id, e)))?;
        Ok(ReviewRecord {
            id: parse_id(&self.id)?,
            kind: ReviewKind::parse(&self.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown review kind '{}'", self.kind)))?,
            review_task_id: self.review_task_id.as_deref().map(parse_id).transpose()?,
            session_id: self.session_id,
            target_task_ids,
            review_type: ReviewType::from(self.review_type),
            context: self.context,
            status: ReviewStatus::parse(&self.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown review status '{}'", self.status))
            })?,
            guidance: self.guidance,
            strengths: self.strengths,
            findings,
            standards,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

fn insert_review(conn: &Connection, review: &ReviewRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO reviews (id, kind, review_task_id, session_id, review_type, context, status,
                              guidance, strengths, findings, standards, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            review.id.to_string(),
            review.kind.as_str(),
            review.review_task_id.map(|id| id.to_string()),
            review.session_id,
            review.review_type.as_str(),
            review.context,
            review.status.as_str(),
            review.guidance,
            review.strengths,
            to_json(&review.findings)?,
            to_json(&review.standards)?,
            ts(&review.created_at),
            review.completed_at.as_ref().map(ts),
        ],
    )?;
    for (position, task_id) in review.target_task_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO review_targets (review_id, task_id, position) VALUES (?1, ?2, ?3)",
            params![review.id.to_string(), task_id.to_string(), position as i64],
        )?;
    }
    Ok(())
}

fn query_reviews(
    conn: &Connection,
    where_clause: &str,
    param: &str,
) -> Result<Vec<ReviewRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM reviews WHERE {} ORDER BY created_at, rowid",
        REVIEW_COLUMNS, where_clause
    ))?;
    let rows = stmt
        .query_map(params![param], ReviewRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|r| r.into_review(conn)).collect()
}

fn load_review(conn: &Connection, id: ReviewId) -> Result<Option<ReviewRecord>, StoreError> {
    Ok(query_reviews(conn, "id = ?1", &id.to_string())?.into_iter().next())
}

fn complete_in(
    conn: &Connection,
    id: ReviewId,
    verdict: &ReviewVerdict,
) -> Result<ReviewRecord, StoreError> {
    let mut review = load_review(conn, id)?.ok_or(StoreError::ReviewNotFound(id))?;
    if review.is_completed() {
        return Err(StoreError::AlreadyCompleted {
            review: id,
            first: review.status,
        });
    }
    review.apply_verdict(verdict, Utc::now());
    let updated = conn.execute(
        "UPDATE reviews SET status = ?1, guidance = ?2, strengths = ?3, findings = ?4,
                            standards = ?5, completed_at = ?6
         WHERE id = ?7 AND status = 'pending'",
        params![
            review.status.as_str(),
            review.guidance,
            review.strengths,
            to_json(&review.findings)?,
            to_json(&review.standards)?,
            review.completed_at.as_ref().map(ts),
            id.to_string(),
        ],
    )?;
    if updated == 0 {
        let first = load_review(conn, id)?
            .map(|r| r.status)
            .unwrap_or(ReviewStatus::Pending);
        return Err(StoreError::AlreadyCompleted { review: id, first });
    }
    Ok(review)
}

fn pair_in(
    conn: &Connection,
    task_id: TaskId,
    review_type: ReviewType,
    context: Option<&str>,
) -> Result<Pairing, StoreError> {
    let task = require_task(conn, task_id)?;
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
    for blocker in &task.blocked_by {
        let rejected = conn
            .prepare(
                "SELECT 1 FROM reviews
                 WHERE review_task_id = ?1 AND status IN ('blocked', 'needs_human_review')",
            )?
            .exists(params![blocker.to_string()])?;
        if rejected {
            delete_edge(conn, task_id, *blocker)?;
        }
    }

    let review_task = Task::from_new(
        NewTask::review(task.session_id.clone(), review_subject(&task.subject))
            .with_description(pairing_description(&task, context)),
    );
    insert_task(conn, &review_task)?;
    let review = ReviewRecord::individual(
        task.session_id.clone(),
        task.id,
        Some(review_task.id),
        review_type,
        context.map(|s| s.to_string()),
    );
    insert_review(conn, &review)?;
    insert_edge(conn, task_id, review_task.id)?;

    let mut governed = require_task(conn, task_id)?;
    let next = status_after_new_blocker(&governed);
    apply_status(&mut governed, next, Utc::now());
    write_status(conn, &governed)?;

    Ok(Pairing {
        task: governed,
        review_task: require_task(conn, review_task.id)?,
        review,
    })
}

fn resolve_in(
    conn: &Connection,
    id: ReviewId,
    verdict: &ReviewVerdict,
) -> Result<ReviewRecord, StoreError> {
    let review = complete_in(conn, id, verdict)?;
    let now = Utc::now();

    for target in &review.target_task_ids {
        if let (Some(review_task_id), Verdict::Approved) = (review.review_task_id, verdict.verdict)
        {
            delete_edge(conn, *target, review_task_id)?;
        }
        let mut task = require_task(conn, *target)?;
        let next = status_after_verdict(&task, verdict.verdict);
        apply_status(&mut task, next, now);
        write_status(conn, &task)?;
    }

    if let Some(review_task_id) = review.review_task_id {
        let mut review_task = require_task(conn, review_task_id)?;
        if !review_task.status.is_terminal() {
            apply_status(&mut review_task, TaskStatus::Completed, now);
            write_status(conn, &review_task)?;
        }
    }
    Ok(review)
}

// ─────────────────────────────────────────────────────────────────────────────
// Findings
// ─────────────────────────────────────────────────────────────────────────────

struct FindingRow {
    id: String,
    session_id: String,
    task_id: Option<String>,
    source: String,
    severity: String,
    description: String,
    dismissed: bool,
    justification: Option<String>,
    created_at: String,
    dismissed_at: Option<String>,
}

impl FindingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            task_id: row.get(2)?,
            source: row.get(3)?,
            severity: row.get(4)?,
            description: row.get(5)?,
            dismissed: row.get(6)?,
            justification: row.get(7)?,
            created_at: row.get(8)?,
            dismissed_at: row.get(9)?,
        })
    }

    fn into_finding(self) -> Result<TrackedFinding, StoreError> {
        Ok(TrackedFinding {
            id: parse_id(&self.id)?,
            session_id: self.session_id,
            task_id: self.task_id.as_deref().map(parse_id).transpose()?,
            source: self.source,
            severity: Severity::parse(&self.severity).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown severity '{}'", self.severity))
            })?,
            description: self.description,
            dismissed: self.dismissed,
            justification: self.justification,
            created_at: parse_ts(&self.created_at)?,
            dismissed_at: parse_opt_ts(self.dismissed_at)?,
        })
    }
}

fn load_finding(conn: &Connection, id: FindingId) -> Result<Option<TrackedFinding>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM findings WHERE id = ?1", FINDING_COLUMNS),
            params![id.to_string()],
            FindingRow::from_row,
        )
        .optional()?;
    row.map(FindingRow::into_finding).transpose()
}

#[async_trait]
impl TaskStore for SqliteGovernanceStore {
    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = Task::from_new(new);
        let t = task.clone();
        self.in_transaction(move |conn| insert_task(conn, &t)).await?;
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| load_task(conn, id)).await
    }

    async fn add_blocker(&self, task_id: TaskId, blocker_id: TaskId) -> Result<(), StoreError> {
        self.in_transaction(move |conn| {
            require_task(conn, task_id)?;
            require_task(conn, blocker_id)?;
            insert_edge(conn, task_id, blocker_id)
        })
        .await
    }

    async fn remove_blocker(
        &self,
        task_id: TaskId,
        blocker_id: TaskId,
    ) -> Result<(), StoreError> {
        self.in_transaction(move |conn| {
            require_task(conn, task_id)?;
            delete_edge(conn, task_id, blocker_id)
        })
        .await
    }

    async fn list_siblings(
        &self,
        session_id: &str,
        exclude: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let session_id = session_id.to_string();
        let exclude = exclude.map(|id| id.to_string()).unwrap_or_default();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks
                 WHERE session_id = ?1 AND id != ?2
                 ORDER BY created_at, rowid
                 LIMIT ?3",
                TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![session_id, exclude, limit as i64], TaskRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(|r| r.into_task(conn)).collect()
        })
        .await
    }

    async fn list_awaiting_review(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks
                 WHERE session_id = ?1 AND kind = 'work'
                   AND status NOT IN ('completed', 'abandoned')
                   AND EXISTS (SELECT 1 FROM task_blockers b WHERE b.task_id = tasks.id)
                 ORDER BY created_at, rowid",
                TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![session_id], TaskRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(|r| r.into_task(conn)).collect()
        })
        .await
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<Task, StoreError> {
        self.in_transaction(move |conn| {
            let mut task = require_task(conn, id)?;
            check_transition(&task, status)?;
            apply_status(&mut task, status, Utc::now());
            write_status(conn, &task)?;
            Ok(task)
        })
        .await
    }
}

#[async_trait]
impl ReviewStore for SqliteGovernanceStore {
    async fn create_individual_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        let context = context.map(|s| s.to_string());
        self.in_transaction(move |conn| {
            let task = require_task(conn, task_id)?;
            let review =
                ReviewRecord::individual(task.session_id, task_id, None, review_type, context);
            insert_review(conn, &review)?;
            Ok(review)
        })
        .await
    }

    async fn create_holistic_review(
        &self,
        session_id: &str,
        task_ids: &[TaskId],
        context: Option<&str>,
    ) -> Result<ReviewRecord, StoreError> {
        let review = ReviewRecord::holistic(
            session_id,
            task_ids.to_vec(),
            context.map(|s| s.to_string()),
        );
        self.in_transaction(move |conn| {
            for id in &review.target_task_ids {
                require_task(conn, *id)?;
            }
            insert_review(conn, &review)?;
            Ok(review)
        })
        .await
    }

    async fn complete_review(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        let verdict = verdict.clone();
        self.in_transaction(move |conn| complete_in(conn, review_id, &verdict))
            .await
    }

    async fn get_review(&self, review_id: ReviewId) -> Result<Option<ReviewRecord>, StoreError> {
        self.with_conn(move |conn| load_review(conn, review_id)).await
    }

    async fn get_by_task(&self, task_id: TaskId) -> Result<Vec<ReviewRecord>, StoreError> {
        self.with_conn(move |conn| {
            query_reviews(
                conn,
                "review_task_id = ?1
                 OR id IN (SELECT review_id FROM review_targets WHERE task_id = ?1)",
                &task_id.to_string(),
            )
        })
        .await
    }

    async fn list_session_reviews(
        &self,
        session_id: &str,
    ) -> Result<Vec<ReviewRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| query_reviews(conn, "session_id = ?1", &session_id))
            .await
    }
}

#[async_trait]
impl FindingLog for SqliteGovernanceStore {
    async fn record_finding(
        &self,
        session_id: &str,
        finding: NewTrackedFinding,
    ) -> Result<TrackedFinding, StoreError> {
        let finding = TrackedFinding::from_new(session_id, finding);
        let f = finding.clone();
        self.in_transaction(move |conn| {
            conn.execute(
                "INSERT INTO findings (id, session_id, task_id, source, severity, description,
                                       dismissed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    f.id.to_string(),
                    f.session_id,
                    f.task_id.map(|id| id.to_string()),
                    f.source,
                    f.severity.as_str(),
                    f.description,
                    ts(&f.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(finding)
    }

    async fn dismiss_finding(
        &self,
        id: FindingId,
        justification: &str,
    ) -> Result<TrackedFinding, StoreError> {
        validate_justification(justification)?;
        let justification = justification.trim().to_string();
        self.in_transaction(move |conn| {
            let finding = load_finding(conn, id)?.ok_or(StoreError::FindingNotFound(id))?;
            if finding.dismissed {
                return Err(StoreError::AlreadyDismissed(id));
            }
            conn.execute(
                "UPDATE findings SET dismissed = 1, justification = ?1, dismissed_at = ?2
                 WHERE id = ?3",
                params![justification, ts(&Utc::now()), id.to_string()],
            )?;
            load_finding(conn, id)?.ok_or(StoreError::FindingNotFound(id))
        })
        .await
    }

    async fn list_findings(&self, session_id: &str) -> Result<Vec<TrackedFinding>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM findings WHERE session_id = ?1 ORDER BY created_at, rowid",
                FINDING_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![session_id], FindingRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(FindingRow::into_finding).collect()
        })
        .await
    }
}

#[async_trait]
impl GovernanceStore for SqliteGovernanceStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_governed_task(
        &self,
        new: NewTask,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        let context = context.map(|s| s.to_string());
        // Dropping the transaction on error rolls the task insert back.
        self.in_transaction(move |conn| {
            let task = Task::from_new(new);
            insert_task(conn, &task)?;
            pair_in(conn, task.id, review_type, context.as_deref())
        })
        .await
    }

    async fn pair_review(
        &self,
        task_id: TaskId,
        review_type: ReviewType,
        context: Option<&str>,
    ) -> Result<Pairing, StoreError> {
        let context = context.map(|s| s.to_string());
        self.in_transaction(move |conn| pair_in(conn, task_id, review_type, context.as_deref()))
            .await
    }

    async fn resolve_review_blocker(
        &self,
        review_id: ReviewId,
        verdict: &ReviewVerdict,
    ) -> Result<ReviewRecord, StoreError> {
        let verdict = verdict.clone();
        self.in_transaction(move |conn| resolve_in(conn, review_id, &verdict))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Two handles on the same database file see each other's writes.
    #[tokio::test]
    async fn test_second_connection_observes_pairing() {
        let dir = TempDir::new().unwrap();
        let writer = SqliteGovernanceStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let reader = SqliteGovernanceStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let pairing = writer
            .create_governed_task(NewTask::work("s1", "task"), ReviewType::General, None)
            .await
            .unwrap();

        let seen = reader.get(pairing.task.id).await.unwrap().unwrap();
        assert_eq!(seen.blocked_by, vec![pairing.review_task.id]);
        let reviews = reader.get_by_task(pairing.task.id).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, pairing.review.id);
    }

    /// A failed pairing leaves no half-created task behind.
    #[tokio::test]
    async fn test_failed_pairing_rolls_back_task() {
        let dir = TempDir::new().unwrap();
        let store = SqliteGovernanceStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        // Review tasks are never paired, so this pairing fails after the insert.
        let err = store
            .create_governed_task(NewTask::review("s1", "[review] x"), ReviewType::General, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let tasks = store.list_siblings("s1", None, 10).await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_findings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteGovernanceStore::new(dir.path().to_path_buf())
                .await
                .unwrap();
            let finding = store
                .record_finding(
                    "s1",
                    NewTrackedFinding {
                        task_id: None,
                        source: "cargo test".to_string(),
                        severity: Severity::High,
                        description: "flaky test".to_string(),
                    },
                )
                .await
                .unwrap();
            store
                .dismiss_finding(finding.id, "quarantined upstream")
                .await
                .unwrap();
        }

        let store = SqliteGovernanceStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let findings = store.list_findings("s1").await.unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].dismissed);
        assert_eq!(findings[0].severity, Severity::High);
    }
}
