//! Session coordination flags.
//!
//! One JSON file per session under `<data_dir>/flags/`. The flag is a fast
//! path signal for the gate and the debounce marker for settle coordinators;
//! it is never the source of truth for task blockers.
//!
//! Every read-modify-write holds an exclusive advisory lock on
//! `<session>.lock`, and every write goes through a temp file so readers
//! never observe a partial record. Creation uses `hard_link`, which fails if
//! the flag already exists.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::task::{TaskId, Verdict};

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("Flag I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to lock flag for session {session}: {source}")]
    Lock {
        session: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed flag file {}: {source}", .path.display())]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Status carried by a session flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Pending,
    Blocked,
    NeedsHumanReview,
}

impl FlagStatus {
    /// Restriction priority; the highest wins when several apply.
    pub fn priority(&self) -> u8 {
        match self {
            FlagStatus::Blocked => 3,
            FlagStatus::NeedsHumanReview => 2,
            FlagStatus::Pending => 1,
        }
    }

    /// The flag status a non-approved verdict leaves behind.
    pub fn from_verdict(verdict: Verdict) -> Option<Self> {
        match verdict {
            Verdict::Approved => None,
            Verdict::Blocked => Some(FlagStatus::Blocked),
            Verdict::NeedsHumanReview => Some(FlagStatus::NeedsHumanReview),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Pending => "pending",
            FlagStatus::Blocked => "blocked",
            FlagStatus::NeedsHumanReview => "needs_human_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlagStatus::Pending)
    }
}

impl std::fmt::Display for FlagStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Held by the settle coordinator whose holistic review is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleClaim {
    pub task_id: TaskId,
    /// Flag sequence at claim time
    pub sequence: u64,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFlag {
    pub session_id: String,
    pub status: FlagStatus,
    /// The "latest task" marker
    pub latest_task_id: TaskId,
    /// Bumped with every marker write
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strengths: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settling: Option<SettleClaim>,
}

impl SessionFlag {
    fn raised(session_id: &str, task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: FlagStatus::Pending,
            latest_task_id: task_id,
            sequence: 1,
            created_at: now,
            updated_at: now,
            guidance: None,
            strengths: None,
            settling: None,
        }
    }

    /// Age measured from the last write.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map(|age| age > stale_after).unwrap_or(false)
    }

    fn claim_is_live(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.settling.as_ref().is_some_and(|claim| {
            now.signed_duration_since(claim.claimed_at)
                .to_std()
                .map(|age| age <= stale_after)
                .unwrap_or(true)
        })
    }
}

/// How `raise_or_fold` treated the session's flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaiseOutcome {
    /// No live flag existed; a new one was created.
    Raised,
    /// A pending flag existed; its marker moved to the new task.
    Folded,
    /// A terminal flag existed; the new task reset it to pending.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(SettleClaim),
    /// A newer task owns the marker.
    NotLatest,
    /// Another coordinator's review is still in flight.
    Busy,
    /// The flag already carries a verdict.
    Resolved(FlagStatus),
    /// No live flag.
    Missing,
}

/// What `finish` did with the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishOutcome {
    /// Approved and nothing newer arrived: the flag is gone.
    Released,
    /// Newer tasks arrived during the review: claim cleared, flag stays pending.
    Rearmed,
    /// Terminal verdict written in place.
    Retained,
}

/// File-backed flag store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FlagStore {
    dir: PathBuf,
    stale_after: Duration,
}

impl FlagStore {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn file_stem(session_id: &str) -> String {
        session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn flag_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::file_stem(session_id)))
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lock", Self::file_stem(session_id)))
    }

    /// Exclusive per-session lock, released when the returned file drops.
    fn lock(&self, session_id: &str) -> Result<File, FlagError> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(session_id))?;
        file.lock_exclusive().map_err(|source| FlagError::Lock {
            session: session_id.to_string(),
            source,
        })?;
        Ok(file)
    }

    /// Plain existence check for the gate's fast path.
    pub fn exists(&self, session_id: &str) -> bool {
        self.flag_path(session_id).exists()
    }

    /// Read the flag without staleness handling.
    pub fn read(&self, session_id: &str) -> Result<Option<SessionFlag>, FlagError> {
        load(&self.flag_path(session_id))
    }

    /// Read the flag, removing it if stale.
    pub fn read_live(&self, session_id: &str) -> Result<Option<SessionFlag>, FlagError> {
        if !self.exists(session_id) {
            return Ok(None);
        }
        let _lock = self.lock(session_id)?;
        self.load_live(session_id)
    }

    /// Caller holds the session lock.
    fn load_live(&self, session_id: &str) -> Result<Option<SessionFlag>, FlagError> {
        let path = self.flag_path(session_id);
        let Some(flag) = load(&path)? else {
            return Ok(None);
        };
        if flag.is_stale(Utc::now(), self.stale_after) {
            tracing::info!(
                session_id = %session_id,
                status = %flag.status,
                updated_at = %flag.updated_at,
                "Removing stale session flag"
            );
            remove_if_present(&path)?;
            return Ok(None);
        }
        Ok(Some(flag))
    }

    /// Record a new task for the session: raise a flag, or move the marker of
    /// the existing one.
    pub fn raise_or_fold(
        &self,
        session_id: &str,
        task_id: TaskId,
    ) -> Result<(RaiseOutcome, SessionFlag), FlagError> {
        let _lock = self.lock(session_id)?;
        let path = self.flag_path(session_id);
        let now = Utc::now();

        let existing = match self.load_live(session_id) {
            Ok(flag) => flag,
            Err(FlagError::Serde { path, source }) => {
                tracing::warn!(
                    "Replacing malformed flag file {}: {}",
                    path.display(),
                    source
                );
                remove_if_present(&path)?;
                None
            }
            Err(e) => return Err(e),
        };

        let Some(mut flag) = existing else {
            let flag = SessionFlag::raised(session_id, task_id, now);
            if create_new(&path, &flag)? {
                return Ok((RaiseOutcome::Raised, flag));
            }
            // Another writer without the lock got there first; fold into it.
            let Some(current) = load(&path)? else {
                replace(&path, &flag)?;
                return Ok((RaiseOutcome::Raised, flag));
            };
            return self.fold(&path, current, task_id, now);
        };

        if flag.status.is_terminal() {
            flag.status = FlagStatus::Pending;
            flag.guidance = None;
            flag.strengths = None;
            flag.settling = None;
            flag.latest_task_id = task_id;
            flag.sequence += 1;
            flag.updated_at = now;
            replace(&path, &flag)?;
            return Ok((RaiseOutcome::Superseded, flag));
        }

        self.fold(&path, flag, task_id, now)
    }

    fn fold(
        &self,
        path: &Path,
        mut flag: SessionFlag,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<(RaiseOutcome, SessionFlag), FlagError> {
        flag.latest_task_id = task_id;
        flag.sequence += 1;
        flag.updated_at = now;
        replace(path, &flag)?;
        Ok((RaiseOutcome::Folded, flag))
    }

    /// Claim the flag for the coordinator spawned for `task_id`.
    pub fn try_claim(&self, session_id: &str, task_id: TaskId) -> Result<ClaimOutcome, FlagError> {
        let _lock = self.lock(session_id)?;
        let now = Utc::now();
        let Some(mut flag) = self.load_live(session_id)? else {
            return Ok(ClaimOutcome::Missing);
        };
        if flag.latest_task_id != task_id {
            return Ok(ClaimOutcome::NotLatest);
        }
        if flag.status.is_terminal() {
            return Ok(ClaimOutcome::Resolved(flag.status));
        }
        if flag.claim_is_live(now, self.stale_after) {
            return Ok(ClaimOutcome::Busy);
        }

        let claim = SettleClaim {
            task_id,
            sequence: flag.sequence,
            claimed_at: now,
        };
        flag.settling = Some(claim.clone());
        flag.updated_at = now;
        replace(&self.flag_path(session_id), &flag)?;
        Ok(ClaimOutcome::Claimed(claim))
    }

    /// Apply the holistic verdict reached under `claim`.
    pub fn finish(
        &self,
        session_id: &str,
        claim: &SettleClaim,
        verdict: Verdict,
        guidance: Option<String>,
        strengths: Option<String>,
    ) -> Result<FinishOutcome, FlagError> {
        let _lock = self.lock(session_id)?;
        let path = self.flag_path(session_id);
        let now = Utc::now();

        let Some(mut flag) = load(&path)? else {
            tracing::debug!(session_id = %session_id, "Flag cleared while settling");
            return Ok(FinishOutcome::Released);
        };

        let owns_claim = flag.settling.as_ref() == Some(claim);
        if flag.sequence != claim.sequence || !owns_claim {
            if owns_claim {
                flag.settling = None;
                flag.updated_at = now;
                replace(&path, &flag)?;
            }
            return Ok(FinishOutcome::Rearmed);
        }

        match FlagStatus::from_verdict(verdict) {
            None => {
                remove_if_present(&path)?;
                Ok(FinishOutcome::Released)
            }
            Some(status) => {
                flag.status = status;
                flag.guidance = guidance;
                flag.strengths = strengths;
                flag.settling = None;
                flag.updated_at = now;
                replace(&path, &flag)?;
                Ok(FinishOutcome::Retained)
            }
        }
    }

    /// Drop `claim` without recording a verdict, so a later instance can retry.
    pub fn release_claim(&self, session_id: &str, claim: &SettleClaim) -> Result<bool, FlagError> {
        let _lock = self.lock(session_id)?;
        let path = self.flag_path(session_id);
        let Some(mut flag) = load(&path)? else {
            return Ok(false);
        };
        if flag.settling.as_ref() != Some(claim) {
            return Ok(false);
        }
        flag.settling = None;
        flag.updated_at = Utc::now();
        replace(&path, &flag)?;
        Ok(true)
    }

    /// Delete the session flag. Returns whether one existed.
    pub fn clear(&self, session_id: &str) -> Result<bool, FlagError> {
        let _lock = self.lock(session_id)?;
        remove_if_present(&self.flag_path(session_id))
    }

    /// Run a flag operation on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, FlagError>
    where
        F: FnOnce(&FlagStore) -> Result<T, FlagError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| FlagError::Io(std::io::Error::new(ErrorKind::Other, e)))?
    }
}

fn load(path: &Path) -> Result<Option<SessionFlag>, FlagError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| FlagError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

fn temp_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn write_temp(path: &Path, flag: &SessionFlag) -> Result<PathBuf, FlagError> {
    let data = serde_json::to_vec_pretty(flag).map_err(|source| FlagError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = temp_path(path);
    fs::write(&tmp, data)?;
    Ok(tmp)
}

/// Create `path` only if absent. Returns false if it already existed.
fn create_new(path: &Path, flag: &SessionFlag) -> Result<bool, FlagError> {
    let tmp = write_temp(path, flag)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace `path`.
fn replace(path: &Path, flag: &SessionFlag) -> Result<(), FlagError> {
    let tmp = write_temp(path, flag)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool, FlagError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FlagStore {
        FlagStore::new(dir.path().join("flags"), Duration::from_secs(600))
    }

    /// Racing interceptors converge on exactly one flag.
    #[test]
    fn test_concurrent_raise_creates_one_flag() {
        let dir = TempDir::new().unwrap();
        let flags = Arc::new(store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flags = flags.clone();
                std::thread::spawn(move || flags.raise_or_fold("s1", TaskId::new()).unwrap().0)
            })
            .collect();
        let outcomes: Vec<RaiseOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let raised = outcomes
            .iter()
            .filter(|o| **o == RaiseOutcome::Raised)
            .count();
        assert_eq!(raised, 1);
        assert_eq!(outcomes.len() - raised, 7);

        let flag = flags.read("s1").unwrap().unwrap();
        assert_eq!(flag.sequence, 8);
        assert_eq!(flag.status, FlagStatus::Pending);

        let json_files = fs::read_dir(flags.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count();
        assert_eq!(json_files, 1);
    }

    #[test]
    fn test_stale_flag_is_removed_on_read() {
        let dir = TempDir::new().unwrap();
        let flags = FlagStore::new(dir.path().join("flags"), Duration::from_millis(20));
        flags.raise_or_fold("s1", TaskId::new()).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        assert!(flags.exists("s1"));
        assert!(flags.read_live("s1").unwrap().is_none());
        assert!(!flags.exists("s1"));
    }

    #[test]
    fn test_stale_flag_is_replaced_by_new_raise() {
        let dir = TempDir::new().unwrap();
        let flags = FlagStore::new(dir.path().join("flags"), Duration::from_millis(20));
        flags.raise_or_fold("s1", TaskId::new()).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let (outcome, flag) = flags.raise_or_fold("s1", TaskId::new()).unwrap();
        assert_eq!(outcome, RaiseOutcome::Raised);
        assert_eq!(flag.sequence, 1);
    }

    #[test]
    fn test_claim_requires_latest_marker() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let t1 = TaskId::new();
        let t2 = TaskId::new();
        flags.raise_or_fold("s1", t1).unwrap();
        flags.raise_or_fold("s1", t2).unwrap();

        assert_eq!(flags.try_claim("s1", t1).unwrap(), ClaimOutcome::NotLatest);
        let ClaimOutcome::Claimed(claim) = flags.try_claim("s1", t2).unwrap() else {
            panic!("latest task should claim");
        };
        assert_eq!(claim.sequence, 2);
        assert_eq!(flags.try_claim("s1", t2).unwrap(), ClaimOutcome::Busy);
        assert_eq!(flags.try_claim("other", t2).unwrap(), ClaimOutcome::Missing);
    }

    #[test]
    fn test_approved_finish_releases_flag() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let t1 = TaskId::new();
        flags.raise_or_fold("s1", t1).unwrap();
        let ClaimOutcome::Claimed(claim) = flags.try_claim("s1", t1).unwrap() else {
            panic!("expected claim");
        };

        let outcome = flags
            .finish("s1", &claim, Verdict::Approved, None, None)
            .unwrap();
        assert_eq!(outcome, FinishOutcome::Released);
        assert!(!flags.exists("s1"));
    }

    /// Tasks folded in while a review is in flight keep the flag armed.
    #[test]
    fn test_finish_rearms_when_newer_tasks_arrived() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let t1 = TaskId::new();
        let t2 = TaskId::new();
        flags.raise_or_fold("s1", t1).unwrap();
        let ClaimOutcome::Claimed(claim) = flags.try_claim("s1", t1).unwrap() else {
            panic!("expected claim");
        };
        flags.raise_or_fold("s1", t2).unwrap();

        let outcome = flags
            .finish("s1", &claim, Verdict::Approved, None, None)
            .unwrap();
        assert_eq!(outcome, FinishOutcome::Rearmed);

        let flag = flags.read("s1").unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::Pending);
        assert!(flag.settling.is_none());
        assert!(matches!(
            flags.try_claim("s1", t2).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn test_released_claim_can_be_retaken() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let t1 = TaskId::new();
        flags.raise_or_fold("s1", t1).unwrap();
        let ClaimOutcome::Claimed(claim) = flags.try_claim("s1", t1).unwrap() else {
            panic!("expected claim");
        };

        assert!(flags.release_claim("s1", &claim).unwrap());
        assert!(!flags.release_claim("s1", &claim).unwrap());
        assert!(matches!(
            flags.try_claim("s1", t1).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    /// A blocked verdict stays in place until a new task supersedes it.
    #[test]
    fn test_blocked_finish_retained_until_superseded() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let t1 = TaskId::new();
        flags.raise_or_fold("s1", t1).unwrap();
        let ClaimOutcome::Claimed(claim) = flags.try_claim("s1", t1).unwrap() else {
            panic!("expected claim");
        };

        let outcome = flags
            .finish(
                "s1",
                &claim,
                Verdict::Blocked,
                Some("fix X".to_string()),
                Some("clear naming".to_string()),
            )
            .unwrap();
        assert_eq!(outcome, FinishOutcome::Retained);

        let flag = flags.read_live("s1").unwrap().unwrap();
        assert_eq!(flag.status, FlagStatus::Blocked);
        assert_eq!(flag.guidance.as_deref(), Some("fix X"));
        assert_eq!(
            flags.try_claim("s1", t1).unwrap(),
            ClaimOutcome::Resolved(FlagStatus::Blocked)
        );

        let (outcome, flag) = flags.raise_or_fold("s1", TaskId::new()).unwrap();
        assert_eq!(outcome, RaiseOutcome::Superseded);
        assert_eq!(flag.status, FlagStatus::Pending);
        assert!(flag.guidance.is_none());
    }

    #[test]
    fn test_malformed_flag_is_replaced() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        fs::create_dir_all(flags.dir()).unwrap();
        fs::write(flags.flag_path("s1"), b"{not json").unwrap();

        assert!(matches!(flags.read("s1"), Err(FlagError::Serde { .. })));
        let (outcome, _) = flags.raise_or_fold("s1", TaskId::new()).unwrap();
        assert_eq!(outcome, RaiseOutcome::Raised);
    }

    #[test]
    fn test_session_ids_cannot_escape_flag_dir() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let path = flags.flag_path("../../etc/passwd");
        assert_eq!(path.parent().unwrap(), flags.dir());
    }

    #[test]
    fn test_priority_order() {
        assert!(FlagStatus::Blocked.priority() > FlagStatus::NeedsHumanReview.priority());
        assert!(FlagStatus::NeedsHumanReview.priority() > FlagStatus::Pending.priority());
        assert_eq!(FlagStatus::from_verdict(Verdict::Approved), None);
    }

    #[tokio::test]
    async fn test_run_on_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let flags = store(&dir);
        let (outcome, _) = flags
            .run(|f| f.raise_or_fold("s1", TaskId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, RaiseOutcome::Raised);
        assert!(flags.run(|f| f.clear("s1")).await.unwrap());
    }
}
