//! Task module - tasks, review records and tracked findings.
//!
//! Pure data types and state-machine rules; persistence lives in `store`.

mod finding;
mod review;
pub mod task;

pub use finding::{FindingId, NewTrackedFinding, TrackedFinding};
pub use review::{
    Finding, ReviewId, ReviewKind, ReviewRecord, ReviewStatus, ReviewType, ReviewVerdict,
    Severity, Verdict,
};
pub use task::{NewTask, Task, TaskId, TaskKind, TaskStatus};
