//! HTTP API for review-gate.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/tasks` - Create a governed task
//! - `GET /api/tasks/{id}` - Get a task
//! - `POST /api/tasks/{id}/blockers` - Attach a fresh review blocker
//! - `GET /api/tasks/{id}/review-status` - Blockers, verdicts and whether the task may run
//! - `POST /api/tasks/{id}/start` - Move a task to in_progress (gated)
//! - `POST /api/tasks/{id}/complete` - Complete a task (gated)
//! - `POST /api/reviews/{review_task_id}/complete` - Record a review verdict
//! - `POST /api/gate/check` - Gate decision, 200 allow / 403 deny
//! - `GET /api/sessions/{session_id}/reviews` - Review history of a session
//! - `DELETE /api/sessions/{session_id}/flag` - Clear the session flag
//! - `POST /api/findings` - Record a finding
//! - `GET /api/sessions/{session_id}/findings` - List findings
//! - `POST /api/findings/{id}/dismiss` - Dismiss a finding with a justification

mod findings;
mod routes;
mod tasks;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
