//! # review-gate
//!
//! Governed task lifecycle engine for autonomous coding agents.
//!
//! Every work task an agent creates is paired with a review task that blocks
//! it. Tasks created in a burst are batched: a per-session flag file folds the
//! burst together, and once the session has been quiet for a while one
//! holistic review covers every task in it. An execution gate answers
//! "may this actor proceed?" from the flag and the blocker graph.
//!
//! ```text
//!   create task ──► Interceptor ──► pair review blocker (store, one transaction)
//!                        │
//!                        ├──► raise / fold session flag (flags/<session>.json)
//!                        └──► spawn Settle Coordinator
//!                                   │  sleep quiet period
//!                                   ▼
//!                        claim flag ──► holistic review ──► release blockers
//!
//!   actor action ──► ExecutionGate ──► allow / deny with guidance
//! ```
//!
//! ## Modules
//! - `task`: tasks, review records and findings
//! - `store`: persistence (in-memory and SQLite)
//! - `flag`: the per-session coordination flag
//! - `interceptor`: pairing and flag signalling on task creation
//! - `settle`: the debounced batch reviewer
//! - `gate`: execution gate
//! - `reviewer`, `standards`: external collaborators
//! - `service`: the actor-facing API
//! - `api`: HTTP routes over `service`

pub mod api;
pub mod config;
pub mod flag;
pub mod gate;
pub mod hook;
pub mod interceptor;
pub mod reviewer;
pub mod service;
pub mod settle;
pub mod standards;
pub mod store;
pub mod task;

pub use config::Config;
pub use gate::{ExecutionGate, GateAction, GateDecision, GateRequest};
pub use service::{GovernanceService, ServiceError, SpawnMode};
