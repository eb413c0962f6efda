//! Opsbridge library crate
//!
//! Approval-gated bridge between a chat workspace and managed
//! repositories: proposals in chat, a durable approval queue, a patch
//! applier with a manual fallback, and a gated shell executor. The binary
//! in `main.rs` is a thin CLI over these modules.

pub mod approval;
pub mod chat;
pub mod config;
pub mod diff;
pub mod events;
pub mod exec;
pub mod git_ops;
pub mod jobs;
pub mod manual_apply;
pub mod patch;
pub mod queue;
pub mod route;
pub mod util;
