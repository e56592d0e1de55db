//! # Context Relay Core
//!
//! Runtime-free logic for Context Relay: the index data model, token
//! estimation, scenarios, context assembly, index search, model ranking,
//! chunk planning, and the delegation state machine.
//!
//! This crate contains no tokio, filesystem I/O, or network code. The
//! `context-relay` app crate owns the cache, backends, router and queue,
//! and calls into these functions for every decision that must be
//! deterministic (fragment order, model order, chunk boundaries).

pub mod assemble;
pub mod error;
pub mod models;
pub mod routing;
pub mod scenario;
pub mod search;
pub mod tokens;
