//! # Context Relay
//!
//! Budgeted source context and multi-model task delegation for developer
//! tools.
//!
//! Context Relay indexes a source tree into a structural summary (modules,
//! symbols, dependencies, summaries), caches it keyed by a content
//! fingerprint, assembles token-budgeted context packages from it for named
//! scenarios, and routes tasks with their context to the best-fitting
//! configured model, retrying transient failures, falling back across
//! models and chunking packages that do not fit a single window.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Source tree │──▶│   Indexer    │──▶│  Validity  │
//! │  (globs)    │   │ builtin/cmd  │   │   cache    │
//! └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                            │
//!                                            ▼
//!                   ┌──────────────┐   ┌────────────┐
//!                   │ Batch queue  │◀──│ Assembler  │
//!                   └──────┬───────┘   └────────────┘
//!                          ▼
//!                   ┌──────────────┐   ┌────────────┐
//!                   │    Router    │──▶│  Backends  │
//!                   │ retry/chunk  │   │ http / cmd │
//!                   └──────────────┘   └────────────┘
//! ```
//!
//! Deterministic decisions (fragment order, model order, chunk boundaries,
//! state transitions) live in the `context-relay-core` crate; this crate
//! owns I/O, concurrency and the `relay` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`fingerprint`] | Source tree walking and content fingerprints |
//! | [`indexer`] | Builtin and external-command indexers |
//! | [`cache`] | Fingerprint-validated index cache |
//! | [`backend`] | Model backend trait, registry, command and echo backends |
//! | [`backend_openai`] | OpenAI-compatible chat completions backend |
//! | [`model_registry`] | Reloadable model profiles |
//! | [`delegation_log`] | Append-only attempt log and per-model stats |
//! | [`router`] | Model selection, retries, fallback, chunked calls |
//! | [`queue`] | Batch queue with bounded concurrency |
//! | [`progress`] | Batch progress reporting |
//! | [`engine`] | Wiring for one configured project |
//! | [`stats`] | `relay log stats` output |

pub mod backend;
pub mod backend_openai;
pub mod cache;
pub mod config;
pub mod delegation_log;
pub mod engine;
pub mod fingerprint;
pub mod indexer;
pub mod model_registry;
pub mod progress;
pub mod queue;
pub mod router;
pub mod stats;
