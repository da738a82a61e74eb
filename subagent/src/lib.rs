//! Execution engine for delegated subtasks.
//!
//! A subtask runs inside a *scope*: an isolated variable context, a resource
//! allocation and a bounded model ↔ tool loop that ends with exactly one
//! terminal status. The crate is split the usual way:
//!
//! - **[`core`]**: Pure, deterministic logic (names, templates, deep copy,
//!   condition evaluation, time budget). No I/O.
//! - **[`store`]**: The shared in-memory stores, [`store::ContextStore`] and
//!   [`store::ResourceLedger`].
//! - **[`io`]**: Everything that talks to the outside world: config and scope
//!   files, the model client and tool registry seams, usage sampling, prompts
//!   and replay fixtures.
//!
//! Orchestration modules ([`termination`], [`monitor`], [`tool_loop`],
//! [`orchestrator`], [`compat`]) wire the stores and collaborators together.

pub mod compat;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod scope;
pub mod store;
pub mod termination;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tool_loop;
