//! Artifact-driven orchestrator for a multi-role coding team.
//!
//! A run is a directory of artifacts outside the target repository. The gate
//! inspects which artifacts exist and validate, the dispatcher routes the one
//! missing piece to a provider (manual outbox, in-process librarian, external
//! agent, or deterministic mock), and the patch guard is the only component
//! that ever touches repository files. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (artifact validation, gate
//!   evaluation, routing, patch policy). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (run storage, journals, git,
//!   process execution, providers).
//!
//! Orchestration modules ([`orchestrate`], [`dispatch`]) coordinate core
//! logic with I/O to implement the CLI commands.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
