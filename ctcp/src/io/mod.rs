//! Side-effecting operations: run storage, journals, git, processes, and
//! the provider backends.

pub mod bundle;
pub mod config;
pub mod git;
pub mod journal;
pub mod librarian;
pub mod patch_guard;
pub mod paths;
pub mod process;
pub mod providers;
pub mod resolver;
pub mod run_store;
pub mod verify;
