//! Deterministic, pure logic for the run state machine.
//!
//! Core modules must be free of I/O side effects. Gate evaluation, dispatch
//! routing, patch policy, and artifact validation all operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod artifacts;
pub mod gate;
pub mod header;
pub mod patch;
pub mod plan;
pub mod route;
pub mod schema;
pub mod types;
