//! Shared test fixtures for the notebook workspace.
//!
//! Provides a single PostgreSQL testcontainer per test process, lazily
//! started and cleaned up when the process exits, plus helpers for unique
//! names.

mod fixtures;

pub use fixtures::*;
