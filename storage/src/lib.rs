//! # Storage
//!
//! Backends for the notebook substrate. Both implement every store trait from
//! `nb_core` with the same semantics:
//!
//! - [`postgres::PostgresBackend`]: PostgreSQL via `sqlx`, with forward-only
//!   migrations in [`migrations`]
//! - [`memory::InMemoryBackend`]: single-process state behind one mutex, used
//!   by tests and embedded deployments

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::InMemoryBackend;
pub use postgres::PostgresBackend;
