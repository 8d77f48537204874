//! # tidemark-engine: Schema Migrations and Seeds
//!
//! Applies versioned migrations and prioritised seeds to a relational store
//! exactly once each. Every unit runs in its own transaction together with
//! the row that records it in `schema_migrations` or `schema_seeds`, so a
//! unit is either fully applied and recorded or not at all. A run stops at
//! the first failure; units committed before it stay applied.
//!
//! The engine talks to the store only through [`backends::DatabasePool`] and
//! [`backends::DatabaseTransaction`]. [`backends::PostgresPool`] binds them to
//! sqlx; [`backends::MemoryPool`] is a deterministic in-memory store.

pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;
pub mod transaction;

// Re-export core traits and types
pub use backends::{DatabasePool, DatabaseTransaction, MemoryPool, PostgresPool};
pub use config::{DatabaseConfig, DownPolicy, Environment, LoaderConfig};
pub use error::*;
pub use migrations::{FileLoader, Manager, Migration, RunSummary, Seed, SeedRunner, SqlSeed, UnitStatus};
pub use transaction::{Transaction, TransactionState};
