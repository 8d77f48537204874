//! Store Backends
//!
//! The capability traits the engine runs against, plus two implementations:
//! a sqlx-backed PostgreSQL adapter and a deterministic in-memory store.

pub mod core;
pub mod memory;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
pub use memory::{MemoryPool, Operation};
pub use postgres::{PostgresPool, PostgresTransaction};
