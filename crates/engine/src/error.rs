//! Error types for the migration engine
//!
//! Two layers: [`StoreError`] is what a backend reports for a single store
//! call, [`MigrationError`] is what a run reports to its caller, carrying the
//! unit and phase that failed.

use std::fmt;
use std::path::PathBuf;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for engine operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors reported by a store backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Failed to decode value: {0}")]
    Decode(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transaction already completed")]
    TransactionClosed,
}

impl StoreError {
    /// Whether the store could not be reached at all
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                StoreError::UniqueViolation(db_err.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. } => StoreError::Decode(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Step of a unit's apply transaction that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    /// Opening the transaction
    Begin,
    /// Running the unit's effect script
    Execute,
    /// Inserting the tracking row
    Record,
    /// Committing
    Commit,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            ApplyPhase::Begin => "beginning transaction",
            ApplyPhase::Execute => "executing",
            ApplyPhase::Record => "recording",
            ApplyPhase::Commit => "committing",
        };
        write!(f, "{}", phase)
    }
}

/// Identifies a migration or seed in error messages and run summaries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitId {
    Migration { version: u32, description: String },
    Seed { name: String },
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Migration { version, description } => {
                write!(f, "migration {} ({})", version, description)
            }
            UnitId::Seed { name } => write!(f, "seed {}", name),
        }
    }
}

/// Errors surfaced by the engine to its caller
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Database connection failed: {source}")]
    Connection {
        #[source]
        source: StoreError,
    },

    #[error("Tracking table {table} unavailable: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("Error {phase} {unit}: {source}")]
    Apply {
        unit: UnitId,
        phase: ApplyPhase,
        #[source]
        source: StoreError,
    },

    #[error("Registration rejected: {reason}")]
    Registration { reason: String },
}

impl MigrationError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MigrationError::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify a failure while bootstrapping or reading a tracking table
    pub(crate) fn tracking(table: &'static str, source: StoreError) -> Self {
        if source.is_connection() {
            MigrationError::Connection { source }
        } else {
            MigrationError::Schema { table, source }
        }
    }

    /// The unit whose apply failed, if any
    pub fn unit(&self) -> Option<&UnitId> {
        match self {
            MigrationError::Apply { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// The underlying store error, if the failure came from the store
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            MigrationError::Connection { source }
            | MigrationError::Schema { source, .. }
            | MigrationError::Apply { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Configuration error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Missing required configuration: {field}")]
    Missing { field: String },
}
