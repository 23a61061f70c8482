//! Core error types for overlord-core.
//!
//! Every fallible operation in the library reports through [`CoreError`]; the
//! narrower enums below are the component-level failures it wraps.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for overlord-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Template relationship errors
    #[error("Template graph error: {0}")]
    Graph(#[from] GraphError),

    /// Wake scheduling errors that could not be degraded
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// Another profile already uses this name.
    #[error("A profile named '{name}' already exists")]
    DuplicateName { name: String },

    /// A row that the operation needs does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// The shared connection mutex was poisoned by a panicking holder.
    #[error("Database handle poisoned")]
    Poisoned,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// No usable data directory
    #[error("Cannot determine data directory: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Empty field
    #[error("'{0}' must not be empty")]
    Empty(&'static str),

    /// Invalid time range
    #[error("Invalid time range: arrival ({arrival}) is before departure ({departure})")]
    InvalidTimeRange {
        departure: chrono::DateTime<chrono::Utc>,
        arrival: chrono::DateTime<chrono::Utc>,
    },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Gap relationship errors raised while editing a profile's templates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The relationship names a sort order that no template in the profile has.
    #[error("Reference alarm #{reference_sort_order} not found in profile")]
    ReferenceNotFound { reference_sort_order: i32 },

    /// Accepting the relationship would make the reference graph cyclic.
    #[error("Alarm #{sort_order} cannot reference #{reference_sort_order}: the references would form a cycle")]
    CycleDetected {
        sort_order: i32,
        reference_sort_order: i32,
    },

    /// The edit targets a template that is not part of the profile.
    #[error("Alarm #{0} not found in profile")]
    TemplateNotFound(i32),
}

/// Wake scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// The platform refused an exact wake (missing permission or policy).
    #[error("Exact wake scheduling denied: {0}")]
    ExactDenied(String),

    /// The backend could not register the wake at all.
    #[error("Wake backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the alert output (screen, speaker, vibrator).
///
/// Never propagated: delivery logs them and carries on with the remaining
/// outputs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Alert render failed: {0}")]
    Render(String),

    #[error("Audio output failed: {0}")]
    Audio(String),

    #[error("Vibration output failed: {0}")]
    Vibration(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _msg) => {
                if inner.code == rusqlite::ErrorCode::DatabaseLocked
                    || inner.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_errors_map_to_query_failed() {
        let err: DatabaseError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, DatabaseError::QueryFailed(_)));
    }

    #[test]
    fn graph_errors_convert_into_core_error() {
        let err: CoreError = GraphError::ReferenceNotFound {
            reference_sort_order: 4,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Template graph error: Reference alarm #4 not found in profile"
        );
    }
}
