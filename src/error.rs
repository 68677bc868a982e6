// ============================================================================
// Error types
// ============================================================================

use thiserror::Error;

/// The six error kinds the engine distinguishes, carried as variants of one
/// flat enum so callers can match on `kind` without downcasting.
#[derive(Error, Debug)]
pub enum OrmError {
    /// Class not registered, missing primary key, malformed relation descriptor.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Illegal lifecycle transition (`persist` on a removed entity, `refresh`
    /// without a primary key, re-entrancy cap exceeded, ...).
    #[error("state error: {0}")]
    State(String),

    /// Invalid identifier, empty mandatory clause, IN/NOT IN with an empty list.
    #[error("query builder error: {0}")]
    Builder(String),

    /// Propagated from the external `Database` interface: connection lost,
    /// constraint violation, deadlock, statement syntax.
    #[error("database error: {0}")]
    Database(String),

    /// An event listener returned an error; treated identically to a database
    /// error (abort flush, rollback).
    #[error("listener error: {0}")]
    Listener(String),

    /// The dependency manager could not break a cycle (e.g. both foreign keys
    /// non-nullable). Surfaced before any DML is emitted.
    #[error("cycle break failure: {0}")]
    CycleBreak(String),
}

impl OrmError {
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn builder(msg: impl Into<String>) -> Self {
        Self::Builder(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener(msg.into())
    }

    pub fn cycle_break(msg: impl Into<String>) -> Self {
        Self::CycleBreak(msg.into())
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Database(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;
