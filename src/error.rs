//! Error types for the PostgreSQL access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every per-query failure travels through `DbResult`; only construction-time
//! configuration errors are raised before any query is attempted.

use thiserror::Error;

/// Message returned to callers for any backend connection failure.
/// The backend detail is logged, never returned.
pub const CONNECTION_ERROR_MESSAGE: &str = "cannot connect to the database";

/// Message returned when neither a user nor a database name is supplied.
pub const ACCESS_PARAMETERS_MESSAGE: &str = "Incorrect access parameters. If you are accessing via OAuth, please check your tokens are correct. For public users, please ensure your table is published.";

/// Fault classification used by the enclosing HTTP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is at fault (forbidden statement, bad SQL).
    Client,
    /// The service or the backend is at fault.
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("{message}")]
    Configuration { message: String },

    #[error("{operation} command is forbidden")]
    Forbidden { operation: String },

    #[error("{message}")]
    Connection { message: String },

    #[error("{message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Type catalog error for database '{db_key}': {message}")]
    Catalog { db_key: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a forbidden operation error.
    pub fn forbidden(operation: impl Into<String>) -> Self {
        Self::Forbidden {
            operation: operation.into(),
        }
    }

    /// Create the generic connection error.
    pub fn connection_failed() -> Self {
        Self::Connection {
            message: CONNECTION_ERROR_MESSAGE.to_string(),
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a catalog population error.
    pub fn catalog(db_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Catalog {
            db_key: db_key.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Fault classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Forbidden { .. } | Self::Query { .. } => ErrorClass::Client,
            Self::Configuration { .. }
            | Self::Connection { .. }
            | Self::Catalog { .. }
            | Self::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// HTTP status the enclosing service should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Forbidden { .. } => 403,
            Self::Query { .. } => 400,
            Self::Configuration { .. }
            | Self::Connection { .. }
            | Self::Catalog { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// SQLSTATE reported by the backend, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Nothing is retried by this layer; callers may retry these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Catalog { .. })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
