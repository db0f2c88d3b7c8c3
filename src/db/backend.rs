//! Driver seam.
//!
//! The access layer never speaks the wire protocol itself. It talks to a
//! [`Backend`] that hands out pooled [`BackendConnection`]s; dropping a
//! connection returns it to its pool. Rows cross the seam as [`RawRow`]s in the
//! backend's text representation and are decoded by [`crate::db::types`].
//!
//! The production implementation is [`crate::db::postgres::PgBackend`].

use crate::db::connection::ConnectionDescriptor;
use crate::db::notice::NoticeSink;
use crate::db::pool::PoolParams;
use futures_util::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// SQLSTATE reported for a statement aborted by a cancel request.
pub const QUERY_CANCELED_SQLSTATE: &str = "57014";

/// Error reported by the driver, with backend detail intact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// SQLSTATE, when the backend reported one
    pub code: Option<String>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// True when the statement was aborted by a cancel request.
    pub fn is_query_canceled(&self) -> bool {
        self.code.as_deref() == Some(QUERY_CANCELED_SQLSTATE)
    }
}

/// Result column description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    /// Backend type identifier (OID)
    pub type_id: u32,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, type_id: u32) -> Self {
        Self {
            name: name.into(),
            type_id,
        }
    }
}

/// A non-null column value as produced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Text(String),
    Binary(Vec<u8>),
    /// Already decoded by the driver; `size` is the length of its wire form
    Decoded { value: JsonValue, size: usize },
}

impl RawValue {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Decoded { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One result row. Columns are shared by every row of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub columns: Arc<[ColumnDesc]>,
    pub values: Vec<Option<RawValue>>,
}

impl RawRow {
    pub fn new(columns: Arc<[ColumnDesc]>, values: Vec<Option<RawValue>>) -> Self {
        Self { columns, values }
    }

    /// Payload size in bytes, used for the max row size check.
    pub fn size(&self) -> usize {
        self.values.iter().flatten().map(RawValue::len).sum()
    }

    /// Text value of a column, if present and textual.
    pub fn text(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx)? {
            Some(RawValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of a buffered statement (or statement batch).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult {
    pub rows: Vec<RawRow>,
    pub rows_affected: u64,
}

/// A pooled driver.
pub trait Backend: Send + Sync + 'static {
    type Connection: BackendConnection;

    /// Acquire a connection from the pool serving `descriptor`.
    ///
    /// `params` are the process-wide pool parameters in force right now; a
    /// backend applies them when it creates a pool.
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        params: &PoolParams,
    ) -> impl Future<Output = Result<Self::Connection, BackendError>> + Send;
}

/// A connection checked out of a pool. Dropping it releases it.
pub trait BackendConnection: Send + 'static {
    type Cancel: CancelRequest;

    /// Run a statement batch and buffer every row.
    fn execute(&mut self, sql: &str)
    -> impl Future<Output = Result<RawResult, BackendError>> + Send;

    /// Handle able to cancel whatever this connection runs next, out of band.
    fn cancel_handle(&mut self) -> impl Future<Output = Result<Self::Cancel, BackendError>> + Send;

    /// Run a statement and yield rows as they arrive.
    ///
    /// Notices raised by the backend while the stream is polled go to `notices`.
    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        notices: NoticeSink,
    ) -> BoxStream<'c, Result<RawRow, BackendError>>;
}

/// Out-of-band cancellation of one in-flight statement.
pub trait CancelRequest: Send + Sync + 'static {
    fn cancel(&self) -> impl Future<Output = Result<(), BackendError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_size_ignores_nulls() {
        let columns: Arc<[ColumnDesc]> =
            vec![ColumnDesc::new("a", 25), ColumnDesc::new("b", 17)].into();
        let row = RawRow::new(
            columns,
            vec![
                Some(RawValue::Text("hello".into())),
                Some(RawValue::Binary(vec![0, 1, 2])),
            ],
        );
        assert_eq!(row.size(), 8);
        assert_eq!(row.text(0), Some("hello"));
        assert_eq!(row.text(1), None);

        let decoded = RawRow::new(
            row.columns.clone(),
            vec![
                Some(RawValue::Decoded {
                    value: serde_json::json!([1, 2]),
                    size: 5,
                }),
                None,
            ],
        );
        assert_eq!(decoded.size(), 5);
        assert_eq!(decoded.text(0), None);

        let nulls = RawRow::new(row.columns.clone(), vec![None, None]);
        assert_eq!(nulls.size(), 0);
    }

    #[test]
    fn test_query_canceled_code() {
        assert!(BackendError::with_code("canceling statement", "57014").is_query_canceled());
        assert!(!BackendError::with_code("syntax error", "42601").is_query_canceled());
        assert!(!BackendError::new("io").is_query_canceled());
    }
}
