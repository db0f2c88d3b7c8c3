//! Buffered query execution.
//!
//! One pipeline, each step short-circuiting on failure:
//! guard check, type catalog bootstrap, connection acquisition, execution,
//! release. The connection goes back to the pool before the result (or the
//! error) is returned.

use crate::client::PsqlClient;
use crate::db::backend::{Backend, BackendConnection, BackendError, RawResult, RawRow};
use crate::error::{DbError, DbResult};
use crate::models::QueryResult;
use crate::sql;
use std::time::Instant;
use tracing::{debug, warn};

/// Prefix making a statement batch run in a read-only transaction.
pub const READ_ONLY_PREFIX: &str = "SET TRANSACTION READ ONLY; ";

/// Statement text actually submitted to the backend.
pub fn submitted_sql(sql: &str, readonly: bool) -> String {
    if readonly {
        format!("{}{}", READ_ONLY_PREFIX, sql)
    } else {
        sql.to_string()
    }
}

/// Map a statement failure, keeping the backend detail.
pub fn query_error(err: BackendError) -> DbError {
    DbError::query(err.message, err.code)
}

/// Fail if a row is larger than the configured maximum.
pub fn check_row_size(row: &RawRow, max_row_size: Option<usize>) -> DbResult<()> {
    match max_row_size {
        Some(max) if row.size() > max => Err(DbError::query(
            format!("Row too large, was {} bytes", row.size()),
            None,
        )),
        _ => Ok(()),
    }
}

/// Run a statement and buffer the whole result.
pub async fn execute<B: Backend>(
    client: &PsqlClient<B>,
    sql: &str,
    readonly: bool,
) -> DbResult<QueryResult> {
    sql::check(sql)?;
    client.ensure_type_cache().await?;

    let start = Instant::now();
    let mut conn = client.acquire().await?;
    let outcome = conn.execute(&submitted_sql(sql, readonly)).await;
    conn.release();

    let raw = outcome.map_err(|e| {
        debug!(db_key = %client.db_key(), error = %e, "Query failed");
        query_error(e)
    })?;

    let result = build_result(client, raw)?
        .with_execution_time(start.elapsed().as_millis() as u64);

    debug!(
        db_key = %client.db_key(),
        readonly = readonly,
        rows = result.row_count,
        elapsed_ms = result.execution_time_ms,
        "Query executed"
    );
    Ok(result)
}

fn build_result<B: Backend>(client: &PsqlClient<B>, raw: RawResult) -> DbResult<QueryResult> {
    let max_row_size = client.registry().current().max_row_size;

    let fields = raw
        .rows
        .first()
        .map(|row| client.fields(&row.columns))
        .unwrap_or_default();

    let decoders = client.decoders();
    let mut rows = Vec::with_capacity(raw.rows.len());
    for row in &raw.rows {
        if let Err(e) = check_row_size(row, max_row_size) {
            warn!(db_key = %client.db_key(), size = row.size(), "Row exceeds max row size");
            return Err(e);
        }
        rows.push(decoders.decode_row(row));
    }

    Ok(QueryResult::new(fields, rows, raw.rows_affected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::{ColumnDesc, RawValue};
    use std::sync::Arc;

    #[test]
    fn test_readonly_prefix() {
        assert_eq!(
            submitted_sql("SELECT 1", true),
            "SET TRANSACTION READ ONLY; SELECT 1"
        );
        assert_eq!(submitted_sql("SELECT 1", false), "SELECT 1");
    }

    #[test]
    fn test_query_error_keeps_sql_state() {
        let err = query_error(BackendError::with_code("syntax error", "42601"));
        assert_eq!(err.sql_state(), Some("42601"));
        assert_eq!(err.to_string(), "syntax error");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_row_size_limit() {
        let columns: Arc<[ColumnDesc]> = vec![ColumnDesc::new("t", 25)].into();
        let row = RawRow::new(columns, vec![Some(RawValue::Text("x".repeat(10)))]);

        assert!(check_row_size(&row, None).is_ok());
        assert!(check_row_size(&row, Some(10)).is_ok());
        let err = check_row_size(&row, Some(9)).unwrap_err();
        assert_eq!(err.to_string(), "Row too large, was 10 bytes");
    }
}
