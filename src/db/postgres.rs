//! sqlx-backed PostgreSQL driver.
//!
//! One lazy `PgPool` per connection descriptor, created on first use with the
//! pool parameters installed at that moment. A background reaper closes whole
//! pools that have been idle longer than their idle timeout.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per descriptor**: single-flight pool creation, so concurrent
//!   first acquisitions share one pool
//! - **Lease per checked-out connection**: the reaper skips pools with leases
//!   outstanding, whatever their idle time
//! - **Simple query protocol**: statements are submitted as plain text, so
//!   statement batches work and every value arrives in text form
//! - **sqlx decoding where it applies**: `bytea` and one-dimensional arrays of
//!   the numeric, boolean and text types go through sqlx `Decode`; the rest
//!   stays text for the decoder table
//! - **Cancellation by backend PID**: `pg_cancel_backend` over a dedicated
//!   connection outside the pool, since sqlx exposes no cancel request and a
//!   saturated pool must not hold it up

use crate::db::backend::{
    Backend, BackendConnection, BackendError, CancelRequest, ColumnDesc, RawResult, RawRow,
    RawValue,
};
use crate::db::connection::{ConnectOptions, ConnectionDescriptor};
use crate::db::notice::{NoticeScoped, NoticeSink};
use crate::db::pool::PoolParams;
use crate::db::types::{float_value, oid};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, PgSslMode, PgValueRef,
};
use sqlx::{Column, Connection, Decode, Either, Executor, Postgres, Row, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Connection string parameters handled by the OS rather than sqlx.
const KEEPALIVE_PARAMS: [&str; 2] = ["keepalives", "keepalives_idle"];

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => BackendError::with_code(db_err.message(), code.into_owned()),
                None => BackendError::new(db_err.message()),
            },
            _ => BackendError::new(err.to_string()),
        }
    }
}

/// A pool serving one descriptor.
struct PoolEntry {
    pool: PgPool,
    pool_key: String,
    idle_timeout: Duration,
    /// Uses std::sync::RwLock (not tokio) to avoid holding locks across await points.
    last_accessed: std::sync::RwLock<Instant>,
    /// Count of checked-out connections. The reaper skips pools with leases.
    active_count: AtomicUsize,
}

impl PoolEntry {
    fn touch(&self) {
        if let Ok(mut last_accessed) = self.last_accessed.write() {
            *last_accessed = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last_accessed = self
            .last_accessed
            .read()
            .map(|guard| *guard)
            .unwrap_or(now);
        now.saturating_duration_since(last_accessed)
    }

    fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    fn is_reapable(&self, now: Instant) -> bool {
        self.active_count() == 0 && self.idle_for(now) > self.idle_timeout
    }
}

/// Marks a pool as in use for as long as a connection is checked out.
struct Lease {
    entry: Arc<PoolEntry>,
}

impl Lease {
    fn new(entry: Arc<PoolEntry>) -> Self {
        entry.active_count.fetch_add(1, Ordering::AcqRel);
        entry.touch();
        Self { entry }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.entry.touch();
        // Saturates at 0
        let _ = self
            .entry
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }
}

type PoolCell = Arc<OnceCell<Arc<PoolEntry>>>;

struct PoolSet {
    pools: TokioRwLock<HashMap<String, PoolCell>>,
    /// Uses std::sync::Mutex for synchronous storage.
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolSet {
    fn drop(&mut self) {
        if let Ok(mut reaper) = self.reaper.lock() {
            if let Some(handle) = reaper.take() {
                handle.abort();
            }
        }
    }
}

/// PostgreSQL driver over sqlx pools.
#[derive(Clone)]
pub struct PgBackend {
    inner: Arc<PoolSet>,
}

impl Default for PgBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBackend").finish_non_exhaustive()
    }
}

impl PgBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolSet {
                pools: TokioRwLock::new(HashMap::new()),
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Number of pools currently open.
    pub async fn pool_count(&self) -> usize {
        let pools = self.inner.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Close every pool and stop the reaper.
    pub async fn close_all(&self) {
        if let Ok(mut reaper) = self.inner.reaper.lock() {
            if let Some(handle) = reaper.take() {
                handle.abort();
            }
        }

        // Drain pools under lock, close outside lock
        let pools_to_close: Vec<_> = {
            let mut pools = self.inner.pools.write().await;
            pools.drain().collect()
        };

        for (_, cell) in pools_to_close {
            if let Some(entry) = cell.get() {
                info!(pool = %masked_key(&entry.pool_key), "Closing pool");
                entry.pool.close().await;
            }
        }
    }

    /// Start the reaper on first use. The interval is fixed from then on.
    fn ensure_reaper(&self, reap_interval: Duration) {
        let Ok(mut reaper) = self.inner.reaper.lock() else {
            return;
        };
        if reaper.is_some() {
            return;
        }

        // Weak reference so the task exits once the backend is dropped
        let weak = Arc::downgrade(&self.inner);
        *reaper = Some(tokio::spawn(async move {
            reap_idle_pools(weak, reap_interval).await;
        }));
        debug!(interval_ms = reap_interval.as_millis() as u64, "Pool reaper started");
    }

    async fn pool_entry(
        &self,
        descriptor: &ConnectionDescriptor,
        params: &PoolParams,
    ) -> Result<Arc<PoolEntry>, BackendError> {
        let pool_key = descriptor.pool_key();

        let cell = {
            let pools = self.inner.pools.read().await;
            if let Some(cell) = pools.get(&pool_key) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.inner.pools.write().await;
                // Double-check after acquiring write lock
                Arc::clone(
                    pools
                        .entry(pool_key.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let entry = cell
            .get_or_try_init(|| async {
                let options = connect_options(descriptor)?;
                let pool = PgPoolOptions::new()
                    // sqlx rejects empty pools
                    .max_connections(params.size.max(1))
                    .min_connections(0)
                    .idle_timeout(Some(params.idle_timeout()))
                    .connect_lazy_with(options);

                info!(
                    pool = %descriptor.masked(),
                    size = params.size,
                    idle_timeout_ms = params.idle_timeout_ms,
                    "Created connection pool"
                );

                Ok::<_, BackendError>(Arc::new(PoolEntry {
                    pool,
                    pool_key: pool_key.clone(),
                    idle_timeout: params.idle_timeout(),
                    last_accessed: std::sync::RwLock::new(Instant::now()),
                    active_count: AtomicUsize::new(0),
                }))
            })
            .await?;

        Ok(Arc::clone(entry))
    }
}

impl Backend for PgBackend {
    type Connection = PgConn;

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        params: &PoolParams,
    ) -> Result<PgConn, BackendError> {
        self.ensure_reaper(params.reap_interval());
        let entry = self.pool_entry(descriptor, params).await?;

        // Lease taken before acquiring so the reaper cannot close the pool
        // while this call waits for a free connection
        let lease = Lease::new(Arc::clone(&entry));
        let conn = entry.pool.acquire().await?;

        Ok(PgConn {
            conn,
            pool: entry.pool.clone(),
            _lease: lease,
        })
    }
}

/// Background task closing idle pools.
///
/// Collect-then-act: candidates are gathered under a read lock, removed one at
/// a time under brief write locks after re-checking, and closed outside of all
/// locks.
async fn reap_idle_pools(weak: Weak<PoolSet>, reap_interval: Duration) {
    let mut interval = tokio::time::interval(reap_interval);

    loop {
        interval.tick().await;

        let Some(set) = weak.upgrade() else {
            debug!("Pool set dropped, reaper exiting");
            return;
        };

        let now = Instant::now();
        let candidates: Vec<String> = {
            let pools = set.pools.read().await;
            pools
                .iter()
                .filter(|(_, cell)| cell.get().is_some_and(|entry| entry.is_reapable(now)))
                .map(|(key, _)| key.clone())
                .collect()
        };

        for pool_key in candidates {
            let removed = {
                let mut pools = set.pools.write().await;
                // Re-check: the pool may have been used since the scan
                let still_idle = pools
                    .get(&pool_key)
                    .and_then(|cell| cell.get())
                    .is_some_and(|entry| entry.is_reapable(Instant::now()));
                if still_idle {
                    pools.remove(&pool_key)
                } else {
                    None
                }
            };

            if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
                info!(pool = %masked_key(&pool_key), "Closing idle pool");
                entry.pool.close().await;
            }
        }

        // Drop strong reference before sleeping to allow deallocation
        drop(set);
    }
}

fn masked_key(pool_key: &str) -> String {
    ConnectionDescriptor::Url(pool_key.to_string()).masked()
}

/// sqlx connect options for a descriptor.
fn connect_options(descriptor: &ConnectionDescriptor) -> Result<PgConnectOptions, BackendError> {
    match descriptor {
        ConnectionDescriptor::Url(url) => {
            let url = strip_keepalive_params(url)?;
            Ok(PgConnectOptions::from_str(&url)?)
        }
        ConnectionDescriptor::Options(options) => Ok(structured_options(options)),
    }
}

fn structured_options(options: &ConnectOptions) -> PgConnectOptions {
    if options.keep_alive.is_some() {
        debug!("TCP keep-alive left to the operating system defaults");
    }

    let mut pg = PgConnectOptions::new_without_pgpass()
        .host(&options.host)
        .ssl_mode(if options.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        });
    if let Some(port) = options.port {
        pg = pg.port(port);
    }
    if let Some(user) = &options.user {
        pg = pg.username(user);
    }
    if let Some(password) = &options.password {
        pg = pg.password(password);
    }
    if let Some(database) = &options.database {
        pg = pg.database(database);
    }
    pg
}

/// Remove keep-alive parameters, which sqlx does not understand.
fn strip_keepalive_params(connection_string: &str) -> Result<String, BackendError> {
    let mut url = Url::parse(connection_string)
        .map_err(|e| BackendError::new(format!("Invalid connection string: {}", e)))?;

    let (keep_alive, kept): (Vec<_>, Vec<_>) = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .partition(|(k, _)| KEEPALIVE_PARAMS.contains(&k.as_str()));

    if keep_alive.is_empty() {
        return Ok(connection_string.to_string());
    }
    debug!("TCP keep-alive left to the operating system defaults");

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url.to_string())
}

/// A connection checked out of a [`PgBackend`] pool.
pub struct PgConn {
    // Field order matters: the connection goes back to the pool before the
    // lease ends
    conn: PoolConnection<Postgres>,
    pool: PgPool,
    _lease: Lease,
}

impl BackendConnection for PgConn {
    type Cancel = PgCancel;

    async fn execute(&mut self, sql: &str) -> Result<RawResult, BackendError> {
        let mut stream = Executor::fetch_many(&mut *self.conn, sql);
        let mut result = RawResult::default();
        let mut columns: Option<Arc<[ColumnDesc]>> = None;

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    result.rows_affected += done.rows_affected();
                    // Next statement of the batch has its own columns
                    columns = None;
                }
                Either::Right(row) => {
                    let shared = columns.get_or_insert_with(|| column_descs(&row)).clone();
                    result.rows.push(raw_row(&row, shared)?);
                }
            }
        }

        Ok(result)
    }

    async fn cancel_handle(&mut self) -> Result<PgCancel, BackendError> {
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(PgCancel {
            options: self.pool.connect_options(),
            pid,
        })
    }

    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        notices: NoticeSink,
    ) -> BoxStream<'c, Result<RawRow, BackendError>> {
        let mut columns: Option<Arc<[ColumnDesc]>> = None;
        let rows = Executor::fetch(&mut *self.conn, sql).map(move |item| {
            let row = item?;
            let shared = columns.get_or_insert_with(|| column_descs(&row)).clone();
            raw_row(&row, shared)
        });
        NoticeScoped::new(rows, notices).boxed()
    }
}

/// Cancels the statement running on one backend process.
///
/// Each request opens its own connection with the pool's options and closes
/// it afterwards, so it never waits for a pooled connection.
#[derive(Debug, Clone)]
pub struct PgCancel {
    options: Arc<PgConnectOptions>,
    pid: i32,
}

impl CancelRequest for PgCancel {
    async fn cancel(&self) -> Result<(), BackendError> {
        let mut conn = PgConnection::connect_with(&self.options).await?;
        let signalled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(self.pid)
            .fetch_one(&mut conn)
            .await;
        if let Err(e) = conn.close().await {
            debug!(pid = self.pid, error = %e, "Closing cancel connection failed");
        }
        let signalled = signalled?;

        if signalled {
            debug!(pid = self.pid, "Cancel request delivered");
        } else {
            warn!(pid = self.pid, "Cancel request not delivered");
        }
        Ok(())
    }
}

fn column_descs(row: &PgRow) -> Arc<[ColumnDesc]> {
    row.columns()
        .iter()
        .map(|column| {
            let type_id = column.type_info().oid().map(|oid| oid.0).unwrap_or(0);
            ColumnDesc::new(column.name(), type_id)
        })
        .collect()
}

fn raw_row(row: &PgRow, columns: Arc<[ColumnDesc]>) -> Result<RawRow, BackendError> {
    let mut values = Vec::with_capacity(columns.len());

    for idx in 0..columns.len() {
        let value = row.try_get_raw(idx)?;
        if value.is_null() {
            values.push(None);
            continue;
        }

        let type_id = columns[idx].type_id;
        let raw = if type_id == oid::BYTEA {
            RawValue::Binary(decode_bytes(value)?)
        } else {
            match <&str as Decode<Postgres>>::decode(value) {
                Ok(text) => match decode_array(type_id, row.try_get_raw(idx)?, text) {
                    Some(value) => RawValue::Decoded {
                        value,
                        size: text.len(),
                    },
                    None => RawValue::Text(text.to_string()),
                },
                Err(_) => RawValue::Binary(decode_bytes(row.try_get_raw(idx)?)?),
            }
        };
        values.push(Some(raw));
    }

    Ok(RawRow::new(columns, values))
}

fn decode_bytes(value: PgValueRef<'_>) -> Result<Vec<u8>, BackendError> {
    <Vec<u8> as Decode<Postgres>>::decode(value).map_err(|e| BackendError::new(e.to_string()))
}

/// One-dimensional arrays through sqlx. Multi-dimensional arrays and arrays
/// with explicit bounds (`[0:1]={...}`) return `None` and stay text.
fn decode_array(type_id: u32, value: PgValueRef<'_>, text: &str) -> Option<JsonValue> {
    if !text.starts_with('{') || text.starts_with("{{") {
        return None;
    }

    let items: Vec<JsonValue> = match type_id {
        oid::INT2_ARRAY | oid::INT4_ARRAY | oid::INT8_ARRAY => {
            <Vec<Option<i64>> as Decode<Postgres>>::decode(value)
                .ok()?
                .into_iter()
                .map(|v| v.map_or(JsonValue::Null, JsonValue::from))
                .collect()
        }
        oid::FLOAT4_ARRAY | oid::FLOAT8_ARRAY | oid::NUMERIC_ARRAY => {
            <Vec<Option<f64>> as Decode<Postgres>>::decode(value)
                .ok()?
                .into_iter()
                .map(|v| v.map_or(JsonValue::Null, float_value))
                .collect()
        }
        oid::BOOL_ARRAY => <Vec<Option<bool>> as Decode<Postgres>>::decode(value)
            .ok()?
            .into_iter()
            .map(|v| v.map_or(JsonValue::Null, JsonValue::from))
            .collect(),
        oid::TEXT_ARRAY | oid::VARCHAR_ARRAY => {
            <Vec<Option<String>> as Decode<Postgres>>::decode(value)
                .ok()?
                .into_iter()
                .map(|v| v.map_or(JsonValue::Null, JsonValue::from))
                .collect()
        }
        _ => return None,
    };
    Some(JsonValue::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_keepalive_params() {
        let url = "postgres://u@h/db?sslmode=disable&keepalives=1&keepalives_idle=2";
        assert_eq!(
            strip_keepalive_params(url).unwrap(),
            "postgres://u@h/db?sslmode=disable"
        );

        let untouched = "postgres://u@h/db?sslmode=disable";
        assert_eq!(strip_keepalive_params(untouched).unwrap(), untouched);
    }

    #[test]
    fn test_invalid_connection_string() {
        assert!(strip_keepalive_params("not a url").is_err());
    }

    #[test]
    fn test_url_options_parse() {
        let descriptor = ConnectionDescriptor::Url(
            "postgres://u:p@db.internal:6432/gis?sslmode=disable&keepalives=1".to_string(),
        );
        let options = connect_options(&descriptor).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_database(), Some("gis"));
    }

    #[test]
    fn test_sqlx_error_keeps_message() {
        let err: BackendError = sqlx::Error::PoolTimedOut.into();
        assert!(err.code.is_none());
        assert!(!err.message.is_empty());
    }

    #[tokio::test]
    async fn test_pool_created_once_per_descriptor() {
        let backend = PgBackend::new();
        let descriptor =
            ConnectionDescriptor::Url("postgres://u@localhost/db?sslmode=disable".to_string());
        let params = PoolParams::default();

        let a = backend.pool_entry(&descriptor, &params).await.unwrap();
        let b = backend.pool_entry(&descriptor, &params).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.pool_count().await, 1);

        backend.close_all().await;
        assert_eq!(backend.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_lease_blocks_reaping() {
        let backend = PgBackend::new();
        let descriptor =
            ConnectionDescriptor::Url("postgres://u@localhost/db?sslmode=disable".to_string());
        let params = PoolParams {
            idle_timeout_ms: 0,
            ..PoolParams::default()
        };
        let entry = backend.pool_entry(&descriptor, &params).await.unwrap();

        let lease = Lease::new(Arc::clone(&entry));
        let later = Instant::now() + Duration::from_millis(10);
        assert!(!entry.is_reapable(later));
        drop(lease);
        assert_eq!(entry.active_count(), 0);
        assert!(entry.is_reapable(later));
    }
}
