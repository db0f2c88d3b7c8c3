//! Scripted in-memory backend for integration tests.
//!
//! Counts acquisitions, releases and cancel requests, records every submitted
//! statement, and answers from a small script:
//! - the catalog query returns one `geometry` type
//! - statements containing `error` fail with a syntax error
//! - statements containing `wide` return a 100 byte value
//! - statements containing `empty` return no rows
//! - anything else returns one row `{"value": 1}`
//!
//! Streaming follows [`StreamScript`].

#![allow(dead_code)]

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use psql_access::config::Settings;
use psql_access::db::backend::{
    Backend, BackendConnection, BackendError, CancelRequest, ColumnDesc, RawResult, RawRow,
    RawValue,
};
use psql_access::db::catalog::catalog_query;
use psql_access::db::notice::{Notice, NoticeSink};
use psql_access::db::{ConnectionDescriptor, ConnectionParams, PoolOverrides, PoolParams};
use psql_access::{DbResult, PsqlClient, SharedState};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Type identifier the fake catalog assigns to `geometry`.
pub const GEOMETRY_OID: u32 = 16_385;

pub const CONNECT_FAILURE: &str = "password authentication failed for user \"secret_user\"";

/// How a streaming statement behaves.
#[derive(Debug, Clone, Default)]
pub struct StreamScript {
    pub rows: usize,
    /// Raised before each row
    pub notices: Vec<String>,
    /// After the rows, wait for a cancel request
    pub hang: bool,
    /// Raised instead of 57014 once a hanging statement is cancelled
    pub cancel_error: Option<BackendError>,
    /// After the rows, fail with this error
    pub error: Option<BackendError>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub cancels: AtomicUsize,
    pub catalog_queries: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub catalog_failures: AtomicUsize,
    pub submitted: Mutex<Vec<String>>,
    pub pool_sizes: Mutex<Vec<u32>>,
    pub script: Mutex<StreamScript>,
    /// When set, cancel requests stay in flight until it is notified
    pub cancel_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeState {
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn catalog_queries(&self) -> usize {
        self.catalog_queries.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn last_pool_size(&self) -> Option<u32> {
        self.pool_sizes.lock().unwrap().last().copied()
    }

    pub fn set_script(&self, script: StreamScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Hold cancel requests until the returned gate is notified.
    pub fn gate_cancels(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.cancel_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn record(&self, sql: &str) {
        self.submitted.lock().unwrap().push(sql.to_string());
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for FakeBackend {
    type Connection = FakeConn;

    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        params: &PoolParams,
    ) -> Result<FakeConn, BackendError> {
        tokio::task::yield_now().await;
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BackendError::with_code(CONNECT_FAILURE, "28P01"));
        }

        self.state.pool_sizes.lock().unwrap().push(params.size);
        self.state.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConn {
            state: Arc::clone(&self.state),
            cancel: Arc::new(Notify::new()),
        })
    }
}

pub struct FakeConn {
    state: Arc<FakeState>,
    cancel: Arc<Notify>,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn value_row(name: &str, type_id: u32, value: &str) -> RawRow {
    let columns: Arc<[ColumnDesc]> = vec![ColumnDesc::new(name, type_id)].into();
    RawRow::new(columns, vec![Some(RawValue::Text(value.to_string()))])
}

impl BackendConnection for FakeConn {
    type Cancel = FakeCancel;

    async fn execute(&mut self, sql: &str) -> Result<RawResult, BackendError> {
        self.state.record(sql);
        tokio::task::yield_now().await;

        if sql == catalog_query() {
            self.state.catalog_queries.fetch_add(1, Ordering::SeqCst);
            let remaining = self.state.catalog_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.state.catalog_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::new("catalog unavailable"));
            }
            let columns: Arc<[ColumnDesc]> =
                vec![ColumnDesc::new("oid", 26), ColumnDesc::new("typname", 19)].into();
            let row = RawRow::new(
                columns,
                vec![
                    Some(RawValue::Text(GEOMETRY_OID.to_string())),
                    Some(RawValue::Text("geometry".to_string())),
                ],
            );
            return Ok(RawResult {
                rows: vec![row],
                rows_affected: 1,
            });
        }

        if sql.contains("error") {
            return Err(BackendError::with_code(
                "syntax error at or near \"error\"",
                "42601",
            ));
        }

        if sql.contains("empty") {
            return Ok(RawResult::default());
        }

        let row = if sql.contains("wide") {
            value_row("value", 25, &"x".repeat(100))
        } else {
            value_row("value", 23, "1")
        };
        Ok(RawResult {
            rows: vec![row],
            rows_affected: 0,
        })
    }

    async fn cancel_handle(&mut self) -> Result<FakeCancel, BackendError> {
        Ok(FakeCancel {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.cancel),
        })
    }

    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        notices: NoticeSink,
    ) -> BoxStream<'c, Result<RawRow, BackendError>> {
        self.state.record(sql);
        let script = self.state.script.lock().unwrap().clone();
        let cancel = Arc::clone(&self.cancel);

        stream::unfold(
            (0usize, script, notices, cancel),
            |(idx, script, notices, cancel)| async move {
                if idx < script.rows {
                    for message in &script.notices {
                        notices.send(Notice::new("NOTICE", message.clone()));
                    }
                    let row = value_row("n", 23, &idx.to_string());
                    return Some((Ok(row), (idx + 1, script, notices, cancel)));
                }
                if idx != script.rows {
                    return None;
                }
                if script.hang {
                    cancel.notified().await;
                    let err = script.cancel_error.clone().unwrap_or_else(|| {
                        BackendError::with_code(
                            "canceling statement due to user request",
                            "57014",
                        )
                    });
                    return Some((Err(err), (usize::MAX, script, notices, cancel)));
                }
                let err = script.error.clone()?;
                Some((Err(err), (usize::MAX, script, notices, cancel)))
            },
        )
        .boxed()
    }
}

pub struct FakeCancel {
    state: Arc<FakeState>,
    notify: Arc<Notify>,
}

impl CancelRequest for FakeCancel {
    async fn cancel(&self) -> Result<(), BackendError> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();

        let gate = self.state.cancel_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

/// Client for `dbname` against `backend`, with its own shared state.
pub fn client(backend: &FakeBackend, dbname: &str) -> PsqlClient<FakeBackend> {
    client_with(backend, dbname, SharedState::isolated(), &Settings::default())
}

pub fn client_with(
    backend: &FakeBackend,
    dbname: &str,
    shared: SharedState,
    settings: &Settings,
) -> PsqlClient<FakeBackend> {
    try_client(backend, dbname, shared, settings).unwrap()
}

pub fn try_client(
    backend: &FakeBackend,
    dbname: &str,
    shared: SharedState,
    settings: &Settings,
) -> DbResult<PsqlClient<FakeBackend>> {
    let params = ConnectionParams::new(Some("publicuser"), Some(dbname)).with_password("secret");
    PsqlClient::with_shared(
        params,
        PoolOverrides::default(),
        settings,
        Arc::new(backend.clone()),
        shared,
    )
}

/// Wait until `condition` holds, failing the test after a second.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
