//! Streaming query execution with mid-flight cancellation.
//!
//! [`execute_streaming`] acquires a connection, then hands it to a spawned
//! task that runs the statement and forwards events through a bounded channel:
//! `Fields` once before the first row, `Row`s in backend order, `Notice`s as
//! they are raised, then exactly one `End`. The task owns the connection and
//! releases it exactly once, before the `End` event is sent.
//!
//! # Design Decisions
//!
//! - **Bounded channel**: a slow consumer applies backpressure to the backend
//! - **Dropped handle is a cancel**: if the consumer goes away the statement is
//!   cancelled, the connection released, and the query recorded as cancelled
//! - **Transition lock**: the cancel decision and the terminal transition are
//!   serialized; the request itself is sent after the lock is dropped
//! - **Send lock**: held while a cancel request is in flight, and taken by the
//!   task before releasing the connection, so a request never reaches a
//!   connection already back in the pool
//! - **Only SQLSTATE 57014 is a cancellation**: a different failure after a
//!   cancel request still ends the query as errored

use crate::client::PsqlClient;
use crate::db::backend::{Backend, BackendConnection, BackendError, CancelRequest, RawRow};
use crate::db::catalog::TypeCatalog;
use crate::db::connection::ConnectionHandle;
use crate::db::executor::{check_row_size, query_error};
use crate::db::notice::{Notice, NoticeSink};
use crate::db::types::{Decoders, JsonRow};
use crate::error::{DbError, DbResult};
use crate::models::Field;
use crate::sql;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events buffered between the query task and the consumer.
pub const EVENT_BUFFER: usize = 64;

/// An event of a streaming query.
#[derive(Debug)]
pub enum QueryEvent {
    /// Result columns, sent once before the first row; never sent when the
    /// query returns no rows
    Fields(Vec<Field>),
    Row(JsonRow),
    Notice(Notice),
    /// Always the last event
    End(QueryEnd),
}

/// How a streaming query ended.
#[derive(Debug)]
pub enum QueryEnd {
    Ended { row_count: u64 },
    Errored(DbError),
    Cancelled,
}

impl QueryEnd {
    pub fn state(&self) -> QueryState {
        match self {
            Self::Ended { .. } => QueryState::Ended,
            Self::Errored(_) => QueryState::Errored,
            Self::Cancelled => QueryState::Cancelled,
        }
    }
}

/// Lifecycle of a streaming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryState {
    Open = 0,
    Ended = 1,
    Errored = 2,
    Cancelled = 3,
}

impl QueryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ended,
            2 => Self::Errored,
            3 => Self::Cancelled,
            _ => Self::Open,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Open
    }
}

/// State shared by the query task, its handle and its canceller.
#[derive(Debug)]
struct QueryShared {
    query_id: Uuid,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    transition: TokioMutex<()>,
    sending: TokioMutex<()>,
}

impl QueryShared {
    fn new() -> Self {
        Self {
            query_id: Uuid::new_v4(),
            state: AtomicU8::new(QueryState::Open as u8),
            cancel_requested: AtomicBool::new(false),
            transition: TokioMutex::new(()),
            sending: TokioMutex::new(()),
        }
    }

    fn state(&self) -> QueryState {
        QueryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: QueryState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

type CancelFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BackendError>> + Send + Sync>;

/// Live event stream of one query.
pub struct QueryHandle {
    rx: mpsc::Receiver<QueryEvent>,
    shared: Arc<QueryShared>,
}

impl QueryHandle {
    pub fn query_id(&self) -> Uuid {
        self.shared.query_id
    }

    pub fn state(&self) -> QueryState {
        self.shared.state()
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_id", &self.shared.query_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Stream for QueryHandle {
    type Item = QueryEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Cancels one in-flight streaming query.
#[derive(Clone)]
pub struct Canceller {
    shared: Arc<QueryShared>,
    request: CancelFn,
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller")
            .field("query_id", &self.shared.query_id)
            .field("requested", &self.is_requested())
            .finish()
    }
}

impl Canceller {
    pub fn query_id(&self) -> Uuid {
        self.shared.query_id
    }

    /// True once a cancel request has been sent.
    pub fn is_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Ask the backend to abort the query.
    ///
    /// No-op when the query has already ended or a cancel was already sent.
    /// The outcome arrives through the event stream as `End(Cancelled)`, or as
    /// the normal end if the query finished first.
    pub async fn cancel(&self) -> DbResult<()> {
        let _sending = {
            let _transition = self.shared.transition.lock().await;

            if self.shared.state().is_terminal() {
                debug!(query_id = %self.shared.query_id, "Query already ended, cancel ignored");
                return Ok(());
            }
            if self.shared.cancel_requested.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.shared.sending.lock().await
        };

        info!(query_id = %self.shared.query_id, "Cancelling query");
        if let Err(e) = (self.request)().await {
            self.shared.cancel_requested.store(false, Ordering::Release);
            warn!(query_id = %self.shared.query_id, error = %e, "Cancel request failed");
            return Err(DbError::internal(format!("Cancel request failed: {}", e)));
        }
        Ok(())
    }
}

/// What the query task needs besides the connection.
struct RunContext {
    db_key: String,
    catalog: Arc<TypeCatalog>,
    decoders: Arc<Decoders>,
    max_row_size: Option<usize>,
}

enum Outcome {
    Done(u64),
    Failed(BackendError),
    Rejected(DbError),
    /// Consumer dropped the handle
    Detached,
}

/// Run a statement and stream its events.
pub async fn execute_streaming<B: Backend>(
    client: &PsqlClient<B>,
    sql: &str,
) -> DbResult<(QueryHandle, Canceller)> {
    sql::check(sql)?;
    client.ensure_type_cache().await?;

    let mut conn = client.acquire().await?;
    let cancel = match conn.cancel_handle().await {
        Ok(cancel) => Arc::new(cancel),
        Err(e) => {
            conn.release();
            return Err(query_error(e));
        }
    };
    let request: CancelFn = Arc::new(move || {
        let cancel = Arc::clone(&cancel);
        async move { cancel.cancel().await }.boxed()
    });

    let shared = Arc::new(QueryShared::new());
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let ctx = RunContext {
        db_key: client.db_key().to_string(),
        catalog: Arc::clone(client.catalog()),
        decoders: Arc::clone(client.decoders()),
        max_row_size: client.registry().current().max_row_size,
    };

    info!(
        query_id = %shared.query_id,
        db_key = %ctx.db_key,
        "Streaming query started"
    );
    tokio::spawn(run(
        conn,
        sql.to_string(),
        ctx,
        tx,
        Arc::clone(&shared),
        Arc::clone(&request),
    ));

    Ok((
        QueryHandle {
            rx,
            shared: Arc::clone(&shared),
        },
        Canceller { shared, request },
    ))
}

async fn run<C: BackendConnection>(
    mut conn: ConnectionHandle<C>,
    sql: String,
    ctx: RunContext,
    tx: mpsc::Sender<QueryEvent>,
    shared: Arc<QueryShared>,
    request: CancelFn,
) {
    let (sink, mut notices) = NoticeSink::channel();

    let outcome = {
        let mut rows = conn.fetch(&sql, sink);
        let outcome = pump(&mut rows, &mut notices, &tx, &ctx).await;
        if matches!(outcome, Outcome::Detached) {
            cancel_detached(&shared, &request).await;
        }
        outcome
        // Row stream dropped here, and the notice sink with it
    };

    let mut detached = matches!(outcome, Outcome::Detached);
    while let Ok(notice) = notices.try_recv() {
        if detached || tx.send(QueryEvent::Notice(notice)).await.is_err() {
            detached = true;
            break;
        }
    }

    let end = {
        let _transition = shared.transition.lock().await;
        let cancel_requested = shared.cancel_requested.load(Ordering::Acquire);
        let end = match outcome {
            Outcome::Done(row_count) => QueryEnd::Ended { row_count },
            Outcome::Failed(e) if e.is_query_canceled() => {
                debug!(query_id = %shared.query_id, error = %e, "Query aborted by cancel");
                QueryEnd::Cancelled
            }
            Outcome::Failed(e) => {
                if cancel_requested {
                    debug!(query_id = %shared.query_id, "Query failed before the cancel landed");
                }
                QueryEnd::Errored(query_error(e))
            }
            Outcome::Rejected(e) => QueryEnd::Errored(e),
            Outcome::Detached => QueryEnd::Cancelled,
        };
        shared.set_state(end.state());
        end
    };

    // Wait out a cancel request still addressed to this connection
    let sending = shared.sending.lock().await;
    conn.release();
    drop(sending);

    match &end {
        QueryEnd::Ended { row_count } => {
            info!(query_id = %shared.query_id, rows = *row_count, "Streaming query ended")
        }
        QueryEnd::Errored(e) => {
            info!(query_id = %shared.query_id, error = %e, "Streaming query failed")
        }
        QueryEnd::Cancelled => info!(query_id = %shared.query_id, "Streaming query cancelled"),
    }

    if !detached {
        let _ = tx.send(QueryEvent::End(end)).await;
    }
}

/// Forward rows and notices until the row stream ends or the consumer leaves.
async fn pump(
    rows: &mut BoxStream<'_, Result<RawRow, BackendError>>,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    tx: &mpsc::Sender<QueryEvent>,
    ctx: &RunContext,
) -> Outcome {
    let mut row_count: u64 = 0;

    loop {
        tokio::select! {
            biased;

            Some(notice) = notices.recv() => {
                if tx.send(QueryEvent::Notice(notice)).await.is_err() {
                    return Outcome::Detached;
                }
            }
            item = rows.next() => match item {
                Some(Ok(row)) => {
                    // Notices raised while this row was read come first
                    if !flush_notices(notices, tx).await {
                        return Outcome::Detached;
                    }
                    if let Err(e) = check_row_size(&row, ctx.max_row_size) {
                        return Outcome::Rejected(e);
                    }
                    if row_count == 0 {
                        let fields = ctx.catalog.describe(&ctx.db_key, &row.columns);
                        if tx.send(QueryEvent::Fields(fields)).await.is_err() {
                            return Outcome::Detached;
                        }
                    }
                    if tx.send(QueryEvent::Row(ctx.decoders.decode_row(&row))).await.is_err() {
                        return Outcome::Detached;
                    }
                    row_count += 1;
                }
                Some(Err(e)) => return Outcome::Failed(e),
                None => return Outcome::Done(row_count),
            },
            _ = tx.closed() => return Outcome::Detached,
        }
    }
}

async fn flush_notices(
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    tx: &mpsc::Sender<QueryEvent>,
) -> bool {
    while let Ok(notice) = notices.try_recv() {
        if tx.send(QueryEvent::Notice(notice)).await.is_err() {
            return false;
        }
    }
    true
}

async fn cancel_detached(shared: &QueryShared, request: &CancelFn) {
    let _sending = {
        let _transition = shared.transition.lock().await;
        if shared.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.sending.lock().await
    };

    debug!(query_id = %shared.query_id, "Consumer dropped, cancelling query");
    if let Err(e) = request().await {
        warn!(query_id = %shared.query_id, error = %e, "Cancel request failed");
    }
}
