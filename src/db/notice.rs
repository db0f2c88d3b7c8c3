//! Backend notice relay.
//!
//! Notices (`RAISE NOTICE`, warnings) raised while a streaming query runs are
//! forwarded to that query's event stream. A [`NoticeSink`] is handed to the
//! connection for the lifetime of one row stream and is gone once the stream
//! is dropped, which happens before the terminal event.
//!
//! sqlx does not expose notices per connection; it reports them as tracing
//! events with target [`SQLX_NOTICE_TARGET`] from inside the task polling the
//! connection. [`layer`] captures those events and routes them to the sink of
//! the stream being polled, set by [`NoticeScoped`]. Install it next to the
//! formatting layer:
//!
//! ```ignore
//! tracing_subscriber::registry()
//!     .with(fmt::layer().with_filter(EnvFilter::new("info")))
//!     .with(psql_access::db::notice::layer())
//!     .init();
//! ```

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{FilterFn, Filtered};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// Target sqlx uses for backend notices.
pub const SQLX_NOTICE_TARGET: &str = "sqlx::postgres::notice";

/// A notice raised by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub severity: String,
    pub message: String,
}

impl Notice {
    pub fn new(severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: severity.into(),
            message: message.into(),
        }
    }
}

/// Sending half of a query's notice relay.
#[derive(Debug, Clone)]
pub struct NoticeSink {
    tx: mpsc::UnboundedSender<Notice>,
}

impl NoticeSink {
    /// Create a relay. The receiver belongs to the streaming executor.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forward a notice. Dropped silently once the relay is detached.
    pub fn send(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}

tokio::task_local! {
    static ACTIVE_SINK: NoticeSink;
}

/// Stream adapter making `sink` the active notice sink while the inner
/// stream is polled.
pub struct NoticeScoped<S> {
    inner: S,
    sink: NoticeSink,
}

impl<S> NoticeScoped<S> {
    pub fn new(inner: S, sink: NoticeSink) -> Self {
        Self { inner, sink }
    }
}

impl<S> Stream for NoticeScoped<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<S::Item>> {
        let this = self.get_mut();
        let sink = this.sink.clone();
        ACTIVE_SINK.sync_scope(sink, || this.inner.poll_next_unpin(cx))
    }
}

/// Captures sqlx notice events for the query currently being polled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoticeLayer;

impl<S: Subscriber> Layer<S> for NoticeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let notice = Notice::new(severity(*event.metadata().level()), visitor.message);
        let _ = ACTIVE_SINK.try_with(|sink| sink.send(notice));
    }
}

type NoticeFilter = FilterFn<fn(&Metadata<'_>) -> bool>;

/// [`NoticeLayer`] filtered to sqlx notice events only.
///
/// The filter is per-layer, so it neither hides nor enables events for the
/// other layers of the subscriber.
pub fn layer<S>() -> Filtered<NoticeLayer, NoticeFilter, S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter: NoticeFilter = FilterFn::new(is_notice_event as fn(&Metadata<'_>) -> bool);
    NoticeLayer.with_filter(filter)
}

fn is_notice_event(metadata: &Metadata<'_>) -> bool {
    metadata.target() == SQLX_NOTICE_TARGET
}

/// Inverse of the level sqlx picks for each notice severity.
fn severity(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "NOTICE",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "LOG",
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}
