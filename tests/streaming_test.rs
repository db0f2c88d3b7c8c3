//! Tests for streaming query execution and cancellation.
//!
//! The scripted backend in `common` stands in for PostgreSQL.

mod common;

use common::{FakeBackend, StreamScript, client, wait_for};
use futures_util::StreamExt;
use psql_access::db::backend::BackendError;
use psql_access::db::{QueryEnd, QueryEvent, QueryHandle, QueryState};
use psql_access::DbError;
use serde_json::json;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Collect every remaining event, failing if the stream stalls.
async fn drain(handle: &mut QueryHandle) -> Vec<QueryEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), handle.next())
            .await
            .expect("stream stalled");
        match next {
            Some(event) => events.push(event),
            None => return events,
        }
    }
}

fn terminal_count(events: &[QueryEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, QueryEvent::End(_)))
        .count()
}

#[tokio::test]
async fn test_stream_emits_fields_rows_then_end() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 3,
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, _canceller) = assert_ok!(client.query_stream("SELECT n FROM t").await);
    let events = drain(&mut handle).await;

    assert_eq!(events.len(), 5);
    match &events[0] {
        QueryEvent::Fields(fields) => {
            assert_eq!(fields[0].name, "n");
            assert_eq!(fields[0].type_name.as_deref(), Some("int4"));
        }
        other => panic!("expected fields first, got {other:?}"),
    }
    for (i, event) in events[1..4].iter().enumerate() {
        match event {
            QueryEvent::Row(row) => assert_eq!(row["n"], json!(i)),
            other => panic!("expected row, got {other:?}"),
        }
    }
    assert!(matches!(
        events[4],
        QueryEvent::End(QueryEnd::Ended { row_count: 3 })
    ));
    assert_eq!(handle.state(), QueryState::Ended);
    assert_eq!(backend.state.acquires(), backend.state.releases());
}

#[tokio::test]
async fn test_empty_result_has_no_fields() {
    let backend = FakeBackend::new();
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, _canceller) = assert_ok!(client.query_stream("SELECT 1 WHERE false").await);
    let events = drain(&mut handle).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        QueryEvent::End(QueryEnd::Ended { row_count: 0 })
    ));
}

#[tokio::test]
async fn test_notices_arrive_before_their_row_and_the_end() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 2,
        notices: vec!["progress".to_string()],
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, _canceller) = assert_ok!(client.query_stream("SELECT notify()").await);
    let events = drain(&mut handle).await;

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            QueryEvent::Fields(_) => "fields",
            QueryEvent::Row(_) => "row",
            QueryEvent::Notice(_) => "notice",
            QueryEvent::End(_) => "end",
        })
        .collect();
    assert_eq!(kinds, ["notice", "fields", "row", "notice", "row", "end"]);

    match &events[0] {
        QueryEvent::Notice(notice) => {
            assert_eq!(notice.severity, "NOTICE");
            assert_eq!(notice.message, "progress");
        }
        other => panic!("expected notice, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_error_is_terminal() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 1,
        error: Some(BackendError::with_code("division by zero", "22012")),
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, _canceller) = assert_ok!(client.query_stream("SELECT 1/0").await);
    let events = drain(&mut handle).await;

    assert_eq!(terminal_count(&events), 1);
    match events.last() {
        Some(QueryEvent::End(QueryEnd::Errored(err))) => {
            assert_eq!(err.sql_state(), Some("22012"));
            assert_eq!(err.to_string(), "division by zero");
        }
        other => panic!("expected error end, got {other:?}"),
    }
    assert_eq!(handle.state(), QueryState::Errored);
    assert_eq!(backend.state.acquires(), backend.state.releases());
}

#[tokio::test]
async fn test_cancel_yields_one_cancelled_end() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 2,
        hang: true,
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, canceller) = assert_ok!(client.query_stream("SELECT pg_sleep(60)").await);
    assert_eq!(canceller.query_id(), handle.query_id());

    // Fields and both rows arrive, then the query hangs
    for _ in 0..3 {
        let event = handle.next().await;
        assert!(matches!(
            event,
            Some(QueryEvent::Fields(_)) | Some(QueryEvent::Row(_))
        ));
    }
    assert_eq!(handle.state(), QueryState::Open);

    assert_ok!(canceller.cancel().await);
    assert_ok!(canceller.cancel().await);
    assert!(canceller.is_requested());

    let events = drain(&mut handle).await;
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(QueryEvent::End(QueryEnd::Cancelled))));
    assert_eq!(handle.state(), QueryState::Cancelled);

    assert_eq!(backend.state.cancels(), 1);
    assert_eq!(backend.state.acquires(), backend.state.releases());

    // Too late to cancel again
    assert_ok!(canceller.cancel().await);
    assert_eq!(backend.state.cancels(), 1);
}

#[tokio::test]
async fn test_connection_held_until_cancel_request_completes() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 1,
        hang: true,
        ..StreamScript::default()
    });
    let gate = backend.state.gate_cancels();
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, canceller) = assert_ok!(client.query_stream("SELECT pg_sleep(60)").await);
    for _ in 0..2 {
        assert!(handle.next().await.is_some());
    }

    let pending = tokio::spawn(async move { canceller.cancel().await });

    // The statement is aborted while the request is still in flight, but the
    // connection stays checked out until the request returns
    let state = &backend.state;
    wait_for(|| handle.state() == QueryState::Cancelled).await;
    assert_eq!(state.cancels(), 1);
    assert_eq!(state.releases(), state.acquires() - 1);

    gate.notify_one();
    assert_ok!(assert_ok!(pending.await));

    let events = drain(&mut handle).await;
    assert!(matches!(events.last(), Some(QueryEvent::End(QueryEnd::Cancelled))));
    assert_eq!(state.acquires(), state.releases());
}

#[tokio::test]
async fn test_other_error_after_cancel_is_not_a_cancellation() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 1,
        hang: true,
        cancel_error: Some(BackendError::with_code("division by zero", "22012")),
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, canceller) = assert_ok!(client.query_stream("SELECT 1/0").await);
    for _ in 0..2 {
        assert!(handle.next().await.is_some());
    }
    assert_ok!(canceller.cancel().await);

    let events = drain(&mut handle).await;
    assert_eq!(terminal_count(&events), 1);
    match events.last() {
        Some(QueryEvent::End(QueryEnd::Errored(err))) => {
            assert_eq!(err.sql_state(), Some("22012"));
        }
        other => panic!("expected error end, got {other:?}"),
    }
    assert_eq!(handle.state(), QueryState::Errored);
    assert_eq!(backend.state.acquires(), backend.state.releases());
}

#[tokio::test]
async fn test_cancel_after_end_is_ignored() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 1,
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (mut handle, canceller) = assert_ok!(client.query_stream("SELECT 1").await);
    let events = drain(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(QueryEvent::End(QueryEnd::Ended { row_count: 1 }))
    ));

    assert_ok!(canceller.cancel().await);
    assert!(!canceller.is_requested());
    assert_eq!(backend.state.cancels(), 0);
}

#[tokio::test]
async fn test_dropped_handle_releases_connection() {
    let backend = FakeBackend::new();
    backend.state.set_script(StreamScript {
        rows: 1,
        hang: true,
        ..StreamScript::default()
    });
    let client = client(&backend, "cartodb_user_1");

    let (handle, _canceller) = assert_ok!(client.query_stream("SELECT pg_sleep(60)").await);
    drop(handle);

    let state = &backend.state;
    wait_for(|| state.acquires() == state.releases()).await;
    assert_eq!(state.cancels(), 1);
}

#[tokio::test]
async fn test_forbidden_stream_never_starts() {
    let backend = FakeBackend::new();
    let client = client(&backend, "cartodb_user_1");

    let err = assert_err!(client.query_stream("SET work_mem = '1GB'").await);
    assert!(matches!(err, DbError::Forbidden { .. }));
    assert_eq!(backend.state.acquires(), 0);
}
