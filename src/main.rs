//! psql-query - Main entry point.
//!
//! Runs one statement through the pooled access layer and prints the outcome
//! as JSON on stdout. Logs go to stderr.

use clap::Parser;
use futures_util::StreamExt;
use psql_access::db::notice;
use psql_access::db::{ConnectionParams, PgBackend, PoolOverrides, QueryEnd, QueryEvent};
use psql_access::sql;
use psql_access::{Config, DbError, PsqlClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// The notice layer is installed unfiltered by the log level: it only sees
/// backend notices, and forwards them to the streaming query they belong to.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(notice::layer());

    if config.json_logs {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .init();
    }
}

fn connection_params(config: &Config) -> ConnectionParams {
    let mut params = ConnectionParams::new(config.user.as_deref(), config.dbname.as_deref());
    if let Some(password) = &config.password {
        params = params.with_password(password);
    }
    if let Some(host) = &config.host {
        params = params.with_host(host);
    }
    if let Some(port) = config.port {
        params = params.with_port(port);
    }
    params
}

/// The statement to submit, windowed when a limit or offset was given.
fn statement(config: &Config) -> String {
    if config.limit.is_some() || config.offset.is_some() {
        sql::window_sql(&config.sql, config.limit, config.offset)
    } else {
        config.sql.clone()
    }
}

fn error_json(err: &DbError) -> serde_json::Value {
    json!({
        "error": err.to_string(),
        "http_status": err.http_status(),
        "sql_state": err.sql_state(),
    })
}

async fn run_buffered(client: &PsqlClient<PgBackend>, config: &Config) -> Result<(), DbError> {
    let result = client.query(&statement(config), config.readonly).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).map_err(|e| DbError::internal(e.to_string()))?
    );
    Ok(())
}

async fn run_streaming(client: &PsqlClient<PgBackend>, config: &Config) -> Result<(), DbError> {
    let (mut handle, canceller) = client.query_stream(&statement(config)).await?;
    let deadline = config
        .timeout_ms
        .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let mut cancel_sent = false;

    loop {
        let next = match deadline {
            Some(deadline) if !cancel_sent => {
                match tokio::time::timeout_at(deadline, handle.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(query_id = %handle.query_id(), "Timeout reached, cancelling query");
                        canceller.cancel().await?;
                        cancel_sent = true;
                        continue;
                    }
                }
            }
            _ => handle.next().await,
        };

        let Some(event) = next else {
            break;
        };

        let line = match event {
            QueryEvent::Fields(fields) => json!({ "fields": fields }),
            QueryEvent::Row(row) => json!({ "row": row }),
            QueryEvent::Notice(notice) => json!({ "notice": notice }),
            QueryEvent::End(QueryEnd::Ended { row_count }) => {
                json!({ "end": "ended", "row_count": row_count })
            }
            QueryEvent::End(QueryEnd::Cancelled) => json!({ "end": "cancelled" }),
            QueryEvent::End(QueryEnd::Errored(err)) => {
                println!("{}", json!({ "end": "errored" }));
                return Err(err);
            }
        };
        println!("{}", line);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        stream = config.stream,
        readonly = config.readonly,
        "Starting psql-query v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = PsqlClient::new(
        connection_params(&config),
        PoolOverrides::default(),
        &config.settings,
        Arc::new(PgBackend::new()),
    )?;

    let result = if config.stream {
        run_streaming(&client, &config).await
    } else {
        run_buffered(&client, &config).await
    };

    if let Err(e) = result {
        error!(error = %e, http_status = e.http_status(), "Query failed");
        println!("{}", error_json(&e));
        std::process::exit(1);
    }

    Ok(())
}
