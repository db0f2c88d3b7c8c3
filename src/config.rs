//! Configuration handling.
//!
//! `Settings` is the read-only global settings collaborator consumed by every
//! client: pool sizing, row size limit, keep-alive and the descriptor flavour.
//! `Config` is the command line of the `psql-query` binary.

use crate::db::pool::KeepAlive;
use clap::{Args, Parser};
use serde::Deserialize;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Process-wide settings shared by every client instance.
///
/// Unset values fall back to the built-in pool defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Args, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum connections per pool
    #[arg(long, env = "DB_POOL_SIZE")]
    pub db_pool_size: Option<u32>,

    /// Milliseconds of idle time before an idle pool is closed
    #[arg(long, env = "DB_POOL_IDLE_TIMEOUT")]
    pub db_pool_idle_timeout: Option<u64>,

    /// Milliseconds between idle pool checks
    #[arg(long, env = "DB_POOL_REAP_INTERVAL")]
    pub db_pool_reap_interval: Option<u64>,

    /// Maximum size in bytes of a single result row
    #[arg(long, env = "DB_MAX_ROW_SIZE")]
    pub db_max_row_size: Option<usize>,

    /// Enable TCP keep-alive on backend connections
    #[arg(long, env = "DB_KEEP_ALIVE")]
    pub db_keep_alive_enabled: bool,

    /// Keep-alive initial delay in milliseconds
    #[arg(long, env = "DB_KEEP_ALIVE_INITIAL_DELAY")]
    pub db_keep_alive_initial_delay: Option<u64>,

    /// Describe connections with structured options instead of a URL string
    #[arg(long, env = "DB_USE_CONFIG_OBJECT")]
    pub db_use_config_object: bool,
}

impl Settings {
    /// Keep-alive configuration, present only when enabled.
    pub fn keep_alive(&self) -> Option<KeepAlive> {
        self.db_keep_alive_enabled.then(|| KeepAlive {
            initial_delay_ms: self.db_keep_alive_initial_delay,
        })
    }
}

/// Command line of the `psql-query` diagnostic binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "psql-query",
    about = "Run one statement through the pooled PostgreSQL access layer",
    version
)]
pub struct Config {
    /// SQL statement to run
    #[arg(value_name = "SQL")]
    pub sql: String,

    /// Database user
    #[arg(short = 'U', long, env = "PGUSER")]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database host
    #[arg(short = 'H', long, env = "PGHOST")]
    pub host: Option<String>,

    /// Database port
    #[arg(short, long, env = "PGPORT")]
    pub port: Option<u16>,

    /// Database name
    #[arg(short, long, env = "PGDATABASE")]
    pub dbname: Option<String>,

    /// Run inside a read-only transaction (buffered mode only)
    #[arg(long)]
    pub readonly: bool,

    /// Stream rows as they arrive instead of buffering the result
    #[arg(long)]
    pub stream: bool,

    /// Return at most this many rows of a single SELECT
    #[arg(long)]
    pub limit: Option<u64>,

    /// Skip this many rows of a single SELECT
    #[arg(long)]
    pub offset: Option<u64>,

    /// Cancel a streaming query after this many milliseconds
    #[arg(long, requires = "stream")]
    pub timeout_ms: Option<u64>,

    #[command(flatten)]
    pub settings: Settings,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "PSQL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "PSQL_JSON_LOGS")]
    pub json_logs: bool,
}
