//! Pooled, multi-tenant PostgreSQL access layer.
//!
//! This library sits between an HTTP query service and PostgreSQL. It resolves
//! per-request credentials into pooled connections, keeps a process-wide type
//! catalog, rejects session-level `SET` statements, and runs statements either
//! buffered or as a cancellable event stream.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sql;

pub use client::{PsqlClient, SharedState};
pub use config::{Config, Settings};
pub use db::PgBackend;
pub use error::{DbError, DbResult};
