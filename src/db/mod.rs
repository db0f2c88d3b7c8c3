//! Database access layer.
//!
//! This module provides:
//! - Pool parameter resolution and the process-wide pool registry
//! - Connection descriptors and the acquired-connection guard
//! - The driver seam and its sqlx implementation
//! - The type catalog and value decoders
//! - Buffered and streaming query execution

pub mod backend;
pub mod catalog;
pub mod connection;
pub mod executor;
pub mod notice;
pub mod pool;
pub mod postgres;
pub mod stream;
pub mod types;

pub use backend::{Backend, BackendConnection, BackendError, CancelRequest};
pub use catalog::TypeCatalog;
pub use connection::{ConnectionDescriptor, ConnectionHandle, ConnectionParams};
pub use notice::Notice;
pub use pool::{KeepAlive, PoolOverrides, PoolParams, PoolRegistry};
pub use postgres::PgBackend;
pub use stream::{Canceller, QueryEnd, QueryEvent, QueryHandle, QueryState};
pub use types::Decoders;
