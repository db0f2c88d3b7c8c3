//! Data models returned to callers.

pub mod query;

pub use crate::db::types::JsonRow;
pub use query::{Field, QueryResult};
