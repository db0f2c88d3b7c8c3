//! Process-wide type catalog.
//!
//! Maps backend type identifiers to type names. Built-in types come from a
//! static table shared by every database. Extension types (PostGIS geometry,
//! geography and raster) get identifiers assigned when the extension is
//! installed, so they are looked up once per database and kept for the life of
//! the process.
//!
//! # Design Decisions
//!
//! - **Keyed by database name only**: two servers hosting a database with the
//!   same name share one entry, and the first one to populate it wins
//! - **`OnceCell` per key**: concurrent first queries against a database issue
//!   one catalog query between them
//! - **No invalidation**: an extension installed after the entry is populated
//!   stays unknown until the process restarts

use crate::db::backend::{ColumnDesc, RawResult};
use crate::error::{DbError, DbResult};
use crate::models::Field;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Extension types resolved per database.
pub const EXTENSION_TYPES: [&str; 3] = ["geometry", "geography", "raster"];

/// Built-in type names, shared by every database.
const STANDARD_TYPES: &[(u32, &str)] = &[
    (16, "bool"),
    (17, "bytea"),
    (18, "char"),
    (19, "name"),
    (20, "int8"),
    (21, "int2"),
    (23, "int4"),
    (25, "text"),
    (26, "oid"),
    (114, "json"),
    (199, "_json"),
    (650, "cidr"),
    (700, "float4"),
    (701, "float8"),
    (869, "inet"),
    (1000, "_bool"),
    (1001, "_bytea"),
    (1005, "_int2"),
    (1007, "_int4"),
    (1008, "_regproc"),
    (1009, "_text"),
    (1014, "_bpchar"),
    (1015, "_varchar"),
    (1016, "_int8"),
    (1021, "_float4"),
    (1022, "_float8"),
    (1042, "bpchar"),
    (1043, "varchar"),
    (1082, "date"),
    (1083, "time"),
    (1114, "timestamp"),
    (1182, "_date"),
    (1184, "timestamptz"),
    (1186, "interval"),
    (1231, "_numeric"),
    (1266, "timetz"),
    (1560, "bit"),
    (1562, "varbit"),
    (1700, "numeric"),
    (2278, "void"),
    (2950, "uuid"),
    (2951, "_uuid"),
    (3802, "jsonb"),
    (3807, "_jsonb"),
];

/// Query resolving the extension types of the connected database.
pub fn catalog_query() -> String {
    let names = EXTENSION_TYPES
        .iter()
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "SELECT oid, typname FROM pg_type WHERE typname IN ({})",
        names
    )
}

/// Build a dynamic entry from the rows of [`catalog_query`].
///
/// Rows that do not carry a numeric identifier and a name are skipped.
pub fn parse_catalog_rows(result: &RawResult) -> HashMap<u32, String> {
    result
        .rows
        .iter()
        .filter_map(|row| {
            let oid = row.text(0)?.trim().parse::<u32>().ok()?;
            let name = row.text(1)?.to_string();
            Some((oid, name))
        })
        .collect()
}

type DynamicEntry = Arc<OnceCell<HashMap<u32, String>>>;

/// Type identifier to type name lookup, static tier first.
#[derive(Debug, Default)]
pub struct TypeCatalog {
    dynamic: RwLock<HashMap<String, DynamicEntry>>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog shared by every client in the process.
    pub fn global() -> Arc<TypeCatalog> {
        static CATALOG: OnceLock<Arc<TypeCatalog>> = OnceLock::new();
        CATALOG.get_or_init(Default::default).clone()
    }

    /// Make sure the extension types of `db_key` are known.
    ///
    /// Runs `loader` only if the key has no entry yet. A failed load leaves the
    /// key empty, so the next call tries again.
    pub async fn ensure<F, Fut>(&self, db_key: &str, loader: F) -> DbResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<HashMap<u32, String>>>,
    {
        let cell = self.entry(db_key);
        if cell.initialized() {
            return Ok(());
        }

        cell.get_or_try_init(|| async move {
            debug!(db_key = %db_key, "Loading extension types");
            let types = loader().await?;
            info!(db_key = %db_key, types = types.len(), "Extension types loaded");
            Ok::<_, DbError>(types)
        })
        .await?;

        Ok(())
    }

    /// True once the extension types of `db_key` are loaded.
    pub fn is_loaded(&self, db_key: &str) -> bool {
        self.existing(db_key).is_some_and(|cell| cell.initialized())
    }

    /// Type name for `type_id`: static table, then the database's extension
    /// types, else `None`.
    pub fn type_name(&self, db_key: &str, type_id: u32) -> Option<String> {
        if let Some(name) = standard_type_name(type_id) {
            return Some(name.to_string());
        }
        self.existing(db_key)?.get()?.get(&type_id).cloned()
    }

    /// Describe result columns with their type names.
    pub fn describe(&self, db_key: &str, columns: &[ColumnDesc]) -> Vec<Field> {
        columns
            .iter()
            .map(|column| {
                Field::new(
                    column.name.clone(),
                    column.type_id,
                    self.type_name(db_key, column.type_id),
                )
            })
            .collect()
    }

    fn existing(&self, db_key: &str) -> Option<DynamicEntry> {
        let dynamic = match self.dynamic.read() {
            Ok(dynamic) => dynamic,
            Err(poisoned) => poisoned.into_inner(),
        };
        dynamic.get(db_key).cloned()
    }

    fn entry(&self, db_key: &str) -> DynamicEntry {
        if let Some(cell) = self.existing(db_key) {
            return cell;
        }

        let mut dynamic = match self.dynamic.write() {
            Ok(dynamic) => dynamic,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Double-check after acquiring write lock
        dynamic
            .entry(db_key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

/// Name of a built-in type.
pub fn standard_type_name(type_id: u32) -> Option<&'static str> {
    STANDARD_TYPES
        .iter()
        .find(|(id, _)| *id == type_id)
        .map(|(_, name)| *name)
}
