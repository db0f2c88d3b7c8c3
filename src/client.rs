//! Per-credentials database client.
//!
//! The enclosing service builds one [`PsqlClient`] per request identity (user,
//! password, target database). Pools, pool parameters, the type catalog and
//! the decoder table are process-wide and shared by every client.

use crate::config::Settings;
use crate::db::backend::{Backend, BackendConnection, ColumnDesc};
use crate::db::catalog::{TypeCatalog, catalog_query, parse_catalog_rows};
use crate::db::connection::{ConnectionDescriptor, ConnectionHandle, ConnectionParams};
use crate::db::executor;
use crate::db::pool::{PoolOverrides, PoolParams, PoolRegistry};
use crate::db::stream::{self, Canceller, QueryHandle};
use crate::db::types::Decoders;
use crate::error::{DbError, DbResult};
use crate::models::{Field, QueryResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process-wide state a client works against.
#[derive(Debug, Clone)]
pub struct SharedState {
    pub registry: Arc<PoolRegistry>,
    pub catalog: Arc<TypeCatalog>,
    pub decoders: Arc<Decoders>,
}

impl SharedState {
    /// The process singletons.
    pub fn global() -> Self {
        Self {
            registry: PoolRegistry::global(),
            catalog: TypeCatalog::global(),
            decoders: Decoders::shared(),
        }
    }

    /// Fresh state, not shared with the rest of the process.
    pub fn isolated() -> Self {
        Self {
            registry: Arc::new(PoolRegistry::new()),
            catalog: Arc::new(TypeCatalog::new()),
            decoders: Decoders::shared(),
        }
    }
}

/// Database access for one set of credentials.
pub struct PsqlClient<B: Backend> {
    params: ConnectionParams,
    pool_params: PoolParams,
    descriptor: ConnectionDescriptor,
    db_key: String,
    backend: Arc<B>,
    shared: SharedState,
}

impl<B: Backend> std::fmt::Debug for PsqlClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsqlClient")
            .field("params", &self.params)
            .field("descriptor", &self.descriptor)
            .field("db_key", &self.db_key)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> PsqlClient<B> {
    /// Create a client using the process-wide registry, catalog and decoders.
    ///
    /// Installs this client's pool parameters process-wide.
    pub fn new(
        params: ConnectionParams,
        overrides: PoolOverrides,
        settings: &Settings,
        backend: Arc<B>,
    ) -> DbResult<Self> {
        Self::with_shared(params, overrides, settings, backend, SharedState::global())
    }

    /// Create a client against explicit shared state.
    pub fn with_shared(
        params: ConnectionParams,
        overrides: PoolOverrides,
        settings: &Settings,
        backend: Arc<B>,
        shared: SharedState,
    ) -> DbResult<Self> {
        params.validate()?;

        let pool_params = PoolParams::resolve(&overrides, settings);
        shared.registry.install(pool_params);

        let descriptor = ConnectionDescriptor::build(
            &params,
            pool_params.keep_alive,
            settings.db_use_config_object,
        )?;
        let db_key = params.db_key();

        debug!(
            db_key = %db_key,
            descriptor = %descriptor.masked(),
            "Client created"
        );

        Ok(Self {
            params,
            pool_params,
            descriptor,
            db_key,
            backend,
            shared,
        })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Pool parameters resolved for this client. The parameters in force are
    /// [`PoolRegistry::current`], which the latest client may have replaced.
    pub fn pool_params(&self) -> &PoolParams {
        &self.pool_params
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.shared.registry
    }

    pub fn catalog(&self) -> &Arc<TypeCatalog> {
        &self.shared.catalog
    }

    pub fn decoders(&self) -> &Arc<Decoders> {
        &self.shared.decoders
    }

    /// Acquire a pooled connection.
    ///
    /// Backend failures are logged and reported as the generic connection
    /// error.
    pub async fn acquire(&self) -> DbResult<ConnectionHandle<B::Connection>> {
        let pool_params = self.shared.registry.current();

        match self.backend.connect(&self.descriptor, &pool_params).await {
            Ok(conn) => {
                debug!(db_key = %self.db_key, "Connection acquired");
                Ok(ConnectionHandle::new(conn, self.db_key.as_str()))
            }
            Err(e) => {
                warn!(
                    db_key = %self.db_key,
                    descriptor = %self.descriptor.masked(),
                    error = %e,
                    "Cannot connect to the database"
                );
                Err(DbError::connection_failed())
            }
        }
    }

    /// Load the extension types of this client's database, once per process.
    pub async fn ensure_type_cache(&self) -> DbResult<()> {
        self.shared
            .catalog
            .ensure(&self.db_key, || async {
                let mut conn = self.acquire().await?;
                let outcome = conn.execute(&catalog_query()).await;
                conn.release();

                let result =
                    outcome.map_err(|e| DbError::catalog(self.db_key.as_str(), e.message))?;
                Ok(parse_catalog_rows(&result))
            })
            .await
    }

    /// Type name for a type identifier, as seen from this client's database.
    pub fn type_name(&self, type_id: u32) -> Option<String> {
        self.shared.catalog.type_name(&self.db_key, type_id)
    }

    /// Describe result columns.
    pub fn fields(&self, columns: &[ColumnDesc]) -> Vec<Field> {
        self.shared.catalog.describe(&self.db_key, columns)
    }

    /// Run a statement and buffer the whole result.
    ///
    /// Result columns are described from the first row: a query returning no
    /// rows yields an empty `fields`, since the statement is never described
    /// on its own.
    pub async fn query(&self, sql: &str, readonly: bool) -> DbResult<QueryResult> {
        executor::execute(self, sql, readonly).await
    }

    /// Run a statement and stream its rows.
    ///
    /// `Fields` arrives with the first row, so a query returning no rows goes
    /// straight to `End`.
    pub async fn query_stream(&self, sql: &str) -> DbResult<(QueryHandle, Canceller)> {
        stream::execute_streaming(self, sql).await
    }
}
