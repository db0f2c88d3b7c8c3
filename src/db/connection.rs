//! Connection identity, descriptors and the acquired-connection guard.
//!
//! A [`ConnectionDescriptor`] is either a URL string or structured options,
//! selected by the `db_use_config_object` global setting. Both forms carry the
//! same user, password, host, port, database, keep-alive and TLS choice:
//! the structured form renders to exactly the URL the string form uses.

use crate::db::pool::KeepAlive;
use crate::error::{ACCESS_PARAMETERS_MESSAGE, DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use tracing::debug;
use url::Url;

/// Host used when the credentials do not name one.
pub const DEFAULT_HOST: &str = "localhost";

/// Per-instance credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub user: Option<String>,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub pass: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "****"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}

impl ConnectionParams {
    pub fn new(user: Option<&str>, dbname: Option<&str>) -> Self {
        Self {
            user: user.map(String::from),
            dbname: dbname.map(String::from),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// At least one of user or database name must be a non-empty string.
    pub fn validate(&self) -> DbResult<()> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if present(&self.user) || present(&self.dbname) {
            Ok(())
        } else {
            Err(DbError::configuration(ACCESS_PARAMETERS_MESSAGE))
        }
    }

    /// Key used for the type catalog.
    ///
    /// Only the database name: two servers hosting databases with the same
    /// name share one catalog entry.
    pub fn db_key(&self) -> String {
        self.dbname.clone().unwrap_or_default()
    }
}

/// Structured connection options.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectOptions {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Option<KeepAlive>,
    pub ssl: bool,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("keep_alive", &self.keep_alive)
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl ConnectOptions {
    pub fn from_params(params: &ConnectionParams, keep_alive: Option<KeepAlive>) -> Self {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        Self {
            host: non_empty(&params.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: params.port,
            database: non_empty(&params.dbname),
            user: non_empty(&params.user),
            password: non_empty(&params.pass),
            keep_alive,
            ssl: false,
        }
    }

    /// Reject hosts that cannot appear in a connection URL.
    pub fn check_host(&self) -> DbResult<()> {
        let mut url = base_url();
        url.set_host(Some(&self.host)).map_err(|e| {
            DbError::configuration(format!("Invalid database host '{}': {}", self.host, e))
        })
    }

    /// Render as a `postgres://` URL with percent-encoded components.
    pub fn to_url(&self) -> String {
        self.build_url(self.password.as_deref())
    }

    /// URL with the password masked, for logs.
    pub fn masked_url(&self) -> String {
        self.build_url(self.password.as_ref().map(|_| "****"))
    }

    fn build_url(&self, password: Option<&str>) -> String {
        let mut url = base_url();

        // Hosts are checked at descriptor construction; the remaining setters
        // only fail for URLs without a host
        let _ = url.set_host(Some(&self.host));
        let _ = url.set_port(self.port);
        if let Some(user) = &self.user {
            let _ = url.set_username(user);
        }
        if let Some(password) = password {
            let _ = url.set_password(Some(password));
        }
        if let Some(database) = &self.database {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.clear().push(database);
            }
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sslmode", if self.ssl { "require" } else { "disable" });
            if let Some(keep_alive) = &self.keep_alive {
                query.append_pair("keepalives", "1");
                if let Some(delay_ms) = keep_alive.initial_delay_ms {
                    query.append_pair("keepalives_idle", &delay_ms.div_ceil(1000).to_string());
                }
            }
        }

        url.to_string()
    }
}

fn base_url() -> Url {
    match Url::parse(&format!("postgres://{}", DEFAULT_HOST)) {
        Ok(url) => url,
        Err(_) => unreachable!("static base URL is valid"),
    }
}

/// How a client describes its backend connection to the driver.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// Connection string (sensitive - not logged).
    Url(String),
    Options(ConnectOptions),
}

impl ConnectionDescriptor {
    /// Build the descriptor, structured or string form according to `structured`.
    pub fn build(
        params: &ConnectionParams,
        keep_alive: Option<KeepAlive>,
        structured: bool,
    ) -> DbResult<Self> {
        let options = ConnectOptions::from_params(params, keep_alive);
        options.check_host()?;
        Ok(if structured {
            Self::Options(options)
        } else {
            Self::Url(options.to_url())
        })
    }

    /// Key identifying the pool serving this descriptor.
    pub fn pool_key(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Options(options) => options.to_url(),
        }
    }

    /// Display-safe rendering (credentials masked).
    pub fn masked(&self) -> String {
        match self {
            Self::Url(url) => mask_password(url),
            Self::Options(options) => options.masked_url(),
        }
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(_) => f.debug_tuple("Url").field(&self.masked()).finish(),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
        }
    }
}

fn mask_password(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<invalid connection string>".to_string(),
    }
}

/// An acquired backend connection.
///
/// Dropping the wrapped connection returns it to its pool, so release happens
/// exactly once: through [`release`](Self::release), or on drop for every other
/// exit path including errors and panics.
pub struct ConnectionHandle<C> {
    conn: C,
    db_key: String,
    released: bool,
}

impl<C> ConnectionHandle<C> {
    pub fn new(conn: C, db_key: impl Into<String>) -> Self {
        Self {
            conn,
            db_key: db_key.into(),
            released: false,
        }
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        self.released = true;
        debug!(db_key = %self.db_key, "Connection released");
    }
}

impl<C> Deref for ConnectionHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for ConnectionHandle<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for ConnectionHandle<C> {
    fn drop(&mut self) {
        if !self.released {
            debug!(db_key = %self.db_key, "Connection released on drop");
        }
    }
}
