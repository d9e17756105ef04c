//! Store handle: the shared connection pool for one data source.
//!
//! Every provider and consumer bound to the same data source shares one
//! [`StoreHandle`]. The handle is initialized at most once; later calls to
//! [`StoreHandle::init`] are no-ops, even when they name a different data
//! source. Handles live for the whole process and are never recreated.
//!
//! Uses the [`sqlx`] `Any` driver with runtime query construction. The pool
//! is created lazily, so an unreachable store does not fail initialization;
//! the failure surfaces as [`DbError::Connection`] on first use.

use std::sync::Arc;
use std::time::Duration;

use sqlx::AnyPool;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use tokio::sync::OnceCell;

use crate::error::DbError;
use crate::sql::Dialect;

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default idle timeout in seconds.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Connection pool settings shared by every handle built from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// How long to wait for a connection before failing.
    pub connect_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

impl StoreConfig {
    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct StoreInner {
    pool: AnyPool,
    data_source: String,
    dialect: Dialect,
}

/// Shared handle to the connection pool for one data source.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle {
    config: StoreConfig,
    inner: Arc<OnceCell<StoreInner>>,
}

impl StoreHandle {
    /// Create an uninitialized handle.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: Arc::new(OnceCell::new()),
        }
    }

    /// Establish the pooled connection for `data_source`, or keep the one
    /// already present.
    ///
    /// Re-initialization is checked against the pool, not the data-source
    /// string: initializing an already-initialized handle with another
    /// source keeps the first connection and logs a warning.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidDataSource`] if the data source cannot be
    /// turned into connection options.
    pub async fn init(&self, data_source: &str) -> Result<(), DbError> {
        let inner = self
            .inner
            .get_or_try_init(|| async { self.open(data_source) })
            .await?;

        if inner.data_source != data_source {
            tracing::warn!(
                current = inner.data_source.as_str(),
                requested = data_source,
                "Store handle already initialized; keeping existing connection pool"
            );
        }
        Ok(())
    }

    fn open(&self, data_source: &str) -> Result<StoreInner, DbError> {
        let url = connection_url(data_source)?;
        let dialect = Dialect::from_url(&url).ok_or_else(|| DbError::InvalidDataSource {
            data_source: data_source.to_owned(),
            reason: "unsupported scheme".to_owned(),
        })?;

        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout)
            .idle_timeout(self.config.idle_timeout)
            .connect_lazy(&url)
            .map_err(|e| DbError::InvalidDataSource {
                data_source: data_source.to_owned(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            data_source,
            ?dialect,
            max_connections = self.config.max_connections,
            "Store connection pool created"
        );

        Ok(StoreInner {
            pool,
            data_source: data_source.to_owned(),
            dialect,
        })
    }

    /// Whether [`StoreHandle::init`] has completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }

    /// The data source used at initialization.
    pub fn source(&self) -> Option<&str> {
        self.inner.get().map(|i| i.data_source.as_str())
    }

    /// The SQL dialect of the backing store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] before initialization.
    pub fn dialect(&self) -> Result<Dialect, DbError> {
        self.inner
            .get()
            .map(|i| i.dialect)
            .ok_or(DbError::InvalidState("store handle is not initialized"))
    }

    /// Return the underlying [`AnyPool`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] before initialization.
    pub fn pool(&self) -> Result<&AnyPool, DbError> {
        self.inner
            .get()
            .map(|i| &i.pool)
            .ok_or(DbError::InvalidState("store handle is not initialized"))
    }

    /// Whether two handles share the same pool.
    pub fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close all connections in the pool gracefully.
    pub async fn close(&self) {
        if let Some(inner) = self.inner.get() {
            inner.pool.close().await;
            tracing::info!(data_source = inner.data_source.as_str(), "Store connection pool closed");
        }
    }
}

/// Turn a data-source identifier into a driver URL.
///
/// Accepted forms:
///
/// - a full URL (`mysql://`, `postgres://`, `postgresql://`, `sqlite:`),
///   passed through unchanged;
/// - the DSN shape `user:password@/database?charset=utf8`, optionally with
///   `tcp(host:port)` before the slash, converted to a `mysql://` URL;
/// - a bare database name, converted to `mysql://localhost/<name>?charset=utf8`.
///
/// # Errors
///
/// Returns [`DbError::InvalidDataSource`] for empty or malformed input.
pub fn connection_url(data_source: &str) -> Result<String, DbError> {
    let invalid = |reason: &str| DbError::InvalidDataSource {
        data_source: data_source.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = data_source.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty data source"));
    }
    if trimmed.contains("://") || trimmed.starts_with("sqlite:") {
        return Ok(trimmed.to_owned());
    }

    let Some((credentials, rest)) = trimmed.rsplit_once('@') else {
        if trimmed.contains(['/', '?', ':']) {
            return Err(invalid("expected a database name or user:password@/database"));
        }
        return Ok(format!("mysql://localhost/{trimmed}?charset=utf8"));
    };

    let (address, database) = rest
        .split_once('/')
        .ok_or_else(|| invalid("missing '/' before the database name"))?;
    if database.is_empty() || database.starts_with('?') {
        return Err(invalid("missing database name"));
    }

    let host = match address {
        "" => "localhost",
        addr => addr
            .strip_prefix("tcp(")
            .and_then(|a| a.strip_suffix(')'))
            .ok_or_else(|| invalid("address must be tcp(host:port)"))?,
    };

    let credentials = match credentials {
        "" | ":" => String::new(),
        creds => format!("{}@", creds.strip_suffix(':').unwrap_or(creds)),
    };

    Ok(format!("mysql://{credentials}{host}/{database}"))
}
