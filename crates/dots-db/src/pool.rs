//! Per-data-source pools of ready providers.
//!
//! The first acquire for a data source warms that source up: it opens the
//! shared [`StoreHandle`] and fills the pool with `capacity` providers bound
//! to it. Concurrent first acquires are single-flighted; exactly one of them
//! performs the warm-up and the others wait for its result. A failed warm-up
//! leaves the source cold so a later acquire can retry.
//!
//! At most `capacity` providers per source are checked out at once. Further
//! acquires wait until one is released. Releasing happens when the
//! [`PooledProvider`] guard is dropped, and always returns the provider to
//! the pool it was taken from.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};

use crate::error::DbError;
use crate::provider::{DbDotProvider, ProviderConfig};
use crate::store::{StoreConfig, StoreHandle};

/// Default number of providers per data source.
const DEFAULT_POOL_CAPACITY: usize = 20;

/// Settings for a [`ProviderPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Providers per data source.
    pub capacity: usize,
    /// Connection settings for each source's store handle.
    pub store: StoreConfig,
    /// Configuration given to every pooled provider.
    pub provider: ProviderConfig,
    /// Upper bound on waiting in [`ProviderPool::acquire`]. `None` waits
    /// indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            store: StoreConfig::default(),
            provider: ProviderConfig::dots(),
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Set the number of providers per data source.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the provider configuration.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    /// Set the store connection settings.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Bound the time [`ProviderPool::acquire`] may wait.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// The pool for one data source.
#[derive(Debug)]
struct SourcePool {
    data_source: String,
    store: StoreHandle,
    idle: Mutex<Vec<DbDotProvider>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SourcePool {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<DbDotProvider>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked_out(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }
}

type SourceSlot = Arc<OnceCell<Arc<SourcePool>>>;

/// Lazily warmed provider pools keyed by data source.
#[derive(Debug)]
pub struct ProviderPool {
    config: PoolConfig,
    sources: Mutex<HashMap<String, SourceSlot>>,
    warm_ups: AtomicUsize,
}

impl Default for ProviderPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ProviderPool {
    /// Create a pool with no warmed sources.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
            warm_ups: AtomicUsize::new(0),
        }
    }

    /// The pool configuration.
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a ready provider for `data_source`, warming the source up on
    /// first use and waiting while every provider is checked out.
    ///
    /// # Errors
    ///
    /// Returns the warm-up error if the source cannot be initialized, or
    /// [`DbError::AcquireTimeout`] if the configured acquire timeout expires.
    pub async fn acquire(&self, data_source: &str) -> Result<PooledProvider, DbError> {
        match self.config.acquire_timeout {
            Some(limit) => self.acquire_timeout(data_source, limit).await,
            None => self.checkout(data_source).await,
        }
    }

    /// Like [`ProviderPool::acquire`], but give up after `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AcquireTimeout`] if no provider became available
    /// in time, or the warm-up error.
    pub async fn acquire_timeout(
        &self,
        data_source: &str,
        limit: Duration,
    ) -> Result<PooledProvider, DbError> {
        tokio::time::timeout(limit, self.checkout(data_source))
            .await
            .map_err(|_elapsed| {
                tracing::warn!(data_source, ?limit, "Timed out waiting for a provider");
                DbError::AcquireTimeout {
                    data_source: data_source.to_owned(),
                    waited: limit,
                }
            })?
    }

    /// Return a provider to the pool it came from.
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, provider: PooledProvider) {
        drop(provider);
    }

    /// Number of warm-ups performed so far.
    pub fn warm_ups(&self) -> usize {
        self.warm_ups.load(Ordering::Acquire)
    }

    /// Providers sitting idle in the pool for `data_source`.
    pub fn idle(&self, data_source: &str) -> usize {
        self.warmed(data_source).map_or(0, |pool| pool.idle().len())
    }

    /// Providers currently checked out for `data_source`.
    pub fn checked_out(&self, data_source: &str) -> usize {
        self.warmed(data_source).map_or(0, |pool| pool.checked_out())
    }

    fn slot(&self, data_source: &str) -> SourceSlot {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sources.entry(data_source.to_owned()).or_default())
    }

    fn warmed(&self, data_source: &str) -> Option<Arc<SourcePool>> {
        let sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.get(data_source).and_then(|slot| slot.get().cloned())
    }

    async fn checkout(&self, data_source: &str) -> Result<PooledProvider, DbError> {
        let slot = self.slot(data_source);
        let home = Arc::clone(
            slot.get_or_try_init(|| self.warm_up(data_source))
                .await?,
        );

        let permit = Arc::clone(&home.permits)
            .acquire_owned()
            .await
            .map_err(|_closed| DbError::InvalidState("provider pool is closed"))?;

        // Permits are returned only after the provider is back in the list.
        let provider = home
            .idle()
            .pop()
            .ok_or(DbError::InvalidState("idle list empty with a free permit"))?;
        tracing::debug!(
            data_source,
            checked_out = home.checked_out(),
            "Provider checked out"
        );

        Ok(PooledProvider {
            provider,
            home,
            _permit: permit,
        })
    }

    async fn warm_up(&self, data_source: &str) -> Result<Arc<SourcePool>, DbError> {
        let store = StoreHandle::new(self.config.store.clone());
        store.init(data_source).await.map_err(|e| {
            tracing::error!(data_source, error = %e, "Provider pool warm-up failed");
            e
        })?;

        let capacity = self.config.capacity.max(1);
        let idle = (0..capacity)
            .map(|_| DbDotProvider::with_store(store.clone(), self.config.provider.clone()))
            .collect();

        self.warm_ups.fetch_add(1, Ordering::AcqRel);
        tracing::info!(data_source, capacity, "Provider pool warmed up");

        Ok(Arc::new(SourcePool {
            data_source: data_source.to_owned(),
            store,
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }))
    }
}

/// A provider checked out of a [`ProviderPool`].
///
/// Dereferences to [`DbDotProvider`]. Dropping the guard returns the
/// provider to its home pool; an open scan is discarded first.
#[derive(Debug)]
pub struct PooledProvider {
    provider: DbDotProvider,
    home: Arc<SourcePool>,
    // Released after the provider is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl PooledProvider {
    /// The data source of the pool this provider belongs to.
    pub fn data_source(&self) -> &str {
        &self.home.data_source
    }
}

impl Deref for PooledProvider {
    type Target = DbDotProvider;

    fn deref(&self) -> &Self::Target {
        &self.provider
    }
}

impl DerefMut for PooledProvider {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.provider
    }
}

impl Drop for PooledProvider {
    fn drop(&mut self) {
        let mut provider = std::mem::take(&mut self.provider);
        if provider.discard_scan() {
            tracing::warn!(
                data_source = self.home.data_source.as_str(),
                "Provider released with an open scan; cursor discarded"
            );
        }
        self.home.idle().push(provider);
    }
}
