//! Configuration loading for the dots pipeline.
//!
//! A pipeline is described by one YAML document with four optional
//! sections. Every field has a default, so an empty document is valid.
//!
//! ```yaml
//! store:
//!   data_source: "user:secret@/dots?charset=utf8"
//!   max_connections: 10
//!   acquire_timeout_ms: 5000
//!   idle_timeout_ms: 300000
//! pool:
//!   capacity: 20
//!   acquire_timeout_ms: 2000
//! provider:
//!   table: dots
//!   key_column: Id
//!   lower_bound: 0
//!   upper_bound: 100
//!   fetch_buffer: 64
//! consumer:
//!   table: dots
//!   queue_capacity: 20
//! ```
//!
//! `DOTS_DATA_SOURCE` overrides `store.data_source` when set.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::consumer::ConsumerConfig;
use crate::pool::PoolConfig;
use crate::provider::{KeyRange, ProviderConfig};
use crate::sql::{self, Column};
use crate::store::StoreConfig;

/// Environment variable overriding `store.data_source`.
pub const DATA_SOURCE_ENV: &str = "DOTS_DATA_SOURCE";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PipelineConfig {
    /// Data source and connection pool settings.
    #[serde(default)]
    pub store: StoreSection,

    /// Provider pool settings.
    #[serde(default)]
    pub pool: PoolSection,

    /// Read-side table layout.
    #[serde(default)]
    pub provider: ProviderSection,

    /// Write-side table layout and queue size.
    #[serde(default)]
    pub consumer: ConsumerSection,
}

impl PipelineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config
            .store
            .override_data_source(std::env::var(DATA_SOURCE_ENV).ok());
        Ok(config)
    }

    /// Runtime settings for a [`crate::ProviderPool`].
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool.capacity,
            store: self.store.store_config(),
            provider: self.provider.provider_config(),
            acquire_timeout: self.pool.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreSection {
    /// Data source identifier: a driver URL, a `user:password@/database`
    /// DSN, or a bare database name.
    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Maximum connections per store.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Milliseconds to wait for a connection.
    #[serde(default = "default_store_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Milliseconds before an idle connection is closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl StoreSection {
    fn override_data_source(&mut self, value: Option<String>) {
        if let Some(val) = value.filter(|v| !v.trim().is_empty()) {
            self.data_source = val;
        }
    }

    /// Runtime connection pool settings.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_max_connections(self.max_connections)
            .with_connect_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .with_idle_timeout(Duration::from_millis(self.idle_timeout_ms))
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_source: default_data_source(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_store_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Provider pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolSection {
    /// Providers per data source.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Milliseconds an acquire may wait. Absent means no limit.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            acquire_timeout_ms: None,
        }
    }
}

/// Read-side table layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderSection {
    /// Table to scan.
    #[serde(default = "default_table")]
    pub table: String,

    /// Columns in slot order.
    #[serde(default = "sql::dots_columns")]
    pub columns: Vec<Column>,

    /// Column the key range applies to.
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Inclusive lower key bound for updates.
    #[serde(default)]
    pub lower_bound: u64,

    /// Exclusive upper key bound for updates.
    #[serde(default = "default_upper_bound")]
    pub upper_bound: u64,

    /// Rows buffered ahead of the reader during a scan.
    #[serde(default = "default_fetch_buffer")]
    pub fetch_buffer: usize,
}

impl ProviderSection {
    /// Runtime provider configuration.
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::dots()
            .with_table(self.table.clone())
            .with_columns(self.columns.clone(), self.key_column.clone())
            .with_bounds(KeyRange::new(self.lower_bound, self.upper_bound))
            .with_fetch_buffer(self.fetch_buffer)
    }
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            table: default_table(),
            columns: sql::dots_columns(),
            key_column: default_key_column(),
            lower_bound: 0,
            upper_bound: default_upper_bound(),
            fetch_buffer: default_fetch_buffer(),
        }
    }
}

/// Write-side table layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerSection {
    /// Table to insert into.
    #[serde(default = "default_table")]
    pub table: String,

    /// Target columns for id, parent id, name and value.
    #[serde(default = "sql::dots_columns")]
    pub columns: Vec<Column>,

    /// Capacity of the submission queue.
    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,
}

impl ConsumerSection {
    /// Runtime consumer configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            table: self.table.clone(),
            columns: self.columns.clone(),
            queue_capacity: self.queue_capacity,
        }
    }
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            table: default_table(),
            columns: sql::dots_columns(),
            queue_capacity: default_capacity(),
        }
    }
}

fn default_data_source() -> String {
    "dots".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_store_acquire_timeout_ms() -> u64 {
    5_000
}

const fn default_idle_timeout_ms() -> u64 {
    300_000
}

const fn default_capacity() -> usize {
    20
}

fn default_table() -> String {
    "dots".to_owned()
}

fn default_key_column() -> String {
    "Id".to_owned()
}

const fn default_upper_bound() -> u64 {
    KeyRange::ALL.upper
}

const fn default_fetch_buffer() -> usize {
    64
}
