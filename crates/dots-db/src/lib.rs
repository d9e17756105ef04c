//! Store-backed access layer for dots.
//!
//! Reads go through providers that stream a key range from the store with a
//! forward-only cursor. Writes go through consumers that accept records from
//! many concurrent submitters and commit them in a single transaction.
//!
//! # Architecture
//!
//! ```text
//! ProviderPool --acquire(source)--> PooledProvider (DbDotProvider)
//!     |                                 |
//!     +-- one StoreHandle per source <--+-- begin / has_more / produce / finalize
//!                |
//! submitters --prepare/consume--> DotQueue --commit--> DbDotConsumer (one transaction)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- Shared connection pool per data source
//! - [`sql`] -- Statement text and dialect placeholders
//! - [`provider`] -- Range-scan providers and typed output slots
//! - [`pool`] -- Bounded, lazily warmed provider pools
//! - [`consumer`] -- Transactional consumers with abort
//! - [`queue`] -- Submission tickets
//! - [`config`] -- YAML pipeline configuration
//! - [`error`] -- Shared error types

pub mod config;
pub mod consumer;
pub mod error;
pub mod pool;
pub mod provider;
pub mod queue;
pub mod sql;
pub mod store;

// Re-export primary types for convenience.
pub use config::{ConfigError, PipelineConfig};
pub use consumer::{ConsumerConfig, ConsumerPhase, DbDotConsumer, DotConsumer};
pub use error::DbError;
pub use pool::{PoolConfig, PooledProvider, ProviderPool};
pub use provider::{
    DbDotProvider, DotProvider, FieldValue, KeyRange, PreCommit, ProviderConfig, ProviderPhase,
    Slot,
};
pub use queue::Submission;
pub use sql::{Column, Dialect};
pub use store::{StoreConfig, StoreHandle};
