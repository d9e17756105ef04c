//! Error types for the entity pipeline.
//!
//! All providers, pools and consumers report failures via [`DbError`]. Store
//! errors from [`sqlx`] are split into connection-level failures (the store
//! could not be reached, usually a symptom of a bad data source) and
//! statement-level failures.

use std::time::Duration;

/// Errors that can occur in the entity pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The data source could not be turned into connection options.
    #[error("invalid data source {data_source:?}: {reason}")]
    InvalidDataSource {
        /// The data-source string as given by the caller.
        data_source: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The store could not be reached. Connections are opened lazily, so
    /// this surfaces on first use rather than at handle initialization.
    #[error("store connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    /// A statement was malformed or rejected by the store.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// The number of output slots or input values does not match the
    /// configured columns.
    #[error("expected {expected} dot fields, got {actual}")]
    ArityMismatch {
        /// Number of configured columns.
        expected: usize,
        /// Number of slots or values supplied.
        actual: usize,
    },

    /// A row column could not be decoded into the requested slot.
    #[error("unable to read column {column}: {reason}")]
    Scan {
        /// Zero-based column index.
        column: usize,
        /// Decoder message.
        reason: String,
    },

    /// An operation was invoked outside its lifecycle phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A commit was terminated by an explicit abort.
    #[error("aborted")]
    Aborted,

    /// Closing a cursor or other resource failed.
    #[error("cleanup failure: {0}")]
    Cleanup(String),

    /// No provider became available within the deadline.
    #[error("no provider for {data_source:?} became available within {waited:?}")]
    AcquireTimeout {
        /// The data source whose pool was exhausted.
        data_source: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The submission queue was torn down before the record was enqueued.
    #[error("submission queue is closed")]
    QueueClosed,

    /// The pre-commit predicate refused the write.
    #[error("pre-commit check rejected the write")]
    Rejected,

    /// An id does not fit the store's signed 64-bit key column.
    #[error("id {0} does not fit a BIGINT column")]
    OutOfRange(u64),
}

impl DbError {
    /// Whether the error is a store-side failure (connection or statement).
    pub const fn is_store_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Query(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let connection_level = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Configuration(_)
        );
        if connection_level {
            Self::Connection(err)
        } else {
            Self::Query(err)
        }
    }
}

/// Convert an unsigned id into the store's signed key type.
pub(crate) fn to_key(id: u64) -> Result<i64, DbError> {
    i64::try_from(id).map_err(|_overflow| DbError::OutOfRange(id))
}
