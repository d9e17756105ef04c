//! Write-side consumers: concurrent submission, one transactional commit.
//!
//! Many submitters `prepare` a ticket and `consume` a record into the
//! consumer's bounded queue. A single `commit` drains the queue into one
//! transaction and commits it only if every insert succeeded. An `abort`
//! races with the drain; whichever is observed first wins, and an abort
//! observed before the final `COMMIT` always rolls back.
//!
//! # Lifecycle
//!
//! ```text
//! Open --commit()--> Committing --drained--> Finishing --> Committed
//!   |                    |                       \------> RolledBack (COMMIT failed)
//!   |                    +--statement failed----------->  RolledBack
//!   +--abort()-----------+--abort observed------------->  Aborted
//! ```
//!
//! Records submitted after an abort are dropped: the submitter gets
//! [`DbError::Aborted`] and the commit caller sees only its own
//! [`DbError::Aborted`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dots_types::Dot;
use sqlx::{Any, Transaction};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;
use crate::provider::{FieldValue, PreCommit, bind_values};
use crate::queue::{DotQueue, Submission};
use crate::sql::{self, Column};
use crate::store::{StoreConfig, StoreHandle};

/// Default capacity of the submission queue.
const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Number of columns a dot is written to.
const DOT_FIELDS: usize = 4;

/// Table and queue settings for a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Table records are inserted into.
    pub table: String,
    /// Target columns for id, parent id, name and value, in that order.
    pub columns: Vec<Column>,
    /// Capacity of the bounded submission queue.
    pub queue_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::dots()
    }
}

impl ConsumerConfig {
    /// Insert into `dots (Id, ParentId, Name, Value)`.
    pub fn dots() -> Self {
        Self {
            table: "dots".to_owned(),
            columns: sql::dots_columns(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Use another table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the capacity of the submission queue.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Lifecycle phase of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    /// Accepting submissions; commit not started.
    Open,
    /// Commit is draining the queue.
    Committing,
    /// The final `COMMIT` has been issued; abort is no longer accepted.
    Finishing,
    /// The transaction was committed.
    Committed,
    /// The transaction was rolled back after a failure.
    RolledBack,
    /// The transaction was rolled back after an abort.
    Aborted,
}

impl ConsumerPhase {
    /// Whether the consumer has reached its single terminal outcome.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Aborted)
    }
}

/// Write-side capability set.
#[async_trait]
pub trait DotConsumer: Send + Sync {
    /// Register one pending unit of submission.
    fn prepare(&self) -> Result<Submission, DbError>;

    /// Enqueue `dot` and complete `submission`. The ticket must come from
    /// this consumer's `prepare`.
    async fn consume(&self, submission: Submission, dot: Dot) -> Result<(), DbError>;

    /// Drain the queue into one transaction. Returns the number of records
    /// inserted.
    async fn commit(&self) -> Result<usize, DbError>;

    /// Signal the commit to stop and roll back. Returns whether the signal
    /// was accepted.
    fn abort(&self) -> bool;

    /// Release consumer-owned resources.
    fn finalize(&self) -> bool;
}

/// Consumer backed by a [`StoreHandle`].
#[derive(Debug)]
pub struct DbDotConsumer {
    store: StoreHandle,
    config: ConsumerConfig,
    queue: DotQueue,
    abort: CancellationToken,
    phase: Mutex<ConsumerPhase>,
    pre_commit: Option<PreCommitCheck>,
}

/// Wrapper giving [`PreCommit`] a `Debug` impl.
struct PreCommitCheck(PreCommit);

impl std::fmt::Debug for PreCommitCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreCommit")
    }
}

impl DbDotConsumer {
    /// Create a consumer on a shared store handle.
    pub fn new(store: StoreHandle, config: ConsumerConfig) -> Self {
        let queue = DotQueue::new(config.queue_capacity);
        Self {
            store,
            config,
            queue,
            abort: CancellationToken::new(),
            phase: Mutex::new(ConsumerPhase::Open),
            pre_commit: None,
        }
    }

    /// Create a consumer with its own store handle for `data_source`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidDataSource`] if the data source is malformed.
    pub async fn connect(
        data_source: &str,
        store: StoreConfig,
        config: ConsumerConfig,
    ) -> Result<Self, DbError> {
        let handle = StoreHandle::new(store);
        handle.init(data_source).await?;
        Ok(Self::new(handle, config))
    }

    /// Install a predicate consulted after the drain and before `COMMIT`.
    #[must_use]
    pub fn with_pre_commit(mut self, pre_commit: PreCommit) -> Self {
        self.pre_commit = Some(PreCommitCheck(pre_commit));
        self
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConsumerPhase {
        *self.lock_phase()
    }

    /// Number of prepared submissions not yet completed.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// The shared store handle.
    pub const fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Commit, aborting if the drain has not finished within `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Aborted`] when the deadline expires first, and
    /// otherwise the same errors as [`DotConsumer::commit`].
    pub async fn commit_timeout(&self, limit: Duration) -> Result<usize, DbError> {
        let commit = self.commit();
        tokio::pin!(commit);
        tokio::select! {
            result = &mut commit => result,
            () = tokio::time::sleep(limit) => {
                if self.abort() {
                    tracing::warn!(?limit, "Commit deadline expired; aborting");
                }
                commit.await
            }
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, ConsumerPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ConsumerPhase) {
        *self.lock_phase() = phase;
    }

    /// Move to `Finishing` unless an abort has already been observed.
    fn enter_finishing(&self) -> bool {
        let mut phase = self.lock_phase();
        if self.abort.is_cancelled() {
            return false;
        }
        *phase = ConsumerPhase::Finishing;
        true
    }

    fn check_pre_commit(&self) -> Result<(), DbError> {
        match &self.pre_commit {
            Some(PreCommitCheck(check)) if !check()? => Err(DbError::Rejected),
            _ => Ok(()),
        }
    }

    async fn drain(&self, rows: &mut mpsc::Receiver<Dot>) -> Result<usize, DbError> {
        if self.abort.is_cancelled() {
            return Err(DbError::Aborted);
        }
        if self.config.columns.len() != DOT_FIELDS {
            return Err(DbError::ArityMismatch {
                expected: DOT_FIELDS,
                actual: self.config.columns.len(),
            });
        }

        let pool = self.store.pool()?;
        let statement = sql::insert(self.store.dialect()?, &self.config.table, &self.config.columns);

        tracing::info!(table = self.config.table.as_str(), "Begin committing dots");
        let mut tx = pool.begin().await?;

        let outcome = self
            .insert_all(&mut tx, &statement, rows)
            .await
            .and_then(|count| self.check_pre_commit().map(|()| count));

        match outcome {
            Ok(count) if self.enter_finishing() => {
                tx.commit().await?;
                tracing::info!(
                    table = self.config.table.as_str(),
                    count,
                    "Finished committing dots"
                );
                Ok(count)
            }
            Ok(_) => {
                Self::rollback(tx, &DbError::Aborted).await;
                Err(DbError::Aborted)
            }
            Err(e) => {
                Self::rollback(tx, &e).await;
                Err(e)
            }
        }
    }

    async fn insert_all(
        &self,
        tx: &mut Transaction<'_, Any>,
        statement: &str,
        rows: &mut mpsc::Receiver<Dot>,
    ) -> Result<usize, DbError> {
        let mut inserted = 0_usize;
        loop {
            let next = tokio::select! {
                biased;
                () = self.abort.cancelled() => return Err(DbError::Aborted),
                next = rows.recv() => next,
            };
            let Some(dot) = next else {
                return Ok(inserted);
            };

            let values: [FieldValue; DOT_FIELDS] = FieldValue::from_dot(&dot)?;
            bind_values(sqlx::query(statement), &values)
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    tracing::error!(id = %dot.id, error = %e, "Failed to insert dot");
                    DbError::from(e)
                })?;
            inserted = inserted.saturating_add(1);
            tracing::debug!(id = %dot.id, name = dot.name.as_str(), "Inserted dot");
        }
    }

    async fn rollback(tx: Transaction<'_, Any>, cause: &DbError) {
        match tx.rollback().await {
            Ok(()) => tracing::warn!(cause = %cause, "Rolled back dot commit"),
            Err(e) => tracing::error!(cause = %cause, error = %e, "Rollback failed"),
        }
    }
}

/// Records the terminal phase of a commit, including one whose future was
/// dropped mid-drain. The dropped transaction rolls back, so an unsettled
/// commit ends `Aborted` if the abort token fired and `RolledBack` otherwise.
struct CommitOutcome<'a> {
    consumer: &'a DbDotConsumer,
    phase: Option<ConsumerPhase>,
}

impl<'a> CommitOutcome<'a> {
    const fn new(consumer: &'a DbDotConsumer) -> Self {
        Self {
            consumer,
            phase: None,
        }
    }

    const fn settle(&mut self, phase: ConsumerPhase) {
        self.phase = Some(phase);
    }
}

impl Drop for CommitOutcome<'_> {
    fn drop(&mut self) {
        let phase = self.phase.unwrap_or_else(|| {
            tracing::warn!("Commit dropped before completion; transaction rolled back");
            if self.consumer.abort.is_cancelled() {
                ConsumerPhase::Aborted
            } else {
                ConsumerPhase::RolledBack
            }
        });
        self.consumer.set_phase(phase);
    }
}

#[async_trait]
impl DotConsumer for DbDotConsumer {
    fn prepare(&self) -> Result<Submission, DbError> {
        if self.abort.is_cancelled() {
            return Err(DbError::Aborted);
        }
        self.queue
            .ticket(&self.abort)
            .ok_or(DbError::InvalidState("consumer no longer accepts submissions"))
    }

    async fn consume(&self, submission: Submission, dot: Dot) -> Result<(), DbError> {
        if !submission.belongs_to(&self.queue) {
            tracing::warn!(id = %dot.id, "Rejecting a submission prepared by another consumer");
            return Err(DbError::InvalidState(
                "submission was prepared by another consumer",
            ));
        }
        submission.consume(dot).await
    }

    async fn commit(&self) -> Result<usize, DbError> {
        {
            let mut phase = self.lock_phase();
            if *phase != ConsumerPhase::Open {
                return Err(DbError::InvalidState("commit already ran on this consumer"));
            }
            *phase = ConsumerPhase::Committing;
        }
        let mut outcome = CommitOutcome::new(self);

        self.queue.close_intake();
        let Some(mut rows) = self.queue.take_drain() else {
            outcome.settle(ConsumerPhase::RolledBack);
            return Err(DbError::InvalidState("consumer was finalized"));
        };

        let result = self.drain(&mut rows).await;
        // Tear the queue down so submitters still blocked on a full buffer
        // observe the outcome instead of waiting forever.
        drop(rows);

        outcome.settle(match &result {
            Ok(_) => ConsumerPhase::Committed,
            Err(DbError::Aborted) => ConsumerPhase::Aborted,
            Err(_) => ConsumerPhase::RolledBack,
        });
        result
    }

    fn abort(&self) -> bool {
        let phase = self.lock_phase();
        if phase.is_terminal() || *phase == ConsumerPhase::Finishing {
            return false;
        }
        self.abort.cancel();
        tracing::info!(phase = ?*phase, "Abort requested");
        true
    }

    fn finalize(&self) -> bool {
        self.queue.tear_down();
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn lazy_consumer() -> DbDotConsumer {
        DbDotConsumer::connect(
            "sqlite::memory:",
            StoreConfig::default(),
            ConsumerConfig::dots().with_queue_capacity(2),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn abort_before_commit_wins() {
        let consumer = lazy_consumer().await;
        let ticket = consumer.prepare().unwrap();
        assert_eq!(consumer.pending(), 1);

        assert!(consumer.abort());
        assert!(matches!(consumer.prepare(), Err(DbError::Aborted)));
        assert!(matches!(
            consumer.consume(ticket, Dot::new(1, 0, "a", "")).await,
            Err(DbError::Aborted)
        ));

        assert!(matches!(consumer.commit().await, Err(DbError::Aborted)));
        assert_eq!(consumer.phase(), ConsumerPhase::Aborted);
        assert!(!consumer.abort());
        assert!(matches!(consumer.commit().await, Err(DbError::InvalidState(_))));
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_closes_intake() {
        let consumer = lazy_consumer().await;
        let ticket = consumer.prepare().unwrap();
        assert!(consumer.finalize());
        assert!(consumer.finalize());

        assert!(matches!(consumer.prepare(), Err(DbError::InvalidState(_))));
        assert!(matches!(
            ticket.consume(Dot::new(1, 0, "a", "")).await,
            Err(DbError::QueueClosed)
        ));
        assert!(matches!(consumer.commit().await, Err(DbError::InvalidState(_))));
        assert_eq!(consumer.phase(), ConsumerPhase::RolledBack);
    }

    #[tokio::test]
    async fn uninitialized_store_fails_commit() {
        let consumer = DbDotConsumer::new(StoreHandle::default(), ConsumerConfig::dots());
        assert!(matches!(consumer.commit().await, Err(DbError::InvalidState(_))));
        assert_eq!(consumer.phase(), ConsumerPhase::RolledBack);
    }

    #[tokio::test]
    async fn foreign_submission_is_rejected() {
        let (a, b) = (lazy_consumer().await, lazy_consumer().await);
        let ticket = b.prepare().unwrap();

        let err = a.consume(ticket, Dot::new(1, 0, "x", "")).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        assert_eq!(b.pending(), 0);

        // Nothing reached b's queue: with no tickets left its drain is empty.
        let mut rows = b.queue.take_drain().unwrap();
        b.queue.close_intake();
        assert!(rows.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_commit_settles_a_terminal_phase() {
        let consumer = lazy_consumer().await;
        let stalled = consumer.prepare().unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(30), consumer.commit()).await;
        assert!(timed_out.is_err());

        assert_eq!(consumer.phase(), ConsumerPhase::RolledBack);
        assert!(consumer.phase().is_terminal());
        assert!(!consumer.abort());
        assert!(matches!(consumer.commit().await, Err(DbError::InvalidState(_))));
        assert!(matches!(
            stalled.consume(Dot::new(1, 0, "late", "")).await,
            Err(DbError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_commit_after_abort_settles_aborted() {
        let consumer = lazy_consumer().await;
        let _stalled = consumer.prepare().unwrap();
        {
            let commit = consumer.commit();
            tokio::pin!(commit);
            let pending = tokio::time::timeout(Duration::from_millis(30), &mut commit).await;
            assert!(pending.is_err());
            assert!(consumer.abort());
        }
        assert_eq!(consumer.phase(), ConsumerPhase::Aborted);
    }

    #[test]
    fn terminal_phases() {
        assert!(!ConsumerPhase::Open.is_terminal());
        assert!(!ConsumerPhase::Finishing.is_terminal());
        assert!(ConsumerPhase::Committed.is_terminal());
        assert!(ConsumerPhase::Aborted.is_terminal());
    }
}
