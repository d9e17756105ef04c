//! Bounded submission queue between many submitters and one committer.
//!
//! Every prepared submission owns a sender on a bounded channel. The
//! consumer keeps one extra "intake" sender that hands out new tickets and
//! is dropped when commit starts. From then on the channel reports closed
//! exactly when every ticket has either enqueued its record or been
//! dropped, and the buffer is empty. A submitter that disappears after
//! `prepare` therefore cannot stall the committer.
//!
//! A shared counter mirrors the number of outstanding tickets so callers
//! can observe progress; the channel itself is the source of truth for
//! closing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dots_types::Dot;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;

/// A prepared unit of submission.
///
/// Consuming the ticket enqueues one record; dropping it unused counts as
/// "will never enqueue". Either way the ticket completes exactly once.
#[derive(Debug)]
#[must_use = "a prepared submission should be consumed"]
pub struct Submission {
    queue: mpsc::Sender<Dot>,
    abort: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl Submission {
    fn new(queue: mpsc::Sender<Dot>, abort: CancellationToken, pending: Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self {
            queue,
            abort,
            pending,
        }
    }

    /// Enqueue `dot` and complete the submission.
    ///
    /// Waits while the queue is full. If the consumer has been aborted the
    /// record is dropped instead of enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Aborted`] if the consumer was aborted before the
    /// record was enqueued, or [`DbError::QueueClosed`] if the queue was
    /// torn down.
    pub async fn consume(self, dot: Dot) -> Result<(), DbError> {
        let id = dot.id;
        tokio::select! {
            biased;
            () = self.abort.cancelled() => {
                tracing::debug!(%id, "Dropping dot submitted after abort");
                Err(DbError::Aborted)
            }
            sent = self.queue.send(dot) => sent.map_err(|_closed| DbError::QueueClosed),
        }
    }

    /// Whether this ticket was handed out by `queue`.
    pub(crate) fn belongs_to(&self, queue: &DotQueue) -> bool {
        Arc::ptr_eq(&self.pending, &queue.pending)
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The queue owned by one consumer.
#[derive(Debug)]
pub(crate) struct DotQueue {
    intake: Mutex<Option<mpsc::Sender<Dot>>>,
    drain: Mutex<Option<mpsc::Receiver<Dot>>>,
    pending: Arc<AtomicUsize>,
}

impl DotQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            intake: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hand out a new ticket, or `None` once intake is closed.
    pub(crate) fn ticket(&self, abort: &CancellationToken) -> Option<Submission> {
        let intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        intake
            .as_ref()
            .map(|tx| Submission::new(tx.clone(), abort.clone(), Arc::clone(&self.pending)))
    }

    /// Stop handing out tickets. Outstanding tickets stay valid.
    pub(crate) fn close_intake(&self) {
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Take the receiving end. Only the first caller gets it.
    pub(crate) fn take_drain(&self) -> Option<mpsc::Receiver<Dot>> {
        self.drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Drop both ends still held by the queue.
    pub(crate) fn tear_down(&self) {
        self.close_intake();
        drop(self.take_drain());
    }

    /// Number of tickets handed out and not yet completed.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
