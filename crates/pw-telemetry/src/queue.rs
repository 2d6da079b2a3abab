//! Bounded ingestion queue.
//!
//! Producers call [`EventSender::enqueue`], which never blocks: when the
//! queue is full the event is handed back inside the error and counted as
//! dropped. The single consumer (the batch writer) drains through
//! [`EventReceiver::dequeue`] with a timeout.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use pw_common::Event;

use crate::stats::Statistics;

/// Why an event was not accepted.
#[derive(Debug)]
pub enum EnqueueError {
    /// Queue at capacity; the event was dropped.
    Full(Event),
    /// The consumer is gone; the event was dropped.
    Closed(Event),
}

impl EnqueueError {
    pub fn into_event(self) -> Event {
        match self {
            EnqueueError::Full(e) | EnqueueError::Closed(e) => e,
        }
    }
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("ingestion queue is full"),
            EnqueueError::Closed(_) => f.write_str("ingestion queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Result of a dequeue attempt.
#[derive(Debug)]
pub enum Dequeue {
    Event(Event),
    /// Nothing arrived before the timeout.
    Empty,
    /// Every sender is gone and the queue is drained.
    Closed,
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<Event>,
    stats: Arc<Statistics>,
}

/// Consumer handle owned by the batch writer.
pub struct EventReceiver {
    rx: Receiver<Event>,
    stats: Arc<Statistics>,
}

/// Create a bounded queue holding at most `capacity` events.
///
/// A capacity of zero is raised to one.
pub fn bounded(capacity: usize, stats: Arc<Statistics>) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        EventSender {
            tx,
            stats: Arc::clone(&stats),
        },
        EventReceiver { rx, stats },
    )
}

impl EventSender {
    /// Offer an event without blocking.
    pub fn enqueue(&self, event: Event) -> Result<(), EnqueueError> {
        self.stats.queue_incr();
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.stats.queue_decr();
                self.stats.record_dropped();
                Err(EnqueueError::Full(event))
            }
            Err(TrySendError::Disconnected(event)) => {
                self.stats.queue_decr();
                self.stats.record_dropped();
                Err(EnqueueError::Closed(event))
            }
        }
    }

    /// Fire-and-forget enqueue. Drops are already counted in [`Statistics`].
    pub fn emit(&self, event: Event) {
        if let Err(err) = self.enqueue(event) {
            tracing::trace!(error = %err, "event dropped");
        }
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event.
    pub fn dequeue(&self, timeout: Duration) -> Dequeue {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.stats.queue_decr();
                Dequeue::Event(event)
            }
            Err(RecvTimeoutError::Timeout) => Dequeue::Empty,
            Err(RecvTimeoutError::Disconnected) => Dequeue::Closed,
        }
    }

    /// Take the next event if one is ready.
    pub fn try_dequeue(&self) -> Dequeue {
        match self.rx.try_recv() {
            Ok(event) => {
                self.stats.queue_decr();
                Dequeue::Event(event)
            }
            Err(TryRecvError::Empty) => Dequeue::Empty,
            Err(TryRecvError::Disconnected) => Dequeue::Closed,
        }
    }
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver").finish_non_exhaustive()
    }
}
