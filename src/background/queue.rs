//! Bounded, non-blocking queue of view events.
//!
//! Request handlers hold a cloned [`ViewQueue`] and call
//! [`enqueue`](ViewQueue::enqueue). The single consumer owns the matching
//! [`ViewReceiver`]. When the buffer is full the event is dropped and counted;
//! the caller is never blocked and never sees an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ViewQueueConfig;
use crate::content::ContentId;

/// Drops between two `warn!` diagnostics; the ones in between log at debug.
const DROP_WARN_EVERY: u64 = 1000;

/// One observed view of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewEvent {
    pub content_id: ContentId,
    pub observed_at: DateTime<Utc>,
}

impl ViewEvent {
    /// The UTC calendar day the view belongs to.
    pub fn day(&self) -> NaiveDate {
        self.observed_at.date_naive()
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Events accepted into the buffer since creation.
    pub accepted: u64,
    /// Events rejected because the buffer was full or the consumer was gone.
    pub dropped: u64,
    /// Events currently buffered and not yet taken by the consumer.
    pub queued: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Producer side of the view queue. Cheap to clone.
#[derive(Clone)]
pub struct ViewQueue {
    tx: mpsc::Sender<ViewEvent>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

/// Consumer side of the view queue.
#[derive(Debug)]
pub struct ViewReceiver {
    rx: mpsc::Receiver<ViewEvent>,
}

/// Creates a view queue holding at most `config.capacity` events.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use pressroom::background::view_queue;
/// use pressroom::clock::SystemClock;
/// use pressroom::config::ViewQueueConfig;
/// use pressroom::content::ContentId;
///
/// let (queue, _receiver) = view_queue(&ViewQueueConfig::default(), Arc::new(SystemClock));
/// queue.enqueue(ContentId(7));
/// assert_eq!(queue.stats().accepted, 1);
/// ```
pub fn view_queue(config: &ViewQueueConfig, clock: Arc<dyn Clock>) -> (ViewQueue, ViewReceiver) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let queue = ViewQueue {
        tx,
        clock,
        counters: Arc::new(Counters::default()),
    };
    (queue, ViewReceiver { rx })
}

impl ViewQueue {
    /// Records a view of `content_id` at the current clock time.
    ///
    /// Never blocks and never fails from the caller's point of view.
    pub fn enqueue(&self, content_id: ContentId) {
        let event = ViewEvent {
            content_id,
            observed_at: self.clock.now(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => self.record_drop(content_id, "full"),
            Err(TrySendError::Closed(_)) => self.record_drop(content_id, "closed"),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let capacity = self.tx.max_capacity();
        QueueStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queued: capacity - self.tx.capacity(),
            capacity,
        }
    }

    fn record_drop(&self, content_id: ContentId, reason: &'static str) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if warns_on_drop(dropped) {
            warn!(
                content_id = %content_id,
                reason,
                dropped_total = dropped,
                "view queue rejected event, dropping it"
            );
        } else {
            debug!(content_id = %content_id, reason, "view event dropped");
        }
    }
}

/// The first drop and every [`DROP_WARN_EVERY`]th one are logged at warn.
fn warns_on_drop(dropped_total: u64) -> bool {
    dropped_total == 1 || dropped_total % DROP_WARN_EVERY == 0
}

impl ViewReceiver {
    pub(crate) async fn recv(&mut self) -> Option<ViewEvent> {
        self.rx.recv().await
    }

    /// Takes one buffered event without waiting; `None` once the buffer is empty.
    pub(crate) fn try_recv(&mut self) -> Option<ViewEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Refuses further events; already-buffered ones stay receivable.
    pub(crate) fn close(&mut self) {
        self.rx.close();
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
