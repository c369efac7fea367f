//! Per-session outbound queues.
//!
//! Frames are queued in driver order while the driver lock is held and never
//! block there. Backpressure happens afterwards: the reader task that produced
//! the frames waits for each queue it fed to drain below
//! [`OUTBOUND_QUEUE_FRAMES`] before it reads the next frame from its peer. A
//! sender whose receivers fall behind therefore stops being read, and QUIC
//! flow control stalls it.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

/// Queued frames a session may hold before producers wait for it.
pub const OUTBOUND_QUEUE_FRAMES: usize = 32;

/// Hard capacity. A queue this full is closed as a stalled consumer.
const OUTBOUND_QUEUE_CAPACITY: usize = 2 * OUTBOUND_QUEUE_FRAMES;

/// How long a producer waits for a queue to drain before giving up on it.
pub const SLOW_CONSUMER_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueError {
    /// Hard capacity reached; the consumer is stalled.
    Overflow,
    /// The writer task is gone.
    Closed,
}

/// Sending half of a session's writer queue.
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Bytes>,
    /// Signalled each time the writer takes a frame
    drained: Arc<Notify>,
}

/// Receiving half, owned by the session's writer task.
#[derive(Debug)]
pub(crate) struct OutboxReceiver {
    rx: mpsc::Receiver<Bytes>,
    drained: Arc<Notify>,
}

impl Outbox {
    /// New queue with the relay's capacity.
    pub(crate) fn new() -> (Self, OutboxReceiver) {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let drained = Arc::new(Notify::new());
        (Self { tx, drained: Arc::clone(&drained) }, OutboxReceiver { rx, drained })
    }

    /// Queue a frame without waiting.
    pub(crate) fn push(&self, bytes: Bytes) -> Result<(), QueueError> {
        self.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Overflow,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Frames queued and not yet taken by the writer.
    pub(crate) fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Wait until the backlog is at most `limit` or the writer is gone.
    pub(crate) async fn drained_to(&self, limit: usize) {
        loop {
            let drained = self.drained.notified();
            if self.tx.is_closed() || self.backlog() <= limit {
                return;
            }
            drained.await;
        }
    }
}

impl OutboxReceiver {
    /// Next frame to write. `None` once every [`Outbox`] is dropped.
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        let bytes = self.rx.recv().await;
        self.drained.notify_waiters();
        bytes
    }

    /// Stop accepting frames and wake anyone waiting on the queue.
    pub(crate) fn close(&mut self) {
        self.rx.close();
        self.drained.notify_waiters();
    }
}

impl Drop for OutboxReceiver {
    fn drop(&mut self) {
        self.close();
    }
}
