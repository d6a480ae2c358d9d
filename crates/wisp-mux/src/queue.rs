//! Per-stream inbound queue between the dispatch loop and a stream's consumer.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};

/// Create a queue holding at most `capacity` payloads, or unbounded.
pub(crate) fn stream_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = match capacity {
        Some(capacity) => flume::bounded(capacity),
        None => flume::unbounded(),
    };
    let closed = Arc::new(AtomicBool::new(false));
    (
        QueueSender {
            tx,
            closed: closed.clone(),
        },
        QueueReceiver { rx, closed },
    )
}

pub(crate) struct QueueSender {
    tx: Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl QueueSender {
    /// Enqueue without waiting. Returns `false`, dropping the payload, when
    /// the queue is full or closed.
    pub fn try_put(&self, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Close the queue. Queued payloads are discarded and waiting consumers
    /// see end-of-stream.
    pub fn close(self) {
        self.closed.store(true, Ordering::Release);
        // flume wakes receivers once the last sender is gone
        drop(self.tx);
    }
}

pub(crate) struct QueueReceiver {
    rx: Receiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl QueueReceiver {
    /// Next payload, or `None` once the queue is closed.
    pub async fn get(&self) -> Option<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let data = self.rx.recv_async().await.ok()?;
        (!self.closed.load(Ordering::Acquire)).then_some(data)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
