/// Bounded cross-context queues
///
/// The outbound and inbound queues are the only structures shared between
/// producers (state owners, socket tasks) and the dispatch loop. Producers
/// never wait: a full queue rejects the item, the item is dropped and the
/// queue's drop counter goes up.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::BrokerError;

/// Producer half, cheap to clone into any task or thread
pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
    name: &'static str,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name,
            capacity: self.capacity,
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Non-blocking enqueue; on a full queue the item is dropped
    pub fn try_enqueue(&self, item: T) -> Result<(), BrokerError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BrokerError::QueueFull {
                    queue: self.name,
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::Stopped),
        }
    }

    /// Items rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Consumer half, owned by the dispatch loop
pub struct QueueConsumer<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> QueueConsumer<T> {
    /// Wait for the next item; None once every producer is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next item if one is ready
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded queue with `capacity` slots
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer {
            tx,
            name,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        QueueConsumer { rx },
    )
}
