//! Distribution queue between the exporter and its workers
//!
//! A multi-producer, multi-consumer handoff where every item reaches exactly
//! one receiver. With [`UNBUFFERED`] capacity a send only completes once a
//! worker has taken the item, which is what gives `push` its backpressure.

/// Capacity of a synchronous handoff queue.
pub const UNBUFFERED: usize = 0;

/// Producer half of the distribution queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: flume::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Wait until a receiver takes `item`. The item comes back if every
    /// receiver is gone.
    pub async fn send(&self, item: T) -> Result<(), T> {
        self.tx.send_async(item).await.map_err(|e| e.into_inner())
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Consumer half of the distribution queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: flume::Receiver<T>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Next item, or `None` once every sender is dropped and the queue is empty.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Take an item that was already handed off, without waiting.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub fn distribution_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}
