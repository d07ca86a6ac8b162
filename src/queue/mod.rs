//! Bounded producer/consumer queues connecting the crawler to its consumers.
//!
//! Two queues exist per blog run:
//! - the post queue carries [`DownloadItem`]s to the downloader
//! - the metadata queue carries [`CrawlerData`] snapshots to the metadata writer
//!
//! Both share one contract: producers `add` while the queue is open, any
//! producer may `complete_adding`, and the single consumer's `receive` yields
//! items until the queue is completed and drained, or until the run is
//! cancelled.
//!
//! # Example
//!
//! ```
//! use blogcrawl_core::queue::bounded;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), blogcrawl_core::queue::QueueError> {
//! let (queue, mut receiver) = bounded::<u32>("numbers", 8);
//! queue.add(1).await?;
//! queue.complete_adding();
//!
//! let cancel = CancellationToken::new();
//! assert_eq!(receiver.receive(&cancel).await?, Some(1));
//! assert_eq!(receiver.receive(&cancel).await?, None);
//! # Ok(())
//! # }
//! ```

mod error;
mod item;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use error::QueueError;
pub use item::{ArtifactKind, CrawlerData, DownloadItem, ItemPayload};

/// Default capacity for per-run queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Crawl → download queue.
pub type PostQueue = Queue<DownloadItem>;

/// Crawl → metadata writer queue.
pub type MetadataQueue<P> = Queue<CrawlerData<P>>;

/// Producer side of a bounded, completion-signaled queue.
///
/// Shared between producers behind an `Arc`. Adding awaits while the queue is
/// full, which back-pressures the crawler when downloads fall behind.
#[derive(Debug)]
pub struct Queue<T> {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<T>>>,
}

/// Consumer side of a queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    receiver: mpsc::Receiver<T>,
}

/// Creates a bounded queue and its receiver.
///
/// A `capacity` of zero is raised to one.
#[must_use]
pub fn bounded<T>(name: &'static str, capacity: usize) -> (Arc<Queue<T>>, QueueReceiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        Arc::new(Queue {
            name,
            sender: Mutex::new(Some(sender)),
        }),
        QueueReceiver { name, receiver },
    )
}

impl<T> Queue<T> {
    /// Returns the queue label.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds an item, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Completed`] when the queue was completed for
    /// adding or its consumer is gone.
    pub async fn add(&self, item: T) -> Result<(), QueueError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(QueueError::Completed { name: self.name });
        };
        sender
            .send(item)
            .await
            .map_err(|_| QueueError::Completed { name: self.name })
    }

    /// Marks the queue complete: later adds fail and the consumer sees the end
    /// once buffered items are drained. Idempotent.
    #[instrument(level = "debug", skip(self), fields(queue = self.name))]
    pub fn complete_adding(&self) {
        let previous = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("queue completed for adding");
        }
    }

    /// Returns true once [`complete_adding`](Self::complete_adding) ran.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item.
    ///
    /// Returns `Ok(None)` once the queue is completed and drained.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] when `cancel` fires first.
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<Option<T>, QueueError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(QueueError::Cancelled { name: self.name }),
            item = self.receiver.recv() => Ok(item),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_queue_delivers_in_order_then_closes() {
        let (queue, mut rx) = bounded::<u32>("test", 4);
        let cancel = CancellationToken::new();

        queue.add(1).await.unwrap();
        queue.add(2).await.unwrap();
        queue.complete_adding();

        assert_eq!(rx.receive(&cancel).await.unwrap(), Some(1));
        assert_eq!(rx.receive(&cancel).await.unwrap(), Some(2));
        assert_eq!(rx.receive(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_add_after_completion_fails() {
        let (queue, _rx) = bounded::<u32>("test", 4);
        queue.complete_adding();
        queue.complete_adding();

        assert!(queue.is_completed());
        assert_eq!(
            queue.add(7).await,
            Err(QueueError::Completed { name: "test" })
        );
    }

    #[tokio::test]
    async fn test_queue_receive_cancelled() {
        let (_queue, mut rx) = bounded::<u32>("test", 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = rx.receive(&cancel).await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_queue_add_fails_when_consumer_dropped() {
        let (queue, rx) = bounded::<u32>("test", 1);
        drop(rx);
        assert!(queue.add(1).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_add_waits_for_capacity() {
        let (queue, mut rx) = bounded::<u32>("test", 1);
        let cancel = CancellationToken::new();
        queue.add(1).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.add(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(rx.receive(&cancel).await.unwrap(), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(rx.receive(&cancel).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_multiple_producers_single_consumer() {
        let (queue, mut rx) = bounded::<u32>("test", 2);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for p in 0..4u32 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                for i in 0..10u32 {
                    queue.add(p * 100 + i).await.unwrap();
                }
            }));
        }
        let completer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for handle in handles {
                    handle.await.unwrap();
                }
                queue.complete_adding();
            })
        };

        let mut received = Vec::new();
        while let Some(item) = rx.receive(&cancel).await.unwrap() {
            received.push(item);
        }
        completer.await.unwrap();
        assert_eq!(received.len(), 40);
    }
}
