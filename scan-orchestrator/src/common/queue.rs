//! Deduplicating work queue.
//!
//! An item is tracked by its [`ReconcileEvent::hash_key`] in one of three
//! places: queued, processing or waiting for a delayed re-enqueue. Enqueueing
//! an item that is processing or waiting is a no-op, so no two
//! reconciliations for the same entity ever run concurrently.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ReconcileEvent;
use crate::{Error, Result};

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashSet<String>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    item_added: Notify,
}

/// Cheaply cloneable handle to a deduplicating queue.
#[derive(Debug)]
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: ReconcileEvent> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ReconcileEvent> Queue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                item_added: Notify::new(),
            }),
        }
    }

    /// Adds an item. A pending item with the same key is replaced in place;
    /// an item that is processing or waiting to be re-enqueued is ignored.
    pub fn enqueue(&self, item: T) {
        let key = item.hash_key();
        let mut state = self.shared.state.lock();
        if state.processing.contains(&key) || state.waiting.contains(&key) {
            trace!(%key, "Item is already in flight");
            return;
        }

        if state.queued.contains(&key) {
            if let Some(pending) = state.queue.iter_mut().find(|p| p.hash_key() == key) {
                *pending = item;
            }
            return;
        }

        state.queued.insert(key);
        state.queue.push_back(item);
        drop(state);
        self.shared.item_added.notify_one();
    }

    /// Waits until an item is available and marks it as processing.
    ///
    /// Fails only when `cancel` fires first.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    let key = item.hash_key();
                    state.queued.remove(&key);
                    state.processing.insert(key);
                    return Ok(item);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled);
                }
                _ = self.shared.item_added.notified() => {}
            }
        }
    }

    /// Releases the processing marker of an item.
    pub fn done(&self, item: &T) {
        self.shared.state.lock().processing.remove(&item.hash_key());
    }

    /// Releases the processing marker and enqueues the item again after `after`.
    pub fn requeue_after(&self, item: T, after: Duration) {
        self.shared.state.lock().processing.remove(&item.hash_key());
        self.enqueue_after(item, after);
    }

    /// Enqueues an item after `after`. Until then the item counts as in flight.
    pub fn enqueue_after(&self, item: T, after: Duration) {
        let key = item.hash_key();
        {
            let mut state = self.shared.state.lock();
            if state.processing.contains(&key)
                || state.waiting.contains(&key)
                || state.queued.contains(&key)
            {
                return;
            }
            state.waiting.insert(key.clone());
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            queue.shared.state.lock().waiting.remove(&key);
            queue.enqueue(item);
        });
    }

    /// Number of queued items, excluding processing and waiting ones.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the item is queued, processing or waiting.
    pub fn has(&self, item: &T) -> bool {
        let key = item.hash_key();
        let state = self.shared.state.lock();
        state.queued.contains(&key) || state.processing.contains(&key) || state.waiting.contains(&key)
    }

    pub fn processing_count(&self) -> usize {
        self.shared.state.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Labels;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        version: u32,
    }

    impl fmt::Display for Item {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ID={}", self.id)
        }
    }

    impl ReconcileEvent for Item {
        fn hash_key(&self) -> String {
            self.id.to_string()
        }

        fn labels(&self) -> Labels {
            Labels::new().with("ID", self.id)
        }
    }

    fn item(id: &'static str, version: u32) -> Item {
        Item { id, version }
    }

    #[tokio::test]
    async fn test_enqueue_dedups_and_replaces() {
        let queue = Queue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(item("a", 1));
        queue.enqueue(item("b", 1));
        queue.enqueue(item("a", 2));
        assert_eq!(queue.len(), 2);

        let first = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(first, item("a", 2));
        let second = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(second, item("b", 1));
        assert_eq!(queue.processing_count(), 2);
    }

    #[tokio::test]
    async fn test_processing_item_is_not_enqueued_again() {
        let queue = Queue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(item("a", 1));
        let a = queue.dequeue(&cancel).await.unwrap();

        queue.enqueue(item("a", 2));
        assert!(queue.is_empty());
        assert!(queue.has(&a));

        queue.done(&a);
        assert!(!queue.has(&a));
        queue.enqueue(item("a", 3));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Queue::new();
        let cancel = CancellationToken::new();

        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(item("late", 1));
        });

        let got = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(got.id, "late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_cancelled() {
        let queue: Queue<Item> = Queue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_delays_item() {
        let queue = Queue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(item("a", 1));
        let a = queue.dequeue(&cancel).await.unwrap();

        queue.requeue_after(a.clone(), Duration::from_secs(5));
        assert_eq!(queue.processing_count(), 0);
        assert!(queue.has(&a));
        assert!(queue.is_empty());

        // waiting items are not enqueued by a poll
        queue.enqueue(item("a", 2));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        let again = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(again, item("a", 1));
    }
}
