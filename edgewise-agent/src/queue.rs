//! Durable, ordered offline queue.
//!
//! Upstream senders (config sync, shadow publish, event publish) park
//! outbound operations here across connectivity loss. Each named queue is a
//! FIFO backed by sqlite rows with an in-memory mirror for fast reads.
//!
//! `flush` is not safe to invoke concurrently for the same queue name;
//! callers serialize flush invocations (one timer-driven task per queue).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One queued operation.
#[derive(Clone, Debug)]
pub struct QueueItem<T> {
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
struct Entry<T> {
    id: i64,
    item: QueueItem<T>,
}

#[derive(Clone, Copy, Debug)]
pub struct FlushOptions {
    /// Attempt ceiling per item; reaching it drops the item.
    pub max_retries: u32,
    /// Advance past a still-retryable failure instead of stopping. Off by
    /// default: stopping preserves strict delivery order.
    pub continue_on_error: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            continue_on_error: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: u32,
    pub dropped: u32,
    pub remaining: usize,
}

pub struct OfflineQueue<T> {
    name: String,
    max_size: usize,
    store: Arc<Store>,
    entries: Mutex<VecDeque<Entry<T>>>,
}

impl<T> OfflineQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Open a named queue, restoring surviving items from storage. Items
    /// beyond `max_size` (a shrunk cap across restarts) are evicted oldest
    /// first.
    pub async fn open(store: Arc<Store>, name: &str, max_size: usize) -> Result<Self, QueueError> {
        let rows = store.queue_load(name).await?;
        let mut entries = VecDeque::with_capacity(rows.len());
        for row in rows {
            let payload: T = serde_json::from_str(&row.payload)?;
            entries.push_back(Entry {
                id: row.id,
                item: QueueItem {
                    payload,
                    created_at: row.created_at,
                    attempts: row.attempts,
                },
            });
        }

        let queue = Self {
            name: name.to_string(),
            max_size,
            store,
            entries: Mutex::new(entries),
        };

        {
            let mut entries = queue.entries.lock().await;
            while entries.len() > queue.max_size {
                if let Some(evicted) = entries.pop_front() {
                    warn!(queue = %queue.name, id = evicted.id, "evicting item over capacity");
                    queue.store.queue_delete(evicted.id).await?;
                }
            }
        }

        Ok(queue)
    }

    /// Append an item. Overflow past `max_size` drops the oldest item, from
    /// memory first, then storage.
    pub async fn enqueue(&self, payload: T) -> Result<(), QueueError> {
        let created_at = Utc::now();
        let serialized = serde_json::to_string(&payload)?;
        let id = self
            .store
            .queue_push(&self.name, &serialized, created_at)
            .await?;

        let mut entries = self.entries.lock().await;
        entries.push_back(Entry {
            id,
            item: QueueItem {
                payload,
                created_at,
                attempts: 0,
            },
        });

        if entries.len() > self.max_size {
            if let Some(evicted) = entries.pop_front() {
                debug!(queue = %self.name, id = evicted.id, "queue full, dropping oldest item");
                self.store.queue_delete(evicted.id).await?;
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Current items in order, for inspection.
    pub async fn items(&self) -> Vec<QueueItem<T>> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.item.clone())
            .collect()
    }

    /// Drain the queue in order through `send`, over a point-in-time copy.
    ///
    /// A delivered item is removed from memory and storage. A failed item
    /// has its attempt counter bumped in both tiers; once attempts reach the
    /// ceiling the item is dropped (a deliberate data-loss boundary) and the
    /// loop advances. Otherwise the loop stops so no item is ever delivered
    /// ahead of an older unresolved one.
    pub async fn flush<F, Fut, E>(
        &self,
        mut send: F,
        opts: FlushOptions,
    ) -> Result<FlushReport, QueueError>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let snapshot: Vec<(i64, T, u32)> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|e| (e.id, e.item.payload.clone(), e.item.attempts))
            .collect();

        let mut report = FlushReport::default();

        for (id, payload, attempts) in snapshot {
            match send(payload).await {
                Ok(()) => {
                    self.remove_entry(id).await?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempts = attempts + 1;
                    self.bump_entry(id).await?;
                    if attempts >= opts.max_retries {
                        warn!(
                            queue = %self.name, id, attempts,
                            error = %e,
                            "dropping item after exceeding retry ceiling"
                        );
                        self.remove_entry(id).await?;
                        report.dropped += 1;
                        continue;
                    }
                    warn!(queue = %self.name, id, attempts, error = %e, "delivery failed");
                    if !opts.continue_on_error {
                        break;
                    }
                }
            }
        }

        report.remaining = self.len().await;
        Ok(report)
    }

    async fn remove_entry(&self, id: i64) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries.remove(pos);
        }
        drop(entries);
        self.store.queue_delete(id).await?;
        Ok(())
    }

    async fn bump_entry(&self, id: i64) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.item.attempts += 1;
        }
        drop(entries);
        self.store.queue_bump_attempts(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    async fn queue(max_size: usize) -> (Arc<Store>, OfflineQueue<String>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = OfflineQueue::open(store.clone(), "events", max_size)
            .await
            .unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn test_failed_item_blocks_younger_items() {
        let (_store, q) = queue(10).await;
        for p in ["A", "B", "C"] {
            q.enqueue(p.to_string()).await.unwrap();
        }

        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sent_ref = sent.clone();
        let report = q
            .flush(
                move |p: String| {
                    let sent = sent_ref.clone();
                    async move {
                        sent.lock().unwrap().push(p.clone());
                        if p == "B" { Err("offline".to_string()) } else { Ok(()) }
                    }
                },
                FlushOptions::default(),
            )
            .await
            .unwrap();

        // A delivered, B failed and stopped the loop before C.
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(*sent.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);

        let left: Vec<String> = q.items().await.into_iter().map(|i| i.payload).collect();
        assert_eq!(left, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(q.items().await[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_item() {
        let (store, q) = queue(3).await;
        for p in ["one", "two", "three", "four"] {
            q.enqueue(p.to_string()).await.unwrap();
        }

        let left: Vec<String> = q.items().await.into_iter().map(|i| i.payload).collect();
        assert_eq!(left, vec!["two", "three", "four"]);
        assert_eq!(store.queue_len("events").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_poison_item_dropped_after_retry_ceiling() {
        let (_store, q) = queue(10).await;
        q.enqueue("poison".to_string()).await.unwrap();
        q.enqueue("good".to_string()).await.unwrap();

        let opts = FlushOptions {
            max_retries: 2,
            continue_on_error: false,
        };
        let fail_poison = |p: String| async move {
            if p == "poison" { Err("boom".to_string()) } else { Ok(()) }
        };

        // First flush: poison fails (1 attempt), loop stops, "good" blocked.
        let report = q.flush(fail_poison, opts).await.unwrap();
        assert_eq!(report, FlushReport { delivered: 0, dropped: 0, remaining: 2 });

        // Second flush: poison hits the ceiling, is dropped, loop advances.
        let report = q.flush(fail_poison, opts).await.unwrap();
        assert_eq!(report, FlushReport { delivered: 1, dropped: 1, remaining: 0 });
    }

    #[tokio::test]
    async fn test_continue_on_error_skips_without_dropping() {
        let (_store, q) = queue(10).await;
        q.enqueue("bad".to_string()).await.unwrap();
        q.enqueue("good".to_string()).await.unwrap();

        let opts = FlushOptions {
            max_retries: 5,
            continue_on_error: true,
        };
        let report = q
            .flush(
                |p: String| async move {
                    if p == "bad" { Err("nope".to_string()) } else { Ok(()) }
                },
                opts,
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
        let left: Vec<String> = q.items().await.into_iter().map(|i| i.payload).collect();
        assert_eq!(left, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        {
            let q: OfflineQueue<String> =
                OfflineQueue::open(store.clone(), "events", 10).await.unwrap();
            q.enqueue("a".to_string()).await.unwrap();
            q.enqueue("b".to_string()).await.unwrap();
        }

        let q: OfflineQueue<String> =
            OfflineQueue::open(store.clone(), "events", 10).await.unwrap();
        let left: Vec<String> = q.items().await.into_iter().map(|i| i.payload).collect();
        assert_eq!(left, vec!["a".to_string(), "b".to_string()]);
    }
}
