//! Terminal destination for items a node could not process.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::ConduitError;

/// One failed item, recorded the moment the Resilient strategy gives up on
/// it. Kept generic over the item type so a dead-letter sink can inspect the
/// payload, not just the error.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub node_id: String,
    pub item: T,
    pub error: ConduitError,
}

/// Published to from every driver running a Resilient strategy concurrently
/// — implementations must be internally synchronised.
///
/// When a node has no dead-letter sink configured, a terminal item failure
/// faults the node instead (see [`crate::error::ConduitError`] propagation
/// policy).
#[async_trait]
pub trait DeadLetterSink<T>: Send + Sync {
    async fn publish(&self, letter: DeadLetter<T>);
}

/// A dead-letter sink backed by an in-memory deque behind a mutex. Mainly
/// useful for tests and small embedders; production use will usually reach
/// for something durable instead.
///
/// Unbounded by default ([`InMemoryDeadLetterSink::new`]); callers wiring a
/// node's `dlq.max_materialized_items` parameter through should construct
/// it via [`InMemoryDeadLetterSink::bounded`] instead, which evicts the
/// oldest retained entry once the bound is reached rather than growing
/// forever.
pub struct InMemoryDeadLetterSink<T> {
    items: tokio::sync::Mutex<VecDeque<DeadLetter<T>>>,
    capacity: Option<usize>,
}

impl<T> Default for InMemoryDeadLetterSink<T> {
    fn default() -> Self {
        Self {
            items: tokio::sync::Mutex::new(VecDeque::new()),
            capacity: None,
        }
    }
}

impl<T> InMemoryDeadLetterSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An in-memory sink that evicts its oldest retained entry (with a
    /// `tracing::warn!`) once `capacity` entries are held, instead of
    /// growing without bound.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: tokio::sync::Mutex::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub async fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut items = self.items.lock().await;
        std::mem::take(&mut *items).into()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> DeadLetterSink<T> for InMemoryDeadLetterSink<T> {
    async fn publish(&self, letter: DeadLetter<T>) {
        let mut items = self.items.lock().await;
        if let Some(capacity) = self.capacity {
            if items.len() >= capacity {
                if let Some(evicted) = items.pop_front() {
                    tracing::warn!(
                        node_id = %evicted.node_id,
                        capacity,
                        "dead-letter sink at capacity, evicting oldest entry"
                    );
                }
            }
        }
        items.push_back(letter);
    }
}
