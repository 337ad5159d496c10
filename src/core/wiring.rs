//! Type-erased runtime wiring between compiled nodes.
//!
//! Each node publishes its output pipe here under its own node id; a
//! downstream node subscribes by the producing node's id and blocks until
//! it's published, regardless of which driver task actually starts first —
//! the reverse-topological start order the runner uses is an optimisation,
//! never a correctness requirement.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::core::graph::NodeId;
use crate::core::pipe::{Pipe, PipeConsumer};
use crate::error::{ConduitError, ConduitResult};

type Slot = Option<Result<Arc<dyn Any + Send + Sync>, ConduitError>>;

pub struct PipeRegistry {
    senders: Mutex<HashMap<NodeId, watch::Sender<Slot>>>,
    receivers: Mutex<HashMap<NodeId, watch::Receiver<Slot>>>,
}

impl PipeRegistry {
    pub fn new(node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for id in node_ids {
            let (tx, rx) = watch::channel(None);
            senders.insert(id.clone(), tx);
            receivers.insert(id, rx);
        }
        Self {
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
        }
    }

    /// Registers the pipe a node produced. A no-op if the node has already
    /// published (first publish wins, matching `Pipe`'s own terminal
    /// semantics).
    pub fn publish<T: Send + Sync + 'static>(&self, node_id: &NodeId, pipe: Pipe<T>) {
        let senders = self.senders.lock().expect("registry lock poisoned");
        if let Some(tx) = senders.get(node_id) {
            let _ = tx.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(Ok(Arc::new(pipe)));
                true
            });
        }
    }

    /// Registers that a node failed before ever producing a pipe, so
    /// subscribers waiting on it fail fast instead of hanging forever.
    pub fn publish_failure(&self, node_id: &NodeId, error: ConduitError) {
        let senders = self.senders.lock().expect("registry lock poisoned");
        if let Some(tx) = senders.get(node_id) {
            let _ = tx.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(Err(error));
                true
            });
        }
    }

    /// Subscribes to the pipe published by `node_id`, waiting for it to be
    /// published if the producer hasn't run yet.
    pub async fn subscribe<T: Clone + Send + Sync + 'static>(
        &self,
        node_id: &NodeId,
    ) -> ConduitResult<PipeConsumer<T>> {
        let mut rx = {
            let receivers = self.receivers.lock().expect("registry lock poisoned");
            receivers.get(node_id).cloned().ok_or_else(|| {
                ConduitError::DataflowFault(format!("no such upstream node '{node_id}'"))
            })?
        };
        loop {
            if let Some(result) = rx.borrow().clone() {
                let arc_any = result?;
                let pipe = arc_any.downcast::<Pipe<T>>().map_err(|_| {
                    ConduitError::DataflowFault(format!(
                        "type mismatch subscribing to output of '{node_id}'"
                    ))
                })?;
                return pipe.subscribe();
            }
            if rx.changed().await.is_err() {
                return Err(ConduitError::DataflowFault(format!(
                    "upstream node '{node_id}' dropped before publishing"
                )));
            }
        }
    }
}
