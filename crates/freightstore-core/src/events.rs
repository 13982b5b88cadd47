//! Change notification bus.
//!
//! Every committed or buffered mutation publishes one event. Subscribers
//! get a bounded queue each; a subscriber that falls behind loses events
//! rather than back-pressuring the write path, and a dropped receiver is
//! pruned on the next publish.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use parking_lot::Mutex;
use tracing::trace;

use crate::value::Value;

/// One mutation, as observed by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// First write of a tag (best-effort classification)
    Put { truck: String, box_id: String, tag: String, value: Value },
    /// Overwrite of an existing tag (best-effort classification)
    Update { truck: String, box_id: String, tag: String, value: Value },
    Delete { truck: String, box_id: String, tag: String },
    DeleteBox { truck: String, box_id: String },
    Batch { truck: String, box_id: String, entries: BTreeMap<String, Value> },
    CasUpdate { truck: String, box_id: String, tag: String, value: Value },
}

impl ChangeEvent {
    pub fn truck(&self) -> &str {
        match self {
            ChangeEvent::Put { truck, .. }
            | ChangeEvent::Update { truck, .. }
            | ChangeEvent::Delete { truck, .. }
            | ChangeEvent::DeleteBox { truck, .. }
            | ChangeEvent::Batch { truck, .. }
            | ChangeEvent::CasUpdate { truck, .. } => truck,
        }
    }

    pub fn box_id(&self) -> &str {
        match self {
            ChangeEvent::Put { box_id, .. }
            | ChangeEvent::Update { box_id, .. }
            | ChangeEvent::Delete { box_id, .. }
            | ChangeEvent::DeleteBox { box_id, .. }
            | ChangeEvent::Batch { box_id, .. }
            | ChangeEvent::CasUpdate { box_id, .. } => box_id,
        }
    }

    /// Whether this event may have changed the value of one specific tag:
    /// a single-tag op on it, a batch containing it, or a box-wide delete.
    pub fn affects_tag(&self, truck: &str, box_id: &str, tag: &str) -> bool {
        if self.truck() != truck || self.box_id() != box_id {
            return false;
        }
        match self {
            ChangeEvent::Put { tag: t, .. }
            | ChangeEvent::Update { tag: t, .. }
            | ChangeEvent::Delete { tag: t, .. }
            | ChangeEvent::CasUpdate { tag: t, .. } => t == tag,
            ChangeEvent::Batch { entries, .. } => entries.contains_key(tag),
            ChangeEvent::DeleteBox { .. } => true,
        }
    }

    /// Whether this event touched any tag of the given box.
    pub fn affects_box(&self, truck: &str, box_id: &str) -> bool {
        self.truck() == truck && self.box_id() == box_id
    }
}

/// Multicast broadcaster with one bounded queue per subscriber.
pub struct Broadcaster {
    subscribers: Mutex<Vec<SyncSender<ChangeEvent>>>,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_depth,
        }
    }

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking. Full queues drop
    /// this event for that subscriber; disconnected subscribers are pruned.
    pub fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(truck = event.truck(), "subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
