//! Topic-string publish/subscribe fabric between the core and its
//! collaborators.
//!
//! Delivery is non-blocking: each subscriber owns a bounded channel, and a
//! publish that would block drops the event for that subscriber and counts
//! the loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::warn;

use crate::constants::EVENT_CHANNEL_SIZE;
use crate::types::Block;

/// Topic for main-chain connections and disconnections.
pub const TOPIC_CHAIN_UPDATE: &str = "chain:update";
/// Topic for peer-scoring annotations.
pub const TOPIC_CONN_EVENT: &str = "p2p:connevent";

/// Identity of a remote peer.
pub type PeerId = String;

/// Scoring annotation attached to a processed block message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    BadBlock,
    NewBlock,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A block was connected to or disconnected from the main chain.
    ChainUpdate { connected: bool, block: Block },
    /// A peer produced a scorable behavior.
    ConnEvent { peer: PeerId, behavior: PeerBehavior },
}

/// Shared pub/sub bus. Cloning yields another handle onto the same fabric.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, Vec<Sender<Event>>>>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bounded subscription on a topic.
    pub fn subscribe(&self, topic: &str) -> Receiver<Event> {
        let (tx, rx) = bounded(EVENT_CHANNEL_SIZE);
        self.topics.write().entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber of the topic. Never
    /// blocks; full subscribers lose the event, dead ones are pruned.
    pub fn publish(&self, topic: &str, event: Event) {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic, "event dropped: subscriber channel full");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of events lost to full subscriber channels.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
