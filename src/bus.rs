//! # Internal Message Bus
//!
//! Typed fan-out channel decoupling the agent layer from the peer relay.
//! Publishers call [`MessageBus::emit`]; each subscriber owns an unbounded
//! receiver drained on its own task, so an emit never runs subscriber code
//! on the publisher's stack and a slow subscriber cannot starve siblings.
//!
//! Within one emit, subscribers are reached in registration order. Ordering
//! between distinct emits is whatever the subscriber tasks make of it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::messages::{Frame, Origin};

// ============================================================================
// Topics and events
// ============================================================================

/// Bus topics used by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusTopic {
    AgentBroadcast,
    AgentDirect,
    AgentPing,
}

impl BusTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusTopic::AgentBroadcast => "outbound:agent_broadcast",
            BusTopic::AgentDirect => "outbound:agent_direct",
            BusTopic::AgentPing => "outbound:agent_ping",
        }
    }
}

/// Events crossing the agent/peer boundary.
#[derive(Clone, Debug)]
pub enum BusEvent {
    /// A locally published broadcast, for opportunistic relay to peers.
    AgentBroadcast { from: Origin, message: Frame },
    /// A direct message addressed to a remote node.
    AgentDirect { from: Origin, message: Frame },
    /// An overlay ping requested by a local agent.
    AgentPing {
        from: Origin,
        dest_node_id: Uuid,
        msg: String,
        ttl: i64,
    },
}

impl BusEvent {
    pub fn topic(&self) -> BusTopic {
        match self {
            BusEvent::AgentBroadcast { .. } => BusTopic::AgentBroadcast,
            BusEvent::AgentDirect { .. } => BusTopic::AgentDirect,
            BusEvent::AgentPing { .. } => BusTopic::AgentPing,
        }
    }
}

// ============================================================================
// MessageBus
// ============================================================================

/// In-process event channel. Cheap to share behind an `Arc`.
pub struct MessageBus {
    subscribers: Mutex<HashMap<BusTopic, Vec<mpsc::UnboundedSender<BusEvent>>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register for a topic. The returned receiver must be drained by its
    /// owner; dropping it unsubscribes lazily on the next emit.
    pub fn subscribe(&self, topic: BusTopic) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(topic).or_default().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber of its topic, in
    /// registration order. Returns how many subscribers were reached.
    pub fn emit(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(senders) = subs.get_mut(&topic) else {
            trace!(topic = topic.as_str(), "emit with no subscribers");
            return 0;
        };

        let mut reached = 0;
        senders.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(_) => false,
        });
        trace!(topic = topic.as_str(), reached, "bus emit");
        reached
    }

    /// Subscriber count for a topic (diagnostics).
    pub fn subscriber_count(&self, topic: BusTopic) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map_or(0, Vec::len)
    }
}

// ============================================================================
// Tests
// ============================================================================
