//! # Agent and Peer Registries
//!
//! Two small ownership maps:
//!
//! - [`AgentRegistry`] owns every authenticated agent connection, keyed by
//!   `conn_id`, together with the resume auth key issued at registration.
//!   The auth key is the sole resume capability; it appears on the wire
//!   only in the initial `auth.ok` and in a later reconnect.
//! - [`PeerRegistry`] owns one peer per remote `node_id` and pins the
//!   issuer identity that vouched for it. A `node_id` cannot be re-claimed
//!   under a different issuer while an entry exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::AgentConnection;
use crate::peers::PeerConnection;

// ============================================================================
// AgentRegistry
// ============================================================================

#[derive(Default)]
struct AgentMaps {
    conns: HashMap<Uuid, Arc<AgentConnection>>,
    auth_keys: HashMap<Uuid, Uuid>,
}

/// `conn_id → connection` plus resume keys. One lock for both maps; the
/// key must never outlive its connection entry.
#[derive(Default)]
pub struct AgentRegistry {
    maps: Mutex<AgentMaps>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly authenticated connection and issue its auth key.
    pub fn register(&self, conn: Arc<AgentConnection>) -> Uuid {
        let auth_key = Uuid::new_v4();
        let mut maps = self.lock();
        maps.auth_keys.insert(conn.id(), auth_key);
        maps.conns.insert(conn.id(), conn);
        auth_key
    }

    /// Resume a registered connection.
    ///
    /// Succeeds only while the connection is still registered and the
    /// presented key matches. The comparison is constant-time so the key
    /// cannot be felt out byte by byte.
    pub fn resume(&self, conn_id: Uuid, presented_key: &str) -> Option<Arc<AgentConnection>> {
        let presented = Uuid::try_parse(presented_key).ok()?;
        let maps = self.lock();
        let expected = maps.auth_keys.get(&conn_id)?;

        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            maps.conns.get(&conn_id).cloned()
        } else {
            warn!(conn = %conn_id, "resume attempted with wrong auth key");
            None
        }
    }

    pub fn get(&self, conn_id: Uuid) -> Option<Arc<AgentConnection>> {
        self.lock().conns.get(&conn_id).cloned()
    }

    /// The auth key issued for a connection, while it is registered.
    pub fn auth_key(&self, conn_id: Uuid) -> Option<Uuid> {
        self.lock().auth_keys.get(&conn_id).copied()
    }

    /// Drop a connection and its key.
    pub fn unregister(&self, conn_id: Uuid) -> Option<Arc<AgentConnection>> {
        let mut maps = self.lock();
        maps.auth_keys.remove(&conn_id);
        let removed = maps.conns.remove(&conn_id);
        if removed.is_some() {
            debug!(conn = %conn_id, "agent unregistered");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.lock().conns.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentMaps> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// PeerRegistry
// ============================================================================

#[derive(Debug)]
pub enum PeerRegistryError {
    /// The node_id is already claimed under a different issuer identity.
    IssuerMismatch {
        node_id: Uuid,
        existing_issuer: String,
    },
}

impl std::fmt::Display for PeerRegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRegistryError::IssuerMismatch {
                node_id,
                existing_issuer,
            } => write!(
                f,
                "node {} is already vouched for by {}",
                node_id, existing_issuer
            ),
        }
    }
}

impl std::error::Error for PeerRegistryError {}

/// `node_id → peer` with the issuer-identity invariant.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<Uuid, Arc<PeerConnection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a trust-validated peer.
    ///
    /// A reconnect for a known `node_id` is admitted only when its issuer
    /// matches the stored one; the previous connection is replaced.
    pub fn register(&self, peer: Arc<PeerConnection>) -> Result<(), PeerRegistryError> {
        let mut peers = self.lock();
        if let Some(existing) = peers.get(&peer.node_id()) {
            if existing.issuer() != peer.issuer() {
                warn!(
                    node = %peer.node_id(),
                    claimed_issuer = %peer.issuer(),
                    existing_issuer = %existing.issuer(),
                    "rejecting peer: node id claimed under a different issuer"
                );
                return Err(PeerRegistryError::IssuerMismatch {
                    node_id: peer.node_id(),
                    existing_issuer: existing.issuer().to_string(),
                });
            }
            existing.close();
        }
        debug!(node = %peer.node_id(), issuer = %peer.issuer(), "peer registered");
        peers.insert(peer.node_id(), peer);
        Ok(())
    }

    pub fn get(&self, node_id: Uuid) -> Option<Arc<PeerConnection>> {
        self.lock().get(&node_id).cloned()
    }

    /// Remove the entry for `node_id`, but only if it still points at the
    /// given connection. A replaced connection must not evict its
    /// successor on teardown.
    pub fn remove_if_current(&self, peer: &Arc<PeerConnection>) {
        let mut peers = self.lock();
        if let Some(existing) = peers.get(&peer.node_id()) {
            if Arc::ptr_eq(existing, peer) {
                peers.remove(&peer.node_id());
                debug!(node = %peer.node_id(), "peer removed");
            }
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// All registered peers, for relay fan-out.
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<PeerConnection>>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================
