//! # Agent Connection
//!
//! The logical connection object behind an authenticated agent. It owns
//! the frame-sending helpers, the bad-message accounting, and the socket
//! binding that gets hot-swapped when a session resumes on a fresh socket.
//!
//! Writers never touch the socket directly: each socket has a writer task
//! draining an outbound queue, and the connection holds the queue's sender
//! plus the socket's cancellation token. `rebind` swaps that pair under a
//! lock, atomically with respect to concurrent senders.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::messages::Frame;

/// Sliding window for error accounting.
pub const ERROR_LOG_WINDOW_SECS: u64 = 60;

/// Bad messages tolerated inside the window before the socket is closed.
pub const ERROR_LOG_LIMIT: usize = 200;

// ============================================================================
// Socket binding
// ============================================================================

/// The writable side of one physical socket.
#[derive(Clone, Debug)]
pub struct SocketBinding {
    /// Serial of the socket this binding belongs to; used to tell whether
    /// a closing socket is still the connection's current one.
    pub serial: u64,
    /// Outbound line queue drained by the socket's writer task.
    pub sender: mpsc::UnboundedSender<String>,
    /// Cancelling this tears the socket's tasks down.
    pub cancel: CancellationToken,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum SendError {
    /// The writer task is gone; the socket is closed or closing.
    SocketClosed,
    /// The frame did not serialize (payloads are JSON values, so this
    /// indicates a bug upstream rather than bad input).
    Serialize(serde_json::Error),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::SocketClosed => write!(f, "socket is closed"),
            SendError::Serialize(e) => write!(f, "frame serialization failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// Outcome of recording one bad message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAccounting {
    Recorded,
    /// More than the tolerated number of bad messages inside the window;
    /// the caller sends a final error and closes the socket.
    Overflow,
}

// ============================================================================
// AgentConnection
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Agent,
    Peer,
}

/// An authenticated logical connection.
///
/// Created on successful auth, owned by the agent registry, borrowed by
/// the server loop and the router. Destroyed on explicit disconnect or
/// when the resume grace period lapses after an unexpected socket close.
pub struct AgentConnection {
    id: Uuid,
    kind: ConnectionKind,
    name: String,
    node_id: Uuid,
    binding: Mutex<SocketBinding>,
    error_log: Mutex<VecDeque<Instant>>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

impl AgentConnection {
    pub fn new(
        id: Uuid,
        kind: ConnectionKind,
        name: String,
        node_id: Uuid,
        binding: SocketBinding,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            node_id,
            binding: Mutex::new(binding),
            error_log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serial of the currently bound socket.
    pub fn current_socket_serial(&self) -> u64 {
        self.lock_binding().serial
    }

    /// Queue a frame on the current socket, minting `msg_id` if the
    /// builder left it empty.
    pub fn send_frame(&self, mut frame: Frame) -> Result<(), SendError> {
        frame.ensure_msg_id();
        let line = serde_json::to_string(&frame).map_err(SendError::Serialize)?;
        self.lock_binding()
            .sender
            .send(line)
            .map_err(|_| SendError::SocketClosed)
    }

    /// Send a control frame wrapped with `in_response_to` when the
    /// triggering message is known.
    pub fn send_control(
        &self,
        msg_type: &str,
        payload: serde_json::Value,
        in_response_to: Option<&str>,
    ) -> Result<(), SendError> {
        self.send_frame(Frame::control(self.node_id, msg_type, payload, in_response_to))
    }

    /// Send an error frame to the agent.
    pub fn send_error(
        &self,
        error_type: &str,
        detail: serde_json::Value,
        in_response_to: Option<&str>,
    ) -> Result<(), SendError> {
        self.send_frame(Frame::error(self.node_id, error_type, detail, in_response_to))
    }

    /// Record one bad message against the sliding window.
    pub fn record_error(&self, reason: &str) -> ErrorAccounting {
        self.record_error_at(reason, Instant::now())
    }

    fn record_error_at(&self, reason: &str, now: Instant) -> ErrorAccounting {
        let mut log = self
            .error_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        log.push_back(now);
        while let Some(front) = log.front() {
            if now.duration_since(*front).as_secs() >= ERROR_LOG_WINDOW_SECS {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() > ERROR_LOG_LIMIT {
            debug!(conn = %self.id, reason, errors = log.len(), "error log overflow");
            ErrorAccounting::Overflow
        } else {
            ErrorAccounting::Recorded
        }
    }

    /// Swap in a new socket binding (session resume). Returns the previous
    /// binding so the caller can cancel the stale socket's tasks.
    pub fn rebind(&self, new_binding: SocketBinding) -> SocketBinding {
        let mut guard = self.lock_binding();
        let old = guard.clone();
        *guard = new_binding;
        debug!(
            conn = %self.id,
            old_socket = old.serial,
            new_socket = guard.serial,
            "socket rebound"
        );
        old
    }

    /// Tear down the currently bound socket.
    pub fn close(&self) {
        self.lock_binding().cancel.cancel();
    }

    fn lock_binding(&self) -> std::sync::MutexGuard<'_, SocketBinding> {
        self.binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================
