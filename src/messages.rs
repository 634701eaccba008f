//! # Wire Protocol Frames
//!
//! This module defines the frame model shared by agent and peer transports.
//! Every frame is a single JSON object on the wire (one object per line);
//! this module owns the typed view, the control/error frame builders, and
//! the fast-path validators that gate every inbound frame.
//!
//! ## Frame Variants
//!
//! | `type` | Extra fields | Sent by |
//! |--------|--------------|---------|
//! | `direct` | `to {node_id, conn_id}` | agents, peers |
//! | `broadcast` | `group` | agents, peers |
//! | `control` | — | agents, server |
//! | `agent_control` | — | special agents |
//! | `peer_control` | — | peers |
//!
//! ## Validation
//!
//! Validators operate on the raw `serde_json::Value` so that a frame which
//! parses as JSON but has the wrong shape is reported as a schema error,
//! not a parse error. They return a plain `bool` and never panic on any
//! input.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Maximum size of a single frame on the wire, in bytes.
/// Anything larger is answered with a `bad_packet` control frame and dropped.
pub const MAX_FRAME_BYTES: usize = 61440;

/// Maximum `msg_type` length in characters.
pub const MAX_MSG_TYPE_LEN: usize = 64;

/// Length of a group identifier in canonical UUID form.
pub const GROUP_ID_LEN: usize = 36;

/// Length of the extended `"<node_id>:<uuid>"` group form used by
/// node-scoped (special-agent) broadcasts.
pub const EXTENDED_GROUP_ID_LEN: usize = 73;

/// Maximum ttl for peer and ordinary agent frames.
pub const MAX_TTL: i64 = 255;

/// Maximum ttl for special-agent (`agent_control`) frames.
pub const MAX_SPECIAL_AGENT_TTL: i64 = 1;

/// The all-zero identifier. The only acceptable `from.node_id` on an
/// unauthenticated frame.
pub const NULL_ID: Uuid = Uuid::nil();

// ============================================================================
// Frame model
// ============================================================================

/// Top-level frame category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Direct,
    Broadcast,
    Control,
    PeerControl,
    AgentControl,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Direct => "direct",
            FrameType::Broadcast => "broadcast",
            FrameType::Control => "control",
            FrameType::PeerControl => "peer_control",
            FrameType::AgentControl => "agent_control",
        }
    }
}

/// Sender or recipient coordinates: which node, which connection on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub node_id: String,
    pub conn_id: String,
}

impl Origin {
    pub fn new(node_id: Uuid, conn_id: Uuid) -> Self {
        Self {
            node_id: node_id.to_string(),
            conn_id: conn_id.to_string(),
        }
    }

    /// The unauthenticated sentinel origin.
    pub fn null() -> Self {
        Self::new(NULL_ID, NULL_ID)
    }
}

/// A single protocol frame.
///
/// `msg_id` may be left empty by builders; the sending side mints one
/// right before the frame hits the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub msg_id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub from: Origin,
    pub msg_type: String,
    pub payload: Value,
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_response_to: Option<String>,
}

impl Frame {
    /// Build a server-originated control frame.
    ///
    /// Control replies carry `in_response_to` referencing the frame that
    /// triggered them, when there is one.
    pub fn control(
        node_id: Uuid,
        msg_type: &str,
        payload: Value,
        in_response_to: Option<&str>,
    ) -> Self {
        Self {
            msg_id: String::new(),
            frame_type: FrameType::Control,
            from: Origin::new(node_id, NULL_ID),
            msg_type: msg_type.to_string(),
            payload,
            ttl: 0,
            to: None,
            group: None,
            in_response_to: in_response_to.map(str::to_string),
        }
    }

    /// Build a server-originated error frame (`msg_type: "error"`).
    pub fn error(
        node_id: Uuid,
        error_type: &str,
        detail: Value,
        in_response_to: Option<&str>,
    ) -> Self {
        let mut payload = json!({ "error_type": error_type });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), detail.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        Self::control(node_id, "error", payload, in_response_to)
    }

    /// Build a peer_control frame (handshakes and relay signalling).
    pub fn peer_control(node_id: Uuid, msg_type: &str, payload: Value) -> Self {
        Self {
            msg_id: String::new(),
            frame_type: FrameType::PeerControl,
            from: Origin::new(node_id, NULL_ID),
            msg_type: msg_type.to_string(),
            payload,
            ttl: 0,
            to: None,
            group: None,
            in_response_to: None,
        }
    }

    /// Mint a fresh `msg_id` if the builder left it empty.
    pub fn ensure_msg_id(&mut self) {
        if self.msg_id.is_empty() {
            self.msg_id = Uuid::new_v4().to_string();
        }
    }

    /// Typed view of an already-validated frame value.
    ///
    /// Returns `None` when the value does not deserialize; callers run a
    /// validator first, so `None` here means the validator and the model
    /// disagree and the frame is dropped.
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

// ============================================================================
// Validators
// ============================================================================

/// Checks a canonical 36-char dashed UUID string.
fn is_uuid_str(v: &Value) -> bool {
    match v.as_str() {
        Some(s) => s.len() == 36 && Uuid::try_parse(s).is_ok(),
        None => false,
    }
}

/// `msg_type` constraint: 1..=64 chars of `[A-Za-z0-9_.@]`.
pub fn is_valid_msg_type(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_MSG_TYPE_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'@')
}

/// Group identifiers are opaque; only length is validated.
fn is_valid_group(v: &Value, allow_extended: bool) -> bool {
    match v.as_str() {
        Some(s) => s.len() == GROUP_ID_LEN || (allow_extended && s.len() == EXTENDED_GROUP_ID_LEN),
        None => false,
    }
}

/// Invariant-shape check shared by every frame variant.
fn is_valid_base(frame: &Value, max_ttl: i64) -> bool {
    let Some(obj) = frame.as_object() else {
        return false;
    };

    if !obj.get("msg_id").is_some_and(is_uuid_str) {
        return false;
    }

    let Some(from) = obj.get("from").and_then(Value::as_object) else {
        return false;
    };
    if !from.get("node_id").is_some_and(is_uuid_str) {
        return false;
    }
    if !from.get("conn_id").is_some_and(|v| v.is_string()) {
        return false;
    }

    if !obj
        .get("msg_type")
        .and_then(Value::as_str)
        .is_some_and(is_valid_msg_type)
    {
        return false;
    }

    if !obj.get("payload").is_some_and(Value::is_object) {
        return false;
    }

    match obj.get("ttl").and_then(Value::as_i64) {
        Some(ttl) => (0..=max_ttl).contains(&ttl),
        None => false,
    }
}

/// Variant-specific checks layered over the base.
fn is_valid_variant(frame: &Value, frame_type: &str, allow_extended_group: bool) -> bool {
    let obj = match frame.as_object() {
        Some(o) => o,
        None => return false,
    };
    match frame_type {
        "direct" => match obj.get("to").and_then(Value::as_object) {
            Some(to) => {
                to.get("node_id").is_some_and(is_uuid_str)
                    && to.get("conn_id").is_some_and(|v| v.is_string())
            }
            None => false,
        },
        "broadcast" => obj
            .get("group")
            .is_some_and(|g| is_valid_group(g, allow_extended_group)),
        "control" | "agent_control" | "peer_control" => true,
        _ => false,
    }
}

fn frame_type_str(frame: &Value) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

/// Validates a frame received from an ordinary agent connection.
pub fn is_valid_agent_frame(frame: &Value) -> bool {
    let Some(ft) = frame_type_str(frame) else {
        return false;
    };
    matches!(ft, "direct" | "broadcast" | "control")
        && is_valid_base(frame, MAX_TTL)
        && is_valid_variant(frame, ft, false)
}

/// Validates a frame received from a special-agent connection.
///
/// Special agents use the tighter ttl bound and may address the extended
/// node-scoped group form.
pub fn is_valid_special_agent_frame(frame: &Value) -> bool {
    let Some(ft) = frame_type_str(frame) else {
        return false;
    };
    matches!(ft, "direct" | "broadcast" | "control" | "agent_control")
        && is_valid_base(frame, MAX_SPECIAL_AGENT_TTL)
        && is_valid_variant(frame, ft, true)
}

/// Validates a frame received from a peer connection.
pub fn is_valid_peer_frame(frame: &Value) -> bool {
    let Some(ft) = frame_type_str(frame) else {
        return false;
    };
    matches!(ft, "direct" | "broadcast" | "control" | "peer_control")
        && is_valid_base(frame, MAX_TTL)
        && is_valid_variant(frame, ft, true)
}

// ============================================================================
// Tests
// ============================================================================
