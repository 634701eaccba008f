//! # Agent Router
//!
//! Dispatches validated, identity-rewritten agent frames:
//!
//! - `control` → the control handlers below
//! - `broadcast` → local fan-out through the group index, then a bus emit
//!   for the peer relay
//! - `direct` → local delivery when addressed to this node, a bus emit
//!   otherwise
//! - anything else → an error back to the sender
//!
//! By the time a frame reaches the router its `from` is authoritative;
//! handlers never consult the wire identity again.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, MessageBus};
use crate::connection::AgentConnection;
use crate::groups::{GroupManager, MAX_MSG_TYPES_PER_GROUP};
use crate::messages::{
    is_valid_msg_type, Frame, FrameType, EXTENDED_GROUP_ID_LEN, GROUP_ID_LEN, MAX_TTL,
};
use crate::registry::AgentRegistry;

/// Longest ping text relayed across the overlay.
const PING_MSG_MAX_LEN: usize = 64;

/// What the server loop should do after a frame was routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Continue,
    /// The agent asked to disconnect; the server cleans up and closes.
    Disconnect,
}

/// The capabilities the router needs, assembled by the composition root.
pub struct AgentRouter {
    node_id: Uuid,
    agents: Arc<AgentRegistry>,
    groups: Arc<GroupManager>,
    bus: Arc<MessageBus>,
}

impl AgentRouter {
    pub fn new(
        node_id: Uuid,
        agents: Arc<AgentRegistry>,
        groups: Arc<GroupManager>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            node_id,
            agents,
            groups,
            bus,
        }
    }

    /// Dispatch one frame from an authenticated agent.
    pub fn route(&self, conn: &Arc<AgentConnection>, frame: Frame) -> RouteOutcome {
        match frame.frame_type {
            FrameType::Control => self.handle_control(conn, frame),
            FrameType::Broadcast => {
                self.handle_broadcast(conn, frame);
                RouteOutcome::Continue
            }
            FrameType::Direct => {
                self.handle_direct(conn, frame);
                RouteOutcome::Continue
            }
            FrameType::PeerControl | FrameType::AgentControl => {
                let _ = conn.send_error(
                    "unsupported_type",
                    json!({ "type": frame.frame_type.as_str() }),
                    Some(&frame.msg_id),
                );
                RouteOutcome::Continue
            }
        }
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    fn handle_broadcast(&self, conn: &Arc<AgentConnection>, frame: Frame) {
        // The validator guarantees the group field on broadcast frames.
        let Some(group) = frame.group.clone() else {
            return;
        };

        let recipients = self.groups.get_recipients(&group, &frame.msg_type);
        let mut delivered = 0usize;
        for recipient in recipients {
            if recipient == conn.id() {
                continue;
            }
            match self.agents.get(recipient) {
                Some(target) => {
                    // Fan-out delivers the frame unchanged.
                    if target.send_frame(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                None => trace!(conn = %recipient, "recipient vanished during fan-out"),
            }
        }

        trace!(
            group = %group,
            msg_type = %frame.msg_type,
            delivered,
            "broadcast fanned out"
        );

        self.bus.emit(BusEvent::AgentBroadcast {
            from: frame.from.clone(),
            message: frame,
        });
    }

    // ------------------------------------------------------------------
    // Direct
    // ------------------------------------------------------------------

    fn handle_direct(&self, conn: &Arc<AgentConnection>, frame: Frame) {
        let Some(to) = frame.to.clone() else {
            return;
        };

        if to.node_id != self.node_id.to_string() {
            self.bus.emit(BusEvent::AgentDirect {
                from: frame.from.clone(),
                message: frame,
            });
            return;
        }

        let target_conn = Uuid::try_parse(&to.conn_id)
            .ok()
            .and_then(|id| self.agents.get(id));
        match target_conn {
            Some(target) => {
                // Local delivery rewrites the envelope: the recipient sees
                // the authoritative sender and the original msg_id in
                // in_response_to.
                let mut delivery = frame.clone();
                delivery.in_response_to = Some(frame.msg_id.clone());
                delivery.msg_id = String::new();
                if let Err(e) = target.send_frame(delivery) {
                    debug!(to = %to.conn_id, error = %e, "local direct delivery failed");
                }
            }
            None => {
                let _ = conn.send_error(
                    "target_not_found",
                    json!({ "node_id": to.node_id, "conn_id": to.conn_id }),
                    Some(&frame.msg_id),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Control handlers
    // ------------------------------------------------------------------

    fn handle_control(&self, conn: &Arc<AgentConnection>, frame: Frame) -> RouteOutcome {
        match frame.msg_type.as_str() {
            "join_group" => {
                self.handle_join_group(conn, &frame);
                RouteOutcome::Continue
            }
            "leave_group" => {
                self.handle_leave_group(conn, &frame);
                RouteOutcome::Continue
            }
            "ping_request" => {
                self.handle_ping_request(conn, &frame);
                RouteOutcome::Continue
            }
            "disconnect" => {
                debug!(conn = %conn.id(), "agent requested disconnect");
                RouteOutcome::Disconnect
            }
            other => {
                warn!(conn = %conn.id(), msg_type = other, "unknown control message");
                let _ = conn.send_error(
                    "unknown_control",
                    json!({ "msg_type": other }),
                    Some(&frame.msg_id),
                );
                RouteOutcome::Continue
            }
        }
    }

    fn handle_join_group(&self, conn: &Arc<AgentConnection>, frame: &Frame) {
        let group = frame.payload.get("group").and_then(Value::as_str);
        let msg_types = parse_msg_types(frame.payload.get("msg_types"));

        let (group, msg_types) = match (group.filter(|g| is_group_shaped(g)), msg_types) {
            (Some(g), Some(m)) if !m.is_empty() => (g, m),
            _ => {
                let _ = conn.send_control(
                    "join_group_reply",
                    json!({
                        "status": "failed",
                        "group": frame.payload.get("group").cloned().unwrap_or(Value::Null),
                        "error": "join_group requires a group id and a non-empty msg_types list",
                    }),
                    Some(&frame.msg_id),
                );
                return;
            }
        };

        let reply = match self.groups.join_group(conn.id(), group, &msg_types) {
            Ok(()) => json!({ "status": "ok", "group": group }),
            Err(e) => json!({
                "status": "failed",
                "group": group,
                "error": e.to_string(),
                "cap": MAX_MSG_TYPES_PER_GROUP,
            }),
        };
        let _ = conn.send_control("join_group_reply", reply, Some(&frame.msg_id));
    }

    fn handle_leave_group(&self, conn: &Arc<AgentConnection>, frame: &Frame) {
        let reply = match frame
            .payload
            .get("group")
            .and_then(Value::as_str)
            .filter(|g| is_group_shaped(g))
        {
            Some(group) => {
                self.groups.leave_group(conn.id(), group);
                json!({ "status": "ok", "group": group })
            }
            None => json!({
                "status": "failed",
                "group": frame.payload.get("group").cloned().unwrap_or(Value::Null),
                "error": "leave_group requires a group id",
            }),
        };
        let _ = conn.send_control("leave_group_reply", reply, Some(&frame.msg_id));
    }

    fn handle_ping_request(&self, conn: &Arc<AgentConnection>, frame: &Frame) {
        let dest = frame
            .payload
            .get("dest_node_id")
            .and_then(Value::as_str)
            .filter(|s| s.len() == 36)
            .and_then(|s| Uuid::try_parse(s).ok());
        let msg = frame
            .payload
            .get("msg")
            .and_then(Value::as_str)
            .filter(|m| m.len() <= PING_MSG_MAX_LEN);
        let ttl = frame
            .payload
            .get("ttl")
            .and_then(Value::as_i64)
            .filter(|t| (0..=MAX_TTL).contains(t));

        match (dest, msg, ttl) {
            (Some(dest_node_id), Some(msg), Some(ttl)) => {
                self.bus.emit(BusEvent::AgentPing {
                    from: frame.from.clone(),
                    dest_node_id,
                    msg: msg.to_string(),
                    ttl,
                });
            }
            _ => {
                let _ = conn.send_control(
                    "ping_response",
                    json!({
                        "msg": frame.payload.get("msg").cloned().unwrap_or(Value::Null),
                        "reached": false,
                        "ttl": frame.payload.get("ttl").cloned().unwrap_or(Value::Null),
                        "error": "ping_request requires dest_node_id, msg and ttl",
                    }),
                    Some(&frame.msg_id),
                );
            }
        }
    }
}

fn is_group_shaped(group: &str) -> bool {
    group.len() == GROUP_ID_LEN || group.len() == EXTENDED_GROUP_ID_LEN
}

fn parse_msg_types(value: Option<&Value>) -> Option<Vec<String>> {
    let list = value?.as_array()?;
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let s = entry.as_str()?;
        if !is_valid_msg_type(s) {
            return None;
        }
        out.push(s.to_string());
    }
    Some(out)
}

// ============================================================================
// Tests
// ============================================================================
