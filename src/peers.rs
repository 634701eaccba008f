//! # Peer Server
//!
//! Terminates connections from other overlay nodes.
//!
//! An incoming peer speaks exactly one handshake frame first:
//! `type=peer_control, msg_type=hello` with a bearer token in the payload.
//! The token must validate structurally and be trusted for `peer-connect`
//! (directly or through a vouch chain). A trusted peer is admitted into
//! the registry subject to the issuer-identity invariant: a `node_id`
//! already registered under a different issuer cannot be re-claimed.
//!
//! After the handshake, relayed `broadcast` and `direct` frames from the
//! peer are delivered to local agents. The reverse direction is the relay
//! egress task at the bottom of this module: it consumes the outbound bus
//! topics and forwards agent traffic to registered peers. Topology logic
//! (who relays what to whom beyond these mechanics) belongs to the peer
//! router, not to this module.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, BusTopic, MessageBus};
use crate::connection::SendError;
use crate::groups::GroupManager;
use crate::messages::{
    is_valid_peer_frame, Frame, FrameType, MAX_FRAME_BYTES, NULL_ID,
};
use crate::registry::{AgentRegistry, PeerRegistry};
use crate::trust::TrustValidator;

/// Purpose a peer token must be trusted for.
pub const PEER_CONNECT_PURPOSE: &str = "peer-connect";

/// Codec headroom, matching the agent server.
const FRAME_SLACK_BYTES: usize = 4096;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct PeerServerConfig {
    pub bind: SocketAddr,
    /// How long to wait for the single hello frame.
    pub handshake_timeout: Duration,
}

impl Default for PeerServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5874".parse().expect("default bind address"),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Capabilities the peer server needs.
#[derive(Clone)]
pub struct PeerContext {
    pub node_id: Uuid,
    pub peers: Arc<PeerRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub groups: Arc<GroupManager>,
    pub trust: Arc<TrustValidator>,
}

// ============================================================================
// PeerConnection
// ============================================================================

/// An admitted peer. Owned by the peer registry; the relay egress task
/// borrows it for forwarding.
pub struct PeerConnection {
    node_id: Uuid,
    /// Issuer URN that vouched for this peer (the identity invariant key).
    issuer: String,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("node_id", &self.node_id)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl PeerConnection {
    pub fn new(
        node_id: Uuid,
        issuer: String,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            issuer,
            outbound,
            cancel,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn send_frame(&self, mut frame: Frame) -> Result<(), SendError> {
        frame.ensure_msg_id();
        let line = serde_json::to_string(&frame).map_err(SendError::Serialize)?;
        self.outbound.send(line).map_err(|_| SendError::SocketClosed)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// PeerServer
// ============================================================================

pub struct PeerServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl PeerServer {
    pub async fn start(config: PeerServerConfig, ctx: PeerContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind peer server on {}", config.bind))?;
        let local_addr = listener.local_addr().context("peer listener local_addr")?;
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, config, ctx, shutdown.clone()));

        info!(addr = %local_addr, "peer server listening");
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: PeerServerConfig,
    ctx: PeerContext,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("peer accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    trace!(remote = %peer_addr, "peer socket accepted");
                    tokio::spawn(handle_peer_socket(
                        stream,
                        peer_addr,
                        config.clone(),
                        ctx.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "peer accept failed"),
            }
        }
    }
}

// ============================================================================
// Handshake and inbound relay
// ============================================================================

async fn handle_peer_socket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: PeerServerConfig,
    ctx: PeerContext,
    shutdown: CancellationToken,
) {
    let socket_cancel = shutdown.child_token();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_BYTES + FRAME_SLACK_BYTES),
    );
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(crate::agents::write_lines(
        write_half,
        out_rx,
        socket_cancel.clone(),
    ));

    // Exactly one handshake frame, within the handshake window.
    let hello = match tokio::time::timeout(config.handshake_timeout, reader.next()).await {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            debug!(remote = %peer_addr, error = %e, "peer handshake read error");
            socket_cancel.cancel();
            return;
        }
        Ok(None) => {
            debug!(remote = %peer_addr, "peer closed before handshake");
            socket_cancel.cancel();
            return;
        }
        Err(_) => {
            debug!(remote = %peer_addr, "peer handshake timed out");
            socket_cancel.cancel();
            return;
        }
    };

    let peer = match admit_peer(&hello, &ctx, &out_tx, &socket_cancel) {
        Some(peer) => peer,
        None => {
            reject(&ctx, &out_tx);
            socket_cancel.cancel();
            return;
        }
    };

    let mut reply = Frame::peer_control(
        ctx.node_id,
        "hello_ok",
        json!({ "node_id": ctx.node_id.to_string() }),
    );
    reply.ensure_msg_id();
    if let Ok(line) = serde_json::to_string(&reply) {
        let _ = out_tx.send(line);
    }
    info!(
        remote = %peer_addr,
        node = %peer.node_id(),
        issuer = %peer.issuer(),
        "peer admitted"
    );

    // Relayed traffic from the peer.
    loop {
        tokio::select! {
            _ = socket_cancel.cancelled() => break,
            next = reader.next() => match next {
                None => break,
                Some(Err(e)) => {
                    debug!(remote = %peer_addr, error = %e, "peer socket read error");
                    break;
                }
                Some(Ok(line)) => handle_peer_frame(&line, &peer, &ctx),
            }
        }
    }

    socket_cancel.cancel();
    ctx.peers.remove_if_current(&peer);
    debug!(node = %peer.node_id(), "peer disconnected");
}

/// Validate the hello frame and register the peer. `None` means reject.
fn admit_peer(
    line: &str,
    ctx: &PeerContext,
    out_tx: &mpsc::UnboundedSender<String>,
    socket_cancel: &CancellationToken,
) -> Option<Arc<PeerConnection>> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if !is_valid_peer_frame(&value) {
        debug!("peer handshake failed schema validation");
        return None;
    }
    let frame = Frame::from_value(value)?;
    if frame.frame_type != FrameType::PeerControl || frame.msg_type != "hello" {
        debug!(msg_type = %frame.msg_type, "peer handshake is not a hello");
        return None;
    }

    let token = frame.payload.get("token").and_then(serde_json::Value::as_str)?;
    let extra_tokens: Vec<String> = frame
        .payload
        .get("tokens")
        .and_then(serde_json::Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if let Err(e) = ctx.trust.validate_token(token) {
        debug!(error = %e, "peer token failed validation");
        return None;
    }
    let decision = ctx
        .trust
        .is_token_trusted(token, &extra_tokens, &[PEER_CONNECT_PURPOSE]);
    if !decision.trusted {
        debug!(
            reason = decision.reason.as_deref().unwrap_or("untrusted"),
            "peer token not trusted"
        );
        return None;
    }
    let issuer = decision.decoded.as_ref().map(|c| c.iss.clone())?;

    let remote_node = Uuid::try_parse(&frame.from.node_id).ok()?;
    if remote_node == NULL_ID || remote_node == ctx.node_id {
        debug!(node = %remote_node, "peer claimed an unusable node id");
        return None;
    }

    let peer = Arc::new(PeerConnection::new(
        remote_node,
        issuer,
        out_tx.clone(),
        socket_cancel.clone(),
    ));
    match ctx.peers.register(peer.clone()) {
        Ok(()) => Some(peer),
        Err(e) => {
            warn!(error = %e, "peer registration refused");
            None
        }
    }
}

fn reject(ctx: &PeerContext, out_tx: &mpsc::UnboundedSender<String>) {
    let mut frame = Frame::error(
        ctx.node_id,
        "auth.failed",
        json!({ "message": "access denied" }),
        None,
    );
    frame.ensure_msg_id();
    if let Ok(line) = serde_json::to_string(&frame) {
        let _ = out_tx.send(line);
    }
}

/// Deliver one relayed frame from an admitted peer to local agents.
fn handle_peer_frame(line: &str, peer: &Arc<PeerConnection>, ctx: &PeerContext) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        debug!(node = %peer.node_id(), "unparseable peer frame dropped");
        return;
    };
    if !is_valid_peer_frame(&value) {
        debug!(node = %peer.node_id(), "invalid peer frame dropped");
        return;
    }
    let Some(frame) = Frame::from_value(value) else {
        return;
    };

    match frame.frame_type {
        FrameType::Broadcast => {
            let Some(group) = frame.group.clone() else {
                return;
            };
            let recipients = ctx.groups.get_recipients(&group, &frame.msg_type);
            let mut delivered = 0usize;
            for recipient in recipients {
                if let Some(conn) = ctx.agents.get(recipient) {
                    if conn.send_frame(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
            trace!(
                node = %peer.node_id(),
                group = %group,
                delivered,
                "relayed broadcast delivered locally"
            );
        }
        FrameType::Direct => {
            let Some(to) = frame.to.clone() else {
                return;
            };
            if to.node_id != ctx.node_id.to_string() {
                trace!(node = %peer.node_id(), "relayed direct not for this node, dropped");
                return;
            }
            let target = Uuid::try_parse(&to.conn_id)
                .ok()
                .and_then(|id| ctx.agents.get(id));
            if let Some(conn) = target {
                let mut delivery = frame.clone();
                delivery.in_response_to = Some(frame.msg_id.clone());
                delivery.msg_id = String::new();
                let _ = conn.send_frame(delivery);
            }
        }
        FrameType::PeerControl if frame.msg_type == "ping_request" => {
            let dest = frame
                .payload
                .get("dest_node_id")
                .and_then(serde_json::Value::as_str);
            let reached = dest == Some(ctx.node_id.to_string().as_str());
            let _ = peer.send_frame(Frame::peer_control(
                ctx.node_id,
                "ping_response",
                json!({
                    "msg": frame.payload.get("msg").cloned().unwrap_or(serde_json::Value::Null),
                    "reached": reached,
                    "ttl": frame.payload.get("ttl").cloned().unwrap_or(serde_json::Value::Null),
                }),
            ));
        }
        _ => {
            trace!(
                node = %peer.node_id(),
                frame_type = frame.frame_type.as_str(),
                msg_type = %frame.msg_type,
                "unhandled peer frame dropped"
            );
        }
    }
}

// ============================================================================
// Relay egress (bus consumer)
// ============================================================================

/// Forward outbound agent traffic to registered peers.
///
/// Broadcasts flood to every peer; directs and pings prefer the peer that
/// owns the destination node and flood otherwise. Each hop decrements the
/// ttl; frames arriving at zero are not forwarded.
pub fn spawn_relay(
    bus: &MessageBus,
    peers: Arc<PeerRegistry>,
    node_id: Uuid,
    shutdown: CancellationToken,
) {
    let mut broadcast_rx = bus.subscribe(BusTopic::AgentBroadcast);
    let mut direct_rx = bus.subscribe(BusTopic::AgentDirect);
    let mut ping_rx = bus.subscribe(BusTopic::AgentPing);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = broadcast_rx.recv() => ev,
                ev = direct_rx.recv() => ev,
                ev = ping_rx.recv() => ev,
            };
            let Some(event) = event else { break };

            match event {
                BusEvent::AgentBroadcast { message, .. } => {
                    relay_flood(&peers, message);
                }
                BusEvent::AgentDirect { message, .. } => {
                    let dest = message
                        .to
                        .as_ref()
                        .and_then(|to| Uuid::try_parse(&to.node_id).ok());
                    match dest.and_then(|node| peers.get(node)) {
                        Some(peer) => relay_one(&peer, message),
                        None => relay_flood(&peers, message),
                    }
                }
                BusEvent::AgentPing {
                    from,
                    dest_node_id,
                    msg,
                    ttl,
                } => {
                    let mut frame = Frame::peer_control(
                        node_id,
                        "ping_request",
                        json!({
                            "dest_node_id": dest_node_id.to_string(),
                            "msg": msg,
                            "ttl": ttl,
                            "origin": { "node_id": from.node_id, "conn_id": from.conn_id },
                        }),
                    );
                    frame.ttl = ttl;
                    match peers.get(dest_node_id) {
                        Some(peer) => relay_one(&peer, frame),
                        None => relay_flood(&peers, frame),
                    }
                }
            }
        }
        debug!("peer relay egress stopped");
    });
}

fn relay_one(peer: &Arc<PeerConnection>, frame: Frame) {
    if let Some(frame) = decrement_ttl(frame) {
        if let Err(e) = peer.send_frame(frame) {
            debug!(node = %peer.node_id(), error = %e, "relay to peer failed");
        }
    }
}

fn relay_flood(peers: &Arc<PeerRegistry>, frame: Frame) {
    let Some(frame) = decrement_ttl(frame) else {
        return;
    };
    for peer in peers.snapshot() {
        if let Err(e) = peer.send_frame(frame.clone()) {
            debug!(node = %peer.node_id(), error = %e, "relay to peer failed");
        }
    }
}

fn decrement_ttl(mut frame: Frame) -> Option<Frame> {
    if frame.ttl <= 0 {
        trace!(msg_type = %frame.msg_type, "ttl exhausted, not relayed");
        return None;
    }
    frame.ttl -= 1;
    Some(frame)
}

// ============================================================================
// Tests
// ============================================================================
