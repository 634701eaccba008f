//! # Agent Server
//!
//! Accept loop and per-connection state machine for agent sockets.
//!
//! Every inbound line runs the same gauntlet, cheapest check first:
//!
//! 1. Spam guard — violators are told off and eventually closed.
//! 2. Size check — oversized frames earn a `bad_packet` and are dropped.
//! 3. JSON parse — unparseable input is a `message_failure` and a close.
//! 4. Schema validation — counted; too many bad messages closes the socket.
//! 5. Unauthenticated sockets may only send `auth`; everything else is
//!    refused. Authenticated sockets get their `from` verified against the
//!    session identity and rewritten to the authoritative value before the
//!    frame reaches the router.
//!
//! A maintenance sweep closes sockets that linger unauthenticated past the
//! connect timeout. An unexpected close of an authenticated socket starts
//! the resume grace window; a reconnect with the right `{conn_id,
//! auth_key}` rebinds the session, otherwise the timer tears it down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::auth::{AuthManager, AuthPayload};
use crate::connection::{
    AgentConnection, ConnectionKind, ErrorAccounting, SocketBinding,
};
use crate::groups::GroupManager;
use crate::messages::{is_valid_agent_frame, Frame, FrameType, Origin, MAX_FRAME_BYTES, NULL_ID};
use crate::registry::AgentRegistry;
use crate::router::{AgentRouter, RouteOutcome};
use crate::spam::{SpamConfig, SpamGuard, SpamVerdict};

/// Codec headroom past the frame cap, so an oversized-but-bounded frame is
/// still read whole and can be answered with `bad_packet` instead of a
/// hard framing error.
const FRAME_SLACK_BYTES: usize = 4096;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct AgentServerConfig {
    pub bind: SocketAddr,
    /// How long a socket may sit unauthenticated before the sweep closes it.
    pub connect_timeout: Duration,
    /// Resume window after an unexpected close of an authenticated socket.
    pub resume_grace: Duration,
    /// Maintenance sweep cadence.
    pub sweep_interval: Duration,
    /// Schema failures tolerated per session before the socket is closed.
    pub max_errors_before_disconnect: u32,
    /// Idle time after which the schema failure counter resets.
    pub error_reset_window: Duration,
    pub spam: SpamConfig,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5295".parse().expect("default bind address"),
            connect_timeout: Duration::from_secs(3),
            resume_grace: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(1),
            max_errors_before_disconnect: 10,
            error_reset_window: Duration::from_millis(300_000),
            spam: SpamConfig::default(),
        }
    }
}

/// Capabilities the agent server needs, assembled by the composition root.
#[derive(Clone)]
pub struct AgentContext {
    pub node_id: Uuid,
    pub registry: Arc<AgentRegistry>,
    pub groups: Arc<GroupManager>,
    pub auth: Arc<AuthManager>,
    pub router: Arc<AgentRouter>,
}

// ============================================================================
// Server state
// ============================================================================

struct PendingSocket {
    opened_at: Instant,
    cancel: CancellationToken,
}

struct ServerState {
    /// Sockets that have connected but not yet authenticated.
    pending: Mutex<HashMap<u64, PendingSocket>>,
    /// Resume grace timers, keyed by conn_id. Cancelling one means the
    /// session was resumed in time.
    cleanup_timers: Mutex<HashMap<Uuid, CancellationToken>>,
    socket_serial: AtomicU64,
}

impl ServerState {
    fn next_serial(&self) -> u64 {
        self.socket_serial.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingSocket>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.cleanup_timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// AgentServer
// ============================================================================

pub struct AgentServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl AgentServer {
    /// Bind the listener and spawn the accept loop and maintenance sweep.
    pub async fn start(config: AgentServerConfig, ctx: AgentContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind agent server on {}", config.bind))?;
        let local_addr = listener.local_addr().context("agent listener local_addr")?;

        let shutdown = CancellationToken::new();
        let state = Arc::new(ServerState {
            pending: Mutex::new(HashMap::new()),
            cleanup_timers: Mutex::new(HashMap::new()),
            socket_serial: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(
            listener,
            config.clone(),
            ctx.clone(),
            state.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(maintenance_sweep(config.clone(), state, shutdown.clone()));

        info!(addr = %local_addr, "agent server listening");
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down every socket task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: AgentServerConfig,
    ctx: AgentContext,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("agent accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    trace!(peer = %peer_addr, "agent socket accepted");
                    tokio::spawn(handle_socket(
                        stream,
                        peer_addr,
                        config.clone(),
                        ctx.clone(),
                        state.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "agent accept failed");
                }
            }
        }
    }
}

/// Closes sockets that opened but never authenticated in time.
async fn maintenance_sweep(
    config: AgentServerConfig,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    interval.tick().await; // skip the immediate tick
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let mut pending = state.lock_pending();
                let expired: Vec<u64> = pending
                    .iter()
                    .filter(|(_, p)| p.opened_at.elapsed() > config.connect_timeout)
                    .map(|(serial, _)| *serial)
                    .collect();
                for serial in expired {
                    if let Some(entry) = pending.remove(&serial) {
                        entry.cancel.cancel();
                        debug!(socket = serial, "closed unauthenticated socket past connect timeout");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Per-socket state machine
// ============================================================================

enum FrameDisposition {
    Continue,
    Close,
}

struct SocketSession {
    serial: u64,
    spam: SpamGuard,
    msg_errors: u32,
    last_error_at: Option<Instant>,
    conn: Option<Arc<AgentConnection>>,
    explicit_disconnect: bool,
}

async fn handle_socket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: AgentServerConfig,
    ctx: AgentContext,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    let serial = state.next_serial();
    let socket_cancel = shutdown.child_token();

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_BYTES + FRAME_SLACK_BYTES),
    );
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(write_lines(write_half, out_rx, socket_cancel.clone()));

    state.lock_pending().insert(
        serial,
        PendingSocket {
            opened_at: Instant::now(),
            cancel: socket_cancel.clone(),
        },
    );

    let mut session = SocketSession {
        serial,
        spam: SpamGuard::new(config.spam.clone()),
        msg_errors: 0,
        last_error_at: None,
        conn: None,
        explicit_disconnect: false,
    };

    loop {
        tokio::select! {
            _ = socket_cancel.cancelled() => break,
            next = reader.next() => match next {
                None => break,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = %peer_addr, "unframeable input, closing");
                    send_raw(&out_tx, Frame::control(ctx.node_id, "message_failure", json!({}), None));
                    break;
                }
                Some(Err(e)) => {
                    debug!(peer = %peer_addr, error = %e, "agent socket read error");
                    break;
                }
                Some(Ok(line)) => {
                    match process_line(&line, &mut session, &config, &ctx, &state, &out_tx, &socket_cancel).await {
                        FrameDisposition::Continue => {}
                        FrameDisposition::Close => break,
                    }
                }
            }
        }
    }

    // Teardown. The writer flushes queued frames on cancellation, so a
    // farewell control frame sent just before the break still goes out.
    state.lock_pending().remove(&serial);
    socket_cancel.cancel();

    if let Some(conn) = &session.conn {
        if session.explicit_disconnect {
            trace!(conn = %conn.id(), "socket closed after explicit disconnect");
        } else if conn.current_socket_serial() == serial {
            start_resume_grace(&config, &ctx, &state, conn.id());
        } else {
            trace!(conn = %conn.id(), "stale socket closed after resume");
        }
    }
}

async fn process_line(
    line: &str,
    session: &mut SocketSession,
    config: &AgentServerConfig,
    ctx: &AgentContext,
    state: &Arc<ServerState>,
    out_tx: &mpsc::UnboundedSender<String>,
    socket_cancel: &CancellationToken,
) -> FrameDisposition {
    // 1. Spam guard, before any parsing work.
    match session.spam.check() {
        SpamVerdict::Allowed => {}
        SpamVerdict::Violation { should_disconnect } => {
            send_raw(
                out_tx,
                Frame::control(
                    ctx.node_id,
                    "speed_limit_exceeded",
                    json!({
                        "limit": config.spam.message_limit,
                        "window": config.spam.window_seconds,
                    }),
                    None,
                ),
            );
            if should_disconnect {
                warn!(
                    violations = session.spam.violations(),
                    "spam threshold reached, closing socket"
                );
                return FrameDisposition::Close;
            }
            return FrameDisposition::Continue;
        }
    }

    // 2. Size gate.
    if line.len() > MAX_FRAME_BYTES {
        send_raw(
            out_tx,
            Frame::control(
                ctx.node_id,
                "bad_packet",
                json!({
                    "error": format!("frame of {} bytes exceeds the {} byte cap", line.len(), MAX_FRAME_BYTES),
                }),
                None,
            ),
        );
        return FrameDisposition::Continue;
    }

    // 3. Parse.
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "unparseable frame");
            send_raw(out_tx, Frame::control(ctx.node_id, "message_failure", json!({}), None));
            return FrameDisposition::Close;
        }
    };

    // 4. Schema.
    if !is_valid_agent_frame(&value) {
        return record_schema_error(session, config, ctx, out_tx, &value);
    }
    let Some(frame) = Frame::from_value(value) else {
        return FrameDisposition::Continue;
    };

    match session.conn.clone() {
        None => {
            handle_unauthenticated(frame, session, ctx, state, out_tx, socket_cancel).await
        }
        Some(conn) => handle_authenticated(frame, session, &conn, ctx, state),
    }
}

fn record_schema_error(
    session: &mut SocketSession,
    config: &AgentServerConfig,
    ctx: &AgentContext,
    out_tx: &mpsc::UnboundedSender<String>,
    value: &serde_json::Value,
) -> FrameDisposition {
    let now = Instant::now();
    if let Some(last) = session.last_error_at {
        if session.msg_errors > 0 && now.duration_since(last) > config.error_reset_window {
            session.msg_errors = 0;
        }
    }
    session.msg_errors += 1;
    session.last_error_at = Some(now);

    let in_response_to = value
        .get("msg_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    if session.msg_errors > config.max_errors_before_disconnect {
        send_raw(
            out_tx,
            Frame::control(
                ctx.node_id,
                "too_many_bad_messages",
                json!({ "errors": session.msg_errors }),
                in_response_to.as_deref(),
            ),
        );
        return FrameDisposition::Close;
    }

    // Connection-level accounting applies its own, wider window.
    if let Some(conn) = &session.conn {
        if conn.record_error("schema") == ErrorAccounting::Overflow {
            send_raw(
                out_tx,
                Frame::control(ctx.node_id, "too_many_bad_messages", json!({}), None),
            );
            return FrameDisposition::Close;
        }
    }

    send_raw(
        out_tx,
        Frame::control(ctx.node_id, "invalid_message", json!({}), in_response_to.as_deref()),
    );
    FrameDisposition::Continue
}

async fn handle_unauthenticated(
    frame: Frame,
    session: &mut SocketSession,
    ctx: &AgentContext,
    state: &Arc<ServerState>,
    out_tx: &mpsc::UnboundedSender<String>,
    socket_cancel: &CancellationToken,
) -> FrameDisposition {
    let is_auth_frame = frame.frame_type == FrameType::Control && frame.msg_type == "auth";
    let from_is_null = frame.from.node_id == NULL_ID.to_string();
    if !is_auth_frame || !from_is_null {
        return auth_failed(ctx, out_tx, "Authorization required", Some(&frame.msg_id));
    }

    let payload: AuthPayload = match serde_json::from_value(frame.payload.clone()) {
        Ok(p) => p,
        Err(_) => {
            return auth_failed(ctx, out_tx, "malformed auth payload", Some(&frame.msg_id));
        }
    };
    let wants_resume = payload.is_reconnect();
    let resume_creds = payload.reconnect.clone();

    let grant = match ctx.auth.submit(payload).await {
        Ok(grant) => grant,
        Err(rejection) => {
            return auth_failed(ctx, out_tx, &rejection.message, Some(&frame.msg_id));
        }
    };

    if wants_resume {
        let Some(creds) = resume_creds else {
            return auth_failed(ctx, out_tx, "Invalid resume credentials", Some(&frame.msg_id));
        };
        let Ok(conn_id) = Uuid::try_parse(&creds.conn_id) else {
            return auth_failed(ctx, out_tx, "Invalid resume credentials", Some(&frame.msg_id));
        };
        let Some(conn) = ctx.registry.resume(conn_id, &creds.auth_key) else {
            return auth_failed(ctx, out_tx, "Invalid resume credentials", Some(&frame.msg_id));
        };

        // Resume won: the pending cleanup no longer applies.
        if let Some(timer) = state.lock_timers().remove(&conn_id) {
            timer.cancel();
        }

        let old = conn.rebind(SocketBinding {
            serial: session.serial,
            sender: out_tx.clone(),
            cancel: socket_cancel.clone(),
        });
        if old.serial != session.serial {
            old.cancel.cancel();
        }

        state.lock_pending().remove(&session.serial);
        session.conn = Some(conn.clone());

        let auth_key = ctx
            .registry
            .auth_key(conn_id)
            .map(|k| k.to_string())
            .unwrap_or_default();
        let _ = conn.send_control(
            "auth.ok",
            json!({
                "node_id": ctx.node_id.to_string(),
                "conn_id": conn_id.to_string(),
                "auth_key": auth_key,
                "auth_type": "reconnect",
            }),
            Some(&frame.msg_id),
        );
        info!(conn = %conn_id, agent = conn.name(), "session resumed on new socket");
        return FrameDisposition::Continue;
    }

    let conn = Arc::new(AgentConnection::new(
        Uuid::new_v4(),
        ConnectionKind::Agent,
        grant.agent_name.clone(),
        ctx.node_id,
        SocketBinding {
            serial: session.serial,
            sender: out_tx.clone(),
            cancel: socket_cancel.clone(),
        },
    ));
    let auth_key = ctx.registry.register(conn.clone());

    state.lock_pending().remove(&session.serial);
    session.conn = Some(conn.clone());

    let _ = conn.send_control(
        "auth.ok",
        json!({
            "node_id": ctx.node_id.to_string(),
            "conn_id": conn.id().to_string(),
            "auth_key": auth_key.to_string(),
            "auth_type": grant.method,
        }),
        Some(&frame.msg_id),
    );
    info!(conn = %conn.id(), agent = %grant.agent_name, "agent authenticated");
    FrameDisposition::Continue
}

fn handle_authenticated(
    mut frame: Frame,
    session: &mut SocketSession,
    conn: &Arc<AgentConnection>,
    ctx: &AgentContext,
    state: &Arc<ServerState>,
) -> FrameDisposition {
    // Identity check: the wire identity must match the session exactly.
    // A mismatch is a protocol violation and closes without a reply.
    if frame.from.node_id != ctx.node_id.to_string()
        || frame.from.conn_id != conn.id().to_string()
    {
        warn!(
            conn = %conn.id(),
            claimed_node = %frame.from.node_id,
            claimed_conn = %frame.from.conn_id,
            "spoofed from identity, closing socket"
        );
        return FrameDisposition::Close;
    }

    // Rewrite to the authoritative identity; downstream handlers treat
    // `from` as trusted.
    frame.from = Origin::new(ctx.node_id, conn.id());

    match ctx.router.route(conn, frame) {
        RouteOutcome::Continue => FrameDisposition::Continue,
        RouteOutcome::Disconnect => {
            cleanup_session(ctx, state, conn.id());
            session.explicit_disconnect = true;
            FrameDisposition::Close
        }
    }
}

/// Unsubscribe everywhere and unregister; used for explicit disconnects
/// and expired grace timers.
fn cleanup_session(ctx: &AgentContext, state: &Arc<ServerState>, conn_id: Uuid) {
    if let Some(timer) = state.lock_timers().remove(&conn_id) {
        timer.cancel();
    }
    ctx.groups.remove_from_all(conn_id);
    ctx.registry.unregister(conn_id);
}

fn start_resume_grace(
    config: &AgentServerConfig,
    ctx: &AgentContext,
    state: &Arc<ServerState>,
    conn_id: Uuid,
) {
    let token = CancellationToken::new();
    {
        let mut timers = state.lock_timers();
        if timers.contains_key(&conn_id) {
            return;
        }
        timers.insert(conn_id, token.clone());
    }

    debug!(
        conn = %conn_id,
        grace_secs = config.resume_grace.as_secs(),
        "socket lost, starting resume grace window"
    );

    let grace = config.resume_grace;
    let ctx = ctx.clone();
    let state = state.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                trace!(conn = %conn_id, "resume grace cancelled by reconnect");
            }
            _ = tokio::time::sleep(grace) => {
                state.lock_timers().remove(&conn_id);
                ctx.groups.remove_from_all(conn_id);
                ctx.registry.unregister(conn_id);
                info!(conn = %conn_id, "resume grace expired, session cleaned up");
            }
        }
    });
}

// ============================================================================
// Socket plumbing
// ============================================================================

fn auth_failed(
    ctx: &AgentContext,
    out_tx: &mpsc::UnboundedSender<String>,
    message: &str,
    in_response_to: Option<&str>,
) -> FrameDisposition {
    send_raw(
        out_tx,
        Frame::control(
            ctx.node_id,
            "auth.failed",
            json!({ "message": message }),
            in_response_to,
        ),
    );
    FrameDisposition::Close
}

/// Queue a frame on a socket that has no connection object yet.
fn send_raw(out_tx: &mpsc::UnboundedSender<String>, mut frame: Frame) {
    frame.ensure_msg_id();
    match serde_json::to_string(&frame) {
        Ok(line) => {
            let _ = out_tx.send(line);
        }
        Err(e) => debug!(error = %e, "failed to encode outbound frame"),
    }
}

/// Drains the outbound queue onto the socket. On cancellation, frames
/// already queued are flushed before the task exits so farewell control
/// frames reach the agent.
pub(crate) async fn write_lines(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = writer.send(line).await {
                        debug!(error = %e, "agent socket write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(line) = rx.try_recv() {
                    if writer.send(line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
