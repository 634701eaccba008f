//! Shared harness for the integration tests: boots a real node on
//! loopback ports and drives it over real TCP sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use uuid::Uuid;

use pan_node::config::Config;
use pan_node::trust::TokenIssuer;
use pan_node::Node;

/// The all-zero identifier in canonical form.
pub const NULL: &str = "00000000-0000-0000-0000-000000000000";

/// How long to wait for an expected frame before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Node harness
// ============================================================================

pub struct TestOverlay {
    pub node: Node,
    /// Issuer listed in `trusted_agents.json` for `agent-connect`.
    pub agent_issuer: TokenIssuer,
    /// Issuer listed in `trusted_peers.json` for `peer-connect`.
    pub peer_issuer: TokenIssuer,
    pub dir: TempDir,
}

impl TestOverlay {
    /// A fresh agent token from the trusted issuer.
    pub fn agent_token(&self, name: &str) -> String {
        self.agent_issuer.mint_attest(name, &["agent-connect"], None)
    }

    /// A fresh peer token from the trusted issuer.
    pub fn peer_token(&self, name: &str) -> String {
        self.peer_issuer.mint_attest(name, &["peer-connect"], None)
    }
}

/// Boot a node on loopback with per-test trust files. The mutator tweaks
/// the config before startup (short timeouts, spam limits, ...).
pub async fn start_node_with(mutate: impl FnOnce(&mut Config)) -> TestOverlay {
    let dir = TempDir::new().expect("tempdir");
    let agent_issuer = TokenIssuer::generate("urn:test:agents");
    let peer_issuer = TokenIssuer::generate("urn:test:peers");

    let agents_file = dir.path().join("trusted_agents.json");
    let peers_file = dir.path().join("trusted_peers.json");
    write_issuers(&agents_file, &[("urn:test:agents", &["agent-connect"])]);
    write_issuers(&peers_file, &[("urn:test:peers", &["peer-connect"])]);

    let mut config = Config::default();
    config.node.persist_node_id_file = Some(dir.path().join("node_id.txt"));
    config.agents.bind = "127.0.0.1:0".parse().unwrap();
    config.peers.bind = "127.0.0.1:0".parse().unwrap();
    config.agents.trusted_issuers_file = agents_file;
    config.peers.trusted_issuers_file = peers_file;
    mutate(&mut config);

    let node = Node::start(config).await.expect("node start");
    TestOverlay {
        node,
        agent_issuer,
        peer_issuer,
        dir,
    }
}

pub async fn start_node() -> TestOverlay {
    start_node_with(|_| {}).await
}

pub fn write_issuers(path: &std::path::Path, issuers: &[(&str, &[&str])]) {
    let map: serde_json::Map<String, Value> = issuers
        .iter()
        .map(|(urn, purposes)| (urn.to_string(), json!(purposes)))
        .collect();
    std::fs::write(
        path,
        serde_json::to_string(&json!({ "trusted_issuers": map })).unwrap(),
    )
    .unwrap();
}

// ============================================================================
// Test client
// ============================================================================

/// A raw frame client speaking newline-delimited JSON.
pub struct TestClient {
    framed: Framed<TcpStream, LinesCodec>,
}

/// Session coordinates returned by `auth.ok`.
#[derive(Clone, Debug)]
pub struct Session {
    pub node_id: String,
    pub conn_id: String,
    pub auth_key: String,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(256 * 1024)),
        }
    }

    pub async fn send(&mut self, frame: &Value) {
        self.send_line(&frame.to_string()).await;
    }

    pub async fn send_line(&mut self, line: &str) {
        self.framed.send(line.to_string()).await.expect("send frame");
    }

    /// Send without asserting success, for tests where the server may
    /// have closed the socket already.
    pub async fn send_lossy(&mut self, frame: &Value) {
        let _ = self.framed.send(frame.to_string()).await;
    }

    /// Next frame, or a test failure after the receive timeout.
    pub async fn recv(&mut self) -> Value {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(line))) => serde_json::from_str(&line).expect("frame is JSON"),
            Ok(Some(Err(e))) => panic!("read error: {e}"),
            Ok(None) => panic!("connection closed while expecting a frame"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }

    /// Next frame, or `None` when the server closes the socket.
    pub async fn recv_or_eof(&mut self) -> Option<Value> {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(line))) => Some(serde_json::from_str(&line).expect("frame is JSON")),
            _ => None,
        }
    }

    /// Assert the server closes the socket (ignoring any frames that
    /// arrive first within `wait`).
    pub async fn expect_close(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.framed.next()).await {
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return,
                Err(_) => panic!("socket still open past the close deadline"),
            }
        }
    }

    /// Authenticate with a bearer token; returns the session coordinates.
    pub async fn authenticate(&mut self, token: &str) -> Session {
        self.send(&auth_frame(&json!({ "token": token }))).await;
        let reply = self.recv().await;
        assert_eq!(reply["msg_type"], "auth.ok", "unexpected reply: {reply}");
        Session {
            node_id: reply["payload"]["node_id"].as_str().unwrap().to_string(),
            conn_id: reply["payload"]["conn_id"].as_str().unwrap().to_string(),
            auth_key: reply["payload"]["auth_key"].as_str().unwrap().to_string(),
        }
    }

    /// Join a group and assert the ok reply.
    pub async fn join_group(&mut self, session: &Session, group: &str, msg_types: &[&str]) {
        self.send(&control_frame(
            session,
            "join_group",
            json!({ "group": group, "msg_types": msg_types }),
        ))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["msg_type"], "join_group_reply", "reply: {reply}");
        assert_eq!(reply["payload"]["status"], "ok", "reply: {reply}");
    }
}

// ============================================================================
// Frame builders
// ============================================================================

/// An unauthenticated `auth` control frame.
pub fn auth_frame(payload: &Value) -> Value {
    json!({
        "msg_id": Uuid::new_v4().to_string(),
        "type": "control",
        "from": { "node_id": NULL, "conn_id": NULL },
        "msg_type": "auth",
        "payload": payload,
        "ttl": 0,
    })
}

/// A control frame from an authenticated session.
pub fn control_frame(session: &Session, msg_type: &str, payload: Value) -> Value {
    json!({
        "msg_id": Uuid::new_v4().to_string(),
        "type": "control",
        "from": { "node_id": session.node_id, "conn_id": session.conn_id },
        "msg_type": msg_type,
        "payload": payload,
        "ttl": 0,
    })
}

/// A broadcast frame from an authenticated session.
pub fn broadcast_frame(session: &Session, group: &str, msg_type: &str, payload: Value) -> Value {
    json!({
        "msg_id": Uuid::new_v4().to_string(),
        "type": "broadcast",
        "from": { "node_id": session.node_id, "conn_id": session.conn_id },
        "msg_type": msg_type,
        "payload": payload,
        "ttl": 10,
        "group": group,
    })
}

/// A direct frame from an authenticated session.
pub fn direct_frame(
    session: &Session,
    to_node: &str,
    to_conn: &str,
    msg_type: &str,
    payload: Value,
) -> Value {
    json!({
        "msg_id": Uuid::new_v4().to_string(),
        "type": "direct",
        "from": { "node_id": session.node_id, "conn_id": session.conn_id },
        "msg_type": msg_type,
        "payload": payload,
        "ttl": 5,
        "to": { "node_id": to_node, "conn_id": to_conn },
    })
}
