//! # Node Composition Root
//!
//! Assembles every subsystem into a running node and owns its lifecycle.
//! All process-wide state (identity, trust validators, registries, the
//! bus) is created here and handed to the components that need it; no
//! subsystem reaches for hidden globals.
//!
//! ## Startup order
//!
//! identity → trust validators → bus/registries/groups → auth → router →
//! relay egress → agent server → peer server. Shutdown walks the same
//! list in reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::agents::{AgentContext, AgentServer, AgentServerConfig};
use crate::auth::{AuthConfig, AuthManager};
use crate::bus::MessageBus;
use crate::config::Config;
use crate::groups::GroupManager;
use crate::identity::{IdentityConfig, IdentityService};
use crate::peers::{self, PeerContext, PeerServer, PeerServerConfig};
use crate::registry::{AgentRegistry, PeerRegistry};
use crate::router::AgentRouter;
use crate::trust::TrustValidator;

/// Point-in-time counters for telemetry logging.
#[derive(Clone, Copy, Debug)]
pub struct NodeStats {
    pub agents: usize,
    pub peers: usize,
    pub groups: usize,
    pub subscriptions: usize,
    pub pending_auth: usize,
}

/// A running PAN node.
pub struct Node {
    identity: IdentityService,
    bus: Arc<MessageBus>,
    agents: Arc<AgentRegistry>,
    peers: Arc<PeerRegistry>,
    groups: Arc<GroupManager>,
    auth: Arc<AuthManager>,
    agent_server: AgentServer,
    peer_server: PeerServer,
    relay_shutdown: CancellationToken,
}

impl Node {
    /// Bring up every subsystem and start listening.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let identity = IdentityService::init(IdentityConfig {
            persist_path: config.node.persist_node_id_file.clone(),
            node_identifier: config.node.node_identifier.clone(),
            crash_on_corrupt: config.node.crash_on_corrupt,
        })
        .context("node identity initialization failed")?;
        let node_id = identity.node_id();

        // One validator per trust domain. The peer config is mandatory:
        // a node that cannot tell peers apart must not join the overlay.
        let agent_trust = Arc::new(
            TrustValidator::open(
                "agent",
                config.agents.trusted_issuers_file.clone(),
                config.trust.cache_ttl(),
                false,
            )
            .context("agent trust validator")?,
        );
        let peer_trust = Arc::new(
            TrustValidator::open(
                "peer",
                config.peers.trusted_issuers_file.clone(),
                config.trust.cache_ttl(),
                true,
            )
            .context("peer trust validator")?,
        );

        let bus = Arc::new(MessageBus::new());
        let agents = Arc::new(AgentRegistry::new());
        let peers_registry = Arc::new(PeerRegistry::new());
        let groups = Arc::new(GroupManager::new());

        let auth = Arc::new(
            AuthManager::new(
                AuthConfig {
                    order: config.auth.order.clone(),
                    timeout: config.auth.timeout(),
                    max_tries: config.auth.max_tries,
                    allow_untrusted_agents: config.agents.allow_untrusted_agents,
                },
                agent_trust,
            )
            .context("auth manager")?,
        );

        let router = Arc::new(AgentRouter::new(
            node_id,
            agents.clone(),
            groups.clone(),
            bus.clone(),
        ));

        // The relay egress subscribes before the servers start so the
        // first agent emit already has its consumer.
        let relay_shutdown = CancellationToken::new();
        peers::spawn_relay(
            &bus,
            peers_registry.clone(),
            node_id,
            relay_shutdown.clone(),
        );

        let agent_server = AgentServer::start(
            AgentServerConfig {
                bind: config.agents.bind,
                connect_timeout: config.agents.connect_timeout(),
                resume_grace: config.agents.resume_grace(),
                sweep_interval: Duration::from_secs(1),
                max_errors_before_disconnect: config.agents.max_errors_before_disconnect,
                error_reset_window: config.agents.error_reset_window(),
                spam: config.spam.clone(),
            },
            AgentContext {
                node_id,
                registry: agents.clone(),
                groups: groups.clone(),
                auth: auth.clone(),
                router,
            },
        )
        .await
        .context("agent server")?;

        let peer_server = PeerServer::start(
            PeerServerConfig {
                bind: config.peers.bind,
                handshake_timeout: config.peers.handshake_timeout(),
            },
            PeerContext {
                node_id,
                peers: peers_registry.clone(),
                agents: agents.clone(),
                groups: groups.clone(),
                trust: peer_trust,
            },
        )
        .await
        .context("peer server")?;

        info!(
            node_id = %node_id,
            agents = %agent_server.local_addr(),
            peers = %peer_server.local_addr(),
            "node started"
        );

        Ok(Self {
            identity,
            bus,
            agents,
            peers: peers_registry,
            groups,
            auth,
            agent_server,
            peer_server,
            relay_shutdown,
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.identity.node_id()
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    /// The internal bus; extension subsystems subscribe here.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_server.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_server.local_addr()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            agents: self.agents.count(),
            peers: self.peers.count(),
            groups: self.groups.group_count(),
            subscriptions: self.groups.subscription_count(),
            pending_auth: self.auth.pending_count(),
        }
    }

    /// Graceful shutdown: stop accepting, then tear subsystems down in
    /// reverse dependency order.
    pub fn shutdown(&self) {
        info!(node_id = %self.node_id(), "node shutting down");
        self.peer_server.shutdown();
        self.agent_server.shutdown();
        self.relay_shutdown.cancel();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
