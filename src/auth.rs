//! # Authentication Manager
//!
//! Ordered, retrying, timed dispatch over pluggable auth methods.
//!
//! Each submitted request walks the configured method order. A method
//! attempt races a per-attempt timeout; a failure or a timeout consumes
//! one try and moves on to the next method in order (cycling), up to
//! exactly `max_tries` attempts. The request sits in a pending map keyed
//! by its request id for the duration; the entry is removed before the
//! result is handed back, and a completion whose entry has already been
//! removed is discarded. That presence check is the guard against late
//! resolutions of timed-out attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::trust::{TokenClaims, TrustValidator};

/// Purpose an agent token must be trusted for.
pub const AGENT_CONNECT_PURPOSE: &str = "agent-connect";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Method try-order, e.g. `["local"]`.
    pub order: Vec<String>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Total attempts permitted across the order.
    pub max_tries: u32,
    /// Accept any structurally valid token without a trust-chain check.
    pub allow_untrusted_agents: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            order: vec!["local".to_string()],
            timeout: Duration::from_millis(3000),
            max_tries: 3,
            allow_untrusted_agents: false,
        }
    }
}

// ============================================================================
// Payload and results
// ============================================================================

/// The `auth` control frame payload.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthPayload {
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub reconnect: Option<ResumeCredentials>,
}

impl AuthPayload {
    pub fn is_reconnect(&self) -> bool {
        self.auth_type.as_deref() == Some("reconnect")
    }
}

/// Resume credentials presented with `auth_type: "reconnect"`.
#[derive(Clone, Debug, Deserialize)]
pub struct ResumeCredentials {
    pub conn_id: String,
    pub auth_key: String,
}

/// Successful authentication.
#[derive(Clone, Debug)]
pub struct AuthGrant {
    /// Name of the method that granted access.
    pub method: &'static str,
    /// Display name adopted for the agent connection.
    pub agent_name: String,
    pub claims: TokenClaims,
}

/// Final authentication failure, after retries are exhausted.
#[derive(Clone, Debug)]
pub struct AuthRejection {
    pub message: String,
}

impl AuthRejection {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AuthRejection {}

// ============================================================================
// Auth methods
// ============================================================================

/// A pluggable authentication method.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// One attempt. The manager enforces the per-attempt timeout.
    async fn attempt(&self, payload: &AuthPayload) -> Result<AuthGrant, AuthRejection>;
}

/// Token validation against the agent trust validator.
pub struct LocalAuth {
    trust: Arc<TrustValidator>,
    allow_untrusted: bool,
}

impl LocalAuth {
    pub fn new(trust: Arc<TrustValidator>, allow_untrusted: bool) -> Self {
        Self {
            trust,
            allow_untrusted,
        }
    }
}

#[async_trait]
impl AuthMethod for LocalAuth {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn attempt(&self, payload: &AuthPayload) -> Result<AuthGrant, AuthRejection> {
        let token = payload
            .token
            .as_deref()
            .ok_or_else(|| AuthRejection::new("Authorization required"))?;

        let claims = self
            .trust
            .validate_token(token)
            .map_err(|e| AuthRejection::new(format!("access denied: {}", e)))?;

        if !self.allow_untrusted {
            let decision =
                self.trust
                    .is_token_trusted(token, &payload.tokens, &[AGENT_CONNECT_PURPOSE]);
            if !decision.trusted {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "access denied".to_string());
                return Err(AuthRejection::new(reason));
            }
        }

        let agent_name = claims
            .identifier
            .clone()
            .unwrap_or_else(|| claims.iss.clone());
        Ok(AuthGrant {
            method: self.name(),
            agent_name,
            claims,
        })
    }
}

// ============================================================================
// AuthManager
// ============================================================================

struct PendingRequest {
    started_at: Instant,
    tries: u32,
}

/// Dispatcher over the configured method order.
pub struct AuthManager {
    methods: Vec<Arc<dyn AuthMethod>>,
    config: AuthConfig,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl AuthManager {
    /// Resolve the configured method order against the known methods.
    ///
    /// Unknown names are skipped with a warning; an order that resolves to
    /// nothing is a startup error.
    pub fn new(config: AuthConfig, trust: Arc<TrustValidator>) -> anyhow::Result<Self> {
        let available: Vec<Arc<dyn AuthMethod>> = vec![Arc::new(LocalAuth::new(
            trust,
            config.allow_untrusted_agents,
        ))];

        let mut methods: Vec<Arc<dyn AuthMethod>> = Vec::new();
        for name in &config.order {
            match available.iter().find(|m| m.name() == name.as_str()) {
                Some(method) => methods.push(method.clone()),
                None => warn!(method = %name, "unknown auth method in order, skipping"),
            }
        }
        if methods.is_empty() {
            anyhow::bail!("auth method order {:?} resolves to no methods", config.order);
        }

        Ok(Self {
            methods,
            config,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Build a manager from explicit methods (used by unit tests).
    #[cfg(test)]
    fn with_methods(config: AuthConfig, methods: Vec<Arc<dyn AuthMethod>>) -> Self {
        Self {
            methods,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Run a request through the method order.
    pub async fn submit(&self, payload: AuthPayload) -> Result<AuthGrant, AuthRejection> {
        let request_id = Uuid::new_v4();
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.insert(
                request_id,
                PendingRequest {
                    started_at: Instant::now(),
                    tries: 0,
                },
            );
        }

        let mut last_rejection = AuthRejection::new("authentication failed");

        for attempt in 0..self.config.max_tries {
            if !self.count_try(request_id) {
                // The request was cancelled out of the pending map; any
                // in-flight method resolution is discarded.
                return Err(AuthRejection::new("authentication request cancelled"));
            }

            let method = &self.methods[attempt as usize % self.methods.len()];
            match tokio::time::timeout(self.config.timeout, method.attempt(&payload)).await {
                Ok(Ok(grant)) => {
                    if self.finish(request_id) {
                        debug!(
                            method = method.name(),
                            agent = %grant.agent_name,
                            tries = attempt + 1,
                            "authentication succeeded"
                        );
                        return Ok(grant);
                    }
                    return Err(AuthRejection::new("authentication request cancelled"));
                }
                Ok(Err(rejection)) => {
                    debug!(
                        method = method.name(),
                        attempt = attempt + 1,
                        reason = %rejection,
                        "auth attempt rejected"
                    );
                    last_rejection = rejection;
                }
                Err(_) => {
                    debug!(
                        method = method.name(),
                        attempt = attempt + 1,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "auth attempt timed out"
                    );
                    last_rejection = AuthRejection::new("authentication timed out");
                }
            }
        }

        self.finish(request_id);
        Err(last_rejection)
    }

    /// Requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Count one try against the request. False when the request is no
    /// longer pending.
    fn count_try(&self, request_id: Uuid) -> bool {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match pending.get_mut(&request_id) {
            Some(entry) => {
                entry.tries += 1;
                true
            }
            None => false,
        }
    }

    /// Remove the request from the pending map. The removal happens before
    /// the caller observes the result; a false return means some other
    /// path already completed or cancelled the request.
    fn finish(&self, request_id: Uuid) -> bool {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = pending.remove(&request_id) {
            debug!(
                request = %request_id,
                tries = entry.tries,
                elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                "auth request finished"
            );
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{TokenIssuer, DEFAULT_CACHE_TTL};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn trust_with(issuers: &[(&str, &[&str])]) -> (TempDir, Arc<TrustValidator>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trusted.json");
        let map: HashMap<&str, Vec<&str>> = issuers
            .iter()
            .map(|(urn, purposes)| (*urn, purposes.to_vec()))
            .collect();
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({ "trusted_issuers": map })).unwrap(),
        )
        .unwrap();
        let validator = TrustValidator::open("agent", path, DEFAULT_CACHE_TTL, true).unwrap();
        (dir, Arc::new(validator))
    }

    fn payload_with_token(token: String) -> AuthPayload {
        AuthPayload {
            auth_type: None,
            token: Some(token),
            tokens: Vec::new(),
            reconnect: None,
        }
    }

    #[tokio::test]
    async fn local_auth_accepts_trusted_token() {
        let (_dir, trust) = trust_with(&[("urn:alice", &["agent-connect"])]);
        let manager = AuthManager::new(AuthConfig::default(), trust).unwrap();

        let alice = TokenIssuer::generate("urn:alice");
        let token = alice.mint_attest("alice", &["agent-connect"], None);

        let grant = manager.submit(payload_with_token(token)).await.unwrap();
        assert_eq!(grant.method, "local");
        assert_eq!(grant.agent_name, "alice");
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn local_auth_rejects_unknown_issuer() {
        let (_dir, trust) = trust_with(&[("urn:alice", &["agent-connect"])]);
        let manager = AuthManager::new(AuthConfig::default(), trust).unwrap();

        let bob = TokenIssuer::generate("urn:bob");
        let token = bob.mint_attest("bob", &["agent-connect"], None);

        let rejection = manager.submit(payload_with_token(token)).await.unwrap_err();
        assert!(rejection.message.to_lowercase().contains("access denied"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn allow_untrusted_accepts_any_valid_token() {
        let (_dir, trust) = trust_with(&[]);
        let config = AuthConfig {
            allow_untrusted_agents: true,
            ..AuthConfig::default()
        };
        let manager = AuthManager::new(config, trust).unwrap();

        let bob = TokenIssuer::generate("urn:bob");
        let token = bob.mint_attest("bob", &["agent-connect"], None);

        let grant = manager.submit(payload_with_token(token)).await.unwrap();
        assert_eq!(grant.agent_name, "bob");
    }

    #[tokio::test]
    async fn allow_untrusted_falls_back_to_issuer_urn() {
        let (_dir, trust) = trust_with(&[]);
        let config = AuthConfig {
            allow_untrusted_agents: true,
            ..AuthConfig::default()
        };
        let manager = AuthManager::new(config, trust).unwrap();

        let issuer = TokenIssuer::generate("urn:carol");
        let token = issuer.mint_vouch("urn:whoever", &[]);

        let grant = manager.submit(payload_with_token(token)).await.unwrap();
        assert_eq!(grant.agent_name, "urn:carol");
    }

    #[tokio::test]
    async fn missing_token_is_authorization_required() {
        let (_dir, trust) = trust_with(&[]);
        let manager = AuthManager::new(AuthConfig::default(), trust).unwrap();

        let rejection = manager.submit(AuthPayload::default()).await.unwrap_err();
        assert!(rejection.message.contains("Authorization required"));
    }

    struct CountingMethod {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl AuthMethod for CountingMethod {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn attempt(&self, _payload: &AuthPayload) -> Result<AuthGrant, AuthRejection> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(AuthGrant {
                    method: "counting",
                    agent_name: "counted".to_string(),
                    claims: TokenClaims {
                        jti: Uuid::new_v4().to_string(),
                        iss: "urn:test".to_string(),
                        iss_key: String::new(),
                        kind: crate::trust::TokenKind::Attest,
                        sub: None,
                        purpose: vec![],
                        identifier: None,
                        exp: None,
                    },
                })
            } else {
                Err(AuthRejection::new("not yet"))
            }
        }
    }

    struct HangingMethod;

    #[async_trait]
    impl AuthMethod for HangingMethod {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn attempt(&self, _payload: &AuthPayload) -> Result<AuthGrant, AuthRejection> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(AuthRejection::new("unreachable"))
        }
    }

    #[tokio::test]
    async fn retries_until_max_tries() {
        let method = Arc::new(CountingMethod {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        });
        let config = AuthConfig {
            max_tries: 3,
            ..AuthConfig::default()
        };
        let manager = AuthManager::with_methods(config, vec![method.clone()]);

        let grant = manager.submit(AuthPayload::default()).await.unwrap();
        assert_eq!(grant.agent_name, "counted");
        assert_eq!(method.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exactly_max_tries_attempts_are_permitted() {
        let method = Arc::new(CountingMethod {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        });
        let config = AuthConfig {
            max_tries: 1,
            ..AuthConfig::default()
        };
        let manager = AuthManager::with_methods(config, vec![method.clone()]);

        assert!(manager.submit(AuthPayload::default()).await.is_err());
        assert_eq!(method.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_consumes_a_try_and_moves_on() {
        let config = AuthConfig {
            max_tries: 2,
            timeout: Duration::from_millis(50),
            ..AuthConfig::default()
        };
        let manager = AuthManager::with_methods(config, vec![Arc::new(HangingMethod)]);

        let rejection = manager.submit(AuthPayload::default()).await.unwrap_err();
        assert!(rejection.message.contains("timed out"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_method_names_are_skipped() {
        let (_dir, trust) = trust_with(&[]);
        let config = AuthConfig {
            order: vec!["nonsense".to_string(), "local".to_string()],
            ..AuthConfig::default()
        };
        let manager = AuthManager::new(config, trust).unwrap();
        assert!(manager.submit(AuthPayload::default()).await.is_err());
    }

    #[tokio::test]
    async fn empty_resolved_order_is_an_error() {
        let (_dir, trust) = trust_with(&[]);
        let config = AuthConfig {
            order: vec!["nonsense".to_string()],
            ..AuthConfig::default()
        };
        assert!(AuthManager::new(config, trust).is_err());
    }

    #[test]
    fn reconnect_payload_detection() {
        let payload: AuthPayload = serde_json::from_value(serde_json::json!({
            "auth_type": "reconnect",
            "token": "pan1.x.y",
            "reconnect": { "conn_id": "c", "auth_key": "k" }
        }))
        .unwrap();
        assert!(payload.is_reconnect());
        assert_eq!(payload.reconnect.unwrap().conn_id, "c");

        let plain: AuthPayload =
            serde_json::from_value(serde_json::json!({ "token": "pan1.x.y" })).unwrap();
        assert!(!plain.is_reconnect());
    }
}
