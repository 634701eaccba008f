//! # Trust Validation
//!
//! Token decoding and trust-chain evaluation against a reloadable config
//! of trusted issuers.
//!
//! ## Token Model
//!
//! A token is `pan1.<claims>.<signature>` where both segments are
//! URL-safe base64 without padding. The claims segment is a JSON object
//! carrying the issuer URN, the issuer's Ed25519 public key, the token
//! kind (`attest` for identity tokens, `vouch` for chain links), the
//! purposes it grants, and an optional expiry. The signature is Ed25519
//! over the claims segment with a fixed domain prefix, keyed by the
//! embedded issuer key, so a token cannot be altered in transit.
//!
//! ## Chains
//!
//! A presented token is trusted when its issuer appears in the trusted
//! config with every required purpose, or when a chain of `vouch` tokens
//! (each vouching for the previous issuer) reaches such an issuer. Chains
//! are depth-bounded and each issuer is visited at most once.
//!
//! ## Issuer Config
//!
//! `trusted_issuers` maps issuer URN to permitted purposes. The file is
//! reloaded lazily when older than the cache TTL; a reload failure keeps
//! the previous config.
//!
//! One validator instance exists per trust domain (agent, peer) so the
//! two can carry disjoint policies.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lru::LruCache;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Wire prefix of the token format.
pub const TOKEN_PREFIX: &str = "pan1";

/// Domain separation prefix for token signatures.
/// Prevents cross-protocol signature reuse.
const TOKEN_SIGNATURE_DOMAIN: &[u8] = b"pan-token-v1:";

/// Maximum vouch links walked during chain evaluation.
pub const MAX_CHAIN_DEPTH: usize = 5;

/// Capacity of the decoded-token cache.
const DECODED_CACHE_CAPACITY: usize = 1024;

/// Default trusted-issuer config cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Milliseconds since the Unix epoch; used for expiry checks.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Claims
// ============================================================================

/// Token kind: `attest` identifies a subject, `vouch` links a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Attest,
    Vouch,
}

/// Decoded claims of a structurally valid token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub jti: String,
    pub iss: String,
    /// Hex-encoded Ed25519 public key of the issuer.
    pub iss_key: String,
    pub kind: TokenKind,
    /// For vouch tokens: the issuer URN being vouched for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default)]
    pub purpose: Vec<String>,
    /// Display identifier for the bearer (agent name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Expiry, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl TokenClaims {
    /// Short issuer-key fingerprint for logging.
    pub fn key_fingerprint(&self) -> String {
        match hex::decode(&self.iss_key) {
            Ok(bytes) => hex::encode(&blake3::hash(&bytes).as_bytes()[..8]),
            Err(_) => "<bad-key>".to_string(),
        }
    }

    pub fn grants_all(&self, purposes: &[&str]) -> bool {
        purposes.iter().all(|p| self.purpose.iter().any(|g| g == p))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed(&'static str),
    BadEncoding,
    BadClaims,
    BadKey,
    BadSignature,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Malformed(what) => write!(f, "malformed token: {}", what),
            TokenError::BadEncoding => write!(f, "token segments are not valid base64"),
            TokenError::BadClaims => write!(f, "token claims are not a valid claims object"),
            TokenError::BadKey => write!(f, "issuer key is not a valid Ed25519 public key"),
            TokenError::BadSignature => write!(f, "token signature verification failed"),
            TokenError::Expired => write!(f, "token is expired"),
        }
    }
}

impl std::error::Error for TokenError {}

// ============================================================================
// Trust decision
// ============================================================================

/// Result of a full chain evaluation.
#[derive(Clone, Debug)]
pub struct TrustDecision {
    pub trusted: bool,
    /// The trusted root issuer, when trusted.
    pub issuer: Option<String>,
    /// Claims of the presented token, when it decoded at all.
    pub decoded: Option<TokenClaims>,
    /// `jti`s of the vouch tokens walked, presented-token first.
    pub chain: Vec<String>,
    /// Purposes granted by the trusted root.
    pub purposes: Vec<String>,
    /// Failure reason, when not trusted.
    pub reason: Option<String>,
}

impl TrustDecision {
    fn denied(decoded: Option<TokenClaims>, reason: String) -> Self {
        Self {
            trusted: false,
            issuer: None,
            decoded,
            chain: Vec::new(),
            purposes: Vec::new(),
            reason: Some(reason),
        }
    }
}

// ============================================================================
// Issuer config
// ============================================================================

#[derive(Debug, Deserialize)]
struct TrustedIssuersFile {
    trusted_issuers: HashMap<String, Vec<String>>,
}

type IssuerMap = HashMap<String, HashSet<String>>;

fn load_issuer_file(path: &PathBuf) -> anyhow::Result<IssuerMap> {
    use anyhow::Context;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trusted issuers from {}", path.display()))?;
    let parsed: TrustedIssuersFile = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse trusted issuers in {}", path.display()))?;
    Ok(parsed
        .trusted_issuers
        .into_iter()
        .map(|(urn, purposes)| (urn, purposes.into_iter().collect()))
        .collect())
}

struct IssuerState {
    issuers: IssuerMap,
    loaded_at: Instant,
}

// ============================================================================
// TrustValidator
// ============================================================================

/// Per-domain trust validator ("agent" and "peer" get separate instances).
pub struct TrustValidator {
    domain: &'static str,
    config_path: PathBuf,
    cache_ttl: Duration,
    state: Mutex<IssuerState>,
    decoded_cache: Mutex<LruCache<String, TokenClaims>>,
}

impl TrustValidator {
    /// Load the issuer config and build a validator.
    ///
    /// With `required` set, a missing or unparseable config file is a
    /// startup error; otherwise the validator starts with an empty issuer
    /// set and picks the file up on a later reload.
    pub fn open(
        domain: &'static str,
        config_path: PathBuf,
        cache_ttl: Duration,
        required: bool,
    ) -> anyhow::Result<Self> {
        let issuers = match load_issuer_file(&config_path) {
            Ok(map) => map,
            Err(e) if required => return Err(e),
            Err(e) => {
                warn!(
                    domain,
                    path = %config_path.display(),
                    error = %e,
                    "trusted issuer config unavailable, starting empty"
                );
                IssuerMap::new()
            }
        };

        debug!(domain, issuers = issuers.len(), "trust validator ready");
        let cache_capacity =
            NonZeroUsize::new(DECODED_CACHE_CAPACITY).expect("cache capacity must be non-zero");
        Ok(Self {
            domain,
            config_path,
            cache_ttl,
            state: Mutex::new(IssuerState {
                issuers,
                loaded_at: Instant::now(),
            }),
            decoded_cache: Mutex::new(LruCache::new(cache_capacity)),
        })
    }

    /// Structural and cryptographic validation of a single token.
    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, TokenError> {
        {
            let mut cache = self
                .decoded_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(claims) = cache.get(token) {
                // Expiry is rechecked on every hit; the cache only skips
                // the signature work.
                return check_expiry(claims.clone());
            }
        }

        let claims = decode_and_verify(token)?;

        let mut cache = self
            .decoded_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(token.to_string(), claims.clone());
        check_expiry(claims)
    }

    /// Full chain evaluation of `token` against the trusted issuer config.
    ///
    /// `extra_tokens` supplies candidate vouch links. The decision is
    /// `trusted` only if the presented token's issuer, or an issuer
    /// reached through vouch links, is configured with every purpose in
    /// `required_purposes`.
    pub fn is_token_trusted(
        &self,
        token: &str,
        extra_tokens: &[String],
        required_purposes: &[&str],
    ) -> TrustDecision {
        let decoded = match self.validate_token(token) {
            Ok(claims) => claims,
            Err(e) => {
                return TrustDecision::denied(None, format!("access denied: {}", e));
            }
        };

        let issuers = self.issuers();

        let vouches: Vec<TokenClaims> = extra_tokens
            .iter()
            .filter_map(|t| self.validate_token(t).ok())
            .filter(|c| c.kind == TokenKind::Vouch)
            .collect();

        let mut chain = vec![decoded.jti.clone()];
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(decoded.iss.clone());
        let mut current_iss = decoded.iss.clone();

        for _ in 0..=MAX_CHAIN_DEPTH {
            if let Some(granted) = issuers.get(&current_iss) {
                if required_purposes.iter().all(|p| granted.contains(*p)) {
                    debug!(
                        domain = self.domain,
                        issuer = %current_iss,
                        links = chain.len(),
                        "token trusted"
                    );
                    return TrustDecision {
                        trusted: true,
                        issuer: Some(current_iss),
                        decoded: Some(decoded),
                        chain,
                        purposes: required_purposes.iter().map(|p| p.to_string()).collect(),
                        reason: None,
                    };
                }
            }

            // Walk one vouch link toward a trusted root.
            let next = vouches.iter().find(|v| {
                v.sub.as_deref() == Some(current_iss.as_str())
                    && v.grants_all(required_purposes)
                    && !visited.contains(&v.iss)
            });
            match next {
                Some(vouch) => {
                    chain.push(vouch.jti.clone());
                    visited.insert(vouch.iss.clone());
                    current_iss = vouch.iss.clone();
                }
                None => break,
            }
        }

        TrustDecision::denied(
            Some(decoded.clone()),
            format!(
                "access denied: issuer {} is not trusted for {:?}",
                decoded.iss, required_purposes
            ),
        )
    }

    /// Current issuer snapshot, reloading lazily when stale.
    /// A failed reload keeps the previous config.
    fn issuers(&self) -> IssuerMap {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.loaded_at.elapsed() >= self.cache_ttl {
            match load_issuer_file(&self.config_path) {
                Ok(fresh) => {
                    debug!(
                        domain = self.domain,
                        issuers = fresh.len(),
                        "trusted issuer config reloaded"
                    );
                    state.issuers = fresh;
                }
                Err(e) => {
                    warn!(
                        domain = self.domain,
                        error = %e,
                        "trusted issuer reload failed, keeping previous config"
                    );
                }
            }
            state.loaded_at = Instant::now();
        }

        state.issuers.clone()
    }
}

fn check_expiry(claims: TokenClaims) -> Result<TokenClaims, TokenError> {
    match claims.exp {
        Some(exp) if now_ms() > exp => Err(TokenError::Expired),
        _ => Ok(claims),
    }
}

fn decode_and_verify(token: &str) -> Result<TokenClaims, TokenError> {
    let mut segments = token.split('.');
    let (prefix, claims_b64, sig_b64) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(p), Some(c), Some(s), None) => (p, c, s),
        _ => return Err(TokenError::Malformed("expected three segments")),
    };
    if prefix != TOKEN_PREFIX {
        return Err(TokenError::Malformed("unknown token prefix"));
    }

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| TokenError::BadEncoding)?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::BadEncoding)?;

    let claims: TokenClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::BadClaims)?;

    let key_bytes: [u8; 32] = hex::decode(&claims.iss_key)
        .map_err(|_| TokenError::BadKey)?
        .try_into()
        .map_err(|_| TokenError::BadKey)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| TokenError::BadKey)?;

    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| TokenError::Malformed("signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_array);

    let mut message = TOKEN_SIGNATURE_DOMAIN.to_vec();
    message.extend_from_slice(claims_b64.as_bytes());
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| TokenError::BadSignature)?;

    Ok(claims)
}

// ============================================================================
// Token issuance
// ============================================================================

/// A signing identity that can mint tokens.
///
/// Deployments issue tokens out of band; this type backs the dev tooling
/// and the integration tests so the whole trust pipeline can be exercised
/// against real signatures.
pub struct TokenIssuer {
    signing_key: SigningKey,
    urn: String,
}

impl TokenIssuer {
    /// Generate a fresh issuer under the given URN.
    pub fn generate(urn: &str) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            urn: urn.to_string(),
        }
    }

    pub fn urn(&self) -> &str {
        &self.urn
    }

    /// Mint an attest token identifying `identifier` for the given purposes.
    pub fn mint_attest(&self, identifier: &str, purposes: &[&str], exp: Option<u64>) -> String {
        self.mint(TokenKind::Attest, None, Some(identifier), purposes, exp)
    }

    /// Mint a vouch token for another issuer's URN.
    pub fn mint_vouch(&self, subject_urn: &str, purposes: &[&str]) -> String {
        self.mint(TokenKind::Vouch, Some(subject_urn), None, purposes, None)
    }

    fn mint(
        &self,
        kind: TokenKind,
        sub: Option<&str>,
        identifier: Option<&str>,
        purposes: &[&str],
        exp: Option<u64>,
    ) -> String {
        let claims = TokenClaims {
            jti: Uuid::new_v4().to_string(),
            iss: self.urn.clone(),
            iss_key: hex::encode(self.signing_key.verifying_key().as_bytes()),
            kind,
            sub: sub.map(str::to_string),
            purpose: purposes.iter().map(|p| p.to_string()).collect(),
            identifier: identifier.map(str::to_string),
            exp,
        };

        let claims_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).expect("claims serialization cannot fail"),
        );

        let mut message = TOKEN_SIGNATURE_DOMAIN.to_vec();
        message.extend_from_slice(claims_b64.as_bytes());
        let signature = self.signing_key.sign(&message);
        let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        format!("{}.{}.{}", TOKEN_PREFIX, claims_b64, sig_b64)
    }
}

// ============================================================================
// Tests
// ============================================================================
