//! # Node Identity
//!
//! Computes and owns the single stable `node_id` of the process.
//!
//! ## Identity Model
//!
//! A node is identified by a 128-bit UUID in canonical dashed form. The id
//! is resolved once at startup, in this order:
//!
//! 1. A valid UUID in the persist file, if one exists.
//! 2. Name-based derivation (UUIDv5 under the PAN namespace) from the
//!    configured `node_identifier`, so a node keeps its identity across
//!    hosts that share a configuration.
//! 3. A fresh random UUIDv4.
//!
//! Whatever wins is persisted (write-then-rename) so the next boot takes
//! path 1.
//!
//! ## Write Access
//!
//! Only the holder of the [`NodeIdSetter`] capability may replace the id
//! after initialization. The capability is handed out exactly once and is
//! consumed by use; no hidden global write path exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use uuid::Uuid;

/// Namespace for name-based (v5) node id derivation.
pub const PAN_NAMESPACE: Uuid = uuid::uuid!("219dd24f-63c4-5e35-b886-da1b21ecc0e0");

/// Default persist file, one line holding the 36-char UUID.
pub const DEFAULT_PERSIST_FILE: &str = "persisted_node_id.txt";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum IdentityError {
    /// The persist file exists but does not hold a UUID, and the
    /// `crash_on_corrupt` policy is in force.
    CorruptPersistFile { path: PathBuf, contents: String },
    /// Reading or writing the persist file failed.
    Io { path: PathBuf, source: io::Error },
    /// A candidate id was not a well-formed canonical UUID.
    MalformedId { value: String },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::CorruptPersistFile { path, contents } => write!(
                f,
                "persisted node id at {} is corrupt (found {:?})",
                path.display(),
                contents
            ),
            IdentityError::Io { path, source } => {
                write!(f, "node id persistence at {} failed: {}", path.display(), source)
            }
            IdentityError::MalformedId { value } => {
                write!(f, "{:?} is not a canonical UUID", value)
            }
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// Configuration
// ============================================================================

/// How the identity service resolves and guards the node id.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Where the id is persisted. `None` disables persistence entirely
    /// (the id then lives only for this process).
    pub persist_path: Option<PathBuf>,
    /// Optional stable textual identifier to derive the id from.
    pub node_identifier: Option<String>,
    /// Whether a corrupt persist file is fatal. When false (the default)
    /// a corrupt file is regenerated in place.
    pub crash_on_corrupt: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            persist_path: Some(PathBuf::from(DEFAULT_PERSIST_FILE)),
            node_identifier: None,
            crash_on_corrupt: false,
        }
    }
}

// ============================================================================
// IdentityService
// ============================================================================

struct IdentityInner {
    node_id: RwLock<Uuid>,
    persist_path: Option<PathBuf>,
    setter_taken: AtomicBool,
}

/// Process-wide node identity with explicit lifecycle.
///
/// Cheap to clone; all clones observe the same id.
#[derive(Clone)]
pub struct IdentityService {
    inner: Arc<IdentityInner>,
}

impl std::fmt::Debug for IdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityService")
            .field("node_id", &self.node_id())
            .finish()
    }
}

impl IdentityService {
    /// Resolve the node id per the configured policy and persist it.
    pub fn init(config: IdentityConfig) -> Result<Self, IdentityError> {
        let (node_id, needs_persist) = resolve_node_id(&config)?;

        let service = Self {
            inner: Arc::new(IdentityInner {
                node_id: RwLock::new(node_id),
                persist_path: config.persist_path.clone(),
                setter_taken: AtomicBool::new(false),
            }),
        };

        if needs_persist {
            if let Some(path) = &config.persist_path {
                persist_node_id(path, node_id)?;
            }
        }

        info!(node_id = %node_id, "node identity initialized");
        Ok(service)
    }

    /// The stable node id. Never changes except through the one-shot setter.
    pub fn node_id(&self) -> Uuid {
        *self
            .inner
            .node_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out the write capability. The first caller gets it; every
    /// later call returns `None`.
    pub fn take_setter(&self) -> Option<NodeIdSetter> {
        if self.inner.setter_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(NodeIdSetter {
            inner: self.inner.clone(),
        })
    }
}

/// One-shot capability to replace the node id.
///
/// Consumed by [`NodeIdSetter::set`]; there is no way to hold write access
/// past a single use.
pub struct NodeIdSetter {
    inner: Arc<IdentityInner>,
}

impl NodeIdSetter {
    /// Replace and persist the node id. Accepts only a well-formed
    /// canonical UUID.
    pub fn set(self, new_id: &str) -> Result<Uuid, IdentityError> {
        let parsed = parse_canonical_uuid(new_id).ok_or_else(|| IdentityError::MalformedId {
            value: new_id.to_string(),
        })?;

        if let Some(path) = &self.inner.persist_path {
            persist_node_id(path, parsed)?;
        }

        let mut guard = self
            .inner
            .node_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = *guard;
        *guard = parsed;
        info!(previous = %previous, node_id = %parsed, "node id replaced");
        Ok(parsed)
    }
}

// ============================================================================
// Resolution and persistence
// ============================================================================

fn parse_canonical_uuid(s: &str) -> Option<Uuid> {
    let s = s.trim();
    if s.len() != 36 {
        return None;
    }
    Uuid::try_parse(s).ok()
}

/// Returns the resolved id and whether it still needs to be written out.
fn resolve_node_id(config: &IdentityConfig) -> Result<(Uuid, bool), IdentityError> {
    if let Some(path) = &config.persist_path {
        match fs::read_to_string(path) {
            Ok(contents) => match parse_canonical_uuid(&contents) {
                Some(id) => return Ok((id, false)),
                None if config.crash_on_corrupt => {
                    return Err(IdentityError::CorruptPersistFile {
                        path: path.clone(),
                        contents: contents.trim().to_string(),
                    });
                }
                None => {
                    warn!(
                        path = %path.display(),
                        "persisted node id is corrupt, regenerating"
                    );
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(IdentityError::Io {
                    path: path.clone(),
                    source,
                });
            }
        }
    }

    let id = match &config.node_identifier {
        Some(identifier) => Uuid::new_v5(&PAN_NAMESPACE, identifier.as_bytes()),
        None => Uuid::new_v4(),
    };
    Ok((id, true))
}

/// Write-then-rename so a crash mid-write never leaves a torn file.
fn persist_node_id(path: &Path, id: Uuid) -> Result<(), IdentityError> {
    let tmp = path.with_extension("tmp");
    let write = fs::write(&tmp, format!("{}\n", id)).and_then(|_| fs::rename(&tmp, path));
    write.map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Tests
// ============================================================================
