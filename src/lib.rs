//! # PAN Node
//!
//! A node of the PAN peer-to-peer messaging overlay. Each node terminates
//! two kinds of long-lived, newline-delimited JSON frame connections:
//! **agents** (end-user participants that publish and receive messages)
//! and **peers** (other overlay nodes relaying traffic for their own
//! agents). Traffic comes in three flavours: *direct* (unicast to one
//! `{node_id, conn_id}`), *broadcast* (publish to a `{group, msg_type}`
//! tuple), and *control* (group membership, ping, disconnect, auth).
//!
//! ## Architecture
//!
//! The composition root ([`Node`]) wires explicit capabilities together;
//! components hold references to exactly what they need and nothing keeps
//! module-level state. Shared indexes sit behind fine-grained locks; each
//! socket is driven by its own task with a writer task draining an
//! outbound queue.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `config` | Typed config file loading with env overrides |
//! | `identity` | Stable node id: derive, persist, one-shot setter |
//! | `bus` | In-process fan-out channel between agent and peer layers |
//! | `messages` | Frame model, builders, and per-variant validators |
//! | `spam` | Per-socket token-bucket rate limiting |
//! | `trust` | Token decoding and trust-chain evaluation |
//! | `auth` | Ordered, retrying, timed auth method dispatch |
//! | `connection` | Agent connection: send helpers, error log, socket swap |
//! | `registry` | Agent and peer registries (resume keys, issuer pinning) |
//! | `groups` | Two-level subscription index for broadcast fan-out |
//! | `router` | Frame dispatch and the control handlers |
//! | `agents` | Agent server: accept loop, state machine, sweeps |
//! | `peers` | Peer server: handshake, trust check, relay egress |
//! | `node` | Composition root and lifecycle |

pub mod agents;
pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod groups;
pub mod identity;
pub mod messages;
pub mod node;
pub mod peers;
pub mod registry;
pub mod router;
pub mod spam;
pub mod trust;

pub use config::Config;
pub use node::{Node, NodeStats};
