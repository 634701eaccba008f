//! # Group Subscriptions
//!
//! Two-level subscription index for broadcast fan-out:
//!
//! - forward: `group → msg_type → set of conn_ids` (who gets a broadcast)
//! - inverse: `conn_id → group → set of msg_types` (what to tear down on
//!   disconnect, in O(subscriptions))
//!
//! Both maps live behind one lock because their invariants are joint:
//! membership is symmetric, and empty inner maps and sets are pruned
//! eagerly so the index never accumulates tombstones.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

/// Maximum distinct msg_types one connection may hold in one group.
pub const MAX_MSG_TYPES_PER_GROUP: usize = 100;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// `join_group` requires a non-empty msg_type list.
    EmptyMsgTypes,
    /// Admitting the join would push the `(conn, group)` pair past the cap.
    /// The join is rejected whole; no partial additions are applied.
    MsgTypeCapExceeded { group: String, cap: usize },
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupError::EmptyMsgTypes => write!(f, "join requires at least one msg_type"),
            GroupError::MsgTypeCapExceeded { group, cap } => {
                write!(f, "group {} would exceed {} msg_types", group, cap)
            }
        }
    }
}

impl std::error::Error for GroupError {}

// ============================================================================
// GroupManager
// ============================================================================

#[derive(Default)]
struct GroupIndex {
    groups: HashMap<String, HashMap<String, HashSet<Uuid>>>,
    agent_subs: HashMap<Uuid, HashMap<String, HashSet<String>>>,
}

/// The subscription index. One lock covers both directions.
#[derive(Default)]
pub struct GroupManager {
    index: Mutex<GroupIndex>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to `msg_types` within a group.
    ///
    /// Idempotent per `(conn, group, msg_type)`. Rejects atomically when
    /// the distinct msg_type count for the pair would exceed the cap.
    pub fn join_group(
        &self,
        conn_id: Uuid,
        group_id: &str,
        msg_types: &[String],
    ) -> Result<(), GroupError> {
        if msg_types.is_empty() {
            return Err(GroupError::EmptyMsgTypes);
        }

        let mut index = self.lock();

        let existing = index
            .agent_subs
            .get(&conn_id)
            .and_then(|groups| groups.get(group_id));
        let mut resulting: HashSet<&str> = existing
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default();
        for msg_type in msg_types {
            resulting.insert(msg_type.as_str());
        }
        if resulting.len() > MAX_MSG_TYPES_PER_GROUP {
            return Err(GroupError::MsgTypeCapExceeded {
                group: group_id.to_string(),
                cap: MAX_MSG_TYPES_PER_GROUP,
            });
        }

        for msg_type in msg_types {
            index
                .groups
                .entry(group_id.to_string())
                .or_default()
                .entry(msg_type.clone())
                .or_default()
                .insert(conn_id);
            index
                .agent_subs
                .entry(conn_id)
                .or_default()
                .entry(group_id.to_string())
                .or_default()
                .insert(msg_type.clone());
        }

        debug!(
            conn = %conn_id,
            group = group_id,
            msg_types = msg_types.len(),
            "joined group"
        );
        Ok(())
    }

    /// Remove a connection from every msg_type it held in a group.
    /// Idempotent; unknown pairs are a no-op.
    pub fn leave_group(&self, conn_id: Uuid, group_id: &str) {
        let mut index = self.lock();
        Self::leave_group_locked(&mut index, conn_id, group_id);
        debug!(conn = %conn_id, group = group_id, "left group");
    }

    /// Local recipients for `(group, msg_type)`. Empty means none.
    pub fn get_recipients(&self, group_id: &str, msg_type: &str) -> HashSet<Uuid> {
        let index = self.lock();
        index
            .groups
            .get(group_id)
            .and_then(|types| types.get(msg_type))
            .cloned()
            .unwrap_or_default()
    }

    /// Tear down every subscription of a connection.
    ///
    /// The group list is snapshotted first: `leave_group` mutates the
    /// inverse map that names the groups being iterated.
    pub fn remove_from_all(&self, conn_id: Uuid) {
        let mut index = self.lock();
        let groups: Vec<String> = index
            .agent_subs
            .get(&conn_id)
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default();
        for group_id in &groups {
            Self::leave_group_locked(&mut index, conn_id, group_id);
        }
        if !groups.is_empty() {
            debug!(conn = %conn_id, groups = groups.len(), "removed from all groups");
        }
    }

    /// Distinct groups with at least one subscriber.
    pub fn group_count(&self) -> usize {
        self.lock().groups.len()
    }

    /// Total `(conn, group, msg_type)` subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.lock()
            .agent_subs
            .values()
            .flat_map(|groups| groups.values())
            .map(HashSet::len)
            .sum()
    }

    /// The msg_types a connection holds in a group (diagnostics, tests).
    pub fn subscriptions_of(&self, conn_id: Uuid, group_id: &str) -> HashSet<String> {
        self.lock()
            .agent_subs
            .get(&conn_id)
            .and_then(|groups| groups.get(group_id))
            .cloned()
            .unwrap_or_default()
    }

    fn leave_group_locked(index: &mut GroupIndex, conn_id: Uuid, group_id: &str) {
        let msg_types = match index.agent_subs.get_mut(&conn_id) {
            Some(groups) => match groups.remove(group_id) {
                Some(types) => {
                    if groups.is_empty() {
                        index.agent_subs.remove(&conn_id);
                    }
                    types
                }
                None => return,
            },
            None => return,
        };

        if let Some(types) = index.groups.get_mut(group_id) {
            for msg_type in msg_types {
                if let Some(conns) = types.get_mut(&msg_type) {
                    conns.remove(&conn_id);
                    if conns.is_empty() {
                        types.remove(&msg_type);
                    }
                }
            }
            if types.is_empty() {
                index.groups.remove(group_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupIndex> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn group(n: u8) -> String {
        Uuid::from_u128(n as u128).to_string()
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Membership symmetry: forward and inverse maps always agree.
    fn assert_symmetric(manager: &GroupManager, conn: Uuid, group_id: &str, msg_type: &str) {
        let forward = manager.get_recipients(group_id, msg_type).contains(&conn);
        let inverse = manager
            .subscriptions_of(conn, group_id)
            .contains(msg_type);
        assert_eq!(forward, inverse, "index out of sync for {}", msg_type);
    }

    #[test]
    fn join_and_lookup() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let g = group(1);

        manager.join_group(conn, &g, &types(&["chat", "status"])).unwrap();

        assert!(manager.get_recipients(&g, "chat").contains(&conn));
        assert!(manager.get_recipients(&g, "status").contains(&conn));
        assert!(manager.get_recipients(&g, "other").is_empty());
        assert_symmetric(&manager, conn, &g, "chat");
    }

    #[test]
    fn join_is_idempotent() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let g = group(1);

        manager.join_group(conn, &g, &types(&["chat"])).unwrap();
        manager.join_group(conn, &g, &types(&["chat"])).unwrap();

        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn empty_msg_types_rejected() {
        let manager = GroupManager::new();
        assert_eq!(
            manager.join_group(Uuid::new_v4(), &group(1), &[]),
            Err(GroupError::EmptyMsgTypes)
        );
    }

    #[test]
    fn cap_is_enforced_atomically() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let g = group(1);

        let first: Vec<String> = (0..MAX_MSG_TYPES_PER_GROUP)
            .map(|i| format!("t{}", i))
            .collect();
        manager.join_group(conn, &g, &first).unwrap();

        let err = manager
            .join_group(conn, &g, &types(&["overflow"]))
            .unwrap_err();
        assert!(matches!(err, GroupError::MsgTypeCapExceeded { .. }));

        // The rejected join applied nothing.
        assert_eq!(
            manager.subscriptions_of(conn, &g).len(),
            MAX_MSG_TYPES_PER_GROUP
        );
        assert!(manager.get_recipients(&g, "overflow").is_empty());

        // Re-joining existing types stays fine: distinct count is unchanged.
        manager.join_group(conn, &g, &types(&["t0", "t1"])).unwrap();
    }

    #[test]
    fn cap_counts_union_not_request_size() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let g = group(1);

        let almost: Vec<String> = (0..MAX_MSG_TYPES_PER_GROUP - 1)
            .map(|i| format!("t{}", i))
            .collect();
        manager.join_group(conn, &g, &almost).unwrap();

        // One existing plus one new: exactly at the cap, allowed.
        manager.join_group(conn, &g, &types(&["t0", "last"])).unwrap();
        assert_eq!(
            manager.subscriptions_of(conn, &g).len(),
            MAX_MSG_TYPES_PER_GROUP
        );
    }

    #[test]
    fn leave_group_prunes_empty_levels() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let g = group(1);

        manager.join_group(conn, &g, &types(&["chat"])).unwrap();
        manager.leave_group(conn, &g);

        assert!(manager.get_recipients(&g, "chat").is_empty());
        assert_eq!(manager.group_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
        assert_symmetric(&manager, conn, &g, "chat");
    }

    #[test]
    fn leave_group_keeps_other_subscribers() {
        let manager = GroupManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let g = group(1);

        manager.join_group(a, &g, &types(&["chat"])).unwrap();
        manager.join_group(b, &g, &types(&["chat"])).unwrap();
        manager.leave_group(a, &g);

        let recipients = manager.get_recipients(&g, "chat");
        assert!(!recipients.contains(&a));
        assert!(recipients.contains(&b));
    }

    #[test]
    fn leave_unknown_group_is_noop() {
        let manager = GroupManager::new();
        manager.leave_group(Uuid::new_v4(), &group(9));
        assert_eq!(manager.group_count(), 0);
    }

    #[test]
    fn remove_from_all_clears_every_trace() {
        let manager = GroupManager::new();
        let conn = Uuid::new_v4();
        let other = Uuid::new_v4();

        for n in 1..=3 {
            manager
                .join_group(conn, &group(n), &types(&["chat", "status"]))
                .unwrap();
        }
        manager.join_group(other, &group(1), &types(&["chat"])).unwrap();

        manager.remove_from_all(conn);

        for n in 1..=3 {
            assert!(!manager.get_recipients(&group(n), "chat").contains(&conn));
            assert!(manager.subscriptions_of(conn, &group(n)).is_empty());
        }
        // The bystander is untouched.
        assert!(manager.get_recipients(&group(1), "chat").contains(&other));
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn distinct_conns_share_a_group_independently() {
        let manager = GroupManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let g = group(1);

        manager.join_group(a, &g, &types(&["chat"])).unwrap();
        manager.join_group(b, &g, &types(&["presence"])).unwrap();

        assert_eq!(manager.get_recipients(&g, "chat").len(), 1);
        assert_eq!(manager.get_recipients(&g, "presence").len(), 1);
        assert_symmetric(&manager, a, &g, "chat");
        assert_symmetric(&manager, b, &g, "presence");
    }
}
