//! The lock table.
//!
//! Locks associate a trunk node with a transaction. Writes take exclusive
//! or keyed shared locks implicitly; explicit `lock` requests may be
//! waitable, in which case a conflicting request parks as pending and is
//! promoted once the conflicts clear. Snapshot locks freeze a node version
//! for the locking transaction and neither block nor are blocked by write
//! locks.
//!
//! Conflicts are evaluated pairwise over acquired and pending locks on the
//! trunk node. A lock held by an ancestor transaction never conflicts with
//! its descendants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use arbor_types::{
    ArborError, ArborResult, ErrorCode, IdGenerator, LockId, NodeId, ObjectKind, Timestamp,
    TransactionId, lock_conflict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Snapshot,
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LockMode::Snapshot => "snapshot",
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        };
        f.write_str(text)
    }
}

/// Key carried by shared locks to narrow their footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LockKey {
    Child(String),
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub mode: LockMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<LockKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl LockRequest {
    pub fn exclusive() -> Self {
        LockRequest {
            mode: LockMode::Exclusive,
            key: None,
            timestamp: None,
        }
    }

    pub fn shared() -> Self {
        LockRequest {
            mode: LockMode::Shared,
            key: None,
            timestamp: None,
        }
    }

    pub fn shared_child(name: impl Into<String>) -> Self {
        LockRequest {
            mode: LockMode::Shared,
            key: Some(LockKey::Child(name.into())),
            timestamp: None,
        }
    }

    pub fn shared_attribute(name: impl Into<String>) -> Self {
        LockRequest {
            mode: LockMode::Shared,
            key: Some(LockKey::Attribute(name.into())),
            timestamp: None,
        }
    }

    pub fn snapshot(timestamp: Option<Timestamp>) -> Self {
        LockRequest {
            mode: LockMode::Snapshot,
            key: None,
            timestamp,
        }
    }

    fn validate(&self) -> ArborResult<()> {
        if self.key.is_some() && self.mode != LockMode::Shared {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("only shared locks may carry child or attribute keys, got {}", self.mode),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Pending,
    Acquired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub trunk_node_id: NodeId,
    pub transaction_id: TransactionId,
    pub mode: LockMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<LockKey>,
    pub state: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Whether two locks held by unrelated transactions collide.
fn modes_conflict(existing_mode: LockMode, existing_key: &Option<LockKey>, request: &LockRequest) -> bool {
    if request.mode == LockMode::Snapshot || existing_mode == LockMode::Snapshot {
        return false;
    }
    match (existing_mode, request.mode) {
        (_, LockMode::Exclusive) | (LockMode::Exclusive, _) => true,
        (LockMode::Shared, LockMode::Shared) => match (existing_key, &request.key) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => unreachable!("snapshot handled above"),
    }
}

/// The per-cell lock table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockManager {
    locks: BTreeMap<LockId, Lock>,
    by_node: BTreeMap<NodeId, Vec<LockId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: LockId) -> Option<&Lock> {
        self.locks.get(&id)
    }

    /// All locks on a node, creation order, any state.
    pub fn node_locks(&self, node: NodeId) -> Vec<&Lock> {
        self.by_node
            .get(&node)
            .map(|ids| ids.iter().filter_map(|id| self.locks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Lock count surfaced as the `lock_count` attribute.
    pub fn lock_count(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map_or(0, Vec::len)
    }

    /// The strongest acquired mode on a node, if any.
    pub fn node_lock_mode(&self, node: NodeId) -> Option<LockMode> {
        let mut strongest: Option<LockMode> = None;
        for lock in self.node_locks(node) {
            if lock.state != LockState::Acquired {
                continue;
            }
            strongest = Some(match (strongest, lock.mode) {
                (_, LockMode::Exclusive) | (Some(LockMode::Exclusive), _) => LockMode::Exclusive,
                (_, LockMode::Shared) | (Some(LockMode::Shared), _) => LockMode::Shared,
                _ => LockMode::Snapshot,
            });
        }
        strongest
    }

    /// Whether the transaction already holds an acquired lock subsuming the
    /// request.
    pub fn is_lock_redundant(
        &self,
        node: NodeId,
        transaction: TransactionId,
        request: &LockRequest,
    ) -> bool {
        self.node_locks(node).iter().any(|lock| {
            lock.transaction_id == transaction
                && lock.state == LockState::Acquired
                && match request.mode {
                    LockMode::Snapshot => lock.mode == LockMode::Snapshot,
                    LockMode::Exclusive => lock.mode == LockMode::Exclusive,
                    LockMode::Shared => {
                        lock.mode == LockMode::Exclusive
                            || (lock.mode == LockMode::Shared
                                && (lock.key.is_none() || lock.key == request.key))
                    }
                }
        })
    }

    fn find_conflict(
        &self,
        node: NodeId,
        transaction: TransactionId,
        request: &LockRequest,
        exclude: Option<LockId>,
        is_ancestor: &dyn Fn(TransactionId, TransactionId) -> bool,
    ) -> Option<&Lock> {
        self.by_node.get(&node)?.iter().find_map(|id| {
            let lock = self.locks.get(id)?;
            if Some(lock.id) == exclude
                || lock.transaction_id == transaction
                || is_ancestor(lock.transaction_id, transaction)
            {
                return None;
            }
            modes_conflict(lock.mode, &lock.key, request).then_some(lock)
        })
    }

    fn check_same_transaction_compatibility(
        &self,
        node: NodeId,
        transaction: TransactionId,
        request: &LockRequest,
    ) -> ArborResult<()> {
        for lock in self.node_locks(node) {
            if lock.transaction_id != transaction {
                continue;
            }
            let mixes_snapshot = (lock.mode == LockMode::Snapshot)
                != (request.mode == LockMode::Snapshot);
            if mixes_snapshot {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!(
                        "cannot take {} lock: transaction {} already holds a {} lock for this node",
                        request.mode, transaction, lock.mode
                    ),
                )
                .with_attr("node_id", node)
                .with_attr("transaction_id", transaction));
            }
        }
        Ok(())
    }

    /// Creates a lock, acquiring it immediately when no conflict exists.
    ///
    /// Conflicting waitable requests park as pending; non-waitable requests
    /// fail fast with `ConcurrentTransactionLockConflict`.
    pub fn acquire(
        &mut self,
        id_generator: &mut IdGenerator,
        node: NodeId,
        transaction: TransactionId,
        request: LockRequest,
        waitable: bool,
        is_ancestor: &dyn Fn(TransactionId, TransactionId) -> bool,
    ) -> ArborResult<(LockId, LockState)> {
        request.validate()?;
        self.check_same_transaction_compatibility(node, transaction, &request)?;

        if let Some(existing) = self.node_locks(node).iter().find(|lock| {
            lock.transaction_id == transaction
                && lock.mode == request.mode
                && lock.key == request.key
        }) {
            return Ok((existing.id, existing.state));
        }

        let state = match self.find_conflict(node, transaction, &request, None, is_ancestor) {
            None => LockState::Acquired,
            Some(holder) if waitable => {
                debug!(
                    node = %node,
                    transaction = %transaction,
                    holder = %holder.transaction_id,
                    mode = %request.mode,
                    "lock request parked as pending"
                );
                LockState::Pending
            }
            Some(holder) => {
                return Err(lock_conflict(
                    node,
                    holder.transaction_id,
                    &holder.mode.to_string(),
                ));
            }
        };

        let id = id_generator.generate(ObjectKind::Lock);
        let lock = Lock {
            id,
            trunk_node_id: node,
            transaction_id: transaction,
            mode: request.mode,
            key: request.key,
            state,
            timestamp: request.timestamp,
        };
        debug!(lock = %id, node = %node, transaction = %transaction, mode = %lock.mode, state = ?state, "lock created");
        self.locks.insert(id, lock);
        self.by_node.entry(node).or_default().push(id);
        Ok((id, state))
    }

    /// Drops every lock held by a transaction; returns the affected nodes.
    pub fn release_transaction_locks(&mut self, transaction: TransactionId) -> Vec<NodeId> {
        let mut affected = Vec::new();
        self.locks.retain(|_, lock| {
            if lock.transaction_id == transaction {
                affected.push(lock.trunk_node_id);
                false
            } else {
                true
            }
        });
        for node in &affected {
            if let Some(ids) = self.by_node.get_mut(node) {
                ids.retain(|id| self.locks.contains_key(id));
                if ids.is_empty() {
                    self.by_node.remove(node);
                }
            }
        }
        affected.dedup();
        affected
    }

    /// Reassigns a finished nested transaction's locks to its parent.
    /// Snapshot locks do not travel; equivalent parent locks absorb the rest.
    pub fn promote_locks_to_parent(
        &mut self,
        transaction: TransactionId,
        parent: TransactionId,
    ) -> Vec<NodeId> {
        let mut affected = Vec::new();
        let promoted: Vec<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.transaction_id == transaction)
            .map(|lock| lock.id)
            .collect();
        for id in promoted {
            let (node, mode, key, snapshot) = {
                let lock = &self.locks[&id];
                (
                    lock.trunk_node_id,
                    lock.mode,
                    lock.key.clone(),
                    lock.mode == LockMode::Snapshot,
                )
            };
            affected.push(node);
            let duplicate = snapshot
                || self.node_locks(node).iter().any(|other| {
                    other.id != id
                        && other.transaction_id == parent
                        && other.mode == mode
                        && other.key == key
                });
            if duplicate {
                self.locks.remove(&id);
                if let Some(ids) = self.by_node.get_mut(&node) {
                    ids.retain(|other| *other != id);
                }
            } else {
                self.locks.get_mut(&id).unwrap().transaction_id = parent;
            }
        }
        affected.dedup();
        affected
    }

    /// Releases snapshot locks taken by the transaction on the node.
    pub fn unlock_snapshot(&mut self, node: NodeId, transaction: TransactionId) -> bool {
        let mut removed = false;
        self.locks.retain(|_, lock| {
            let matches = lock.trunk_node_id == node
                && lock.transaction_id == transaction
                && lock.mode == LockMode::Snapshot;
            removed |= matches;
            !matches
        });
        if removed {
            if let Some(ids) = self.by_node.get_mut(&node) {
                ids.retain(|id| self.locks.contains_key(id));
                if ids.is_empty() {
                    self.by_node.remove(&node);
                }
            }
        }
        removed
    }

    /// Drops every lock on a node; used when the node itself is destroyed.
    pub fn remove_node_locks(&mut self, node: NodeId) {
        if let Some(ids) = self.by_node.remove(&node) {
            for id in ids {
                self.locks.remove(&id);
            }
        }
    }

    /// Promotes pending locks whose conflicts have cleared, in creation
    /// order. Returns the promoted lock ids.
    pub fn promote_pending(
        &mut self,
        is_ancestor: &dyn Fn(TransactionId, TransactionId) -> bool,
    ) -> Vec<LockId> {
        let pending: Vec<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.state == LockState::Pending)
            .map(|lock| lock.id)
            .collect();

        let mut promoted = Vec::new();
        for id in pending {
            let (node, transaction, request) = {
                let lock = &self.locks[&id];
                (
                    lock.trunk_node_id,
                    lock.transaction_id,
                    LockRequest {
                        mode: lock.mode,
                        key: lock.key.clone(),
                        timestamp: lock.timestamp,
                    },
                )
            };
            if self
                .find_conflict(node, transaction, &request, Some(id), is_ancestor)
                .is_none()
            {
                self.locks.get_mut(&id).unwrap().state = LockState::Acquired;
                debug!(lock = %id, node = %node, transaction = %transaction, "pending lock promoted");
                promoted.push(id);
            }
        }
        promoted
    }
}
