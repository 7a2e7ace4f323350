//! Versioned node storage: trunk entities, branches, originator resolution.
//!
//! Trunk nodes form the committed tree. Every transaction that writes a node
//! first branches it: the branch clones the nearest originator (the closest
//! ancestor transaction's branch, or the trunk) and all further writes under
//! that transaction go to the branch. Reads resolve the nearest branch along
//! the transaction's ancestor chain.
//!
//! Nodes created inside a transaction exist as trunk entities immediately
//! but are only linked from their parent's branch, so no other transaction
//! can reach them until commit. The sweep pass destroys entities left
//! unreachable by an abort (created nodes) or a commit (removed subtrees).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use arbor_types::{
    ArborError, ArborResult, CellTag, ErrorCode, IdGenerator, NodeId, ObjectKind, TransactionId,
};

use super::acl::{Ace, Acd, Permission};
use super::locks::LockManager;
use super::node::{CypressNode, NodeBranch, NodeContent};

/// Options applied when cloning a subtree for copy/move.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub preserve_account: bool,
    pub preserve_expiration_time: bool,
    pub preserve_creation_time: bool,
    /// Account assigned when not preserving the source's.
    pub target_account: Option<String>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        CloneOptions {
            preserve_account: false,
            preserve_expiration_time: false,
            preserve_creation_time: false,
            target_account: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CypressTree {
    cell_tag: CellTag,
    root_id: NodeId,
    nodes: BTreeMap<NodeId, CypressNode>,
    branches: BTreeMap<NodeId, BTreeMap<TransactionId, NodeBranch>>,
    pub locks: LockManager,
}

impl CypressTree {
    pub fn new(id_generator: &mut IdGenerator, now: DateTime<Utc>) -> Self {
        let root_id = id_generator.generate(ObjectKind::MapNode);
        let mut root = CypressNode::new(
            root_id,
            None,
            NodeContent::Map {
                children: BTreeMap::new(),
            },
            now,
        );
        root.acd = Acd {
            inherit: true,
            entries: vec![Ace::allow(
                &[super::acl::EVERYONE],
                &[
                    Permission::Read,
                    Permission::Write,
                    Permission::Remove,
                    Permission::Create,
                    Permission::Use,
                ],
            )],
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id, root);
        CypressTree {
            cell_tag: id_generator.cell_tag(),
            root_id,
            nodes,
            branches: BTreeMap::new(),
            locks: LockManager::new(),
        }
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn trunk(&self, id: NodeId) -> ArborResult<&CypressNode> {
        self.nodes.get(&id).ok_or_else(|| {
            ArborError::new(ErrorCode::ResolveError, format!("no such node {id}"))
                .with_attr("node_id", id)
        })
    }

    pub fn trunk_mut(&mut self, id: NodeId) -> ArborResult<&mut CypressNode> {
        self.nodes.get_mut(&id).ok_or_else(|| {
            ArborError::new(ErrorCode::ResolveError, format!("no such node {id}"))
                .with_attr("node_id", id)
        })
    }

    pub fn branch_for(&self, id: NodeId, transaction: TransactionId) -> Option<&NodeBranch> {
        self.branches.get(&id)?.get(&transaction)
    }

    /// Resolves the node version visible to a transaction chain (deepest
    /// transaction first; empty chain reads the trunk).
    pub fn resolve(&self, id: NodeId, chain: &[TransactionId]) -> ArborResult<&CypressNode> {
        if let Some(branches) = self.branches.get(&id) {
            for transaction in chain {
                if let Some(branch) = branches.get(transaction) {
                    return Ok(&branch.node);
                }
            }
        }
        self.trunk(id)
    }

    /// Creates a branch of the node under the deepest transaction of the
    /// chain unless one already exists. Snapshot branches freeze the
    /// currently visible version.
    pub fn branch_node(
        &mut self,
        id: NodeId,
        chain: &[TransactionId],
        snapshot: bool,
    ) -> ArborResult<()> {
        let Some(&transaction) = chain.first() else {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "cannot branch a node outside a transaction",
            ));
        };
        if let Some(existing) = self.branch_for(id, transaction) {
            if existing.snapshot && !snapshot {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("node {id} is snapshot-locked by transaction {transaction}"),
                )
                .with_attr("node_id", id)
                .with_attr("transaction_id", transaction));
            }
            return Ok(());
        }
        let originator = self.resolve(id, &chain[1..])?.clone();
        debug!(node = %id, transaction = %transaction, snapshot, "node branched");
        self.branches
            .entry(id)
            .or_default()
            .insert(transaction, NodeBranch {
                node: originator,
                snapshot,
            });
        Ok(())
    }

    /// Mutable access to the version owned by the deepest transaction,
    /// branching lazily. Fails on snapshot branches.
    pub fn version_mut(
        &mut self,
        id: NodeId,
        chain: &[TransactionId],
    ) -> ArborResult<&mut CypressNode> {
        if chain.is_empty() {
            return self.trunk_mut(id);
        }
        self.branch_node(id, chain, false)?;
        let transaction = chain[0];
        Ok(&mut self
            .branches
            .get_mut(&id)
            .expect("branch just ensured")
            .get_mut(&transaction)
            .expect("branch just ensured")
            .node)
    }

    /// Registers a freshly created trunk entity.
    pub fn insert_node(&mut self, node: CypressNode) {
        let previous = self.nodes.insert(node.id, node);
        assert!(previous.is_none(), "node id collision");
    }

    /// Merges all branches of a finished transaction.
    ///
    /// Nested commit hands branches to the parent transaction; topmost
    /// commit folds them into the trunk. Snapshot branches never merge.
    pub fn commit_branches(
        &mut self,
        transaction: TransactionId,
        parent: Option<TransactionId>,
        now: DateTime<Utc>,
    ) {
        let node_ids: Vec<NodeId> = self
            .branches
            .iter()
            .filter(|(_, per_txn)| per_txn.contains_key(&transaction))
            .map(|(id, _)| *id)
            .collect();

        for id in node_ids {
            let per_txn = self.branches.get_mut(&id).expect("listed above");
            let branch = per_txn.remove(&transaction).expect("listed above");
            if branch.snapshot {
                if per_txn.is_empty() {
                    self.branches.remove(&id);
                }
                continue;
            }
            match parent {
                Some(parent) => {
                    per_txn.insert(parent, branch);
                }
                None => {
                    if per_txn.is_empty() {
                        self.branches.remove(&id);
                    }
                    if let Some(trunk) = self.nodes.get_mut(&id) {
                        let revision = trunk.revision.max(branch.node.revision) + 1;
                        let mut merged = branch.node;
                        merged.revision = revision;
                        merged.content_revision = revision;
                        merged.attributes_revision = revision;
                        merged.modification_time = now;
                        *trunk = merged;
                    }
                }
            }
        }
        debug!(transaction = %transaction, parent = ?parent, "branches merged");
    }

    /// Discards one transaction's branch of one node (explicit unlock).
    pub fn abort_branches_for_node(&mut self, id: NodeId, transaction: TransactionId) {
        if let Some(per_txn) = self.branches.get_mut(&id) {
            per_txn.remove(&transaction);
            if per_txn.is_empty() {
                self.branches.remove(&id);
            }
        }
    }

    /// Discards all branches of an aborted transaction.
    pub fn abort_branches(&mut self, transaction: TransactionId) {
        self.branches.retain(|_, per_txn| {
            per_txn.remove(&transaction);
            !per_txn.is_empty()
        });
    }

    /// Whether the node is linked from the root through trunk content.
    pub fn is_linked(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            let Some(node) = self.nodes.get(&current) else {
                return false;
            };
            let Some(parent_id) = node.parent_id else {
                return current == self.root_id;
            };
            let Some(parent) = self.nodes.get(&parent_id) else {
                return false;
            };
            if !parent.content.child_ids().contains(&current) {
                return false;
            }
            current = parent_id;
        }
    }

    /// Destroys candidate entities (and their trunk subtrees) that ended up
    /// unreachable after a commit or abort.
    pub fn sweep_unreachable(&mut self, candidates: &[NodeId]) {
        for &candidate in candidates {
            if !self.nodes.contains_key(&candidate) || self.is_linked(candidate) {
                continue;
            }
            let mut stack = vec![candidate];
            while let Some(id) = stack.pop() {
                if let Some(node) = self.nodes.remove(&id) {
                    stack.extend(node.content.child_ids());
                    self.branches.remove(&id);
                    self.locks.remove_node_locks(id);
                    debug!(node = %id, "unreachable node destroyed");
                }
            }
        }
    }

    /// Ids of the subtree rooted at `id`, as visible to the chain; the root
    /// of the subtree comes first.
    pub fn subtree_ids(&self, id: NodeId, chain: &[TransactionId]) -> ArborResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            result.push(current);
            let node = self.resolve(current, chain)?;
            stack.extend(node.content.child_ids());
        }
        Ok(result)
    }

    /// Finds the named child of a map node, `None` for absent names.
    pub fn find_child(&self, parent: &CypressNode, name: &str) -> Option<NodeId> {
        match &parent.content {
            NodeContent::Map { children } => children.get(name).copied(),
            NodeContent::List { children } => {
                let index: usize = name.parse().ok()?;
                children.get(index).copied()
            }
            _ => None,
        }
    }

    /// The key under which `child` hangs off `parent`, if any.
    pub fn key_of_child(&self, parent: &CypressNode, child: NodeId) -> Option<String> {
        match &parent.content {
            NodeContent::Map { children } => children
                .iter()
                .find(|(_, id)| **id == child)
                .map(|(key, _)| key.clone()),
            NodeContent::List { children } => children
                .iter()
                .position(|id| *id == child)
                .map(|index| index.to_string()),
            _ => None,
        }
    }

    /// Reconstructs an absolute path for diagnostics.
    pub fn node_path(&self, id: NodeId, chain: &[TransactionId]) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        while let Ok(node) = self.resolve(current, chain) {
            let Some(parent_id) = node.parent_id else {
                break;
            };
            let Ok(parent) = self.resolve(parent_id, chain) else {
                break;
            };
            match self.key_of_child(parent, current) {
                Some(key) => segments.push(key),
                None => break,
            }
            current = parent_id;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Clones the subtree visible to `chain` into fresh trunk entities.
    /// Returns the new subtree root; the caller links it and stages the new
    /// ids with the owning transaction.
    pub fn clone_subtree(
        &mut self,
        source_id: NodeId,
        chain: &[TransactionId],
        id_generator: &mut IdGenerator,
        options: &CloneOptions,
        now: DateTime<Utc>,
    ) -> ArborResult<NodeId> {
        let source = self.resolve(source_id, chain)?.clone();
        let cloned_content = match &source.content {
            NodeContent::Map { children } => {
                let mut cloned = BTreeMap::new();
                for (key, child) in children {
                    let child_clone = self.clone_subtree(*child, chain, id_generator, options, now)?;
                    cloned.insert(key.clone(), child_clone);
                }
                NodeContent::Map { children: cloned }
            }
            NodeContent::List { children } => {
                let mut cloned = Vec::with_capacity(children.len());
                for child in children {
                    cloned.push(self.clone_subtree(*child, chain, id_generator, options, now)?);
                }
                NodeContent::List { children: cloned }
            }
            other => other.clone(),
        };

        let id = id_generator.generate(cloned_content.kind());
        let mut node = CypressNode::new(id, None, cloned_content, now);
        node.acd = source.acd.clone();
        node.opaque = source.opaque;
        node.user_attributes = source.user_attributes.clone();
        node.inheritable = source.inheritable.clone();
        node.external_cell_tag = source.external_cell_tag;
        node.account = if options.preserve_account {
            source.account.clone()
        } else {
            options.target_account.clone().or(source.account.clone())
        };
        if options.preserve_expiration_time {
            node.expiration_time = source.expiration_time;
        }
        if options.preserve_creation_time {
            node.creation_time = source.creation_time;
        }

        // Fix up parent links of the cloned children.
        for child in node.content.child_ids() {
            if let Some(child_node) = self.nodes.get_mut(&child) {
                child_node.parent_id = Some(id);
            }
        }
        self.insert_node(node);
        Ok(id)
    }

    /// Whether `ancestor` lies on the trunk path from `descendant` to the
    /// root (through the chain's view of parents).
    pub fn is_ancestor(
        &self,
        ancestor: NodeId,
        descendant: NodeId,
        chain: &[TransactionId],
    ) -> bool {
        let mut current = descendant;
        loop {
            if current == ancestor {
                return true;
            }
            match self.resolve(current, chain).ok().and_then(|n| n.parent_id) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }
}
