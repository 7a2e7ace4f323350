//! The path-addressed verb surface.
//!
//! Implements `get`, `set`, `remove`, `list`, `create`, `copy`, `move`,
//! `link`, `exists`, `lock`, and `unlock` on [`Master`], under an optional
//! transaction context with ACL enforcement and implicit locking. Request
//! and response shapes are JSON value trees.
//!
//! Link handling: read verbs follow links transitively (bounded by the
//! configured depth); write verbs resolve intermediate links but act on the
//! final link node itself. A `&` suffix suppresses redirection explicitly.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use arbor_types::{
    ArborError, ArborResult, CellTag, ErrorCode, LockId, NodeId, ObjectKind, Timestamp,
    TransactionId, already_exists, authorization_error, resolve_error,
};

use crate::master::Master;

use super::acl::{CheckScope, Permission};
use super::attributes::{self, AttributeContext};
use super::locks::{LockRequest, LockState};
use super::node::{CypressNode, InheritableAttributes, NodeContent};
use super::path::{ParsedPath, parse_path};
use super::tree::CloneOptions;

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// When set, the listed attributes of the target node are returned
    /// under `attributes` alongside the `value` subtree.
    pub attribute_filter: Option<Vec<String>>,
    pub max_size: Option<usize>,
    pub suppress_tracking: bool,
}

/// Options for `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub attributes: BTreeMap<String, Value>,
    pub recursive: bool,
    pub ignore_existing: bool,
    pub force: bool,
}

/// Options for `copy` and `move`.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub preserve_account: bool,
    pub preserve_expiration_time: bool,
    pub preserve_creation_time: bool,
    pub recursive: bool,
    pub ignore_existing: bool,
    pub force: bool,
    /// Pessimistic quota validation hook; bookkeeping only.
    pub pessimistic_quota_check: bool,
}

/// Options for `lock`.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub request: LockRequest,
    pub waitable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResult {
    pub node_id: NodeId,
    pub cell_tag: CellTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockResult {
    pub lock_id: LockId,
    pub node_id: NodeId,
    pub cell_tag: CellTag,
    pub state: LockState,
}

/// A fully resolved path target.
struct Resolved {
    node_id: NodeId,
    attribute: Option<String>,
    /// Path remainder inside a document node's embedded value.
    document_path: Vec<String>,
}

impl Master {
    fn resolve_target(
        &self,
        path: &str,
        chain: &[TransactionId],
        follow_final_link: bool,
    ) -> ArborResult<Resolved> {
        let parsed = parse_path(path)?;
        self.resolve_parsed(path, &parsed, chain, follow_final_link, 0)
    }

    fn resolve_parsed(
        &self,
        original_path: &str,
        parsed: &ParsedPath,
        chain: &[TransactionId],
        follow_final_link: bool,
        link_depth: u32,
    ) -> ArborResult<Resolved> {
        let mut current = self.cypress.root_id();
        let segments = &parsed.segments;
        for (index, segment) in segments.iter().enumerate() {
            let node = self.cypress.resolve(current, chain)?;

            // Document nodes swallow the remaining path.
            if let NodeContent::Document { .. } = node.content {
                return Ok(Resolved {
                    node_id: current,
                    attribute: parsed.attribute.clone(),
                    document_path: segments[index..]
                        .iter()
                        .map(|segment| segment.name.clone())
                        .collect(),
                });
            }

            let child = self.cypress.find_child(node, &segment.name).ok_or_else(|| {
                resolve_error(
                    original_path,
                    format!(
                        "node {} has no child {:?}",
                        self.cypress.node_path(current, chain),
                        segment.name
                    ),
                )
            })?;

            let is_final = index + 1 == segments.len();
            let child_node = self.cypress.resolve(child, chain)?;
            if let NodeContent::Link { target_path } = &child_node.content {
                let follow = !segment.suppress_redirect && (!is_final || follow_final_link);
                if follow {
                    if link_depth >= self.config.cypress.max_link_depth {
                        return Err(resolve_error(
                            original_path,
                            format!("link chain is too long resolving {original_path:?}"),
                        ));
                    }
                    let mut redirected = parse_path(target_path)?;
                    redirected
                        .segments
                        .extend(segments[index + 1..].iter().cloned());
                    redirected.attribute = parsed.attribute.clone();
                    return self.resolve_parsed(
                        original_path,
                        &redirected,
                        chain,
                        follow_final_link,
                        link_depth + 1,
                    );
                }
            }
            current = child;
        }

        Ok(Resolved {
            node_id: current,
            attribute: parsed.attribute.clone(),
            document_path: Vec::new(),
        })
    }

    /// Resolves everything but the final segment; returns the parent node,
    /// the final name, and the existing child if any.
    fn resolve_destination(
        &mut self,
        path: &str,
        chain: &[TransactionId],
        recursive: bool,
        user: &str,
    ) -> ArborResult<(NodeId, String, Option<NodeId>)> {
        let parsed = parse_path(path)?;
        if parsed.attribute.is_some() {
            return Err(resolve_error(
                path,
                "cannot create or copy to an attribute path",
            ));
        }
        let Some((last, prefix)) = parsed.segments.split_last() else {
            return Err(resolve_error(path, "cannot create or copy to the root"));
        };

        let mut current = self.cypress.root_id();
        for segment in prefix {
            let node = self.cypress.resolve(current, chain)?;
            match self.cypress.find_child(node, &segment.name) {
                Some(child) => {
                    let child_node = self.cypress.resolve(child, chain)?;
                    if let NodeContent::Link { target_path } = &child_node.content
                        && !segment.suppress_redirect
                    {
                        let target = self
                            .resolve_target(&target_path.clone(), chain, true)?
                            .node_id;
                        current = target;
                        continue;
                    }
                    current = child;
                }
                None if recursive => {
                    current =
                        self.create_child_node(current, &segment.name, ObjectKind::MapNode, chain, user)?;
                }
                None => {
                    return Err(resolve_error(
                        path,
                        format!("node has no child {:?}", segment.name),
                    ));
                }
            }
        }

        let parent_node = self.cypress.resolve(current, chain)?;
        if !matches!(parent_node.content, NodeContent::Map { .. }) {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!(
                    "{} cannot have children",
                    self.cypress.node_path(current, chain)
                ),
            ));
        }
        let existing = self.cypress.find_child(parent_node, &last.name);
        Ok((current, last.name.clone(), existing))
    }

    /// Permission check with the configured scope; the ACD chain is read
    /// through the transaction's view.
    pub(crate) fn check_permission(
        &self,
        node_id: NodeId,
        chain: &[TransactionId],
        user: &str,
        permission: Permission,
        scope: CheckScope,
    ) -> ArborResult<()> {
        let mut targets = Vec::new();
        if scope.this {
            targets.push(node_id);
        }
        if scope.parent
            && let Some(parent) = self.cypress.resolve(node_id, chain)?.parent_id
        {
            targets.push(parent);
        }
        if scope.descendants {
            let subtree = self.cypress.subtree_ids(node_id, chain)?;
            targets.extend(subtree.into_iter().skip(1));
        }

        for target in targets {
            let mut acds = Vec::new();
            let mut current = Some(target);
            while let Some(id) = current {
                let node = self.cypress.resolve(id, chain)?;
                acds.push(node.acd.clone());
                current = node.parent_id;
            }
            if !super::acl::check_permission(acds.iter(), user, permission) {
                return Err(authorization_error(
                    user,
                    permission.as_str(),
                    &self.cypress.node_path(target, chain),
                ));
            }
        }
        Ok(())
    }

    /// Takes an implicit, non-waitable write lock when under a transaction.
    fn take_write_lock(
        &mut self,
        node: NodeId,
        chain: &[TransactionId],
        request: LockRequest,
    ) -> ArborResult<()> {
        let Some(&transaction) = chain.first() else {
            return Ok(());
        };
        if self.cypress.locks.is_lock_redundant(node, transaction, &request) {
            return Ok(());
        }
        let transactions = &self.transactions;
        self.cypress.locks.acquire(
            &mut self.id_generator,
            node,
            transaction,
            request,
            false,
            &|holder, requester| transactions.is_ancestor(holder, requester),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read verbs.

    /// Returns the subtree (or attribute) addressed by the path.
    pub fn get(
        &mut self,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        options: &GetOptions,
    ) -> ArborResult<Value> {
        let chain = self.chain(transaction)?;
        let resolved = self.resolve_target(path, &chain, true)?;
        self.check_permission(resolved.node_id, &chain, user, Permission::Read, CheckScope::THIS)?;

        if !options.suppress_tracking && chain.is_empty() {
            let now = Utc::now();
            if let Ok(node) = self.cypress.trunk_mut(resolved.node_id) {
                node.touch_access(now);
            }
        }

        let node = self.cypress.resolve(resolved.node_id, &chain)?;
        let value = if let Some(attribute) = &resolved.attribute {
            self.read_attribute(node, attribute, transaction)?
        } else if !resolved.document_path.is_empty() {
            let NodeContent::Document { value } = &node.content else {
                unreachable!("document_path implies a document node");
            };
            document_get(value, &resolved.document_path)
                .ok_or_else(|| resolve_error(path, "no such key in document"))?
                .clone()
        } else {
            let max_size = options
                .max_size
                .unwrap_or(self.config.cypress.max_read_size);
            let mut budget = max_size;
            self.build_subtree(resolved.node_id, &chain, true, &mut budget)
                .map_err(|error| error.with_attr("path", path))?
        };

        if let Some(filter) = &options.attribute_filter {
            let node = self.cypress.resolve(resolved.node_id, &chain)?;
            let mut attributes = serde_json::Map::new();
            for key in filter {
                if let Ok(attribute_value) = self.read_attribute(node, key, transaction) {
                    attributes.insert(key.clone(), attribute_value);
                }
            }
            return Ok(serde_json::json!({
                "attributes": Value::Object(attributes),
                "value": value,
            }));
        }
        Ok(value)
    }

    fn read_attribute(
        &self,
        node: &CypressNode,
        key: &str,
        transaction: Option<TransactionId>,
    ) -> ArborResult<Value> {
        let context = AttributeContext {
            cell_tag: self.cell_tag(),
            lock_count: self.cypress.locks.lock_count(node.id),
            lock_mode: self.cypress.locks.node_lock_mode(node.id),
        };
        if let Some(value) = attributes::get_builtin(node, &context, key) {
            return Ok(value);
        }
        if let Some(value) = node.user_attributes.get(key) {
            return Ok(value.clone());
        }
        // External nodes keep content attributes on their native cell.
        if let (Some(cell), Some(client)) = (node.external_cell_tag, &self.external_client) {
            return match client.get_attribute(cell, node.id, transaction, key) {
                Ok(value) => Ok(value.unwrap_or(Value::Null)),
                Err(error)
                    if matches!(
                        error.code,
                        ErrorCode::ResolveError | ErrorCode::NoSuchTransaction
                    ) =>
                {
                    Ok(Value::Null)
                }
                Err(error) => Err(error),
            };
        }
        Err(resolve_error(
            &self.cypress.node_path(node.id, &[]),
            format!("attribute {key:?} is not found"),
        ))
    }

    /// Renders a subtree as a JSON value. Opaque containers below the top
    /// level render as null; entities render as null.
    fn build_subtree(
        &self,
        id: NodeId,
        chain: &[TransactionId],
        top_level: bool,
        budget: &mut usize,
    ) -> ArborResult<Value> {
        if *budget == 0 {
            return Err(ArborError::new(
                ErrorCode::MaxSizeViolated,
                "read result exceeds the size limit",
            ));
        }
        *budget -= 1;

        let node = self.cypress.resolve(id, chain)?;
        if node.opaque && !top_level {
            return Ok(Value::Null);
        }
        Ok(match &node.content {
            NodeContent::Map { children } => {
                let mut object = serde_json::Map::new();
                for (name, child) in children {
                    object.insert(name.clone(), self.build_subtree(*child, chain, false, budget)?);
                }
                Value::Object(object)
            }
            NodeContent::List { children } => {
                let mut array = Vec::with_capacity(children.len());
                for child in children {
                    array.push(self.build_subtree(*child, chain, false, budget)?);
                }
                Value::Array(array)
            }
            NodeContent::String { value } => Value::String(value.clone()),
            NodeContent::Int64 { value } => Value::from(*value),
            NodeContent::Uint64 { value } => Value::from(*value),
            NodeContent::Double { value } => {
                serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number)
            }
            NodeContent::Boolean { value } => Value::Bool(*value),
            NodeContent::Document { value } => value.clone(),
            NodeContent::Link { target_path } => {
                serde_json::json!({ "target_path": target_path })
            }
            NodeContent::Entity
            | NodeContent::Table
            | NodeContent::File
            | NodeContent::Journal => Value::Null,
        })
    }

    /// Child names of a map node.
    pub fn list(
        &mut self,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        max_size: Option<usize>,
    ) -> ArborResult<Vec<String>> {
        let chain = self.chain(transaction)?;
        let resolved = self.resolve_target(path, &chain, true)?;
        self.check_permission(resolved.node_id, &chain, user, Permission::Read, CheckScope::THIS)?;

        let node = self.cypress.resolve(resolved.node_id, &chain)?;
        let NodeContent::Map { children } = &node.content else {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("cannot list {} of kind {:?}", path, node.kind()),
            ));
        };
        let limit = max_size.unwrap_or(self.config.cypress.max_read_size);
        if children.len() > limit {
            return Err(ArborError::new(
                ErrorCode::MaxSizeViolated,
                "list result exceeds the size limit",
            )
            .with_attr("path", path));
        }
        Ok(children.keys().cloned().collect())
    }

    pub fn exists(&self, path: &str, transaction: Option<TransactionId>) -> ArborResult<bool> {
        let chain = self.chain(transaction)?;
        match self.resolve_target(path, &chain, true) {
            Ok(resolved) => {
                if let Some(attribute) = &resolved.attribute {
                    let node = self.cypress.resolve(resolved.node_id, &chain)?;
                    let context = AttributeContext {
                        cell_tag: self.cell_tag(),
                        lock_count: self.cypress.locks.lock_count(node.id),
                        lock_mode: self.cypress.locks.node_lock_mode(node.id),
                    };
                    Ok(attributes::get_builtin(node, &context, attribute).is_some()
                        || node.user_attributes.contains_key(attribute))
                } else if !resolved.document_path.is_empty() {
                    let node = self.cypress.resolve(resolved.node_id, &chain)?;
                    let NodeContent::Document { value } = &node.content else {
                        return Ok(false);
                    };
                    Ok(document_get(value, &resolved.document_path).is_some())
                } else {
                    Ok(true)
                }
            }
            Err(error) if error.code == ErrorCode::ResolveError => Ok(false),
            Err(error) => Err(error),
        }
    }

    // ------------------------------------------------------------------
    // Write verbs.

    /// Replaces the content (or one attribute) addressed by the path.
    pub fn set(
        &mut self,
        path: &str,
        value: Value,
        transaction: Option<TransactionId>,
        user: &str,
    ) -> ArborResult<()> {
        let chain = self.active_chain(transaction)?;
        let resolved = self.resolve_target(path, &chain, false)?;
        self.check_permission(resolved.node_id, &chain, user, Permission::Write, CheckScope::THIS)?;
        let now = Utc::now();

        if let Some(attribute) = resolved.attribute.clone() {
            self.take_write_lock(
                resolved.node_id,
                &chain,
                LockRequest::shared_attribute(attribute.clone()),
            )?;
            let node = self.cypress.version_mut(resolved.node_id, &chain)?;
            if !attributes::set_builtin(node, &attribute, value.clone(), now)? {
                node.user_attributes.insert(attribute.clone(), value);
                node.touch_attributes(now);
            }
            debug!(path, attribute = %attribute, user, "attribute set");
            return Ok(());
        }

        self.take_write_lock(resolved.node_id, &chain, LockRequest::exclusive())?;

        if !resolved.document_path.is_empty() {
            let node = self.cypress.version_mut(resolved.node_id, &chain)?;
            let NodeContent::Document { value: document } = &mut node.content else {
                unreachable!("document_path implies a document node");
            };
            document_set(document, &resolved.document_path, value)?;
            node.touch_content(now);
            return Ok(());
        }

        let kind = self.cypress.resolve(resolved.node_id, &chain)?.kind();
        let new_content = match (kind, value) {
            (ObjectKind::DocumentNode, value) => Some(NodeContent::Document { value }),
            (ObjectKind::StringNode, Value::String(value)) => {
                Some(NodeContent::String { value })
            }
            (ObjectKind::Int64Node, Value::Number(number)) if number.is_i64() => {
                Some(NodeContent::Int64 {
                    value: number.as_i64().expect("checked"),
                })
            }
            (ObjectKind::Uint64Node, Value::Number(number)) if number.is_u64() => {
                Some(NodeContent::Uint64 {
                    value: number.as_u64().expect("checked"),
                })
            }
            (ObjectKind::DoubleNode, Value::Number(number)) => Some(NodeContent::Double {
                value: number.as_f64().unwrap_or(0.0),
            }),
            (ObjectKind::BooleanNode, Value::Bool(value)) => {
                Some(NodeContent::Boolean { value })
            }
            (ObjectKind::MapNode, value @ Value::Object(_))
            | (ObjectKind::ListNode, value @ Value::Array(_)) => {
                self.rebuild_container(resolved.node_id, value, &chain, now)?;
                None
            }
            (kind, _) => {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("cannot assign a value of this type to a node of kind {kind:?}"),
                )
                .with_attr("path", path));
            }
        };
        if let Some(content) = new_content {
            let node = self.cypress.version_mut(resolved.node_id, &chain)?;
            node.content = content;
            node.touch_content(now);
        }
        debug!(path, user, transaction = ?transaction, "node content set");
        Ok(())
    }

    /// Replaces a container's children with nodes built from a JSON value.
    fn rebuild_container(
        &mut self,
        id: NodeId,
        value: Value,
        chain: &[TransactionId],
        now: chrono::DateTime<Utc>,
    ) -> ArborResult<()> {
        let old_children = {
            let node = self.cypress.resolve(id, chain)?;
            node.content.child_ids()
        };
        let content = match value {
            Value::Object(entries) => {
                let mut children = BTreeMap::new();
                for (name, child_value) in entries {
                    let child = self.materialize_value(id, child_value, chain, now)?;
                    children.insert(name, child);
                }
                NodeContent::Map { children }
            }
            Value::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    children.push(self.materialize_value(id, item, chain, now)?);
                }
                NodeContent::List { children }
            }
            _ => unreachable!("caller matched on container kinds"),
        };
        let node = self.cypress.version_mut(id, chain)?;
        node.content = content;
        node.touch_content(now);

        // Old children become unreachable once this branch commits.
        if let Some(&transaction) = chain.first() {
            for child in old_children {
                self.transactions.record_removed_node(transaction, child)?;
            }
        } else {
            self.cypress.sweep_unreachable(&old_children);
        }
        Ok(())
    }

    /// Builds a typed node tree from a JSON value; new entities are staged
    /// under the transaction.
    fn materialize_value(
        &mut self,
        parent: NodeId,
        value: Value,
        chain: &[TransactionId],
        now: chrono::DateTime<Utc>,
    ) -> ArborResult<NodeId> {
        let content = match value {
            Value::Object(entries) => {
                let mut children = BTreeMap::new();
                let id = self.id_generator.generate(ObjectKind::MapNode);
                // Children need the parent id first; create then fill.
                let node = CypressNode::new(id, Some(parent), NodeContent::Map {
                    children: BTreeMap::new(),
                }, now);
                self.cypress.insert_node(node);
                self.stage_if_transactional(id, chain)?;
                for (name, child_value) in entries {
                    let child = self.materialize_value(id, child_value, chain, now)?;
                    children.insert(name, child);
                }
                self.cypress.trunk_mut(id)?.content = NodeContent::Map { children };
                return Ok(id);
            }
            Value::Array(items) => {
                let id = self.id_generator.generate(ObjectKind::ListNode);
                let node = CypressNode::new(id, Some(parent), NodeContent::List {
                    children: Vec::new(),
                }, now);
                self.cypress.insert_node(node);
                self.stage_if_transactional(id, chain)?;
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    children.push(self.materialize_value(id, item, chain, now)?);
                }
                self.cypress.trunk_mut(id)?.content = NodeContent::List { children };
                return Ok(id);
            }
            Value::String(text) => NodeContent::String { value: text },
            Value::Number(number) if number.is_i64() => NodeContent::Int64 {
                value: number.as_i64().expect("checked"),
            },
            Value::Number(number) if number.is_u64() => NodeContent::Uint64 {
                value: number.as_u64().expect("checked"),
            },
            Value::Number(number) => NodeContent::Double {
                value: number.as_f64().unwrap_or(0.0),
            },
            Value::Bool(flag) => NodeContent::Boolean { value: flag },
            Value::Null => NodeContent::Entity,
        };
        let id = self.id_generator.generate(content.kind());
        self.cypress
            .insert_node(CypressNode::new(id, Some(parent), content, now));
        self.stage_if_transactional(id, chain)?;
        Ok(id)
    }

    fn stage_if_transactional(&mut self, id: NodeId, chain: &[TransactionId]) -> ArborResult<()> {
        if let Some(&transaction) = chain.first() {
            self.transactions.stage_node(transaction, id)?;
        }
        Ok(())
    }

    /// Unlinks the addressed subtree.
    pub fn remove(
        &mut self,
        path: &str,
        recursive: bool,
        force: bool,
        transaction: Option<TransactionId>,
        user: &str,
    ) -> ArborResult<()> {
        let chain = self.active_chain(transaction)?;
        let resolved = match self.resolve_target(path, &chain, false) {
            Ok(resolved) => resolved,
            Err(error) if force && error.code == ErrorCode::ResolveError => return Ok(()),
            Err(error) => return Err(error),
        };
        if !resolved.document_path.is_empty() {
            return Err(resolve_error(path, "cannot remove inside a document"));
        }
        let now = Utc::now();

        if let Some(attribute) = resolved.attribute.clone() {
            self.check_permission(resolved.node_id, &chain, user, Permission::Write, CheckScope::THIS)?;
            self.take_write_lock(
                resolved.node_id,
                &chain,
                LockRequest::shared_attribute(attribute.clone()),
            )?;
            let node = self.cypress.version_mut(resolved.node_id, &chain)?;
            if !attributes::remove_builtin(node, &attribute, now)? {
                let removed = node.user_attributes.remove(&attribute).is_some();
                if removed {
                    node.touch_attributes(now);
                } else if !force {
                    return Err(resolve_error(path, format!("attribute {attribute:?} is not found")));
                }
            }
            return Ok(());
        }

        let node = self.cypress.resolve(resolved.node_id, &chain)?;
        let Some(parent_id) = node.parent_id else {
            return Err(ArborError::new(ErrorCode::Generic, "cannot remove the root"));
        };
        if node.content.is_composite() && !node.content.child_ids().is_empty() && !recursive {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("cannot remove non-empty composite node {path}"),
            ));
        }

        self.check_permission(
            resolved.node_id,
            &chain,
            user,
            Permission::Remove,
            CheckScope::THIS_AND_DESCENDANTS,
        )?;
        self.check_permission(resolved.node_id, &chain, user, Permission::Write, CheckScope::PARENT)?;

        let key = {
            let parent = self.cypress.resolve(parent_id, &chain)?;
            self.cypress
                .key_of_child(parent, resolved.node_id)
                .ok_or_else(|| resolve_error(path, "node is not linked from its parent"))?
        };
        self.take_write_lock(resolved.node_id, &chain, LockRequest::exclusive())?;
        self.take_write_lock(parent_id, &chain, LockRequest::shared_child(key.clone()))?;

        let parent = self.cypress.version_mut(parent_id, &chain)?;
        match &mut parent.content {
            NodeContent::Map { children } => {
                children.remove(&key);
            }
            NodeContent::List { children } => {
                let index: usize = key.parse().expect("list keys are indices");
                children.remove(index);
            }
            _ => unreachable!("parent of a linked node is composite"),
        }
        parent.touch_content(now);

        match chain.first() {
            Some(&transaction) => {
                self.transactions
                    .record_removed_node(transaction, resolved.node_id)?;
            }
            None => {
                self.cypress.sweep_unreachable(&[resolved.node_id]);
            }
        }
        debug!(path, user, recursive, "node removed");
        Ok(())
    }

    /// Creates a node of the given kind.
    pub fn create(
        &mut self,
        kind: ObjectKind,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        options: &CreateOptions,
    ) -> ArborResult<CreateResult> {
        if options.ignore_existing && options.force {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "cannot specify both \"ignore_existing\" and \"force\" options simultaneously",
            ));
        }
        if !kind.is_node() {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("cannot create a node of kind {kind:?}"),
            ));
        }
        let chain = self.active_chain(transaction)?;
        let (parent_id, name, existing) =
            self.resolve_destination(path, &chain, options.recursive, user)?;

        if let Some(existing_id) = existing {
            if options.ignore_existing {
                let existing_node = self.cypress.resolve(existing_id, &chain)?;
                if existing_node.kind() != kind {
                    return Err(ArborError::new(
                        ErrorCode::AlreadyExists,
                        format!(
                            "{} already exists and has kind {:?} while a node of kind {:?} is about to be created",
                            path,
                            existing_node.kind(),
                            kind
                        ),
                    ));
                }
                let cell_tag = existing_node.external_cell_tag.unwrap_or(self.cell_tag());
                return Ok(CreateResult {
                    node_id: existing_id,
                    cell_tag,
                });
            }
            if !options.force {
                return Err(already_exists(path));
            }
            self.remove(path, true, false, transaction, user)?;
        }

        self.check_permission(parent_id, &chain, user, Permission::Write, CheckScope::THIS)?;

        let node_id = self.create_child_node(parent_id, &name, kind, &chain, user)?;

        // Explicit attributes override whatever was inherited.
        let now = Utc::now();
        for (key, value) in &options.attributes {
            let node = self.cypress.version_mut(node_id, &chain)?;
            if !attributes::set_builtin(node, key, value.clone(), now)? {
                if key == "target_path" {
                    if let (NodeContent::Link { target_path }, Value::String(target)) =
                        (&mut node.content, value)
                    {
                        *target_path = target.clone();
                        continue;
                    }
                }
                node.user_attributes.insert(key.clone(), value.clone());
                node.touch_attributes(now);
            }
        }

        let node = self.cypress.resolve(node_id, &chain)?;
        let cell_tag = node.external_cell_tag.unwrap_or(self.cell_tag());
        debug!(path, kind = ?kind, node = %node_id, user, "node created");
        Ok(CreateResult { node_id, cell_tag })
    }

    /// Creates one child node under a map parent, inheriting attributes
    /// from the ancestry and staging it with the transaction.
    fn create_child_node(
        &mut self,
        parent_id: NodeId,
        name: &str,
        kind: ObjectKind,
        chain: &[TransactionId],
        _user: &str,
    ) -> ArborResult<NodeId> {
        let now = Utc::now();

        let mut inherited = InheritableAttributes::default();
        let mut account = None;
        let mut current = Some(parent_id);
        while let Some(id) = current {
            let ancestor = self.cypress.resolve(id, chain)?;
            if id == parent_id && !matches!(ancestor.content, NodeContent::Map { .. }) {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("node of kind {:?} cannot have children", ancestor.kind()),
                ));
            }
            if account.is_none() {
                account = ancestor.account.clone();
            }
            inherited.fill_from(&ancestor.inheritable);
            if inherited.is_full() {
                break;
            }
            current = ancestor.parent_id;
        }

        self.take_write_lock(parent_id, chain, LockRequest::shared_child(name.to_string()))?;

        let content = NodeContent::empty_of_kind(kind)?;
        let id = self.id_generator.generate(kind);
        let mut node = CypressNode::new(id, Some(parent_id), content, now);
        node.account = account;
        node.inheritable = inherited;
        self.cypress.insert_node(node);
        self.stage_if_transactional(id, chain)?;

        let parent = self.cypress.version_mut(parent_id, chain)?;
        match &mut parent.content {
            NodeContent::Map { children } => {
                children.insert(name.to_string(), id);
            }
            _ => unreachable!("parent kind validated above"),
        }
        parent.touch_content(now);
        Ok(id)
    }

    /// Copies (or moves) a subtree.
    pub fn copy(
        &mut self,
        source_path: &str,
        destination_path: &str,
        remove_source: bool,
        transaction: Option<TransactionId>,
        user: &str,
        options: &CopyOptions,
    ) -> ArborResult<CreateResult> {
        if options.ignore_existing && options.force {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "cannot specify both \"ignore_existing\" and \"force\" options simultaneously",
            ));
        }
        if options.ignore_existing && remove_source {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "cannot specify both \"ignore_existing\" and \"remove_source\" options simultaneously",
            ));
        }
        let chain = self.active_chain(transaction)?;
        let source = self.resolve_target(source_path, &chain, true)?;
        if source.attribute.is_some() || !source.document_path.is_empty() {
            return Err(resolve_error(source_path, "cannot copy an attribute"));
        }

        let (destination_parent, name, existing) =
            self.resolve_destination(destination_path, &chain, options.recursive, user)?;

        if self
            .cypress
            .is_ancestor(source.node_id, destination_parent, &chain)
        {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "cannot copy or move a node to its descendant",
            ));
        }

        if let Some(existing_id) = existing {
            if options.ignore_existing {
                return Ok(CreateResult {
                    node_id: existing_id,
                    cell_tag: self.cell_tag(),
                });
            }
            if !options.force {
                return Err(already_exists(destination_path));
            }
            self.remove(destination_path, true, false, transaction, user)?;
        }

        self.check_permission(destination_parent, &chain, user, Permission::Write, CheckScope::THIS)?;
        self.check_permission(
            source.node_id,
            &chain,
            user,
            Permission::Read,
            CheckScope::THIS_AND_DESCENDANTS,
        )?;
        if remove_source {
            self.check_permission(
                source.node_id,
                &chain,
                user,
                Permission::Remove,
                CheckScope::THIS_AND_DESCENDANTS,
            )?;
            self.check_permission(source.node_id, &chain, user, Permission::Write, CheckScope::PARENT)?;
            self.take_write_lock(source.node_id, &chain, LockRequest::exclusive())?;
        }

        let now = Utc::now();
        let clone_options = CloneOptions {
            preserve_account: options.preserve_account,
            preserve_expiration_time: options.preserve_expiration_time,
            preserve_creation_time: options.preserve_creation_time,
            target_account: self.cypress.resolve(destination_parent, &chain)?.account.clone(),
        };
        let cloned = self.cypress.clone_subtree(
            source.node_id,
            &chain,
            &mut self.id_generator,
            &clone_options,
            now,
        )?;
        for id in self.cypress.subtree_ids(cloned, &[])? {
            self.stage_if_transactional(id, &chain)?;
        }

        self.take_write_lock(destination_parent, &chain, LockRequest::shared_child(name.clone()))?;
        {
            let cloned_node = self.cypress.trunk_mut(cloned)?;
            cloned_node.parent_id = Some(destination_parent);
        }
        let parent = self.cypress.version_mut(destination_parent, &chain)?;
        match &mut parent.content {
            NodeContent::Map { children } => {
                children.insert(name.clone(), cloned);
            }
            _ => unreachable!("destination parent validated as a map"),
        }
        parent.touch_content(now);

        if remove_source {
            self.remove(source_path, true, false, transaction, user)?;
        }

        debug!(
            source = source_path,
            destination = destination_path,
            moved = remove_source,
            node = %cloned,
            "subtree copied"
        );
        Ok(CreateResult {
            node_id: cloned,
            cell_tag: self.cell_tag(),
        })
    }

    /// Creates a link node redirecting to `target_path`.
    pub fn link(
        &mut self,
        link_path: &str,
        target_path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        options: &CreateOptions,
    ) -> ArborResult<CreateResult> {
        if !options.force {
            let chain = self.chain(transaction)?;
            // The target must resolve now; a broken link needs force.
            self.resolve_target(target_path, &chain, true)?;
        }
        let mut options = options.clone();
        options.attributes.insert(
            "target_path".to_string(),
            Value::String(target_path.to_string()),
        );
        self.create(ObjectKind::LinkNode, link_path, transaction, user, &options)
    }

    /// Explicit lock acquisition.
    pub fn lock(
        &mut self,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        options: &LockOptions,
    ) -> ArborResult<LockResult> {
        let chain = self.active_chain(transaction)?;
        let Some(&transaction) = chain.first() else {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "locking requires a transaction",
            ));
        };
        let resolved = self.resolve_target(path, &chain, false)?;
        let permission = match options.request.mode {
            super::locks::LockMode::Snapshot => Permission::Read,
            _ => Permission::Write,
        };
        self.check_permission(resolved.node_id, &chain, user, permission, CheckScope::THIS)?;

        let transactions = &self.transactions;
        let (lock_id, state) = self.cypress.locks.acquire(
            &mut self.id_generator,
            resolved.node_id,
            transaction,
            options.request.clone(),
            options.waitable,
            &|holder, requester| transactions.is_ancestor(holder, requester),
        )?;

        if options.request.mode == super::locks::LockMode::Snapshot
            && state == LockState::Acquired
        {
            self.cypress.branch_node(resolved.node_id, &chain, true)?;
        }

        let node = self.cypress.resolve(resolved.node_id, &chain)?;
        let cell_tag = node.external_cell_tag.unwrap_or(self.cell_tag());
        Ok(LockResult {
            lock_id,
            node_id: resolved.node_id,
            cell_tag,
            state,
        })
    }

    /// Releases snapshot locks held by the transaction on the node.
    pub fn unlock(
        &mut self,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
    ) -> ArborResult<()> {
        let chain = self.active_chain(transaction)?;
        let Some(&transaction) = chain.first() else {
            return Err(ArborError::new(
                ErrorCode::Generic,
                "unlocking requires a transaction",
            ));
        };
        let resolved = self.resolve_target(path, &chain, false)?;
        self.check_permission(resolved.node_id, &chain, user, Permission::Read, CheckScope::THIS)?;
        if self.cypress.locks.unlock_snapshot(resolved.node_id, transaction) {
            // Drop the frozen branch along with the lock.
            self.cypress.abort_branches_for_node(resolved.node_id, transaction);
        }
        Ok(())
    }

    /// Explicit snapshot read support for verbs that carry a timestamp.
    pub fn lock_with_timestamp(
        &mut self,
        path: &str,
        transaction: Option<TransactionId>,
        user: &str,
        timestamp: Timestamp,
        waitable: bool,
    ) -> ArborResult<LockResult> {
        self.lock(path, transaction, user, &LockOptions {
            request: LockRequest::snapshot(Some(timestamp)),
            waitable,
        })
    }
}

fn document_get<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = match current {
            Value::Object(object) => object.get(key)?,
            Value::Array(array) => array.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn document_set(document: &mut Value, path: &[String], value: Value) -> ArborResult<()> {
    let Some((last, prefix)) = path.split_last() else {
        *document = value;
        return Ok(());
    };
    let mut current = document;
    for key in prefix {
        current = match current {
            Value::Object(object) => object
                .get_mut(key)
                .ok_or_else(|| resolve_error(key, "no such key in document"))?,
            Value::Array(array) => {
                let index: usize = key
                    .parse()
                    .map_err(|_| resolve_error(key, "document index is not a number"))?;
                array
                    .get_mut(index)
                    .ok_or_else(|| resolve_error(key, "document index out of range"))?
            }
            _ => {
                return Err(resolve_error(key, "cannot descend into a document scalar"));
            }
        };
    }
    match current {
        Value::Object(object) => {
            object.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(array) => {
            let index: usize = last
                .parse()
                .map_err(|_| resolve_error(last, "document index is not a number"))?;
            if index < array.len() {
                array[index] = value;
                Ok(())
            } else {
                Err(resolve_error(last, "document index out of range"))
            }
        }
        _ => Err(resolve_error(last, "cannot descend into a document scalar")),
    }
}
