//! Node representation: kinds, content payloads, inheritable attributes.
//!
//! Node kinds are a tagged union: the discriminant doubles as the
//! [`ObjectKind`] embedded in the node id, and the payload carries the
//! kind-specific content. Container kinds (map, list) hold child ids;
//! scalar kinds hold their value; documents embed a JSON tree; links hold
//! their target path; table/file/journal nodes carry no local content
//! beyond their storage attributes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_types::{ArborError, ArborResult, CellTag, ErrorCode, NodeId, ObjectKind};

use super::acl::Acd;

/// Kind-specific node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeContent {
    Map {
        children: BTreeMap<String, NodeId>,
    },
    List {
        children: Vec<NodeId>,
    },
    String {
        value: String,
    },
    Int64 {
        value: i64,
    },
    Uint64 {
        value: u64,
    },
    Double {
        value: f64,
    },
    Boolean {
        value: bool,
    },
    Entity,
    Document {
        value: Value,
    },
    Link {
        target_path: String,
    },
    Table,
    File,
    Journal,
}

impl NodeContent {
    pub fn kind(&self) -> ObjectKind {
        match self {
            NodeContent::Map { .. } => ObjectKind::MapNode,
            NodeContent::List { .. } => ObjectKind::ListNode,
            NodeContent::String { .. } => ObjectKind::StringNode,
            NodeContent::Int64 { .. } => ObjectKind::Int64Node,
            NodeContent::Uint64 { .. } => ObjectKind::Uint64Node,
            NodeContent::Double { .. } => ObjectKind::DoubleNode,
            NodeContent::Boolean { .. } => ObjectKind::BooleanNode,
            NodeContent::Entity => ObjectKind::EntityNode,
            NodeContent::Document { .. } => ObjectKind::DocumentNode,
            NodeContent::Link { .. } => ObjectKind::LinkNode,
            NodeContent::Table => ObjectKind::TableNode,
            NodeContent::File => ObjectKind::FileNode,
            NodeContent::Journal => ObjectKind::JournalNode,
        }
    }

    pub fn empty_of_kind(kind: ObjectKind) -> ArborResult<NodeContent> {
        Ok(match kind {
            ObjectKind::MapNode => NodeContent::Map {
                children: BTreeMap::new(),
            },
            ObjectKind::ListNode => NodeContent::List { children: vec![] },
            ObjectKind::StringNode => NodeContent::String {
                value: String::new(),
            },
            ObjectKind::Int64Node => NodeContent::Int64 { value: 0 },
            ObjectKind::Uint64Node => NodeContent::Uint64 { value: 0 },
            ObjectKind::DoubleNode => NodeContent::Double { value: 0.0 },
            ObjectKind::BooleanNode => NodeContent::Boolean { value: false },
            ObjectKind::EntityNode => NodeContent::Entity,
            ObjectKind::DocumentNode => NodeContent::Document { value: Value::Null },
            ObjectKind::LinkNode => NodeContent::Link {
                target_path: String::new(),
            },
            ObjectKind::TableNode => NodeContent::Table,
            ObjectKind::FileNode => NodeContent::File,
            ObjectKind::JournalNode => NodeContent::Journal,
            other => {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("cannot create a node of kind {other:?}"),
                ));
            }
        })
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, NodeContent::Map { .. } | NodeContent::List { .. })
    }

    /// Ids of direct children, in iteration order.
    pub fn child_ids(&self) -> Vec<NodeId> {
        match self {
            NodeContent::Map { children } => children.values().copied().collect(),
            NodeContent::List { children } => children.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    Full,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOrdering {
    Weak,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InMemoryMode {
    None,
    Compressed,
    Uncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeFor {
    Lookup,
    Scan,
}

/// Replication policy for one medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumPolicy {
    pub replication_factor: u32,
    #[serde(default)]
    pub data_parts_only: bool,
}

/// The attribute set that propagates down the tree until overridden.
///
/// `None` means "not set here": reads fall through to the nearest ancestor
/// that sets the attribute.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InheritableAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erasure_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<BTreeMap<String, MediumPolicy>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vital: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tablet_cell_bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomicity: Option<Atomicity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_ordering: Option<CommitOrdering>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_memory_mode: Option<InMemoryMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimize_for: Option<OptimizeFor>,
}

/// Names of all inheritable attributes, in descriptor order.
pub const INHERITABLE_ATTRIBUTE_KEYS: &[&str] = &[
    "compression_codec",
    "erasure_codec",
    "primary_medium",
    "media",
    "vital",
    "replication_factor",
    "tablet_cell_bundle",
    "atomicity",
    "commit_ordering",
    "in_memory_mode",
    "optimize_for",
];

impl InheritableAttributes {
    /// Fills every unset slot from `ancestor`; the gather loop stops once
    /// the set is full.
    pub fn fill_from(&mut self, ancestor: &InheritableAttributes) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = ancestor.$field.clone();
                }
            };
        }
        fill!(compression_codec);
        fill!(erasure_codec);
        fill!(primary_medium);
        fill!(media);
        fill!(vital);
        fill!(replication_factor);
        fill!(tablet_cell_bundle);
        fill!(atomicity);
        fill!(commit_ordering);
        fill!(in_memory_mode);
        fill!(optimize_for);
    }

    pub fn is_full(&self) -> bool {
        self.compression_codec.is_some()
            && self.erasure_codec.is_some()
            && self.primary_medium.is_some()
            && self.media.is_some()
            && self.vital.is_some()
            && self.replication_factor.is_some()
            && self.tablet_cell_bundle.is_some()
            && self.atomicity.is_some()
            && self.commit_ordering.is_some()
            && self.in_memory_mode.is_some()
            && self.optimize_for.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self == &InheritableAttributes::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        fn json<T: Serialize>(value: &Option<T>) -> Option<Value> {
            value.as_ref().map(|v| serde_json::to_value(v).expect("serializable"))
        }
        match key {
            "compression_codec" => json(&self.compression_codec),
            "erasure_codec" => json(&self.erasure_codec),
            "primary_medium" => json(&self.primary_medium),
            "media" => json(&self.media),
            "vital" => json(&self.vital),
            "replication_factor" => json(&self.replication_factor),
            "tablet_cell_bundle" => json(&self.tablet_cell_bundle),
            "atomicity" => json(&self.atomicity),
            "commit_ordering" => json(&self.commit_ordering),
            "in_memory_mode" => json(&self.in_memory_mode),
            "optimize_for" => json(&self.optimize_for),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Value) -> ArborResult<()> {
        fn parse<T: for<'de> Deserialize<'de>>(key: &str, value: Value) -> ArborResult<T> {
            serde_json::from_value(value).map_err(|e| {
                ArborError::new(
                    ErrorCode::Generic,
                    format!("invalid value for attribute {key:?}: {e}"),
                )
            })
        }
        match key {
            "compression_codec" => self.compression_codec = Some(parse(key, value)?),
            "erasure_codec" => self.erasure_codec = Some(parse(key, value)?),
            "primary_medium" => self.primary_medium = Some(parse(key, value)?),
            "media" => self.media = Some(parse(key, value)?),
            "vital" => self.vital = Some(parse(key, value)?),
            "replication_factor" => self.replication_factor = Some(parse(key, value)?),
            "tablet_cell_bundle" => self.tablet_cell_bundle = Some(parse(key, value)?),
            "atomicity" => self.atomicity = Some(parse(key, value)?),
            "commit_ordering" => self.commit_ordering = Some(parse(key, value)?),
            "in_memory_mode" => self.in_memory_mode = Some(parse(key, value)?),
            "optimize_for" => self.optimize_for = Some(parse(key, value)?),
            _ => {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("{key:?} is not an inheritable attribute"),
                ));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match key {
            "compression_codec" => self.compression_codec.take().is_some(),
            "erasure_codec" => self.erasure_codec.take().is_some(),
            "primary_medium" => self.primary_medium.take().is_some(),
            "media" => self.media.take().is_some(),
            "vital" => self.vital.take().is_some(),
            "replication_factor" => self.replication_factor.take().is_some(),
            "tablet_cell_bundle" => self.tablet_cell_bundle.take().is_some(),
            "atomicity" => self.atomicity.take().is_some(),
            "commit_ordering" => self.commit_ordering.take().is_some(),
            "in_memory_mode" => self.in_memory_mode.take().is_some(),
            "optimize_for" => self.optimize_for.take().is_some(),
            _ => false,
        }
    }
}

/// One version of a tree node: either the trunk or a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CypressNode {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub content: NodeContent,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub access_counter: u64,
    pub revision: u64,
    pub attributes_revision: u64,
    pub content_revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default)]
    pub opaque: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acd: Acd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cell_tag: Option<CellTag>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "InheritableAttributes::is_empty")]
    pub inheritable: InheritableAttributes,
}

impl CypressNode {
    pub fn new(id: NodeId, parent_id: Option<NodeId>, content: NodeContent, now: DateTime<Utc>) -> Self {
        CypressNode {
            id,
            parent_id,
            content,
            creation_time: now,
            modification_time: now,
            access_time: now,
            access_counter: 0,
            revision: 1,
            attributes_revision: 1,
            content_revision: 1,
            account: None,
            opaque: false,
            expiration_time: None,
            acd: Acd::default(),
            external_cell_tag: None,
            user_attributes: BTreeMap::new(),
            inheritable: InheritableAttributes::default(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.content.kind()
    }

    pub fn is_external(&self) -> bool {
        self.external_cell_tag.is_some()
    }

    pub fn touch_content(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.content_revision = self.revision;
        self.modification_time = now;
    }

    pub fn touch_attributes(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.attributes_revision = self.revision;
        self.modification_time = now;
    }

    pub fn touch_access(&mut self, now: DateTime<Utc>) {
        self.access_counter += 1;
        self.access_time = now;
    }
}

/// A transaction-local shadow of a trunk node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBranch {
    pub node: CypressNode,
    /// Snapshot branches are frozen at lock time and never merged back.
    pub snapshot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::ObjectId;

    fn node_id(counter: u32) -> NodeId {
        ObjectId::new(ObjectKind::MapNode, CellTag(1), counter, 0)
    }

    #[test]
    fn test_content_kind_mapping() {
        assert_eq!(
            NodeContent::Map {
                children: BTreeMap::new()
            }
            .kind(),
            ObjectKind::MapNode
        );
        assert_eq!(
            NodeContent::Document { value: Value::Null }.kind(),
            ObjectKind::DocumentNode
        );
        let content = NodeContent::empty_of_kind(ObjectKind::TableNode).unwrap();
        assert_eq!(content.kind(), ObjectKind::TableNode);
        assert!(NodeContent::empty_of_kind(ObjectKind::Transaction).is_err());
    }

    #[test]
    fn test_inheritable_fill_stops_at_set_values() {
        let mut child = InheritableAttributes {
            replication_factor: Some(3),
            ..Default::default()
        };
        let parent = InheritableAttributes {
            replication_factor: Some(5),
            compression_codec: Some("lz4".to_string()),
            ..Default::default()
        };
        child.fill_from(&parent);
        assert_eq!(child.replication_factor, Some(3));
        assert_eq!(child.compression_codec.as_deref(), Some("lz4"));
    }

    #[test]
    fn test_inheritable_get_set_remove_by_key() {
        let mut attrs = InheritableAttributes::default();
        attrs
            .set("replication_factor", serde_json::json!(5))
            .unwrap();
        attrs.set("atomicity", serde_json::json!("full")).unwrap();
        assert_eq!(attrs.get("replication_factor"), Some(serde_json::json!(5)));
        assert_eq!(attrs.get("atomicity"), Some(serde_json::json!("full")));
        assert!(attrs.set("replication_factor", serde_json::json!("x")).is_err());
        assert!(attrs.set("no_such", serde_json::json!(1)).is_err());
        assert!(attrs.remove("atomicity"));
        assert!(!attrs.remove("atomicity"));
        assert_eq!(attrs.get("atomicity"), None);
    }

    #[test]
    fn test_revision_monotonicity() {
        let now = Utc::now();
        let mut node = CypressNode::new(
            node_id(1),
            None,
            NodeContent::empty_of_kind(ObjectKind::MapNode).unwrap(),
            now,
        );
        let initial = node.revision;
        node.touch_attributes(now);
        assert!(node.attributes_revision > initial);
        assert_eq!(node.revision, node.attributes_revision);
        node.touch_content(now);
        assert!(node.content_revision > node.attributes_revision);
        assert!(node.attributes_revision <= node.revision);
        assert!(node.content_revision <= node.revision);
    }

    #[test]
    fn test_child_ids() {
        let mut children = BTreeMap::new();
        children.insert("a".to_string(), node_id(2));
        children.insert("b".to_string(), node_id(3));
        let content = NodeContent::Map { children };
        assert_eq!(content.child_ids(), vec![node_id(2), node_id(3)]);
        assert!(NodeContent::Entity.child_ids().is_empty());
    }
}
