//! Builtin attribute descriptors and handlers.
//!
//! Attributes split three ways: builtin system attributes with per-key
//! get/set/remove handlers and validation, free-form user attributes, and
//! the inheritable storage attributes living in
//! [`InheritableAttributes`](super::node::InheritableAttributes). The verb
//! layer consults this module for anything addressed as `@key`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use arbor_types::{ArborError, ArborResult, CellTag, ErrorCode};

use super::acl::Ace;
use super::locks::LockMode;
use super::node::{CypressNode, INHERITABLE_ATTRIBUTE_KEYS, MediumPolicy};

/// Flags of one builtin attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttributeDescriptor {
    pub key: &'static str,
    pub writable: bool,
    pub removable: bool,
    pub opaque: bool,
}

const fn descriptor(key: &'static str) -> AttributeDescriptor {
    AttributeDescriptor {
        key,
        writable: false,
        removable: false,
        opaque: false,
    }
}

const fn writable(key: &'static str) -> AttributeDescriptor {
    AttributeDescriptor {
        key,
        writable: true,
        removable: false,
        opaque: false,
    }
}

const fn removable(key: &'static str) -> AttributeDescriptor {
    AttributeDescriptor {
        key,
        writable: true,
        removable: true,
        opaque: false,
    }
}

/// Builtin attributes common to every node kind.
pub const BUILTIN_ATTRIBUTES: &[AttributeDescriptor] = &[
    descriptor("id"),
    descriptor("type"),
    descriptor("parent_id"),
    descriptor("creation_time"),
    descriptor("modification_time"),
    descriptor("access_time"),
    descriptor("access_counter"),
    descriptor("revision"),
    descriptor("attributes_revision"),
    descriptor("content_revision"),
    descriptor("external"),
    descriptor("external_cell_tag"),
    descriptor("lock_count"),
    descriptor("lock_mode"),
    writable("account"),
    writable("opaque"),
    writable("acl"),
    writable("inherit_acl"),
    removable("expiration_time"),
    // Inheritable storage attributes; all writable and removable.
    removable("compression_codec"),
    removable("erasure_codec"),
    removable("primary_medium"),
    removable("media"),
    removable("vital"),
    removable("replication_factor"),
    removable("tablet_cell_bundle"),
    removable("atomicity"),
    removable("commit_ordering"),
    removable("in_memory_mode"),
    removable("optimize_for"),
];

pub fn find_descriptor(key: &str) -> Option<&'static AttributeDescriptor> {
    BUILTIN_ATTRIBUTES.iter().find(|d| d.key == key)
}

/// Read-side context the node itself does not carry.
#[derive(Debug, Clone, Copy)]
pub struct AttributeContext {
    pub cell_tag: CellTag,
    pub lock_count: usize,
    pub lock_mode: Option<LockMode>,
}

fn time_value(time: DateTime<Utc>) -> Value {
    Value::String(time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

/// Reads a builtin attribute; `None` when the key is not builtin or not
/// present on this node.
pub fn get_builtin(node: &CypressNode, context: &AttributeContext, key: &str) -> Option<Value> {
    match key {
        "id" => Some(Value::String(node.id.to_string())),
        "type" => serde_json::to_value(node.kind()).ok(),
        "parent_id" => node.parent_id.map(|id| Value::String(id.to_string())),
        "creation_time" => Some(time_value(node.creation_time)),
        "modification_time" => Some(time_value(node.modification_time)),
        "access_time" => Some(time_value(node.access_time)),
        "access_counter" => Some(Value::from(node.access_counter)),
        "revision" => Some(Value::from(node.revision)),
        "attributes_revision" => Some(Value::from(node.attributes_revision)),
        "content_revision" => Some(Value::from(node.content_revision)),
        "account" => node.account.clone().map(Value::String),
        "opaque" => Some(Value::Bool(node.opaque)),
        "expiration_time" => node.expiration_time.map(time_value),
        "external" => Some(Value::Bool(node.is_external())),
        "external_cell_tag" => Some(Value::from(
            node.external_cell_tag.unwrap_or(context.cell_tag).0,
        )),
        "lock_count" => Some(Value::from(context.lock_count as u64)),
        "lock_mode" => context
            .lock_mode
            .and_then(|mode| serde_json::to_value(mode).ok()),
        "acl" => serde_json::to_value(&node.acd.entries).ok(),
        "inherit_acl" => Some(Value::Bool(node.acd.inherit)),
        "target_path" => match &node.content {
            super::node::NodeContent::Link { target_path } => {
                Some(Value::String(target_path.clone()))
            }
            _ => None,
        },
        _ if INHERITABLE_ATTRIBUTE_KEYS.contains(&key) => node.inheritable.get(key),
        _ => None,
    }
}

fn invalid_value(key: &str, reason: impl std::fmt::Display) -> ArborError {
    ArborError::new(
        ErrorCode::Generic,
        format!("invalid value for attribute {key:?}: {reason}"),
    )
}

/// Writes a builtin attribute. `Ok(false)` means the key is not builtin and
/// should go to the user attribute map instead.
pub fn set_builtin(
    node: &mut CypressNode,
    key: &str,
    value: Value,
    now: DateTime<Utc>,
) -> ArborResult<bool> {
    let Some(descriptor) = find_descriptor(key) else {
        return Ok(false);
    };
    if !descriptor.writable {
        return Err(ArborError::new(
            ErrorCode::Generic,
            format!("attribute {key:?} is not writable"),
        ));
    }

    match key {
        "account" => {
            let account: String =
                serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            node.account = Some(account);
        }
        "opaque" => {
            node.opaque = serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
        }
        "acl" => {
            let entries: Vec<Ace> =
                serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            node.acd.entries = entries;
        }
        "inherit_acl" => {
            node.acd.inherit = serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
        }
        "expiration_time" => {
            if node.parent_id.is_none() {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    "cannot set expiration time for the root",
                ));
            }
            let time: DateTime<Utc> =
                serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            node.expiration_time = Some(time);
        }
        "primary_medium" => {
            let medium: String =
                serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            set_primary_medium(node, medium)?;
        }
        "media" => {
            let media: std::collections::BTreeMap<String, MediumPolicy> =
                serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            validate_media(&media, node.inheritable.primary_medium.as_deref())?;
            if let Some(primary) = node.inheritable.primary_medium.as_deref()
                && let Some(policy) = media.get(primary)
            {
                node.inheritable.replication_factor = Some(policy.replication_factor);
            }
            node.inheritable.media = Some(media);
        }
        "replication_factor" => {
            let factor: u32 = serde_json::from_value(value).map_err(|e| invalid_value(key, e))?;
            if factor == 0 {
                return Err(invalid_value(key, "replication factor must be positive"));
            }
            node.inheritable.replication_factor = Some(factor);
            if let (Some(media), Some(primary)) = (
                node.inheritable.media.as_mut(),
                node.inheritable.primary_medium.as_deref(),
            ) && let Some(policy) = media.get_mut(primary)
            {
                policy.replication_factor = factor;
            }
        }
        _ if INHERITABLE_ATTRIBUTE_KEYS.contains(&key) => {
            node.inheritable.set(key, value)?;
        }
        _ => unreachable!("descriptor table and handler set diverged for {key}"),
    }

    node.touch_attributes(now);
    Ok(true)
}

/// Switching the primary medium; moving to a medium absent from the media
/// map relocates the old primary's replication there.
fn set_primary_medium(node: &mut CypressNode, new_primary: String) -> ArborResult<()> {
    if node.inheritable.primary_medium.as_deref() == Some(new_primary.as_str()) {
        return Ok(());
    }
    if let Some(media) = node.inheritable.media.as_mut() {
        if !media.contains_key(&new_primary) {
            let old_policy = node
                .inheritable
                .primary_medium
                .as_deref()
                .and_then(|old| media.remove(old));
            match old_policy {
                Some(policy) => {
                    media.insert(new_primary.clone(), policy);
                }
                None => {
                    return Err(ArborError::new(
                        ErrorCode::Generic,
                        format!("medium {new_primary:?} has zero replication on this node"),
                    ));
                }
            }
        }
        let media = media.clone();
        validate_media(&media, Some(new_primary.as_str()))?;
        if let Some(policy) = media.get(&new_primary) {
            node.inheritable.replication_factor = Some(policy.replication_factor);
        }
    }
    node.inheritable.primary_medium = Some(new_primary);
    Ok(())
}

fn validate_media(
    media: &std::collections::BTreeMap<String, MediumPolicy>,
    primary: Option<&str>,
) -> ArborResult<()> {
    for (name, policy) in media {
        if policy.replication_factor == 0 {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("medium {name:?} has zero replication factor"),
            ));
        }
    }
    if let Some(primary) = primary
        && !media.contains_key(primary)
    {
        return Err(ArborError::new(
            ErrorCode::Generic,
            format!("cannot remove primary medium {primary:?}"),
        ));
    }
    Ok(())
}

/// Removes a builtin attribute. `Ok(false)` means the key is not builtin.
pub fn remove_builtin(node: &mut CypressNode, key: &str, now: DateTime<Utc>) -> ArborResult<bool> {
    let Some(descriptor) = find_descriptor(key) else {
        return Ok(false);
    };
    if !descriptor.removable {
        return Err(ArborError::new(
            ErrorCode::Generic,
            format!("attribute {key:?} cannot be removed"),
        ));
    }

    let removed = match key {
        "expiration_time" => node.expiration_time.take().is_some(),
        _ if INHERITABLE_ATTRIBUTE_KEYS.contains(&key) => {
            if key == "media" || key == "primary_medium" {
                // Cannot orphan the replication description halfway.
                node.inheritable.remove("media");
                node.inheritable.remove("primary_medium");
                true
            } else {
                node.inheritable.remove(key)
            }
        }
        _ => false,
    };
    if removed {
        node.touch_attributes(now);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypress::node::NodeContent;
    use arbor_types::{ObjectId, ObjectKind};
    use std::collections::BTreeMap;

    fn test_node(parented: bool) -> CypressNode {
        let now = Utc::now();
        let id = ObjectId::new(ObjectKind::TableNode, CellTag(1), 1, 0);
        let parent = parented.then(|| ObjectId::new(ObjectKind::MapNode, CellTag(1), 2, 0));
        CypressNode::new(id, parent, NodeContent::Table, now)
    }

    fn context() -> AttributeContext {
        AttributeContext {
            cell_tag: CellTag(1),
            lock_count: 0,
            lock_mode: None,
        }
    }

    #[test]
    fn test_readonly_attributes_reject_writes() {
        let mut node = test_node(true);
        let err = set_builtin(&mut node, "revision", Value::from(9), Utc::now()).unwrap_err();
        assert!(err.message.contains("not writable"));
    }

    #[test]
    fn test_unknown_key_falls_through() {
        let mut node = test_node(true);
        assert!(!set_builtin(&mut node, "my_annotation", Value::from(1), Utc::now()).unwrap());
        assert!(!remove_builtin(&mut node, "my_annotation", Utc::now()).unwrap());
        assert_eq!(get_builtin(&node, &context(), "my_annotation"), None);
    }

    #[test]
    fn test_get_type_and_lock_context() {
        let node = test_node(true);
        assert_eq!(
            get_builtin(&node, &context(), "type"),
            Some(serde_json::json!("table_node"))
        );
        let ctx = AttributeContext {
            cell_tag: CellTag(1),
            lock_count: 3,
            lock_mode: Some(LockMode::Shared),
        };
        assert_eq!(get_builtin(&node, &ctx, "lock_count"), Some(serde_json::json!(3)));
        assert_eq!(get_builtin(&node, &ctx, "lock_mode"), Some(serde_json::json!("shared")));
    }

    #[test]
    fn test_expiration_time_rejected_on_root() {
        let mut root = test_node(false);
        let err = set_builtin(
            &mut root,
            "expiration_time",
            serde_json::json!("2026-01-01T00:00:00Z"),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.message.contains("root"));
    }

    #[test]
    fn test_replication_factor_tracks_primary_medium_policy() {
        let mut node = test_node(true);
        let mut media = BTreeMap::new();
        media.insert(
            "default".to_string(),
            MediumPolicy {
                replication_factor: 3,
                data_parts_only: false,
            },
        );
        set_builtin(&mut node, "primary_medium", serde_json::json!("default"), Utc::now()).unwrap();
        set_builtin(&mut node, "media", serde_json::to_value(&media).unwrap(), Utc::now()).unwrap();
        assert_eq!(node.inheritable.replication_factor, Some(3));

        set_builtin(&mut node, "replication_factor", serde_json::json!(5), Utc::now()).unwrap();
        assert_eq!(
            node.inheritable.media.as_ref().unwrap()["default"].replication_factor,
            5
        );
    }

    #[test]
    fn test_zero_replication_media_rejected() {
        let mut node = test_node(true);
        let mut media = BTreeMap::new();
        media.insert(
            "ssd".to_string(),
            MediumPolicy {
                replication_factor: 0,
                data_parts_only: false,
            },
        );
        let err = set_builtin(&mut node, "media", serde_json::to_value(&media).unwrap(), Utc::now())
            .unwrap_err();
        assert!(err.message.contains("zero replication"));
    }

    #[test]
    fn test_primary_medium_switch_moves_replication() {
        let mut node = test_node(true);
        let mut media = BTreeMap::new();
        media.insert(
            "default".to_string(),
            MediumPolicy {
                replication_factor: 4,
                data_parts_only: false,
            },
        );
        set_builtin(&mut node, "primary_medium", serde_json::json!("default"), Utc::now()).unwrap();
        set_builtin(&mut node, "media", serde_json::to_value(&media).unwrap(), Utc::now()).unwrap();

        // "ssd" has no entry: switching moves the old primary's policy over.
        set_builtin(&mut node, "primary_medium", serde_json::json!("ssd"), Utc::now()).unwrap();
        let media = node.inheritable.media.as_ref().unwrap();
        assert!(!media.contains_key("default"));
        assert_eq!(media["ssd"].replication_factor, 4);
        assert_eq!(node.inheritable.primary_medium.as_deref(), Some("ssd"));
    }

    #[test]
    fn test_acl_set_and_inherit_flag() {
        let mut node = test_node(true);
        let acl = serde_json::json!([
            {"action": "allow", "subjects": ["alice"], "permissions": ["read", "write"]}
        ]);
        set_builtin(&mut node, "acl", acl, Utc::now()).unwrap();
        set_builtin(&mut node, "inherit_acl", Value::Bool(false), Utc::now()).unwrap();
        assert_eq!(node.acd.entries.len(), 1);
        assert!(!node.acd.inherit);
        assert_eq!(
            get_builtin(&node, &context(), "inherit_acl"),
            Some(Value::Bool(false))
        );
    }

    #[test]
    fn test_remove_media_clears_primary_too() {
        let mut node = test_node(true);
        let mut media = BTreeMap::new();
        media.insert(
            "default".to_string(),
            MediumPolicy {
                replication_factor: 3,
                data_parts_only: false,
            },
        );
        set_builtin(&mut node, "primary_medium", serde_json::json!("default"), Utc::now()).unwrap();
        set_builtin(&mut node, "media", serde_json::to_value(&media).unwrap(), Utc::now()).unwrap();
        remove_builtin(&mut node, "media", Utc::now()).unwrap();
        assert!(node.inheritable.media.is_none());
        assert!(node.inheritable.primary_medium.is_none());
    }
}
