//! The cypress tree: a versioned, transactional, path-addressed metadata
//! namespace.

/// Access control descriptors and permission evaluation.
pub mod acl;

/// Builtin attribute descriptors and handlers.
pub mod attributes;

/// The lock table: modes, keys, conflicts, pending promotion.
pub mod locks;

/// Node kinds, content payloads, inheritable attributes.
pub mod node;

/// Tree path parsing (`/`, `@attribute`, `&`).
pub mod path;

/// The verb surface (get/set/remove/list/create/copy/move/link/exists/
/// lock/unlock) implemented on [`crate::master::Master`].
pub mod service;

/// Versioned node storage: trunk entities, branches, merges.
pub mod tree;
