//! # Arbor
//!
//! A transactional metadata core: a versioned, hierarchical, multicell
//! namespace (the cypress tree), the transaction manager that coordinates
//! visibility across cells, and the scheduler operation lifecycle with its
//! archival cleaner.
//!
//! ## Components
//!
//! - **Cypress tree** — path-addressed nodes with per-node locks
//!   (exclusive / shared-by-child / shared-by-attribute / snapshot),
//!   transaction-local branches merged on commit, inheritable storage
//!   attributes, access control descriptors, and link redirection.
//! - **Transaction manager** — nested transactions with prerequisites and
//!   dependents, replication and externalization to foreign cells,
//!   two-phase prepare/commit/abort, leader-side leases, timestamp holders,
//!   and boomerang tracking for round-tripping mutations.
//! - **Scheduler lifecycle & cleaner** — the operation state machine with
//!   its event log, alerts, and runtime parameters, plus the batched,
//!   retrying archival-to-storage pipeline that evicts finished operation
//!   nodes from the tree.
//!
//! ## Shape
//!
//! A [`master::Master`] owns one cell's tree and transactions; all mutating
//! entry points take `&mut self`, so hosting it on the [`automaton`]
//! executor serializes every state transition. The cleaner runs on tokio
//! and talks to durable storage through the
//! [`scheduler::archive::ArchiveStore`] seam.
//!
//! ## Example
//!
//! ```
//! use arbor::config::ArborConfig;
//! use arbor::master::Master;
//! use arbor::transaction::manager::StartOptions;
//! use arbor_types::{CellTag, ObjectKind};
//! use serde_json::json;
//!
//! let mut master = Master::single_cell(CellTag(1), ArborConfig::default());
//! let txn = master.start_transaction(StartOptions::new("alice")).unwrap();
//! master
//!     .create(ObjectKind::MapNode, "/home", Some(txn), "alice", &Default::default())
//!     .unwrap();
//! master.set("/home/@motd", json!("hello"), Some(txn), "alice").unwrap();
//! master.commit_transaction(txn, 1).unwrap();
//! assert_eq!(master.get("/home/@motd", None, "alice", &Default::default()).unwrap(), json!("hello"));
//! ```

/// Single-threaded mutation executor and cancelable contexts.
pub mod automaton;

/// TOML-backed configuration for all components.
pub mod config;

/// The versioned, transactional metadata tree.
pub mod cypress;

/// The per-cell master facade.
pub mod master;

/// Cross-cell messages and postbox seams.
pub mod multicell;

/// Scheduler operations and the archival cleaner.
pub mod scheduler;

/// Versioned snapshot persistence.
pub mod snapshot;

/// Transactions: lifecycle, leases, presence, boomerangs.
pub mod transaction;

/// Backoff and jitter policies, re-exported from the arbor-retry microcrate.
pub use arbor_retry as retry;

/// Property-based tests for core invariants.
#[cfg(test)]
mod property_tests;
