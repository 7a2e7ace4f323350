//! Cross-cell messaging seams.
//!
//! Masters of different cells communicate through an ordered postbox: every
//! message posted to a destination cell is delivered there in posting order.
//! The transport itself is external; this module defines the message set and
//! the [`CellPostbox`] trait the transaction manager talks to, plus an
//! in-memory implementation used by tests and single-process wiring.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_types::{ArborResult, CellTag, NodeId, ObjectId, Timestamp, TransactionId};

/// A mutation posted from one master cell to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellMessage {
    StartForeignTransaction {
        id: TransactionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<TransactionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        upload: bool,
    },
    CommitTransaction {
        id: TransactionId,
        commit_timestamp: Timestamp,
    },
    AbortTransaction {
        id: TransactionId,
        force: bool,
    },
    /// Absence note: the id was requested for replication but is dead here.
    NoteNoSuchTransaction {
        id: TransactionId,
    },
    /// A boomerang returning to its originating cell.
    ReturnBoomerang {
        wave_id: ObjectId,
        wave_size: u32,
        mutation: Value,
    },
}

/// Ordered delivery of [`CellMessage`]s to destination cells.
pub trait CellPostbox: Send + Sync {
    fn post(&self, destination: CellTag, message: CellMessage);
}

/// In-memory postbox: queues per destination, drained by the test harness or
/// by a single-process multicell loop.
#[derive(Debug, Default)]
pub struct InMemoryPostbox {
    queues: Mutex<BTreeMap<CellTag, VecDeque<CellMessage>>>,
}

impl InMemoryPostbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all messages pending for a destination, in order.
    pub fn drain(&self, destination: CellTag) -> Vec<CellMessage> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .remove(&destination)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Messages pending for a destination, without draining.
    pub fn pending(&self, destination: CellTag) -> Vec<CellMessage> {
        let queues = self.queues.lock().unwrap();
        queues
            .get(&destination)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, destination: CellTag) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(&destination).map_or(0, VecDeque::len)
    }
}

impl CellPostbox for InMemoryPostbox {
    fn post(&self, destination: CellTag, message: CellMessage) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(destination).or_default().push_back(message);
    }
}

/// A postbox that drops everything; for single-cell setups.
#[derive(Debug, Default)]
pub struct NullPostbox;

impl CellPostbox for NullPostbox {
    fn post(&self, _destination: CellTag, _message: CellMessage) {}
}

/// Reads of attributes owned by another cell are forwarded through this
/// seam. Implementations translate resolve and no-such-transaction failures
/// into `Ok(None)` at the call site, not here.
pub trait ExternalCellClient: Send + Sync {
    fn get_attribute(
        &self,
        cell: CellTag,
        node_id: NodeId,
        transaction_id: Option<TransactionId>,
        key: &str,
    ) -> ArborResult<Option<Value>>;
}
