//! The transaction manager.
//!
//! Owns the lifecycle of every transaction on this cell: start (native,
//! upload, foreign), nesting, prerequisites and dependents, replication and
//! externalization to other cells, two-phase prepare, commit, abort, and the
//! common finish path. Also owns the refcounted timestamp holders and the
//! boomerang tracker, and drives the cypress tree's branch merges on
//! transaction end.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use arbor_types::{
    ArborError, ArborResult, CellTag, ErrorCode, IdGenerator, NULL_TIMESTAMP, ObjectKind,
    Timestamp, TransactionId, externalize_transaction_id, invalid_transaction_state,
    no_such_transaction, prerequisite_check_failed,
};

use crate::config::TransactionManagerConfig;
use crate::cypress::tree::CypressTree;
use crate::multicell::{CellMessage, CellPostbox};

use super::boomerang::BoomerangTracker;
use super::lease::LeaseTracker;
use super::presence::PresenceCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    TransientCommitPrepared,
    PersistentCommitPrepared,
    TransientAbortPrepared,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Transient states read as Active across restarts and epochs.
    pub fn persistent(self) -> TransactionState {
        match self {
            TransactionState::TransientCommitPrepared
            | TransactionState::TransientAbortPrepared => TransactionState::Active,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::TransientCommitPrepared => "transient_commit_prepared",
            TransactionState::PersistentCommitPrepared => "persistent_commit_prepared",
            TransactionState::TransientAbortPrepared => "transient_abort_prepared",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        }
    }
}

/// A typed action registered with a transaction; handlers run it on
/// prepare, commit, and abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionAction {
    pub action_type: String,
    pub payload: Value,
}

/// Per-action-type callbacks.
pub trait TransactionActionHandler: Send + Sync {
    fn action_type(&self) -> &str;

    fn prepare(&self, _id: TransactionId, _payload: &Value, _persistent: bool) -> ArborResult<()> {
        Ok(())
    }

    fn commit(&self, _id: TransactionId, _payload: &Value) {}

    fn abort(&self, _id: TransactionId, _payload: &Value) {}
}

/// An object exported to another cell under this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedObject {
    pub object_id: arbor_types::ObjectId,
    pub destination_cell_tag: CellTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub nested: BTreeSet<TransactionId>,
    pub state: TransactionState,
    pub depth: u32,
    pub upload: bool,
    pub foreign: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub owner: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<TransactionId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependents: BTreeSet<TransactionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicated_to: Vec<CellTag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub externalized_to: Vec<CellTag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub staged_node_ids: Vec<arbor_types::NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_node_ids: Vec<arbor_types::NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported_objects: Vec<ExportedObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imported_objects: Vec<arbor_types::ObjectId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<TransactionAction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Transaction {
    pub fn persistent_state(&self) -> TransactionState {
        self.state.persistent()
    }

    pub fn is_replicated_to(&self, cell: CellTag) -> bool {
        self.replicated_to.contains(&cell)
    }

    pub fn is_externalized_to(&self, cell: CellTag) -> bool {
        self.externalized_to.contains(&cell)
    }

    fn invalid_state_error(&self) -> ArborError {
        invalid_transaction_state(self.id, self.state.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampHolder {
    pub timestamp: Timestamp,
    pub ref_count: i64,
}

/// Options for starting a native transaction.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub parent: Option<TransactionId>,
    pub prerequisites: Vec<TransactionId>,
    pub replicate_to: Vec<CellTag>,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub attributes: BTreeMap<String, Value>,
    pub hint_id: Option<TransactionId>,
    pub upload: bool,
    pub user: String,
}

impl StartOptions {
    pub fn new(user: impl Into<String>) -> Self {
        StartOptions {
            parent: None,
            prerequisites: Vec::new(),
            replicate_to: Vec::new(),
            timeout: None,
            deadline: None,
            title: None,
            attributes: BTreeMap::new(),
            hint_id: None,
            upload: false,
            user: user.into(),
        }
    }

    pub fn with_parent(mut self, parent: TransactionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<TransactionId>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_replicate_to(mut self, cells: Vec<CellTag>) -> Self {
        self.replicate_to = cells;
        self
    }
}

/// Outcome of a bulk `replicate_transactions` request.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplicationSummary {
    pub posted: Vec<TransactionId>,
    pub skipped: Vec<TransactionId>,
    pub missing: Vec<TransactionId>,
}

impl ReplicationSummary {
    pub fn sync_implied(&self) -> bool {
        !self.posted.is_empty()
    }
}

pub struct TransactionManager {
    cell_tag: CellTag,
    config: TransactionManagerConfig,
    transactions: BTreeMap<TransactionId, Transaction>,
    native: BTreeSet<TransactionId>,
    native_topmost: BTreeSet<TransactionId>,
    timestamp_holders: BTreeMap<TransactionId, TimestampHolder>,
    pub presence: PresenceCache,
    pub boomerangs: BoomerangTracker,
    pub leases: LeaseTracker,
    is_leader: bool,
    action_handlers: Vec<Arc<dyn TransactionActionHandler>>,
}

impl TransactionManager {
    pub fn new(cell_tag: CellTag, config: TransactionManagerConfig) -> Self {
        let mut presence = PresenceCache::new(cell_tag, config.recently_finished_ttl);
        presence.start();
        TransactionManager {
            cell_tag,
            config,
            transactions: BTreeMap::new(),
            native: BTreeSet::new(),
            native_topmost: BTreeSet::new(),
            timestamp_holders: BTreeMap::new(),
            presence,
            boomerangs: BoomerangTracker::new(),
            leases: LeaseTracker::new(),
            is_leader: true,
            action_handlers: Vec::new(),
        }
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn register_action_handler(&mut self, handler: Arc<dyn TransactionActionHandler>) {
        self.action_handlers.push(handler);
    }

    pub fn get(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    pub fn get_or_err(&self, id: TransactionId) -> ArborResult<&Transaction> {
        self.transactions.get(&id).ok_or_else(|| no_such_transaction(id))
    }

    pub fn exists(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn native_topmost(&self) -> &BTreeSet<TransactionId> {
        &self.native_topmost
    }

    pub fn native_transactions(&self) -> &BTreeSet<TransactionId> {
        &self.native
    }

    /// The ancestor chain of a transaction, deepest first, self included.
    pub fn chain_of(&self, id: TransactionId) -> ArborResult<Vec<TransactionId>> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let transaction = self.get_or_err(id)?;
            chain.push(id);
            current = transaction.parent;
        }
        Ok(chain)
    }

    /// Whether `ancestor` is a proper ancestor of `descendant`.
    pub fn is_ancestor(&self, ancestor: TransactionId, descendant: TransactionId) -> bool {
        let mut current = self
            .transactions
            .get(&descendant)
            .and_then(|transaction| transaction.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.transactions.get(&id).and_then(|transaction| transaction.parent);
        }
        false
    }

    fn validate_generic_start(&self, parent: Option<TransactionId>) -> ArborResult<()> {
        if let Some(parent_id) = parent {
            let parent = self.get_or_err(parent_id)?;
            if parent.upload {
                return Err(ArborError::new(
                    ErrorCode::UploadTransactionCannotHaveNested,
                    "failed to start a transaction nested in an upload transaction",
                )
                .with_attr("upload_transaction_id", parent_id));
            }
        }
        Ok(())
    }

    fn validate_native_start(
        &self,
        parent: Option<TransactionId>,
        prerequisites: &[TransactionId],
    ) -> ArborResult<()> {
        self.validate_generic_start(parent)?;

        if let Some(parent_id) = parent
            && parent_id.cell_tag() != self.cell_tag
        {
            return Err(ArborError::new(
                ErrorCode::ForeignParentTransaction,
                "parent transaction is foreign",
            )
            .with_attr("parent_transaction_id", parent_id)
            .with_attr("parent_transaction_cell_tag", parent_id.cell_tag())
            .with_attr("expected_cell_tag", self.cell_tag));
        }

        for &prerequisite in prerequisites {
            if prerequisite.cell_tag() != self.cell_tag {
                return Err(ArborError::new(
                    ErrorCode::ForeignPrerequisiteTransaction,
                    "prerequisite transaction is foreign",
                )
                .with_attr("prerequisite_transaction_id", prerequisite)
                .with_attr("prerequisite_transaction_cell_tag", prerequisite.cell_tag())
                .with_attr("expected_cell_tag", self.cell_tag));
            }
        }
        Ok(())
    }

    fn validate_prerequisite(&self, id: TransactionId) -> ArborResult<()> {
        let Some(prerequisite) = self.transactions.get(&id) else {
            return Err(prerequisite_check_failed(id, "is missing"));
        };
        if prerequisite.persistent_state() != TransactionState::Active {
            return Err(prerequisite_check_failed(
                id,
                &format!("is in {:?} state", prerequisite.state.as_str()),
            ));
        }
        Ok(())
    }

    /// Starts a native transaction.
    pub fn start_transaction(
        &mut self,
        options: StartOptions,
        id_generator: &mut IdGenerator,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<TransactionId> {
        self.validate_native_start(options.parent, &options.prerequisites)?;
        for &prerequisite in &options.prerequisites {
            self.validate_prerequisite(prerequisite)?;
        }
        self.do_start_transaction(options, id_generator, postbox, now)
    }

    /// Applies a `start foreign transaction` message from another cell.
    pub fn start_foreign_transaction(
        &mut self,
        id: TransactionId,
        parent_id: Option<TransactionId>,
        title: Option<String>,
        upload: bool,
        id_generator: &mut IdGenerator,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<TransactionId> {
        if let Some(parent_id) = parent_id
            && !self.exists(parent_id)
        {
            return Err(ArborError::new(
                ErrorCode::NoSuchTransaction,
                "failed to start foreign transaction: parent transaction not found",
            )
            .with_attr("transaction_id", id)
            .with_attr("parent_transaction_id", parent_id));
        }
        if self.exists(id) {
            // Replication is idempotent per destination; a duplicate start
            // message is harmless.
            return Ok(id);
        }
        let mut options = StartOptions::new("scheduler");
        options.parent = parent_id;
        options.title = title;
        options.upload = upload;
        options.hint_id = Some(id);
        self.validate_generic_start(parent_id)?;
        self.do_start_transaction(options, id_generator, postbox, now)
    }

    fn do_start_transaction(
        &mut self,
        options: StartOptions,
        id_generator: &mut IdGenerator,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<TransactionId> {
        let mut depth = 0;
        if let Some(parent_id) = options.parent {
            let parent = self.get_or_err(parent_id)?;
            if parent.persistent_state() != TransactionState::Active {
                return Err(parent.invalid_state_error());
            }
            if parent.depth >= self.config.max_transaction_depth {
                return Err(ArborError::new(
                    ErrorCode::TransactionDepthLimitReached,
                    "transaction depth limit reached",
                )
                .with_attr("limit", self.config.max_transaction_depth));
            }
            depth = parent.depth + 1;
        }

        let kind = match (options.upload, options.parent.is_some()) {
            (true, true) => ObjectKind::UploadNestedTransaction,
            (true, false) => ObjectKind::UploadTransaction,
            (false, true) => ObjectKind::NestedTransaction,
            (false, false) => ObjectKind::Transaction,
        };
        let id = match options.hint_id.filter(|hint| !hint.is_null()) {
            Some(hint) => hint,
            None => id_generator.generate(kind),
        };
        if self.transactions.contains_key(&id) {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!("transaction id {id} is already in use"),
            ));
        }

        let native = id.cell_tag() == self.cell_tag;
        let timeout = if native {
            options
                .timeout
                .map(|timeout| timeout.min(self.config.max_transaction_timeout))
        } else {
            None
        };
        let deadline = if native { options.deadline } else { None };

        let transaction = Transaction {
            id,
            parent: options.parent,
            nested: BTreeSet::new(),
            state: TransactionState::Active,
            depth,
            upload: options.upload,
            foreign: !native,
            timeout,
            deadline,
            title: options.title.clone(),
            owner: options.user.clone(),
            start_time: now,
            prerequisites: options.prerequisites.clone(),
            dependents: BTreeSet::new(),
            replicated_to: Vec::new(),
            externalized_to: Vec::new(),
            staged_node_ids: Vec::new(),
            removed_node_ids: Vec::new(),
            exported_objects: Vec::new(),
            imported_objects: Vec::new(),
            actions: Vec::new(),
            attributes: options.attributes,
        };
        self.transactions.insert(id, transaction);

        if let Some(parent_id) = options.parent {
            self.transactions
                .get_mut(&parent_id)
                .expect("validated above")
                .nested
                .insert(id);
        }
        if native {
            self.native.insert(id);
            if options.parent.is_none() {
                self.native_topmost.insert(id);
            }
        }
        for &prerequisite in &options.prerequisites {
            // Duplicates are fine; prerequisite lists may repeat ids.
            if let Some(prerequisite) = self.transactions.get_mut(&prerequisite) {
                prerequisite.dependents.insert(id);
            }
        }

        if self.is_leader && native {
            self.leases
                .register(id, options.parent, timeout, deadline, now);
        }

        let mut replicate_to = options.replicate_to;
        replicate_to.retain(|&cell| cell != id.cell_tag());
        if !replicate_to.is_empty() {
            if options.upload {
                self.transactions.get_mut(&id).expect("just inserted").replicated_to =
                    replicate_to.clone();
            } else {
                for &cell in &replicate_to {
                    self.replicate_to_cell(id, cell, postbox)?;
                }
            }
        }

        self.presence.set_replicated(id, now);

        debug!(
            transaction = %id,
            parent = ?options.parent,
            prerequisites = ?options.prerequisites,
            replicated_to = ?replicate_to,
            timeout = ?timeout,
            user = %options.user,
            title = ?options.title,
            "transaction started"
        );
        Ok(id)
    }

    /// Replicates (native) or externalizes (foreign) the transaction and
    /// its not-yet-sent ancestors to the destination cell. Returns the id
    /// the destination knows the transaction by.
    pub fn replicate_to_cell(
        &mut self,
        id: TransactionId,
        destination: CellTag,
        postbox: &dyn CellPostbox,
    ) -> ArborResult<TransactionId> {
        let transaction = self.get_or_err(id)?;
        if transaction.upload {
            return Ok(id);
        }
        let should_externalize = transaction.foreign;

        let chain = self.chain_of(id)?;
        let mut to_send = Vec::new();
        for &current in &chain {
            let transaction = self.transactions.get_mut(&current).expect("chain is alive");
            let state = transaction.persistent_state();
            if state == TransactionState::Committed || state == TransactionState::Aborted {
                warn!(
                    transaction = %id,
                    ancestor = %current,
                    state = state.as_str(),
                    "unexpected transaction state encountered while replicating"
                );
            }
            if should_externalize {
                if transaction.is_externalized_to(destination) {
                    break;
                }
                transaction.externalized_to.push(destination);
            } else {
                if transaction.is_replicated_to(destination) {
                    break;
                }
                transaction.replicated_to.push(destination);
            }
            to_send.push(current);
        }

        // Parents strictly before children.
        to_send.reverse();
        for current in to_send {
            let transaction = &self.transactions[&current];
            let effective_id;
            let effective_parent;
            if should_externalize {
                effective_id = externalize_transaction_id(current, self.cell_tag);
                effective_parent = transaction
                    .parent
                    .map(|parent| externalize_transaction_id(parent, self.cell_tag));
                debug!(
                    transaction = %current,
                    externalized = %effective_id,
                    destination = %destination,
                    "externalizing transaction"
                );
            } else {
                effective_id = current;
                effective_parent = transaction.parent;
                debug!(transaction = %current, destination = %destination, "replicating transaction");
            }
            postbox.post(destination, CellMessage::StartForeignTransaction {
                id: effective_id,
                parent_id: effective_parent,
                title: transaction.title.clone(),
                upload: transaction.upload,
            });
        }

        Ok(if should_externalize {
            externalize_transaction_id(id, self.cell_tag)
        } else {
            id
        })
    }

    /// Bulk replication used by cross-cell dependency setup, optionally
    /// carrying a boomerang envelope forwarded to the destination.
    pub fn replicate_transactions(
        &mut self,
        ids: &[TransactionId],
        destination: CellTag,
        boomerang: Option<CellMessage>,
        postbox: &dyn CellPostbox,
    ) -> ArborResult<ReplicationSummary> {
        let mut summary = ReplicationSummary::default();
        for &id in ids {
            if id.cell_tag() != self.cell_tag {
                return Err(ArborError::new(
                    ErrorCode::Generic,
                    format!("transaction {id} is not native to this cell"),
                ));
            }
            if !self.exists(id) {
                postbox.post(destination, CellMessage::NoteNoSuchTransaction { id });
                summary.missing.push(id);
                continue;
            }
            if self.get_or_err(id)?.is_replicated_to(destination) {
                summary.skipped.push(id);
                continue;
            }
            let replicated = self.replicate_to_cell(id, destination, postbox)?;
            debug_assert_eq!(replicated, id);
            summary.posted.push(id);
        }

        if let Some(envelope) = boomerang {
            postbox.post(destination, envelope);
        }

        debug!(
            destination = %destination,
            posted = ?summary.posted,
            skipped = ?summary.skipped,
            missing = ?summary.missing,
            "transactions replicated"
        );
        Ok(summary)
    }

    fn check_user(&self, transaction: &Transaction, user: Option<&str>) -> ArborResult<()> {
        if let Some(user) = user
            && user != transaction.owner
            && user != "root"
        {
            return Err(arbor_types::authorization_error(
                user,
                "write",
                &format!("#{}", transaction.id),
            ));
        }
        Ok(())
    }

    /// First phase of two-phase commit.
    pub fn prepare_commit(
        &mut self,
        id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
        prerequisite_ids: &[TransactionId],
        user: Option<&str>,
    ) -> ArborResult<()> {
        let chain = self.chain_of(id)?;
        for &current in &chain {
            let transaction = self.get_or_err(current)?;
            let state = if persistent {
                transaction.persistent_state()
            } else {
                transaction.state
            };
            if state != TransactionState::Active {
                return Err(transaction.invalid_state_error());
            }
        }

        let transaction = self.get_or_err(id)?;
        self.check_user(transaction, user)?;

        for &prerequisite in prerequisite_ids {
            self.validate_prerequisite(prerequisite)?;
        }

        self.run_prepare_actions(id, persistent)?;

        let transaction = self.transactions.get_mut(&id).expect("checked above");
        transaction.state = if persistent {
            TransactionState::PersistentCommitPrepared
        } else {
            TransactionState::TransientCommitPrepared
        };
        debug!(transaction = %id, persistent, prepare_timestamp, "transaction commit prepared");
        Ok(())
    }

    pub fn prepare_abort(
        &mut self,
        id: TransactionId,
        force: bool,
        user: Option<&str>,
    ) -> ArborResult<()> {
        let transaction = self.get_or_err(id)?;
        if transaction.state != TransactionState::Active && !force {
            return Err(transaction.invalid_state_error());
        }
        if transaction.state != TransactionState::Active {
            return Ok(());
        }
        self.check_user(transaction, user)?;
        self.transactions.get_mut(&id).expect("checked above").state =
            TransactionState::TransientAbortPrepared;
        debug!(transaction = %id, "transaction abort prepared");
        Ok(())
    }

    /// User-facing commit; foreign replicas commit only via cell messages.
    pub fn commit_transaction(
        &mut self,
        id: TransactionId,
        commit_timestamp: Timestamp,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        let transaction = self.get_or_err(id)?;
        if transaction.foreign {
            return Err(ArborError::new(
                ErrorCode::InvalidTransactionState,
                format!("cannot commit foreign transaction {id} on this cell"),
            )
            .with_attr("transaction_id", id)
            .with_attr("native_cell_tag", id.cell_tag()));
        }
        self.commit_impl(id, commit_timestamp, cypress, postbox, now)
    }

    fn commit_impl(
        &mut self,
        id: TransactionId,
        commit_timestamp: Timestamp,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        let transaction = self.get_or_err(id)?;
        let state = transaction.persistent_state();
        if state == TransactionState::Committed {
            debug!(transaction = %id, "transaction is already committed");
            return Ok(());
        }
        if state != TransactionState::Active && state != TransactionState::PersistentCommitPrepared
        {
            return Err(transaction.invalid_state_error());
        }

        if self.timestamp_holders.contains_key(&id) {
            self.set_timestamp_holder_timestamp(id, commit_timestamp);
        }

        let nested: Vec<TransactionId> = self.transactions[&id].nested.iter().copied().collect();
        for nested_id in nested {
            debug!(transaction = %nested_id, parent = %id, "aborting nested transaction on parent commit");
            self.abort_impl(nested_id, true, None, cypress, postbox, now)?;
        }
        debug_assert!(self.transactions[&id].nested.is_empty());

        let transaction = &self.transactions[&id];
        for &cell in &transaction.replicated_to {
            postbox.post(cell, CellMessage::CommitTransaction {
                id,
                commit_timestamp,
            });
        }
        if !transaction.externalized_to.is_empty() {
            let externalized_id = externalize_transaction_id(id, self.cell_tag);
            for &cell in &transaction.externalized_to {
                postbox.post(cell, CellMessage::CommitTransaction {
                    id: externalized_id,
                    commit_timestamp,
                });
            }
        }

        if self.is_leader {
            self.leases.unregister(id);
        }

        self.transactions.get_mut(&id).expect("present").state = TransactionState::Committed;
        self.run_commit_actions(id);

        // Promote exported/imported object records to the parent, or let
        // the imports drop at the root.
        let (parent, exported, imported, staged, removed) = {
            let transaction = self.transactions.get_mut(&id).expect("present");
            (
                transaction.parent,
                std::mem::take(&mut transaction.exported_objects),
                std::mem::take(&mut transaction.imported_objects),
                std::mem::take(&mut transaction.staged_node_ids),
                std::mem::take(&mut transaction.removed_node_ids),
            )
        };

        match parent {
            Some(parent_id) => {
                let parent = self.transactions.get_mut(&parent_id).expect("parent is alive");
                parent.exported_objects.extend(exported);
                parent.imported_objects.extend(imported);
                parent.staged_node_ids.extend(staged);
                parent.removed_node_ids.extend(removed);

                cypress.commit_branches(id, Some(parent_id), now);
                cypress.locks.promote_locks_to_parent(id, parent_id);
            }
            None => {
                cypress.commit_branches(id, None, now);
                cypress.locks.release_transaction_locks(id);
                let transactions = &self.transactions;
                cypress.locks.promote_pending(&|holder, requester| {
                    is_ancestor_in(transactions, holder, requester)
                });
                cypress.sweep_unreachable(&removed);
                cypress.sweep_unreachable(&staged);
            }
        }

        let owner = self.transactions[&id].owner.clone();
        self.finish_transaction(id, cypress, postbox, now)?;

        debug!(transaction = %id, user = %owner, commit_timestamp, "transaction committed");
        Ok(())
    }

    /// Aborts a transaction. `user` of `None` skips the permission check.
    pub fn abort_transaction(
        &mut self,
        id: TransactionId,
        force: bool,
        user: Option<&str>,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        self.abort_impl(id, force, user, cypress, postbox, now)
    }

    fn abort_impl(
        &mut self,
        id: TransactionId,
        force: bool,
        user: Option<&str>,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        let transaction = self.get_or_err(id)?;
        let state = transaction.persistent_state();
        if state == TransactionState::Aborted {
            return Ok(());
        }
        if (state == TransactionState::PersistentCommitPrepared && !force)
            || state == TransactionState::Committed
        {
            return Err(transaction.invalid_state_error());
        }
        self.check_user(transaction, user)?;

        let nested: Vec<TransactionId> = transaction.nested.iter().copied().collect();
        for nested_id in nested {
            self.abort_impl(nested_id, true, None, cypress, postbox, now)?;
        }
        debug_assert!(self.transactions[&id].nested.is_empty());

        let transaction = &self.transactions[&id];
        for &cell in &transaction.replicated_to {
            postbox.post(cell, CellMessage::AbortTransaction { id, force: true });
        }
        if !transaction.externalized_to.is_empty() {
            let externalized_id = externalize_transaction_id(id, self.cell_tag);
            for &cell in &transaction.externalized_to {
                postbox.post(cell, CellMessage::AbortTransaction {
                    id: externalized_id,
                    force: true,
                });
            }
        }

        if self.is_leader {
            self.leases.unregister(id);
        }

        self.transactions.get_mut(&id).expect("present").state = TransactionState::Aborted;
        self.run_abort_actions(id);

        // Exported objects unexport; imported ones unref. The records just
        // drop here since the object manager is external.
        let staged = {
            let transaction = self.transactions.get_mut(&id).expect("present");
            transaction.exported_objects.clear();
            transaction.imported_objects.clear();
            transaction.removed_node_ids.clear();
            std::mem::take(&mut transaction.staged_node_ids)
        };

        cypress.abort_branches(id);
        cypress.locks.release_transaction_locks(id);
        let transactions = &self.transactions;
        cypress.locks.promote_pending(&|holder, requester| {
            is_ancestor_in(transactions, holder, requester)
        });
        cypress.sweep_unreachable(&staged);

        let owner = self.transactions[&id].owner.clone();
        self.finish_transaction(id, cypress, postbox, now)?;

        debug!(transaction = %id, user = %owner, force, "transaction aborted");
        Ok(())
    }

    /// Common end-of-life path shared by commit and abort.
    fn finish_transaction(
        &mut self,
        id: TransactionId,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        let (parent, prerequisites, dependents) = {
            let transaction = self.transactions.get_mut(&id).expect("finishing a live transaction");
            transaction.deadline = None;
            (
                transaction.parent.take(),
                std::mem::take(&mut transaction.prerequisites),
                std::mem::take(&mut transaction.dependents),
            )
        };

        if let Some(parent_id) = parent
            && let Some(parent) = self.transactions.get_mut(&parent_id)
        {
            parent.nested.remove(&id);
        }

        if self.native.remove(&id) && parent.is_none() {
            self.native_topmost.remove(&id);
        }

        for prerequisite in prerequisites {
            if let Some(prerequisite) = self.transactions.get_mut(&prerequisite) {
                prerequisite.dependents.remove(&id);
            }
        }

        self.presence.set_recently_finished(id, now);
        self.transactions.remove(&id);

        // Prerequisite failure propagates: still-active dependents abort.
        for dependent in dependents {
            let Some(transaction) = self.transactions.get(&dependent) else {
                continue;
            };
            if transaction.persistent_state() != TransactionState::Active {
                continue;
            }
            debug!(
                dependent = %dependent,
                prerequisite = %id,
                "aborting dependent transaction"
            );
            self.abort_impl(dependent, true, None, cypress, postbox, now)?;
        }

        Ok(())
    }

    /// Renews the lease; unknown ids are a no-op.
    pub fn ping_transaction(&mut self, id: TransactionId, ping_ancestors: bool, now: DateTime<Utc>) {
        self.leases.ping(id, ping_ancestors, now);
    }

    pub fn set_transaction_timeout(&mut self, id: TransactionId, timeout: Duration) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        transaction.timeout = Some(timeout);
        self.leases.set_timeout(id, timeout);
        Ok(())
    }

    /// Force-aborts every Active transaction with an expired lease.
    pub fn process_expired_leases(
        &mut self,
        now: DateTime<Utc>,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
    ) -> Vec<TransactionId> {
        let mut aborted = Vec::new();
        for id in self.leases.expired(now) {
            let Some(transaction) = self.transactions.get(&id) else {
                self.leases.unregister(id);
                continue;
            };
            if transaction.state != TransactionState::Active {
                continue;
            }
            debug!(transaction = %id, "aborting expired transaction");
            if let Err(error) = self.abort_impl(id, true, None, cypress, postbox, now) {
                warn!(transaction = %id, %error, "error aborting expired transaction");
                continue;
            }
            aborted.push(id);
        }
        aborted
    }

    /// Appends typed actions to an Active transaction.
    pub fn register_transaction_actions(
        &mut self,
        id: TransactionId,
        actions: Vec<TransactionAction>,
    ) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        if transaction.persistent_state() != TransactionState::Active {
            return Err(transaction.invalid_state_error());
        }
        for action in actions {
            debug!(transaction = %id, action_type = %action.action_type, "transaction action registered");
            transaction.actions.push(action);
        }
        Ok(())
    }

    fn run_prepare_actions(&self, id: TransactionId, persistent: bool) -> ArborResult<()> {
        let transaction = &self.transactions[&id];
        for action in &transaction.actions {
            for handler in &self.action_handlers {
                if handler.action_type() == action.action_type {
                    handler.prepare(id, &action.payload, persistent)?;
                }
            }
        }
        Ok(())
    }

    fn run_commit_actions(&self, id: TransactionId) {
        let transaction = &self.transactions[&id];
        for action in &transaction.actions {
            for handler in &self.action_handlers {
                if handler.action_type() == action.action_type {
                    handler.commit(id, &action.payload);
                }
            }
        }
    }

    fn run_abort_actions(&self, id: TransactionId) {
        let transaction = &self.transactions[&id];
        for action in &transaction.actions {
            for handler in &self.action_handlers {
                if handler.action_type() == action.action_type {
                    handler.abort(id, &action.payload);
                }
            }
        }
    }

    /// Records a node created (staged) under the transaction.
    pub fn stage_node(&mut self, id: TransactionId, node: arbor_types::NodeId) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        transaction.staged_node_ids.push(node);
        Ok(())
    }

    /// Records a subtree unlinked under the transaction; it is destroyed on
    /// topmost commit.
    pub fn record_removed_node(
        &mut self,
        id: TransactionId,
        node: arbor_types::NodeId,
    ) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        transaction.removed_node_ids.push(node);
        Ok(())
    }

    pub fn export_object(
        &mut self,
        id: TransactionId,
        object_id: arbor_types::ObjectId,
        destination_cell_tag: CellTag,
    ) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        transaction.exported_objects.push(ExportedObject {
            object_id,
            destination_cell_tag,
        });
        Ok(())
    }

    pub fn import_object(
        &mut self,
        id: TransactionId,
        object_id: arbor_types::ObjectId,
    ) -> ArborResult<()> {
        let transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| no_such_transaction(id))?;
        transaction.imported_objects.push(object_id);
        Ok(())
    }

    // Timestamp holders.

    pub fn create_or_ref_timestamp_holder(&mut self, id: TransactionId) {
        self.timestamp_holders
            .entry(id)
            .and_modify(|holder| holder.ref_count += 1)
            .or_insert(TimestampHolder {
                timestamp: NULL_TIMESTAMP,
                ref_count: 1,
            });
    }

    pub fn set_timestamp_holder_timestamp(&mut self, id: TransactionId, timestamp: Timestamp) {
        if let Some(holder) = self.timestamp_holders.get_mut(&id) {
            holder.timestamp = timestamp;
        }
    }

    pub fn timestamp_holder_timestamp(&self, id: TransactionId) -> Timestamp {
        self.timestamp_holders
            .get(&id)
            .map_or(NULL_TIMESTAMP, |holder| holder.timestamp)
    }

    pub fn unref_timestamp_holder(&mut self, id: TransactionId) {
        if let Some(holder) = self.timestamp_holders.get_mut(&id) {
            holder.ref_count -= 1;
            if holder.ref_count == 0 {
                self.timestamp_holders.remove(&id);
            }
        }
    }

    /// Applies a message posted by another cell. A completed boomerang wave
    /// returns its stored mutation for the caller to resume.
    pub fn apply_cell_message(
        &mut self,
        message: CellMessage,
        id_generator: &mut IdGenerator,
        cypress: &mut CypressTree,
        postbox: &dyn CellPostbox,
        now: DateTime<Utc>,
    ) -> ArborResult<Option<Value>> {
        match message {
            CellMessage::StartForeignTransaction {
                id,
                parent_id,
                title,
                upload,
            } => {
                self.start_foreign_transaction(
                    id,
                    parent_id,
                    title,
                    upload,
                    id_generator,
                    postbox,
                    now,
                )?;
                Ok(None)
            }
            CellMessage::CommitTransaction {
                id,
                commit_timestamp,
            } => {
                self.commit_impl(id, commit_timestamp, cypress, postbox, now)?;
                Ok(None)
            }
            CellMessage::AbortTransaction { id, force } => {
                self.abort_impl(id, force, None, cypress, postbox, now)?;
                Ok(None)
            }
            CellMessage::NoteNoSuchTransaction { id } => {
                self.presence.set_recently_finished(id, now);
                Ok(None)
            }
            CellMessage::ReturnBoomerang {
                wave_id,
                wave_size,
                // The envelope carries the mutation too, but the issuing
                // side trusts its own copy in the tracker.
                mutation: _,
            } => Ok(self.boomerangs.process_returned(wave_id, wave_size)),
        }
    }

    /// Leader epoch start: recreate leases for live transactions.
    pub fn on_leader_active(&mut self, now: DateTime<Utc>) {
        self.is_leader = true;
        for (id, transaction) in &self.transactions {
            if !transaction.foreign
                && matches!(
                    transaction.state,
                    TransactionState::Active | TransactionState::PersistentCommitPrepared
                )
            {
                self.leases.register(
                    *id,
                    transaction.parent,
                    transaction.timeout,
                    transaction.deadline,
                    now,
                );
            }
        }
    }

    /// Leadership loss: drop leases, reset transient prepare states.
    pub fn on_stop_leading(&mut self) {
        self.is_leader = false;
        self.leases.clear();
        for transaction in self.transactions.values_mut() {
            transaction.state = transaction.state.persistent();
        }
    }

    // Snapshot plumbing.

    pub fn transactions(&self) -> &BTreeMap<TransactionId, Transaction> {
        &self.transactions
    }

    pub fn timestamp_holders(&self) -> &BTreeMap<TransactionId, TimestampHolder> {
        &self.timestamp_holders
    }

    /// Rebuilds a manager from snapshot state, reconstructing the derived
    /// native/topmost indices and reseeding the presence cache.
    pub fn restore(
        cell_tag: CellTag,
        config: TransactionManagerConfig,
        transactions: BTreeMap<TransactionId, Transaction>,
        timestamp_holders: BTreeMap<TransactionId, TimestampHolder>,
        boomerangs: BoomerangTracker,
        now: DateTime<Utc>,
    ) -> Self {
        let mut manager = TransactionManager::new(cell_tag, config);
        manager.transactions = transactions;
        manager.timestamp_holders = timestamp_holders;
        manager.boomerangs = boomerangs;
        for (id, transaction) in &manager.transactions {
            if !transaction.foreign {
                manager.native.insert(*id);
                if transaction.parent.is_none() {
                    manager.native_topmost.insert(*id);
                }
            }
        }
        let ids: Vec<TransactionId> = manager.transactions.keys().copied().collect();
        for id in ids {
            manager.presence.set_replicated(id, now);
        }
        manager.on_leader_active(now);
        manager
    }
}

fn is_ancestor_in(
    transactions: &BTreeMap<TransactionId, Transaction>,
    ancestor: TransactionId,
    descendant: TransactionId,
) -> bool {
    let mut current = transactions
        .get(&descendant)
        .and_then(|transaction| transaction.parent);
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = transactions.get(&id).and_then(|transaction| transaction.parent);
    }
    false
}
