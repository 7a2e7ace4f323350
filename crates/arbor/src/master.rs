//! The per-cell master: cypress tree + transaction manager + cross-cell
//! plumbing under one roof.
//!
//! All mutating entry points take `&mut self`, so a `Master` hosted on the
//! automaton serializes every state transition by construction. The verb
//! surface (get/set/create/...) lives in [`crate::cypress::service`]; this
//! module owns construction, the transaction facade, and message pumping
//! between cells.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use arbor_types::{
    ArborResult, CellTag, IdGenerator, Timestamp, TransactionId, invalid_transaction_state,
};

use crate::config::ArborConfig;
use crate::cypress::tree::CypressTree;
use crate::multicell::{CellMessage, CellPostbox, ExternalCellClient, NullPostbox};
use crate::transaction::manager::{
    ReplicationSummary, StartOptions, TransactionAction, TransactionManager, TransactionState,
};

pub struct Master {
    pub config: ArborConfig,
    pub id_generator: IdGenerator,
    pub cypress: CypressTree,
    pub transactions: TransactionManager,
    pub postbox: Arc<dyn CellPostbox>,
    pub external_client: Option<Arc<dyn ExternalCellClient>>,
}

impl Master {
    pub fn new(cell_tag: CellTag, config: ArborConfig, postbox: Arc<dyn CellPostbox>) -> Self {
        let mut id_generator = IdGenerator::new(cell_tag);
        let cypress = CypressTree::new(&mut id_generator, Utc::now());
        let transactions =
            TransactionManager::new(cell_tag, config.transaction_manager.clone());
        Master {
            config,
            id_generator,
            cypress,
            transactions,
            postbox,
            external_client: None,
        }
    }

    /// A single-cell master with no outbound replication.
    pub fn single_cell(cell_tag: CellTag, config: ArborConfig) -> Self {
        Master::new(cell_tag, config, Arc::new(NullPostbox))
    }

    pub fn cell_tag(&self) -> CellTag {
        self.transactions.cell_tag()
    }

    pub fn set_external_client(&mut self, client: Arc<dyn ExternalCellClient>) {
        self.external_client = Some(client);
    }

    /// Transaction ancestor chain for a verb context, deepest first. Write
    /// verbs additionally require the transaction to be Active.
    pub(crate) fn chain(&self, transaction: Option<TransactionId>) -> ArborResult<Vec<TransactionId>> {
        match transaction {
            None => Ok(Vec::new()),
            Some(id) => self.transactions.chain_of(id),
        }
    }

    pub(crate) fn active_chain(
        &self,
        transaction: Option<TransactionId>,
    ) -> ArborResult<Vec<TransactionId>> {
        let chain = self.chain(transaction)?;
        if let Some(&id) = chain.first() {
            let state = self.transactions.get_or_err(id)?.persistent_state();
            if state != TransactionState::Active {
                return Err(invalid_transaction_state(id, state.as_str()));
            }
        }
        Ok(chain)
    }

    // Transaction facade.

    pub fn start_transaction(&mut self, options: StartOptions) -> ArborResult<TransactionId> {
        self.transactions.start_transaction(
            options,
            &mut self.id_generator,
            self.postbox.as_ref(),
            Utc::now(),
        )
    }

    pub fn commit_transaction(
        &mut self,
        id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> ArborResult<()> {
        self.transactions.commit_transaction(
            id,
            commit_timestamp,
            &mut self.cypress,
            self.postbox.as_ref(),
            Utc::now(),
        )
    }

    pub fn abort_transaction(
        &mut self,
        id: TransactionId,
        force: bool,
        user: Option<&str>,
    ) -> ArborResult<()> {
        self.transactions.abort_transaction(
            id,
            force,
            user,
            &mut self.cypress,
            self.postbox.as_ref(),
            Utc::now(),
        )
    }

    pub fn prepare_commit(
        &mut self,
        id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
        prerequisites: &[TransactionId],
        user: Option<&str>,
    ) -> ArborResult<()> {
        self.transactions
            .prepare_commit(id, persistent, prepare_timestamp, prerequisites, user)
    }

    pub fn ping_transaction(&mut self, id: TransactionId, ping_ancestors: bool) {
        self.transactions
            .ping_transaction(id, ping_ancestors, Utc::now());
    }

    pub fn register_transaction_actions(
        &mut self,
        id: TransactionId,
        actions: Vec<TransactionAction>,
    ) -> ArborResult<()> {
        self.transactions.register_transaction_actions(id, actions)
    }

    pub fn replicate_transactions(
        &mut self,
        ids: &[TransactionId],
        destination: CellTag,
        boomerang: Option<CellMessage>,
    ) -> ArborResult<ReplicationSummary> {
        self.transactions
            .replicate_transactions(ids, destination, boomerang, self.postbox.as_ref())
    }

    /// Applies one message from another cell; completed boomerang waves
    /// surface their mutation.
    pub fn apply_cell_message(&mut self, message: CellMessage) -> ArborResult<Option<Value>> {
        self.transactions.apply_cell_message(
            message,
            &mut self.id_generator,
            &mut self.cypress,
            self.postbox.as_ref(),
            Utc::now(),
        )
    }

    /// Periodic housekeeping: expired leases abort, presence cache evicts,
    /// stuck boomerang waves die.
    pub fn housekeep(&mut self, now: DateTime<Utc>) -> Vec<TransactionId> {
        let aborted = self.transactions.process_expired_leases(
            now,
            &mut self.cypress,
            self.postbox.as_ref(),
        );
        self.transactions.presence.evict(now);
        let stuck_age = self.config.transaction_manager.stuck_boomerang_wave_age;
        let threshold = now
            - chrono::Duration::from_std(stuck_age).unwrap_or(chrono::Duration::zero());
        self.transactions.boomerangs.remove_stuck_waves(threshold);
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicell::InMemoryPostbox;

    /// Delivers every message queued for `destination` into that master.
    pub(crate) fn pump(postbox: &InMemoryPostbox, destination: &mut Master) {
        let cell = destination.cell_tag();
        loop {
            let messages = postbox.drain(cell);
            if messages.is_empty() {
                return;
            }
            for message in messages {
                destination
                    .apply_cell_message(message)
                    .expect("cell message must apply");
            }
        }
    }

    #[test]
    fn test_two_cell_replication_and_commit() {
        let postbox = Arc::new(InMemoryPostbox::new());
        let mut cell_a = Master::new(CellTag(1), ArborConfig::default(), postbox.clone());
        let mut cell_b = Master::new(CellTag(2), ArborConfig::default(), postbox.clone());

        let id = cell_a
            .start_transaction(
                StartOptions::new("alice").with_replicate_to(vec![CellTag(2)]),
            )
            .unwrap();
        pump(&postbox, &mut cell_b);

        let replica = cell_b.transactions.get(id).expect("replicated");
        assert!(replica.foreign);
        assert_eq!(replica.state, TransactionState::Active);

        cell_a.commit_transaction(id, 77).unwrap();
        pump(&postbox, &mut cell_b);
        assert!(!cell_b.transactions.exists(id));
        assert!(cell_b.transactions.presence.is_recently_finished(id));
    }

    #[test]
    fn test_housekeeping_aborts_expired_and_notifies_replicas() {
        let postbox = Arc::new(InMemoryPostbox::new());
        let mut cell_a = Master::new(CellTag(1), ArborConfig::default(), postbox.clone());
        let mut cell_b = Master::new(CellTag(2), ArborConfig::default(), postbox.clone());

        let id = cell_a
            .start_transaction(
                StartOptions::new("alice")
                    .with_timeout(std::time::Duration::from_secs(5))
                    .with_replicate_to(vec![CellTag(2)]),
            )
            .unwrap();
        pump(&postbox, &mut cell_b);
        assert!(cell_b.transactions.exists(id));

        let later = Utc::now() + chrono::Duration::seconds(6);
        let aborted = cell_a.housekeep(later);
        assert_eq!(aborted, vec![id]);

        pump(&postbox, &mut cell_b);
        assert!(!cell_b.transactions.exists(id));
    }
}
