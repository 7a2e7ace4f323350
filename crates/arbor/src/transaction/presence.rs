//! Transaction presence cache.
//!
//! Records, for foreign transaction ids, whether they have been observed
//! replicated to this cell, and for finished ones, when they finished.
//! Reads consult it to avoid cross-cell round trips and snapshot scans for
//! negative lookups. Native and upload transaction ids are never cached.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use arbor_types::{CellTag, TransactionId};

#[derive(Debug)]
pub struct PresenceCache {
    cell_tag: CellTag,
    replicated: BTreeMap<TransactionId, DateTime<Utc>>,
    recently_finished: BTreeMap<TransactionId, DateTime<Utc>>,
    /// How long finished ids stay cached.
    finished_ttl: Duration,
    started: bool,
}

impl PresenceCache {
    pub fn new(cell_tag: CellTag, finished_ttl: std::time::Duration) -> Self {
        PresenceCache {
            cell_tag,
            replicated: BTreeMap::new(),
            recently_finished: BTreeMap::new(),
            finished_ttl: Duration::from_std(finished_ttl).unwrap_or(Duration::MAX),
            started: false,
        }
    }

    fn should_cache(&self, id: TransactionId) -> bool {
        if id.kind().is_upload_transaction() {
            return false;
        }
        id.cell_tag() != self.cell_tag
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.replicated.clear();
        self.recently_finished.clear();
    }

    pub fn set_replicated(&mut self, id: TransactionId, now: DateTime<Utc>) {
        if self.started && self.should_cache(id) {
            self.replicated.insert(id, now);
        }
    }

    pub fn set_recently_finished(&mut self, id: TransactionId, now: DateTime<Utc>) {
        if self.started && self.should_cache(id) {
            self.replicated.remove(&id);
            self.recently_finished.insert(id, now);
        }
    }

    pub fn is_replicated(&self, id: TransactionId) -> bool {
        self.replicated.contains_key(&id)
    }

    pub fn is_recently_finished(&self, id: TransactionId) -> bool {
        self.recently_finished.contains_key(&id)
    }

    pub fn replicated_count(&self) -> usize {
        self.replicated.len()
    }

    pub fn recently_finished_count(&self) -> usize {
        self.recently_finished.len()
    }

    /// Evicts finished entries older than the TTL.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        let ttl = self.finished_ttl;
        self.recently_finished
            .retain(|_, finished_at| now - *finished_at < ttl);
    }

    pub fn clear(&mut self) {
        self.replicated.clear();
        self.recently_finished.clear();
    }
}
