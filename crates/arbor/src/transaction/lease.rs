//! Leader-side transaction leases.
//!
//! Every Active (or persistently commit-prepared) transaction holds a lease
//! on the leader. Pings renew it; expiry of the timeout since the last ping,
//! or passing the absolute deadline, surfaces the transaction for a forced
//! abort. The tracker is poll-driven: the host sweeps it periodically with
//! the current instant, so tests drive time explicitly.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use arbor_types::TransactionId;

#[derive(Debug, Clone)]
pub struct Lease {
    pub parent: Option<TransactionId>,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub last_ping: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LeaseTracker {
    leases: BTreeMap<TransactionId, Lease>,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: TransactionId,
        parent: Option<TransactionId>,
        timeout: Option<Duration>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        debug!(transaction = %id, ?timeout, ?deadline, "lease registered");
        self.leases.insert(id, Lease {
            parent,
            timeout,
            deadline,
            last_ping: now,
        });
    }

    pub fn unregister(&mut self, id: TransactionId) {
        if self.leases.remove(&id).is_some() {
            debug!(transaction = %id, "lease closed");
        }
    }

    pub fn set_timeout(&mut self, id: TransactionId, timeout: Duration) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.timeout = Some(timeout);
        }
    }

    /// Renews the lease. Pinging an unknown id is a no-op. With
    /// `ping_ancestors`, the whole parent chain renews too.
    pub fn ping(&mut self, id: TransactionId, ping_ancestors: bool, now: DateTime<Utc>) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(lease) = self.leases.get_mut(&id) else {
                return;
            };
            lease.last_ping = now;
            if !ping_ancestors {
                return;
            }
            current = lease.parent;
        }
    }

    pub fn last_ping(&self, id: TransactionId) -> Option<DateTime<Utc>> {
        self.leases.get(&id).map(|lease| lease.last_ping)
    }

    pub fn is_registered(&self, id: TransactionId) -> bool {
        self.leases.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Ids whose timeout or deadline has passed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<TransactionId> {
        self.leases
            .iter()
            .filter(|(_, lease)| {
                let timed_out = lease.timeout.is_some_and(|timeout| {
                    now - lease.last_ping
                        >= chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX)
                });
                let past_deadline = lease.deadline.is_some_and(|deadline| now >= deadline);
                timed_out || past_deadline
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops every lease (on leadership loss).
    pub fn clear(&mut self) {
        self.leases.clear();
    }
}
