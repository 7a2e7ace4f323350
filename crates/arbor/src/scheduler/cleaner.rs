//! The operations cleaner.
//!
//! Finished operations are submitted here; each analysis tick decides, from
//! newest to oldest, which ones the retention budget keeps in the tree and
//! which ones go to the archive. Archival writes batches transactionally to
//! the tabular store, retrying with jittered sleeps and raising an alert
//! when the queue backs up; a hard watermark temporarily disables
//! archivation altogether. Archived operations then move to the removal
//! queue, which drops their tree nodes in sub-batches, skipping (and
//! recycling) locked ones. A separate periodic task ships accumulated
//! operation alert events to the archive.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use arbor_types::{ArborError, ArborResult, ErrorCode, OperationId};
use arbor_retry::jittered_between;

use crate::automaton::CancelableContext;
use crate::config::CleanerConfig;

use super::archive::{
    ALERT_EVENTS_MIN_VERSION, ALIASES_TABLE_MIN_VERSION, ArchiveRequest, ArchiveStore,
    ArchiveTable, OperationAlertEvent, build_operation_aliases_row, build_ordered_by_id_row,
    build_ordered_by_start_time_row, max_row_value_weight,
};
use super::operation::OperationState;

/// Scheduler-level alerts raised by the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulerAlertType {
    OperationsArchivation,
    OperationAlertArchivation,
}

/// Alert sink; `None` clears the alert.
pub trait CleanerHost: Send + Sync {
    fn set_scheduler_alert(&self, alert_type: SchedulerAlertType, error: Option<ArborError>);
}

/// Narrow view of the metadata tree for operation node cleanup.
#[async_trait::async_trait]
pub trait OperationNodeClient: Send + Sync {
    /// `@lock_count` per operation node; missing nodes count as unlocked.
    async fn get_lock_counts(
        &self,
        ids: &[OperationId],
    ) -> ArborResult<BTreeMap<OperationId, u64>>;

    /// Recursive removal; one result per requested id.
    async fn remove_operations(
        &self,
        ids: &[OperationId],
    ) -> Vec<(OperationId, ArborResult<()>)>;
}

/// Exported pipeline gauges; atomics so observers read them off-thread.
#[derive(Debug, Default)]
pub struct CleanerCounters {
    pub submitted: AtomicI64,
    pub archive_pending: AtomicI64,
    pub remove_pending: AtomicI64,
    pub archived_total: AtomicI64,
    pub removed_total: AtomicI64,
    pub archive_errors: AtomicI64,
    pub remove_errors: AtomicI64,
    pub enqueued_alert_events: AtomicI64,
}

pub struct OperationsCleaner {
    config: CleanerConfig,
    enabled: bool,
    archivation_enabled: bool,
    archivation_disabled_until: Option<DateTime<Utc>>,
    /// Earliest-archival-deadline index over submitted operations.
    archive_deadline_index: BTreeMap<(DateTime<Utc>, OperationId), ()>,
    operations: BTreeMap<OperationId, ArchiveRequest>,
    archive_queue: VecDeque<OperationId>,
    remove_queue: VecDeque<OperationId>,
    alert_event_queue: VecDeque<OperationAlertEvent>,
    last_alert_event_send: DateTime<Utc>,
    counters: Arc<CleanerCounters>,
    archive: Arc<dyn ArchiveStore>,
    nodes: Arc<dyn OperationNodeClient>,
    host: Arc<dyn CleanerHost>,
}

impl OperationsCleaner {
    pub fn new(
        config: CleanerConfig,
        archive: Arc<dyn ArchiveStore>,
        nodes: Arc<dyn OperationNodeClient>,
        host: Arc<dyn CleanerHost>,
    ) -> Self {
        let enabled = config.enable;
        let archivation_enabled = config.enable_operation_archivation;
        OperationsCleaner {
            config,
            enabled,
            archivation_enabled,
            archivation_disabled_until: None,
            archive_deadline_index: BTreeMap::new(),
            operations: BTreeMap::new(),
            archive_queue: VecDeque::new(),
            remove_queue: VecDeque::new(),
            alert_event_queue: VecDeque::new(),
            last_alert_event_send: Utc::now(),
            counters: Arc::new(CleanerCounters::default()),
            archive,
            nodes,
            host,
        }
    }

    pub fn counters(&self) -> Arc<CleanerCounters> {
        self.counters.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_archivation_enabled(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.archivation_enabled
            && self
                .archivation_disabled_until
                .is_none_or(|until| now >= until)
    }

    /// Applies a config update, starting or stopping the pipelines.
    pub fn update_config(&mut self, config: CleanerConfig) {
        let was_enabled = self.enabled;
        self.enabled = config.enable;
        self.archivation_enabled = config.enable_operation_archivation;
        self.config = config;

        if was_enabled && !self.enabled {
            self.archive_deadline_index.clear();
            self.operations.clear();
            self.archive_queue.clear();
            self.remove_queue.clear();
            self.counters.archive_pending.store(0, Ordering::Relaxed);
            self.counters.remove_pending.store(0, Ordering::Relaxed);
            info!("operations cleaner stopped");
        } else if !was_enabled && self.enabled {
            info!("operations cleaner started");
        }
        if !self.archivation_enabled {
            self.archivation_disabled_until = None;
            self.host
                .set_scheduler_alert(SchedulerAlertType::OperationsArchivation, None);
        }
        self.truncate_alert_events();
    }

    /// Accepts a finished operation for eventual archival and removal.
    pub fn submit_for_archivation(&mut self, request: ArchiveRequest) {
        if !self.enabled {
            return;
        }
        let id = request.id;
        // The scheduler and the tree fetch path may both report the same
        // operation; the first submission wins.
        if self.operations.contains_key(&id) {
            return;
        }
        let deadline = request.finish_time
            + chrono::Duration::from_std(self.config.clean_delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.archive_deadline_index.insert((deadline, id), ());
        self.operations.insert(id, request);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(operation = %id, %deadline, "operation submitted for archivation");
    }

    /// Queues an operation node for removal without archiving it.
    pub fn submit_for_removal(&mut self, id: OperationId) {
        if !self.enabled {
            return;
        }
        self.enqueue_for_removal(id);
        debug!(operation = %id, "operation submitted for removal");
    }

    fn enqueue_for_removal(&mut self, id: OperationId) {
        self.counters.remove_pending.fetch_add(1, Ordering::Relaxed);
        self.remove_queue.push_back(id);
    }

    fn enqueue_for_archivation(&mut self, id: OperationId) {
        self.counters.archive_pending.fetch_add(1, Ordering::Relaxed);
        self.archive_queue.push_back(id);
    }

    /// One analysis pass: walks the due entries from newest to oldest and
    /// keeps an operation only while the retention budget allows.
    pub fn analyze_operations(&mut self, now: DateTime<Utc>) {
        if !self.enabled || self.archive_deadline_index.is_empty() {
            return;
        }
        info!(
            submitted = self.archive_deadline_index.len(),
            "analyzing operations submitted for archivation"
        );

        let mut retained_count: usize = 0;
        let mut per_user: BTreeMap<String, usize> = BTreeMap::new();

        let due: Vec<(DateTime<Utc>, OperationId)> = self
            .archive_deadline_index
            .range(..=(now, OperationId { hi: u64::MAX, lo: u64::MAX }))
            .map(|(key, ())| *key)
            .collect();

        for &(deadline, id) in due.iter().rev() {
            let request = &self.operations[&id];
            let max_age =
                chrono::Duration::from_std(self.config.max_operation_age).unwrap_or_else(|_| chrono::Duration::zero());

            let can_archive = retained_count >= self.config.hard_retained_operation_count
                || now - request.finish_time > max_age
                || (!request.operation_type.has_user_jobs()
                    && request.state == OperationState::Completed)
                || per_user
                    .get(&request.authenticated_user)
                    .is_some_and(|count| *count >= self.config.max_operation_count_per_user)
                || (retained_count >= self.config.soft_retained_operation_count
                    && request.state != OperationState::Failed);

            if can_archive {
                self.archive_deadline_index.remove(&(deadline, id));
                if self.is_archivation_enabled(now) {
                    self.enqueue_for_archivation(id);
                } else {
                    self.operations.remove(&id);
                    self.enqueue_for_removal(id);
                }
            } else {
                retained_count += 1;
                *per_user
                    .entry(self.operations[&id].authenticated_user.clone())
                    .or_default() += 1;
            }
        }

        self.counters
            .submitted
            .store(self.archive_deadline_index.len() as i64, Ordering::Relaxed);
        info!(
            retained = retained_count,
            enqueued = due.len() - retained_count,
            "finished analyzing operations submitted for archivation"
        );
    }

    /// Number of operations still held in memory awaiting archival.
    pub fn retained_count(&self) -> usize {
        self.archive_deadline_index.len()
    }

    pub fn archive_queue_len(&self) -> usize {
        self.archive_queue.len()
    }

    pub fn remove_queue_len(&self) -> usize {
        self.remove_queue.len()
    }

    fn maybe_reenable_archivation(&mut self, now: DateTime<Utc>) {
        if let Some(until) = self.archivation_disabled_until
            && now >= until
        {
            self.archivation_disabled_until = None;
            self.host
                .set_scheduler_alert(SchedulerAlertType::OperationsArchivation, None);
            info!("operations archivation re-enabled");
        }
    }

    fn temporarily_disable_archivation(&mut self, now: DateTime<Utc>) {
        let enable_at = now
            + chrono::Duration::from_std(self.config.archivation_enable_delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.archivation_disabled_until = Some(enable_at);
        self.host.set_scheduler_alert(
            SchedulerAlertType::OperationsArchivation,
            Some(
                ArborError::new(
                    ErrorCode::ArchiveQueueOverflow,
                    "max enqueued operations limit reached; archivation is temporarily disabled",
                )
                .with_attr("enable_time", enable_at.to_rfc3339()),
            ),
        );
        info!(%enable_at, "archivation is temporarily disabled");
    }

    /// Builds and commits the three row families for one batch. Operations
    /// whose heaviest column exceeds the weight limit are skipped with a
    /// warning, never failed.
    async fn try_archive_operations(&self, ids: &[OperationId]) -> ArborResult<()> {
        let version = self.config.archive_version;
        if version < 0 {
            return Err(ArborError::new(
                ErrorCode::ArchiveError,
                "unknown operations archive version",
            ));
        }

        let mut transaction = self.archive.start_transaction().await?;
        debug!(operation_count = ids.len(), "operations archivation transaction started");

        let mut skipped: Vec<OperationId> = Vec::new();
        let mut by_id_rows = Vec::with_capacity(ids.len());
        for &id in ids {
            let request = &self.operations[&id];
            let row = build_ordered_by_id_row(request, version);
            let (weight, column) = max_row_value_weight(&row);
            if weight > self.config.max_archive_value_weight {
                warn!(
                    operation = %id,
                    column = column.unwrap_or("<none>"),
                    weight,
                    limit = self.config.max_archive_value_weight,
                    "operation row violates value data weight, archivation skipped"
                );
                skipped.push(id);
                continue;
            }
            by_id_rows.push(row);
        }
        transaction
            .write_rows(ArchiveTable::OrderedById, by_id_rows)
            .await?;

        let mut by_start_time_rows = Vec::with_capacity(ids.len());
        for &id in ids {
            if skipped.contains(&id) {
                continue;
            }
            by_start_time_rows.push(build_ordered_by_start_time_row(&self.operations[&id], version));
        }
        transaction
            .write_rows(ArchiveTable::OrderedByStartTime, by_start_time_rows)
            .await?;

        if version >= ALIASES_TABLE_MIN_VERSION {
            let alias_rows: Vec<_> = ids
                .iter()
                .filter(|id| !skipped.contains(id))
                .filter_map(|id| build_operation_aliases_row(&self.operations[id]))
                .collect();
            transaction
                .write_rows(ArchiveTable::OperationAliases, alias_rows)
                .await?;
        }

        transaction.commit().await?;
        debug!(operation_count = ids.len(), skipped = skipped.len(), "operations archived");
        Ok(())
    }

    fn update_archivation_alert(&self, inner: Option<&ArborError>) {
        let pending = self.counters.archive_pending.load(Ordering::Relaxed);
        if pending >= self.config.min_operation_count_enqueued_for_alert as i64 {
            let mut alert = ArborError::new(
                ErrorCode::ArchiveError,
                "too many operations in archivation queue",
            )
            .with_attr("pending_count", pending);
            if let Some(inner) = inner {
                alert = alert.with_inner(inner.clone());
            }
            self.host
                .set_scheduler_alert(SchedulerAlertType::OperationsArchivation, Some(alert));
        } else if self.archivation_disabled_until.is_none() {
            self.host
                .set_scheduler_alert(SchedulerAlertType::OperationsArchivation, None);
        }
    }

    /// One archival step: dequeues a batch and tries to commit it. On
    /// failure the batch recycles to the queue head after a jittered sleep,
    /// or archivation disables when the queue passes the hard watermark.
    /// Returns the number of operations handed to removal.
    pub async fn archive_tick(&mut self, now: DateTime<Utc>) -> usize {
        self.maybe_reenable_archivation(now);
        if !self.is_archivation_enabled(now) || self.archive_queue.is_empty() {
            return 0;
        }

        let batch: Vec<OperationId> = {
            let take = self.config.archive_batch_size.min(self.archive_queue.len());
            self.archive_queue.drain(..take).collect()
        };

        match self.try_archive_operations(&batch).await {
            Ok(()) => {
                self.counters
                    .archive_pending
                    .fetch_sub(batch.len() as i64, Ordering::Relaxed);
                self.counters
                    .archived_total
                    .fetch_add(batch.len() as i64, Ordering::Relaxed);
                self.update_archivation_alert(None);
                for id in batch.iter() {
                    self.operations.remove(id);
                    self.enqueue_for_removal(*id);
                }
                batch.len()
            }
            Err(error) => {
                self.counters.archive_errors.fetch_add(1, Ordering::Relaxed);
                let pending = self.counters.archive_pending.load(Ordering::Relaxed);
                let error = ArborError::new(ErrorCode::ArchiveError, "failed to archive operations")
                    .with_attr("pending_count", pending)
                    .with_inner(error);
                warn!(%error, "failed to archive operations");
                self.update_archivation_alert(Some(&error));

                // Recycle the batch for the next attempt.
                for id in batch.into_iter().rev() {
                    self.archive_queue.push_front(id);
                }

                if pending > self.config.max_operation_count_enqueued_for_archival as i64 {
                    self.temporarily_disable_archivation(now);
                } else {
                    let delay = jittered_between(
                        self.config.min_archivation_retry_sleep_delay,
                        self.config.max_archivation_retry_sleep_delay,
                    );
                    tokio::time::sleep(delay).await;
                }
                0
            }
        }
    }

    /// One removal step: fetches lock counts for a batch, removes unlocked
    /// nodes in sub-batches, recycles the rest. Returns the removed count.
    pub async fn remove_tick(&mut self) -> usize {
        if !self.enabled || self.remove_queue.is_empty() {
            return 0;
        }
        let batch: Vec<OperationId> = {
            let take = self.config.remove_batch_size.min(self.remove_queue.len());
            self.remove_queue.drain(..take).collect()
        };
        debug!(operation_count = batch.len(), "removing operations from the tree");

        let mut failed: Vec<OperationId> = Vec::new();
        let mut to_remove: Vec<OperationId> = Vec::new();
        let mut locked_count = 0;

        match self.nodes.get_lock_counts(&batch).await {
            Ok(lock_counts) => {
                for &id in &batch {
                    if lock_counts.get(&id).copied().unwrap_or(0) > 0 {
                        locked_count += 1;
                        failed.push(id);
                    } else {
                        to_remove.push(id);
                    }
                }
            }
            Err(error) => {
                warn!(%error, operation_count = batch.len(), "failed to get lock counts for operations");
                failed = batch.clone();
            }
        }

        let mut removed_count = 0;
        for chunk in to_remove.chunks(self.config.remove_subbatch_size.max(1)) {
            for (id, result) in self.nodes.remove_operations(chunk).await {
                match result {
                    Ok(()) => removed_count += 1,
                    Err(error) => {
                        debug!(operation = %id, %error, "failed to remove finished operation from the tree");
                        failed.push(id);
                    }
                }
            }
        }

        self.counters
            .removed_total
            .fetch_add(removed_count as i64, Ordering::Relaxed);
        self.counters
            .remove_errors
            .fetch_add(failed.len() as i64, Ordering::Relaxed);
        self.counters
            .remove_pending
            .fetch_sub(removed_count as i64, Ordering::Relaxed);

        // Locked or failed ids recycle into the queue.
        for id in failed {
            self.remove_queue.push_back(id);
        }

        debug!(
            removed = removed_count,
            locked = locked_count,
            "finished removing operations from the tree"
        );
        removed_count
    }

    /// Queues one operation alert state change for archival.
    pub fn enqueue_operation_alert_event(&mut self, event: OperationAlertEvent) {
        self.alert_event_queue.push_back(event);
        self.truncate_alert_events();
    }

    fn truncate_alert_events(&mut self) {
        while self.alert_event_queue.len() > self.config.max_enqueued_operation_alert_event_count {
            self.alert_event_queue.pop_front();
        }
        self.counters
            .enqueued_alert_events
            .store(self.alert_event_queue.len() as i64, Ordering::Relaxed);
    }

    /// Ships accumulated alert events: merges them into the per-operation
    /// histories already archived, trimmed to the configured cap.
    pub async fn send_operation_alerts(&mut self, now: DateTime<Utc>) -> ArborResult<()> {
        if self.config.archive_version < ALERT_EVENTS_MIN_VERSION
            || self.alert_event_queue.is_empty()
        {
            self.host
                .set_scheduler_alert(SchedulerAlertType::OperationAlertArchivation, None);
            return Ok(());
        }

        let events_to_send: Vec<OperationAlertEvent> = self.alert_event_queue.drain(..).collect();
        let result = self.do_send_operation_alerts(&events_to_send).await;
        match result {
            Ok(()) => {
                self.last_alert_event_send = now;
                self.host
                    .set_scheduler_alert(SchedulerAlertType::OperationAlertArchivation, None);
                self.truncate_alert_events();
                Ok(())
            }
            Err(error) => {
                let error = ArborError::new(
                    ErrorCode::ArchiveError,
                    "failed to write operation alert events to archive",
                )
                .with_inner(error);
                warn!(%error, "failed to write operation alert events to archive");
                let threshold = chrono::Duration::from_std(
                    self.config.operation_alert_sender_alert_threshold,
                )
                .unwrap_or_else(|_| chrono::Duration::zero());
                if now - self.last_alert_event_send > threshold {
                    self.host.set_scheduler_alert(
                        SchedulerAlertType::OperationAlertArchivation,
                        Some(error.clone()),
                    );
                }
                // Requeue what fits, newest last.
                for event in events_to_send {
                    if self.alert_event_queue.len()
                        >= self.config.max_enqueued_operation_alert_event_count
                    {
                        break;
                    }
                    self.alert_event_queue.push_back(event);
                }
                self.truncate_alert_events();
                Err(error)
            }
        }
    }

    async fn do_send_operation_alerts(
        &self,
        events: &[OperationAlertEvent],
    ) -> ArborResult<()> {
        debug!(event_count = events.len(), "writing operation alert events to archive");

        let mut ids: Vec<OperationId> = events.iter().map(|event| event.operation_id).collect();
        ids.sort();
        ids.dedup();

        let mut histories = self.archive.lookup_alert_events(&ids).await?;
        for event in events {
            let history = histories.entry(event.operation_id).or_default();
            history.push(event.clone());
            while history.len() > self.config.max_alert_event_count_per_operation {
                history.remove(0);
            }
        }

        let mut rows = Vec::with_capacity(histories.len());
        for (id, history) in &histories {
            let mut row = BTreeMap::new();
            row.insert("id_hi".to_string(), Value::from(id.hi));
            row.insert("id_lo".to_string(), Value::from(id.lo));
            row.insert(
                "alert_events".to_string(),
                serde_json::to_value(history).unwrap_or(Value::Null),
            );
            rows.push(row);
        }

        let mut transaction = self.archive.start_transaction().await?;
        transaction
            .write_rows(ArchiveTable::OrderedById, rows)
            .await?;
        transaction.commit().await?;

        debug!(event_count = events.len(), "operation alert events written to archive");
        Ok(())
    }

    /// Introspection blob for operators.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "enable": self.enabled,
            "enable_operation_archivation": self.archivation_enabled,
            "archive_pending": self.counters.archive_pending.load(Ordering::Relaxed),
            "remove_pending": self.counters.remove_pending.load(Ordering::Relaxed),
            "submitted": self.counters.submitted.load(Ordering::Relaxed),
            "enqueued_alert_events": self.counters.enqueued_alert_events.load(Ordering::Relaxed),
        })
    }

    /// Drives the pipelines until the context cancels. Tick cadence follows
    /// the configured analysis period and batch timeouts.
    pub async fn run(cleaner: Arc<tokio::sync::Mutex<Self>>, context: CancelableContext) {
        let (analysis_period, batch_period, alert_period) = {
            let cleaner = cleaner.lock().await;
            (
                cleaner.config.analysis_period,
                cleaner
                    .config
                    .archive_batch_timeout
                    .min(cleaner.config.remove_batch_timeout),
                cleaner.config.operation_alert_event_send_period,
            )
        };
        let mut last_analysis = Utc::now();
        let mut last_alert_send = Utc::now();
        loop {
            if context.is_cancelled() {
                info!("operations cleaner loop cancelled");
                return;
            }
            tokio::time::sleep(batch_period).await;
            let now = Utc::now();
            let mut cleaner = cleaner.lock().await;
            if now - last_analysis
                >= chrono::Duration::from_std(analysis_period).unwrap_or_else(|_| chrono::Duration::zero())
            {
                cleaner.analyze_operations(now);
                last_analysis = now;
            }
            cleaner.archive_tick(now).await;
            cleaner.remove_tick().await;
            if now - last_alert_send
                >= chrono::Duration::from_std(alert_period).unwrap_or_else(|_| chrono::Duration::zero())
            {
                let _ = cleaner.send_operation_alerts(now).await;
                last_alert_send = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::archive::testing::InMemoryArchive;
    use crate::scheduler::operation::{OperationAlertType, OperationType};
    use arbor_types::{CellTag, IdGenerator, ObjectKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        alerts: Mutex<BTreeMap<SchedulerAlertType, Option<ArborError>>>,
    }

    impl RecordingHost {
        fn alert(&self, alert_type: SchedulerAlertType) -> Option<ArborError> {
            self.alerts
                .lock()
                .unwrap()
                .get(&alert_type)
                .cloned()
                .flatten()
        }
    }

    impl CleanerHost for RecordingHost {
        fn set_scheduler_alert(&self, alert_type: SchedulerAlertType, error: Option<ArborError>) {
            self.alerts.lock().unwrap().insert(alert_type, error);
        }
    }

    /// Tree stub: every id exists; lock counts are configurable.
    #[derive(Default)]
    struct FakeNodes {
        lock_counts: Mutex<BTreeMap<OperationId, u64>>,
        removed: Mutex<Vec<OperationId>>,
    }

    #[async_trait::async_trait]
    impl OperationNodeClient for FakeNodes {
        async fn get_lock_counts(
            &self,
            ids: &[OperationId],
        ) -> ArborResult<BTreeMap<OperationId, u64>> {
            let lock_counts = self.lock_counts.lock().unwrap();
            Ok(ids
                .iter()
                .map(|id| (*id, lock_counts.get(id).copied().unwrap_or(0)))
                .collect())
        }

        async fn remove_operations(
            &self,
            ids: &[OperationId],
        ) -> Vec<(OperationId, ArborResult<()>)> {
            let mut removed = self.removed.lock().unwrap();
            ids.iter()
                .map(|id| {
                    removed.push(*id);
                    (*id, Ok(()))
                })
                .collect()
        }
    }

    struct Fixture {
        cleaner: OperationsCleaner,
        archive: InMemoryArchive,
        nodes: Arc<FakeNodes>,
        host: Arc<RecordingHost>,
        id_generator: IdGenerator,
    }

    fn fixture(mutate: impl FnOnce(&mut CleanerConfig)) -> Fixture {
        let mut config = CleanerConfig::default();
        config.clean_delay = std::time::Duration::ZERO;
        config.min_archivation_retry_sleep_delay = std::time::Duration::from_millis(1);
        config.max_archivation_retry_sleep_delay = std::time::Duration::from_millis(2);
        // Everything is archivable by default in tests.
        config.hard_retained_operation_count = 0;
        config.soft_retained_operation_count = 0;
        mutate(&mut config);
        let archive = InMemoryArchive::new();
        let nodes = Arc::new(FakeNodes::default());
        let host = Arc::new(RecordingHost::default());
        Fixture {
            cleaner: OperationsCleaner::new(
                config,
                Arc::new(archive.clone()),
                nodes.clone(),
                host.clone(),
            ),
            archive,
            nodes,
            host,
            id_generator: IdGenerator::new(CellTag(1)),
        }
    }

    fn request(
        id_generator: &mut IdGenerator,
        user: &str,
        state: OperationState,
        operation_type: OperationType,
        finished_ago: chrono::Duration,
    ) -> ArchiveRequest {
        let now = Utc::now();
        ArchiveRequest {
            id: id_generator.generate(ObjectKind::Operation),
            start_time: now - finished_ago - chrono::Duration::minutes(5),
            finish_time: now - finished_ago,
            state,
            authenticated_user: user.to_string(),
            operation_type,
            spec: serde_json::json!({"pool": "p"}),
            result: serde_json::json!({"error": null}),
            events: serde_json::json!([]),
            progress: None,
            brief_progress: None,
            brief_spec: None,
            full_spec: None,
            unrecognized_spec: None,
            alerts: None,
            runtime_parameters: None,
            alias: None,
            slot_index_per_pool_tree: None,
            task_names: None,
            experiment_assignments: None,
            experiment_assignment_names: Vec::new(),
            controller_features: None,
        }
    }

    #[tokio::test]
    async fn test_submit_analyze_archive_remove_pipeline() {
        let mut fx = fixture(|_| {});
        let mut ids = Vec::new();
        for _ in 0..3 {
            let request = request(
                &mut fx.id_generator,
                "alice",
                OperationState::Completed,
                OperationType::Map,
                chrono::Duration::minutes(1),
            );
            ids.push(request.id);
            fx.cleaner.submit_for_archivation(request);
        }

        fx.cleaner.analyze_operations(Utc::now());
        assert_eq!(fx.cleaner.archive_queue_len(), 3);

        let archived = fx.cleaner.archive_tick(Utc::now()).await;
        assert_eq!(archived, 3);
        let mut archived_ids = fx.archive.archived_ids();
        archived_ids.sort();
        ids.sort();
        assert_eq!(archived_ids, ids);
        assert!(!fx.archive.rows(ArchiveTable::OrderedByStartTime).is_empty());

        let removed = fx.cleaner.remove_tick().await;
        assert_eq!(removed, 3);
        assert_eq!(fx.nodes.removed.lock().unwrap().len(), 3);
        assert_eq!(fx.cleaner.remove_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_ignored() {
        let mut fx = fixture(|_| {});
        let request = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        );
        fx.cleaner.submit_for_archivation(request.clone());
        fx.cleaner.submit_for_archivation(request);
        assert_eq!(fx.cleaner.retained_count(), 1);
    }

    #[tokio::test]
    async fn test_retention_keeps_failed_and_recent() {
        let mut fx = fixture(|config| {
            config.hard_retained_operation_count = 10;
            config.soft_retained_operation_count = 1;
            config.max_operation_count_per_user = 10;
        });
        // Newest first in analysis: the failed map op is retained; the
        // completed sort op has no user jobs and archives immediately; the
        // older failed one survives the soft limit because of its state.
        let failed_new = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Failed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        );
        let completed_sort = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Sort,
            chrono::Duration::minutes(2),
        );
        let failed_old = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Failed,
            OperationType::Map,
            chrono::Duration::minutes(3),
        );
        let completed_old = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(4),
        );
        let sort_id = completed_sort.id;
        let completed_old_id = completed_old.id;
        for request in [failed_new, completed_sort, failed_old, completed_old] {
            fx.cleaner.submit_for_archivation(request);
        }

        fx.cleaner.analyze_operations(Utc::now());
        // Retained: both failed ops. Archived: sort (no user jobs +
        // completed) and the old completed map (soft limit exceeded).
        assert_eq!(fx.cleaner.retained_count(), 2);
        assert_eq!(fx.cleaner.archive_queue_len(), 2);

        fx.cleaner.archive_tick(Utc::now()).await;
        let archived = fx.archive.archived_ids();
        assert!(archived.contains(&sort_id));
        assert!(archived.contains(&completed_old_id));
    }

    #[tokio::test]
    async fn test_per_user_cap() {
        let mut fx = fixture(|config| {
            config.hard_retained_operation_count = 100;
            config.soft_retained_operation_count = 100;
            config.max_operation_count_per_user = 2;
        });
        for _ in 0..5 {
            fx.cleaner.submit_for_archivation(request(
                &mut fx.id_generator,
                "bob",
                OperationState::Failed,
                OperationType::Map,
                chrono::Duration::minutes(1),
            ));
        }
        fx.cleaner.analyze_operations(Utc::now());
        assert_eq!(fx.cleaner.retained_count(), 2);
        assert_eq!(fx.cleaner.archive_queue_len(), 3);
    }

    #[tokio::test]
    async fn test_max_age_forces_archival() {
        let mut fx = fixture(|config| {
            config.hard_retained_operation_count = 100;
            config.soft_retained_operation_count = 100;
            config.max_operation_age = std::time::Duration::from_secs(60);
        });
        fx.cleaner.submit_for_archivation(request(
            &mut fx.id_generator,
            "alice",
            OperationState::Failed,
            OperationType::Map,
            chrono::Duration::minutes(10),
        ));
        fx.cleaner.analyze_operations(Utc::now());
        assert_eq!(fx.cleaner.archive_queue_len(), 1);
    }

    #[tokio::test]
    async fn test_archive_failure_recycles_and_alerts() {
        let mut fx = fixture(|config| {
            config.min_operation_count_enqueued_for_alert = 1;
        });
        fx.archive.set_available(false);
        let request = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        );
        fx.cleaner.submit_for_archivation(request);
        fx.cleaner.analyze_operations(Utc::now());

        for _ in 0..3 {
            let archived = fx.cleaner.archive_tick(Utc::now()).await;
            assert_eq!(archived, 0);
            assert_eq!(fx.cleaner.archive_queue_len(), 1);
        }
        let alert = fx
            .host
            .alert(SchedulerAlertType::OperationsArchivation)
            .expect("alert must be set");
        assert_eq!(alert.code, ErrorCode::ArchiveError);
        assert_eq!(fx.cleaner.remove_queue_len(), 0);

        // Storage recovers: the batch archives and the alert clears.
        fx.archive.set_available(true);
        let archived = fx.cleaner.archive_tick(Utc::now()).await;
        assert_eq!(archived, 1);
        assert!(fx.host.alert(SchedulerAlertType::OperationsArchivation).is_none());
        assert_eq!(fx.cleaner.remove_queue_len(), 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_disables_archivation_until_delay() {
        let mut fx = fixture(|config| {
            config.max_operation_count_enqueued_for_archival = 0;
            config.archivation_enable_delay = std::time::Duration::from_secs(60);
        });
        fx.archive.set_available(false);
        fx.cleaner.submit_for_archivation(request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        ));
        let t0 = Utc::now();
        fx.cleaner.analyze_operations(t0);
        fx.cleaner.archive_tick(t0).await;
        assert!(fx.host.alert(SchedulerAlertType::OperationsArchivation).is_some());
        assert!(!fx.cleaner.is_archivation_enabled(t0));

        // Still disabled before the delay elapses, even with storage back.
        fx.archive.set_available(true);
        assert_eq!(fx.cleaner.archive_tick(t0 + chrono::Duration::seconds(30)).await, 0);

        let later = t0 + chrono::Duration::seconds(61);
        let archived = fx.cleaner.archive_tick(later).await;
        assert_eq!(archived, 1);
        assert!(fx.host.alert(SchedulerAlertType::OperationsArchivation).is_none());
    }

    #[tokio::test]
    async fn test_value_weight_violation_skips_operation() {
        let mut fx = fixture(|config| {
            config.max_archive_value_weight = 64;
        });
        let mut heavy = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        );
        heavy.spec = serde_json::json!({"pool": "x".repeat(1000)});
        let light = request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        );
        let light_id = light.id;
        let heavy_id = heavy.id;
        fx.cleaner.submit_for_archivation(heavy);
        fx.cleaner.submit_for_archivation(light);
        fx.cleaner.analyze_operations(Utc::now());
        let archived = fx.cleaner.archive_tick(Utc::now()).await;
        // Both count as handled; only the light one has archive rows.
        assert_eq!(archived, 2);
        assert_eq!(fx.archive.archived_ids(), vec![light_id]);
        // The heavy one is still removed from the tree.
        fx.cleaner.remove_tick().await;
        assert!(fx.nodes.removed.lock().unwrap().contains(&heavy_id));
    }

    #[tokio::test]
    async fn test_locked_operations_recycle_in_remove_queue() {
        let mut fx = fixture(|_| {});
        let locked = fx.id_generator.generate(ObjectKind::Operation);
        let free = fx.id_generator.generate(ObjectKind::Operation);
        fx.nodes.lock_counts.lock().unwrap().insert(locked, 2);
        fx.cleaner.submit_for_removal(locked);
        fx.cleaner.submit_for_removal(free);

        let removed = fx.cleaner.remove_tick().await;
        assert_eq!(removed, 1);
        assert_eq!(fx.cleaner.remove_queue_len(), 1);

        // Once unlocked, the recycled id goes through.
        fx.nodes.lock_counts.lock().unwrap().remove(&locked);
        let removed = fx.cleaner.remove_tick().await;
        assert_eq!(removed, 1);
        assert_eq!(fx.cleaner.remove_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_alert_events_merge_and_trim() {
        let mut fx = fixture(|config| {
            config.max_alert_event_count_per_operation = 2;
        });
        let id = fx.id_generator.generate(ObjectKind::Operation);
        for index in 0..3 {
            fx.cleaner.enqueue_operation_alert_event(OperationAlertEvent {
                operation_id: id,
                alert_type: OperationAlertType::LongAbortedJobs,
                time: Utc::now(),
                error: ArborError::new(ErrorCode::Generic, format!("event {index}")),
            });
        }
        fx.cleaner.send_operation_alerts(Utc::now()).await.unwrap();
        let history = fx.archive.alert_events(id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].error.message, "event 1");
        assert_eq!(history[1].error.message, "event 2");

        // A later send appends to the archived history.
        fx.cleaner.enqueue_operation_alert_event(OperationAlertEvent {
            operation_id: id,
            alert_type: OperationAlertType::LongAbortedJobs,
            time: Utc::now(),
            error: ArborError::new(ErrorCode::Generic, "event 3"),
        });
        fx.cleaner.send_operation_alerts(Utc::now()).await.unwrap();
        let history = fx.archive.alert_events(id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].error.message, "event 3");
    }

    #[tokio::test]
    async fn test_alert_event_failure_requeues() {
        let mut fx = fixture(|_| {});
        let id = fx.id_generator.generate(ObjectKind::Operation);
        fx.cleaner.enqueue_operation_alert_event(OperationAlertEvent {
            operation_id: id,
            alert_type: OperationAlertType::InvalidAcl,
            time: Utc::now(),
            error: ArborError::new(ErrorCode::Generic, "bad acl"),
        });
        fx.archive.set_available(false);
        assert!(fx.cleaner.send_operation_alerts(Utc::now()).await.is_err());
        assert_eq!(
            fx.cleaner
                .counters
                .enqueued_alert_events
                .load(Ordering::Relaxed),
            1
        );

        fx.archive.set_available(true);
        fx.cleaner.send_operation_alerts(Utc::now()).await.unwrap();
        assert_eq!(fx.archive.alert_events(id).len(), 1);
    }

    #[tokio::test]
    async fn test_disable_drops_queues() {
        let mut fx = fixture(|_| {});
        fx.cleaner.submit_for_archivation(request(
            &mut fx.id_generator,
            "alice",
            OperationState::Completed,
            OperationType::Map,
            chrono::Duration::minutes(1),
        ));
        fx.cleaner.analyze_operations(Utc::now());
        assert_eq!(fx.cleaner.archive_queue_len(), 1);

        let mut config = CleanerConfig::default();
        config.enable = false;
        fx.cleaner.update_config(config);
        assert!(!fx.cleaner.is_enabled());
        assert_eq!(fx.cleaner.archive_queue_len(), 0);
        assert_eq!(fx.cleaner.retained_count(), 0);
    }
}
