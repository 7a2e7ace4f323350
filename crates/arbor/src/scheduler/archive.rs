//! Archive row building and the tabular-storage seam.
//!
//! A finished operation is distilled once into an [`ArchiveRequest`] -
//! either from the in-memory operation or from a tree-attribute snapshot -
//! and that request is the unit shipped to durable storage. Archival writes
//! three row families inside one tablet transaction: `ordered_by_id` (full
//! attributes plus search filter factors), `ordered_by_start_time` (search
//! fields and per-tree pools), and `operation_aliases` for aliased
//! operations. Optional columns are gated by the archive schema version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_types::{ArborError, ArborResult, ErrorCode, OperationId};

use super::operation::{Operation, OperationAlertType, OperationState, OperationType};

/// Minimum schema version carrying the `operation_aliases` table.
pub const ALIASES_TABLE_MIN_VERSION: i32 = 26;

/// Minimum schema version carrying the `alert_events` column.
pub const ALERT_EVENTS_MIN_VERSION: i32 = 43;

/// Self-contained descriptor of one operation to archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub id: OperationId,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub state: OperationState,
    pub authenticated_user: String,
    pub operation_type: OperationType,
    pub spec: Value,
    pub result: Value,
    pub events: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrecognized_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_index_per_pool_tree: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_names: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_assignments: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiment_assignment_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_features: Option<Value>,
}

impl ArchiveRequest {
    /// Extracts the request from a live operation.
    pub fn from_operation(operation: &Operation) -> ArborResult<ArchiveRequest> {
        let finish_time = operation.finish_time().ok_or_else(|| {
            ArborError::new(
                ErrorCode::Generic,
                "cannot archive an operation that has not finished",
            )
            .with_attr("operation_id", operation.id())
        })?;
        Ok(ArchiveRequest {
            id: operation.id(),
            start_time: operation.start_time(),
            finish_time,
            state: operation.state(),
            authenticated_user: operation.authenticated_user().to_string(),
            operation_type: operation.operation_type(),
            spec: operation.spec_node().clone(),
            result: operation.build_result(),
            events: serde_json::to_value(operation.events()).unwrap_or(Value::Null),
            progress: operation.progress().cloned(),
            brief_progress: operation.brief_progress().cloned(),
            brief_spec: None,
            full_spec: None,
            unrecognized_spec: None,
            alerts: Some(operation.build_alerts()),
            runtime_parameters: serde_json::to_value(operation.runtime_parameters()).ok(),
            alias: operation.alias().map(str::to_string),
            slot_index_per_pool_tree: serde_json::to_value(operation.slot_indices()).ok(),
            task_names: serde_json::to_value(operation.task_names()).ok(),
            experiment_assignments: None,
            experiment_assignment_names: operation.experiment_assignment_names().to_vec(),
            controller_features: None,
        })
    }

    /// Attribute keys fetched from the operation node when building the
    /// request from a tree snapshot.
    pub fn attribute_keys() -> &'static [&'static str] {
        &[
            "key",
            "start_time",
            "finish_time",
            "state",
            "authenticated_user",
            "operation_type",
            "progress",
            "brief_progress",
            "spec",
            "brief_spec",
            "result",
            "events",
            "alerts",
            "full_spec",
            "unrecognized_spec",
            "runtime_parameters",
            "alias",
            "slot_index_per_pool_tree",
            "task_names",
            "experiment_assignments",
            "controller_features",
        ]
    }

    /// Builds the request from an operation node's attribute snapshot.
    pub fn from_attributes(attributes: &BTreeMap<String, Value>) -> ArborResult<ArchiveRequest> {
        fn required<'a>(
            attributes: &'a BTreeMap<String, Value>,
            key: &str,
        ) -> ArborResult<&'a Value> {
            attributes.get(key).ok_or_else(|| {
                ArborError::new(
                    ErrorCode::Generic,
                    format!("operation attribute {key:?} is missing"),
                )
            })
        }
        fn parse<T: for<'de> Deserialize<'de>>(key: &str, value: &Value) -> ArborResult<T> {
            serde_json::from_value(value.clone()).map_err(|error| {
                ArborError::new(
                    ErrorCode::Generic,
                    format!("error parsing operation attribute {key:?}: {error}"),
                )
            })
        }

        let spec = required(attributes, "spec")?.clone();
        let alias = spec
            .get("alias")
            .and_then(Value::as_str)
            .map(str::to_string);
        let experiment_assignment_names = attributes
            .get("experiment_assignments")
            .and_then(Value::as_array)
            .map(|assignments| {
                assignments
                    .iter()
                    .filter_map(|assignment| {
                        assignment.get("name").and_then(Value::as_str).map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ArchiveRequest {
            id: parse("key", required(attributes, "key")?)?,
            start_time: parse("start_time", required(attributes, "start_time")?)?,
            finish_time: parse("finish_time", required(attributes, "finish_time")?)?,
            state: parse("state", required(attributes, "state")?)?,
            authenticated_user: parse(
                "authenticated_user",
                required(attributes, "authenticated_user")?,
            )?,
            operation_type: parse("operation_type", required(attributes, "operation_type")?)?,
            spec,
            result: required(attributes, "result")?.clone(),
            events: required(attributes, "events")?.clone(),
            progress: attributes.get("progress").cloned(),
            brief_progress: attributes.get("brief_progress").cloned(),
            brief_spec: attributes.get("brief_spec").cloned(),
            full_spec: attributes.get("full_spec").cloned(),
            unrecognized_spec: attributes.get("unrecognized_spec").cloned(),
            alerts: attributes.get("alerts").cloned(),
            runtime_parameters: attributes.get("runtime_parameters").cloned(),
            alias,
            slot_index_per_pool_tree: attributes.get("slot_index_per_pool_tree").cloned(),
            task_names: attributes.get("task_names").cloned(),
            experiment_assignments: attributes.get("experiment_assignments").cloned(),
            experiment_assignment_names,
            controller_features: attributes.get("controller_features").cloned(),
        })
    }
}

/// Pools referenced by the per-tree scheduling options.
pub fn pools_from_runtime_parameters(runtime_parameters: &Value) -> Vec<String> {
    runtime_parameters
        .get("scheduling_options_per_pool_tree")
        .and_then(Value::as_object)
        .map(|trees| {
            trees
                .values()
                .filter_map(|options| {
                    options.get("pool").and_then(Value::as_str).map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The lowercased search blob: id, user, state, type, experiment names,
/// annotations, pool, title, first input/output paths, per-tree pools.
pub fn filter_factors(request: &ArchiveRequest) -> String {
    let mut parts: Vec<String> = vec![
        request.id.to_string(),
        request.authenticated_user.clone(),
        enum_to_string(&request.state),
        enum_to_string(&request.operation_type),
    ];
    parts.extend(request.experiment_assignment_names.iter().cloned());

    if let Some(runtime_parameters) = &request.runtime_parameters {
        if let Some(annotations) = runtime_parameters.get("annotations")
            && !annotations.is_null()
        {
            parts.push(annotations.to_string());
        }
    }

    for key in ["pool", "title"] {
        if let Some(text) = request.spec.get(key).and_then(Value::as_str) {
            parts.push(text.to_string());
        }
    }
    for key in ["input_table_paths", "output_table_paths"] {
        if let Some(first) = request
            .spec
            .get(key)
            .and_then(Value::as_array)
            .and_then(|paths| paths.first())
            .and_then(Value::as_str)
        {
            parts.push(first.to_string());
        }
    }
    for key in ["output_table_path", "table_path"] {
        if let Some(path) = request.spec.get(key).and_then(Value::as_str) {
            parts.push(path.to_string());
        }
    }

    if let Some(runtime_parameters) = &request.runtime_parameters {
        parts.extend(pools_from_runtime_parameters(runtime_parameters));
    }

    parts.join(" ").to_lowercase()
}

fn enum_to_string<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Whether the brief progress reports failed jobs (`/jobs/failed > 0`).
pub fn has_failed_jobs(brief_progress: &Value) -> bool {
    brief_progress
        .get("jobs")
        .and_then(|jobs| jobs.get("failed"))
        .and_then(Value::as_i64)
        .is_some_and(|failed| failed > 0)
}

/// Progress blobs carry authority only once the controller reports a
/// finished state; unfinished blobs in the tree snapshot lose to whatever
/// the archive already has.
pub fn progress_is_authoritative(progress: &Value) -> bool {
    progress
        .get("state")
        .and_then(Value::as_str)
        .is_some_and(|state| matches!(state, "completed" | "failed" | "aborted"))
}

/// Archive row families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveTable {
    OrderedById,
    OrderedByStartTime,
    OperationAliases,
}

/// One row: named columns to JSON values.
pub type ArchiveRow = BTreeMap<String, Value>;

/// Serialized weight of one column value.
pub fn value_weight(value: &Value) -> usize {
    serde_json::to_string(value).map_or(0, |text| text.len())
}

/// The heaviest column of a row, for the per-value weight check.
pub fn max_row_value_weight(row: &ArchiveRow) -> (usize, Option<&str>) {
    let mut max = 0;
    let mut key = None;
    for (column, value) in row {
        let weight = value_weight(value);
        if weight > max {
            max = weight;
            key = Some(column.as_str());
        }
    }
    (max, key)
}

fn insert_optional(row: &mut ArchiveRow, column: &str, value: &Option<Value>) {
    if let Some(value) = value {
        row.insert(column.to_string(), value.clone());
    }
}

/// The full-attribute row keyed by id.
pub fn build_ordered_by_id_row(request: &ArchiveRequest, version: i32) -> ArchiveRow {
    let mut row = ArchiveRow::new();
    row.insert("id_hi".to_string(), Value::from(request.id.hi));
    row.insert("id_lo".to_string(), Value::from(request.id.lo));
    row.insert("state".to_string(), Value::String(enum_to_string(&request.state)));
    row.insert(
        "authenticated_user".to_string(),
        Value::String(request.authenticated_user.clone()),
    );
    row.insert(
        "operation_type".to_string(),
        Value::String(enum_to_string(&request.operation_type)),
    );
    if let Some(progress) = &request.progress
        && progress_is_authoritative(progress)
    {
        row.insert("progress".to_string(), progress.clone());
    }
    if let Some(brief_progress) = &request.brief_progress
        && progress_is_authoritative(brief_progress)
    {
        row.insert("brief_progress".to_string(), brief_progress.clone());
    }
    row.insert("spec".to_string(), request.spec.clone());
    insert_optional(&mut row, "brief_spec", &request.brief_spec);
    row.insert(
        "start_time".to_string(),
        Value::from(request.start_time.timestamp_micros()),
    );
    row.insert(
        "finish_time".to_string(),
        Value::from(request.finish_time.timestamp_micros()),
    );
    row.insert(
        "filter_factors".to_string(),
        Value::String(filter_factors(request)),
    );
    row.insert("result".to_string(), request.result.clone());
    row.insert("events".to_string(), request.events.clone());
    insert_optional(&mut row, "alerts", &request.alerts);
    if version >= 17 {
        insert_optional(&mut row, "unrecognized_spec", &request.unrecognized_spec);
        insert_optional(&mut row, "full_spec", &request.full_spec);
    }
    if version >= 22 {
        insert_optional(&mut row, "runtime_parameters", &request.runtime_parameters);
    }
    if version >= 27 {
        insert_optional(
            &mut row,
            "slot_index_per_pool_tree",
            &request.slot_index_per_pool_tree,
        );
    }
    if version >= 35 {
        insert_optional(&mut row, "task_names", &request.task_names);
    }
    if version >= 40 {
        insert_optional(
            &mut row,
            "experiment_assignments",
            &request.experiment_assignments,
        );
        if !request.experiment_assignment_names.is_empty() {
            row.insert(
                "experiment_assignment_names".to_string(),
                serde_json::to_value(&request.experiment_assignment_names)
                    .unwrap_or(Value::Null),
            );
        }
    }
    if version >= 42 {
        insert_optional(&mut row, "controller_features", &request.controller_features);
    }
    row
}

/// The search row keyed by start time.
pub fn build_ordered_by_start_time_row(request: &ArchiveRequest, version: i32) -> ArchiveRow {
    let mut row = ArchiveRow::new();
    row.insert(
        "start_time".to_string(),
        Value::from(request.start_time.timestamp_micros()),
    );
    row.insert("id_hi".to_string(), Value::from(request.id.hi));
    row.insert("id_lo".to_string(), Value::from(request.id.lo));
    row.insert(
        "operation_type".to_string(),
        Value::String(enum_to_string(&request.operation_type)),
    );
    row.insert("state".to_string(), Value::String(enum_to_string(&request.state)));
    row.insert(
        "authenticated_user".to_string(),
        Value::String(request.authenticated_user.clone()),
    );
    row.insert(
        "filter_factors".to_string(),
        Value::String(filter_factors(request)),
    );
    if version >= 24 {
        if let Some(runtime_parameters) = &request.runtime_parameters {
            let pools = pools_from_runtime_parameters(runtime_parameters);
            if !pools.is_empty() {
                row.insert(
                    "pools".to_string(),
                    serde_json::to_value(pools).unwrap_or(Value::Null),
                );
            }
        }
        if let Some(brief_progress) = &request.brief_progress {
            row.insert(
                "has_failed_jobs".to_string(),
                Value::Bool(has_failed_jobs(brief_progress)),
            );
        }
    }
    if version >= 30
        && let Some(acl) = request
            .runtime_parameters
            .as_ref()
            .and_then(|parameters| parameters.get("acl"))
        && !acl.is_null()
    {
        row.insert("acl".to_string(), acl.clone());
    }
    row
}

/// The alias lookup row; only for requests with an alias.
pub fn build_operation_aliases_row(request: &ArchiveRequest) -> Option<ArchiveRow> {
    let alias = request.alias.as_ref()?;
    let mut row = ArchiveRow::new();
    row.insert("alias".to_string(), Value::String(alias.clone()));
    row.insert("operation_id_hi".to_string(), Value::from(request.id.hi));
    row.insert("operation_id_lo".to_string(), Value::from(request.id.lo));
    Some(row)
}

/// One alert state change shipped to the archive's alert-events column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAlertEvent {
    pub operation_id: OperationId,
    pub alert_type: OperationAlertType,
    pub time: DateTime<Utc>,
    pub error: ArborError,
}

/// A tablet transaction against the archive tables.
#[async_trait]
pub trait ArchiveTransaction: Send {
    async fn write_rows(&mut self, table: ArchiveTable, rows: Vec<ArchiveRow>) -> ArborResult<()>;
    async fn commit(self: Box<Self>) -> ArborResult<()>;
}

/// The durable tabular store finished operations are persisted to.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn start_transaction(&self) -> ArborResult<Box<dyn ArchiveTransaction>>;

    /// Existing alert-event histories for the given operations.
    async fn lookup_alert_events(
        &self,
        ids: &[OperationId],
    ) -> ArborResult<BTreeMap<OperationId, Vec<OperationAlertEvent>>>;
}

/// In-memory archive used by tests and single-process setups. The
/// `available` flag simulates the storage service going down: transactions
/// fail to start or commit while it is off.
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct InMemoryArchiveState {
        rows: BTreeMap<ArchiveTable, Vec<ArchiveRow>>,
    }

    #[derive(Default)]
    struct Inner {
        state: Mutex<InMemoryArchiveState>,
        available: AtomicBool,
    }

    #[derive(Clone, Default)]
    pub struct InMemoryArchive {
        inner: Arc<Inner>,
    }

    impl InMemoryArchive {
        pub fn new() -> Self {
            let archive = InMemoryArchive::default();
            archive.set_available(true);
            archive
        }

        pub fn set_available(&self, available: bool) {
            self.inner.available.store(available, Ordering::SeqCst);
        }

        pub fn rows(&self, table: ArchiveTable) -> Vec<ArchiveRow> {
            self.inner
                .state
                .lock()
                .unwrap()
                .rows
                .get(&table)
                .cloned()
                .unwrap_or_default()
        }

        /// Ids present in the ordered-by-id family.
        pub fn archived_ids(&self) -> Vec<OperationId> {
            self.rows(ArchiveTable::OrderedById)
                .iter()
                .filter_map(|row| {
                    let hi = row.get("id_hi")?.as_u64()?;
                    let lo = row.get("id_lo")?.as_u64()?;
                    Some(OperationId { hi, lo })
                })
                .collect()
        }

        /// The alert-event history stored in the `alert_events` column of
        /// the ordered-by-id row, if any.
        pub fn alert_events(&self, id: OperationId) -> Vec<OperationAlertEvent> {
            self.rows(ArchiveTable::OrderedById)
                .iter()
                .find(|row| {
                    row.get("id_hi").and_then(Value::as_u64) == Some(id.hi)
                        && row.get("id_lo").and_then(Value::as_u64) == Some(id.lo)
                })
                .and_then(|row| row.get("alert_events"))
                .and_then(|events| serde_json::from_value(events.clone()).ok())
                .unwrap_or_default()
        }
    }

    pub struct InMemoryArchiveTransaction {
        inner: Arc<Inner>,
        staged: Vec<(ArchiveTable, Vec<ArchiveRow>)>,
    }

    #[async_trait]
    impl ArchiveTransaction for InMemoryArchiveTransaction {
        async fn write_rows(
            &mut self,
            table: ArchiveTable,
            rows: Vec<ArchiveRow>,
        ) -> ArborResult<()> {
            self.staged.push((table, rows));
            Ok(())
        }

        async fn commit(self: Box<Self>) -> ArborResult<()> {
            if !self.inner.available.load(Ordering::SeqCst) {
                return Err(ArborError::new(
                    ErrorCode::ArchiveError,
                    "archive storage is unavailable",
                ));
            }
            let mut state = self.inner.state.lock().unwrap();
            for (table, rows) in self.staged {
                // Tablet write semantics: a row with a known key updates the
                // written columns in place; unknown keys insert.
                let existing = state.rows.entry(table).or_default();
                for row in rows {
                    let key_columns: &[&str] = match table {
                        ArchiveTable::OrderedById => &["id_hi", "id_lo"],
                        ArchiveTable::OrderedByStartTime => &["start_time", "id_hi", "id_lo"],
                        ArchiveTable::OperationAliases => &["alias"],
                    };
                    match existing.iter_mut().find(|candidate| {
                        key_columns
                            .iter()
                            .all(|column| candidate.get(*column) == row.get(*column))
                    }) {
                        Some(candidate) => candidate.extend(row),
                        None => existing.push(row),
                    }
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ArchiveStore for InMemoryArchive {
        async fn start_transaction(&self) -> ArborResult<Box<dyn ArchiveTransaction>> {
            if !self.inner.available.load(Ordering::SeqCst) {
                return Err(ArborError::new(
                    ErrorCode::ArchiveError,
                    "archive storage is unavailable",
                ));
            }
            Ok(Box::new(InMemoryArchiveTransaction {
                inner: self.inner.clone(),
                staged: Vec::new(),
            }))
        }

        async fn lookup_alert_events(
            &self,
            ids: &[OperationId],
        ) -> ArborResult<BTreeMap<OperationId, Vec<OperationAlertEvent>>> {
            if !self.inner.available.load(Ordering::SeqCst) {
                return Err(ArborError::new(
                    ErrorCode::ArchiveError,
                    "archive storage is unavailable",
                ));
            }
            Ok(ids
                .iter()
                .map(|id| (*id, self.alert_events(*id)))
                .filter(|(_, events)| !events.is_empty())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{CellTag, IdGenerator, ObjectKind};

    fn sample_request(alias: Option<&str>) -> ArchiveRequest {
        let id = IdGenerator::new(CellTag(1)).generate(ObjectKind::Operation);
        ArchiveRequest {
            id,
            start_time: Utc::now(),
            finish_time: Utc::now(),
            state: OperationState::Completed,
            authenticated_user: "Alice".to_string(),
            operation_type: OperationType::MapReduce,
            spec: serde_json::json!({
                "pool": "Research",
                "title": "Nightly Rollup",
                "input_table_paths": ["/input/one", "/input/two"],
                "output_table_paths": ["/output/main"],
            }),
            result: serde_json::json!({"error": null}),
            events: serde_json::json!([]),
            progress: None,
            brief_progress: Some(serde_json::json!({
                "state": "completed",
                "jobs": {"failed": 2},
            })),
            brief_spec: None,
            full_spec: None,
            unrecognized_spec: None,
            alerts: None,
            runtime_parameters: Some(serde_json::json!({
                "annotations": {"team": "infra"},
                "acl": [{"action": "allow", "subjects": ["alice"], "permissions": ["read"]}],
                "scheduling_options_per_pool_tree": {
                    "physical": {"pool": "research-physical"},
                    "cloud": {"pool": "research-cloud"},
                },
            })),
            alias: alias.map(str::to_string),
            slot_index_per_pool_tree: None,
            task_names: None,
            experiment_assignments: None,
            experiment_assignment_names: vec!["exp_a".to_string()],
            controller_features: None,
        }
    }

    #[test]
    fn test_filter_factors_contains_search_fields() {
        let request = sample_request(None);
        let factors = filter_factors(&request);
        assert!(factors.contains(&request.id.to_string()));
        assert!(factors.contains("alice"));
        assert!(factors.contains("completed"));
        assert!(factors.contains("map_reduce"));
        assert!(factors.contains("research"));
        assert!(factors.contains("nightly rollup"));
        assert!(factors.contains("/input/one"));
        assert!(!factors.contains("/input/two"));
        assert!(factors.contains("/output/main"));
        assert!(factors.contains("research-physical"));
        assert!(factors.contains("exp_a"));
        assert_eq!(factors, factors.to_lowercase());
    }

    #[test]
    fn test_ordered_by_id_row_version_gating() {
        let request = sample_request(None);
        let old = build_ordered_by_id_row(&request, 21);
        assert!(!old.contains_key("runtime_parameters"));
        let new = build_ordered_by_id_row(&request, 43);
        assert!(new.contains_key("runtime_parameters"));
        assert!(new.contains_key("filter_factors"));
        assert_eq!(new["id_hi"], Value::from(request.id.hi));
    }

    #[test]
    fn test_unfinished_progress_is_not_written() {
        let mut request = sample_request(None);
        request.brief_progress = Some(serde_json::json!({"state": "running"}));
        let row = build_ordered_by_id_row(&request, 43);
        assert!(!row.contains_key("brief_progress"));
    }

    #[test]
    fn test_start_time_row_pools_and_failed_jobs() {
        let request = sample_request(None);
        let row = build_ordered_by_start_time_row(&request, 43);
        let pools: Vec<String> =
            serde_json::from_value(row["pools"].clone()).unwrap();
        assert_eq!(pools, vec!["research-physical", "research-cloud"]);
        assert_eq!(row["has_failed_jobs"], Value::Bool(true));
        assert!(row.contains_key("acl"));
    }

    #[test]
    fn test_alias_row_only_when_alias_set() {
        assert!(build_operation_aliases_row(&sample_request(None)).is_none());
        let row = build_operation_aliases_row(&sample_request(Some("*nightly"))).unwrap();
        assert_eq!(row["alias"], Value::String("*nightly".to_string()));
    }

    #[test]
    fn test_value_weight_flags_heaviest_column() {
        let request = sample_request(None);
        let row = build_ordered_by_id_row(&request, 43);
        let (weight, column) = max_row_value_weight(&row);
        assert!(weight > 0);
        assert!(column.is_some());
    }

    #[test]
    fn test_from_operation_extracts_finished_state() {
        use crate::scheduler::operation::{Operation, parse_spec};
        let parsed = parse_spec(
            r#"{"pool": "research", "alias": "*nightly"}"#,
            None,
            None,
        )
        .unwrap();
        let id = IdGenerator::new(CellTag(1)).generate(ObjectKind::Operation);
        let mut operation =
            Operation::new(id, OperationType::Vanilla, "alice", parsed, Utc::now());

        // Unfinished operations cannot be distilled.
        assert!(ArchiveRequest::from_operation(&operation).is_err());

        let now = Utc::now();
        for state in [
            OperationState::WaitingForAgent,
            OperationState::Initializing,
            OperationState::Preparing,
            OperationState::Materializing,
            OperationState::Running,
            OperationState::Completing,
            OperationState::Completed,
        ] {
            operation
                .set_state_and_enqueue_event(state, Default::default(), now)
                .unwrap();
        }

        let request = ArchiveRequest::from_operation(&operation).unwrap();
        assert_eq!(request.id, id);
        assert_eq!(request.state, OperationState::Completed);
        assert_eq!(request.alias.as_deref(), Some("*nightly"));
        assert_eq!(request.authenticated_user, "alice");
        assert!(request.events.as_array().is_some_and(|events| events.len() == 7));
    }

    #[test]
    fn test_from_attributes_roundtrip_core_fields() {
        let request = sample_request(Some("*nightly"));
        let mut attributes = BTreeMap::new();
        attributes.insert("key".to_string(), serde_json::to_value(request.id).unwrap());
        attributes.insert(
            "start_time".to_string(),
            serde_json::to_value(request.start_time).unwrap(),
        );
        attributes.insert(
            "finish_time".to_string(),
            serde_json::to_value(request.finish_time).unwrap(),
        );
        attributes.insert("state".to_string(), serde_json::json!("completed"));
        attributes.insert(
            "authenticated_user".to_string(),
            serde_json::json!("Alice"),
        );
        attributes.insert("operation_type".to_string(), serde_json::json!("map_reduce"));
        attributes.insert(
            "spec".to_string(),
            serde_json::json!({"alias": "*nightly", "pool": "p"}),
        );
        attributes.insert("result".to_string(), serde_json::json!({"error": null}));
        attributes.insert("events".to_string(), serde_json::json!([]));

        let parsed = ArchiveRequest::from_attributes(&attributes).unwrap();
        assert_eq!(parsed.id, request.id);
        assert_eq!(parsed.alias.as_deref(), Some("*nightly"));
        assert_eq!(parsed.state, OperationState::Completed);

        attributes.remove("finish_time");
        assert!(ArchiveRequest::from_attributes(&attributes).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_archive_upserts_by_key() {
        let archive = testing::InMemoryArchive::new();
        let request = sample_request(None);
        let row = build_ordered_by_id_row(&request, 43);

        for _ in 0..2 {
            let mut transaction = archive.start_transaction().await.unwrap();
            transaction
                .write_rows(ArchiveTable::OrderedById, vec![row.clone()])
                .await
                .unwrap();
            transaction.commit().await.unwrap();
        }
        assert_eq!(archive.rows(ArchiveTable::OrderedById).len(), 1);
        assert_eq!(archive.archived_ids(), vec![request.id]);
    }

    #[tokio::test]
    async fn test_in_memory_archive_unavailable_fails_commit() {
        let archive = testing::InMemoryArchive::new();
        archive.set_available(false);
        assert!(archive.start_transaction().await.is_err());
        archive.set_available(true);
        assert!(archive.start_transaction().await.is_ok());
    }
}
