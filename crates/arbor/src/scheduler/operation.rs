//! Scheduler operations: state machine, events, alerts, runtime parameters.
//!
//! An operation is the scheduler-side representation of one workload. Its
//! persistent identity and spec never change after start; the state machine,
//! the event log, alerts, and runtime parameters evolve and carry flush
//! flags so the persister knows what to write back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use arbor_types::{ArborError, ArborResult, ErrorCode, OperationId, TransactionId};

use crate::automaton::CancelableContext;
use crate::cypress::acl::Ace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Map,
    Merge,
    Erase,
    Sort,
    Reduce,
    MapReduce,
    JoinReduce,
    RemoteCopy,
    Vanilla,
}

impl OperationType {
    /// Whether operations of this type run user-supplied code.
    pub fn has_user_jobs(self) -> bool {
        !matches!(
            self,
            OperationType::Merge
                | OperationType::Erase
                | OperationType::Sort
                | OperationType::RemoteCopy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Starting,
    WaitingForAgent,
    Initializing,
    Preparing,
    Materializing,
    ReviveInitializing,
    Reviving,
    Pending,
    Running,
    Completing,
    Completed,
    Failing,
    Failed,
    Aborting,
    Aborted,
}

impl OperationState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Aborted
        )
    }

    pub fn is_finishing(self) -> bool {
        self.is_finished()
            || matches!(
                self,
                OperationState::Completing | OperationState::Failing | OperationState::Aborting
            )
    }
}

/// The forward edges of the operation state machine. Aborting is reachable
/// from any unfinished state and is not listed per-state.
pub fn valid_transitions(from: OperationState) -> &'static [OperationState] {
    use OperationState::*;
    match from {
        Starting => &[WaitingForAgent],
        WaitingForAgent => &[Initializing, ReviveInitializing],
        Initializing => &[Preparing, Failing],
        Preparing => &[Materializing, Failing],
        Materializing => &[Pending, Running, Failing],
        ReviveInitializing => &[Reviving, Failing],
        Reviving => &[Pending, Running, Failing],
        Pending => &[Running, Failing],
        Running => &[Completing, Failing, Pending],
        Completing => &[Completed, Failing],
        Failing => &[Failed],
        Aborting => &[Aborted],
        Completed | Failed | Aborted => &[],
    }
}

pub fn can_transition(from: OperationState, to: OperationState) -> bool {
    if from == to {
        return true;
    }
    if to == OperationState::Aborting || to == OperationState::Aborted {
        return !from.is_finished();
    }
    valid_transitions(from).contains(&to)
}

/// One entry of the operation's event log; strictly monotonic in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub time: DateTime<Utc>,
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAlertType {
    UnusedTmpfsSpace,
    LostIntermediateChunks,
    IntermediateDataSkew,
    LongAbortedJobs,
    ExcessiveDiskUsage,
    OperationSuspended,
    InvalidAcl,
    OperationsArchivation,
    OperationAlertArchivation,
}

#[derive(Debug, Clone)]
pub struct OperationAlert {
    pub error: ArborError,
    /// When set, the alert clears itself at this instant.
    pub reset_at: Option<DateTime<Utc>>,
}

/// Per-tree scheduling options inside runtime parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeSchedulingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<Value>,
}

/// Mutable-at-runtime parameters, kept apart from the immutable spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeParameters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<Ace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduling_options_per_pool_tree: BTreeMap<String, TreeSchedulingOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub erased_trees: Vec<String>,
}

/// The strategy-relevant projection of an operation spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StrategySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<Ace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failed_job_count: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduling_options_per_pool_tree: BTreeMap<String, Value>,
    /// Vanilla operations: task name -> task spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<String, Value>>,
}

/// Deep-merges `overlay` into `base`: objects merge recursively, everything
/// else replaces.
pub fn patch_spec(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let patched = match merged.get(key) {
                    Some(base_value) => patch_spec(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), patched);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Result of parsing an operation spec.
#[derive(Debug, Clone)]
pub struct ParsedSpec {
    pub spec: StrategySpec,
    /// The merged spec tree with `secure_vault` stripped.
    pub spec_node: Value,
    /// Per-tree effective strategy specs: the base spec patched with the
    /// tree's scheduling options.
    pub custom_per_tree: BTreeMap<String, StrategySpec>,
}

/// Parses a spec string, merging it over an optional template. In the
/// revive path (`operation_id` set) a malformed ACL is dropped instead of
/// failing the whole revival.
pub fn parse_spec(
    spec_string: &str,
    template: Option<&Value>,
    operation_id: Option<OperationId>,
) -> ArborResult<ParsedSpec> {
    let parsed: Value = serde_json::from_str(spec_string).map_err(|error| {
        ArborError::new(
            ErrorCode::Generic,
            format!("error parsing operation spec string: {error}"),
        )
    })?;
    if !parsed.is_object() {
        return Err(ArborError::new(
            ErrorCode::Generic,
            "operation spec must be a map",
        ));
    }

    let mut spec_node = match template {
        Some(template) => patch_spec(template, &parsed),
        None => parsed,
    };

    if let Some(id) = operation_id
        && let Some(acl_node) = spec_node.get("acl")
        && serde_json::from_value::<Vec<Ace>>(acl_node.clone()).is_err()
    {
        warn!(operation = %id, "failed to parse operation ACL from spec, removing it");
        spec_node.as_object_mut().expect("checked").remove("acl");
    }

    spec_node.as_object_mut().expect("checked").remove("secure_vault");

    let spec: StrategySpec = serde_json::from_value(spec_node.clone()).map_err(|error| {
        ArborError::new(
            ErrorCode::Generic,
            format!("error parsing operation spec: {error}"),
        )
    })?;

    let mut custom_per_tree = BTreeMap::new();
    for (tree, options) in &spec.scheduling_options_per_pool_tree {
        let patched = patch_spec(&spec_node, options);
        let tree_spec: StrategySpec = serde_json::from_value(patched).map_err(|error| {
            ArborError::new(
                ErrorCode::Generic,
                format!("error parsing per-tree spec for tree {tree:?}: {error}"),
            )
        })?;
        custom_per_tree.insert(tree.clone(), tree_spec);
    }

    Ok(ParsedSpec {
        spec,
        spec_node,
        custom_per_tree,
    })
}

pub struct Operation {
    id: OperationId,
    operation_type: OperationType,
    user_transaction_id: Option<TransactionId>,
    authenticated_user: String,
    start_time: DateTime<Utc>,
    finish_time: Option<DateTime<Utc>>,
    state: OperationState,
    suspended: bool,
    spec: StrategySpec,
    spec_node: Value,
    custom_spec_per_tree: BTreeMap<String, StrategySpec>,
    runtime_parameters: RuntimeParameters,
    events: Vec<OperationEvent>,
    alerts: BTreeMap<OperationAlertType, OperationAlert>,
    slot_index_per_tree: BTreeMap<String, i32>,
    result_error: Option<ArborError>,
    brief_progress: Option<Value>,
    progress: Option<Value>,
    experiment_assignment_names: Vec<String>,
    should_flush: bool,
    should_flush_acl: bool,
    cancelable_context: CancelableContext,
}

impl Operation {
    pub fn new(
        id: OperationId,
        operation_type: OperationType,
        authenticated_user: impl Into<String>,
        parsed: ParsedSpec,
        start_time: DateTime<Utc>,
    ) -> Self {
        let runtime_parameters = RuntimeParameters {
            acl: parsed.spec.acl.clone().unwrap_or_default(),
            annotations: parsed.spec.annotations.clone(),
            scheduling_options_per_pool_tree: parsed
                .spec
                .scheduling_options_per_pool_tree
                .keys()
                .map(|tree| (tree.clone(), TreeSchedulingOptions::default()))
                .collect(),
            erased_trees: Vec::new(),
        };
        Operation {
            id,
            operation_type,
            user_transaction_id: None,
            authenticated_user: authenticated_user.into(),
            start_time,
            finish_time: None,
            state: OperationState::Starting,
            suspended: false,
            spec: parsed.spec,
            spec_node: parsed.spec_node,
            custom_spec_per_tree: parsed.custom_per_tree,
            runtime_parameters,
            events: Vec::new(),
            alerts: BTreeMap::new(),
            slot_index_per_tree: BTreeMap::new(),
            result_error: None,
            brief_progress: None,
            progress: None,
            experiment_assignment_names: Vec::new(),
            should_flush: false,
            should_flush_acl: false,
            cancelable_context: CancelableContext::new(),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn authenticated_user(&self) -> &str {
        &self.authenticated_user
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.finish_time
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        self.should_flush = true;
    }

    pub fn set_user_transaction(&mut self, id: TransactionId) {
        self.user_transaction_id = Some(id);
    }

    pub fn user_transaction(&self) -> Option<TransactionId> {
        self.user_transaction_id
    }

    pub fn spec(&self) -> &StrategySpec {
        &self.spec
    }

    pub fn spec_node(&self) -> &Value {
        &self.spec_node
    }

    pub fn alias(&self) -> Option<&str> {
        self.spec.alias.as_deref()
    }

    pub fn events(&self) -> &[OperationEvent] {
        &self.events
    }

    pub fn cancelable_context(&self) -> &CancelableContext {
        &self.cancelable_context
    }

    /// The effective strategy spec for a tree: the per-tree override when
    /// the spec sets one, the base spec otherwise.
    pub fn strategy_spec_for_tree(&self, tree: &str) -> &StrategySpec {
        self.custom_spec_per_tree.get(tree).unwrap_or(&self.spec)
    }

    /// Task names of vanilla operations; empty for every other type.
    pub fn task_names(&self) -> Vec<String> {
        if self.operation_type != OperationType::Vanilla {
            return Vec::new();
        }
        self.spec
            .tasks
            .as_ref()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Moves the state machine and appends an event. Invalid transitions
    /// are rejected; finished states additionally stamp the finish time.
    pub fn set_state_and_enqueue_event(
        &mut self,
        state: OperationState,
        attributes: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> ArborResult<()> {
        if !can_transition(self.state, state) {
            return Err(ArborError::new(
                ErrorCode::Generic,
                format!(
                    "invalid operation state transition {:?} -> {:?}",
                    self.state, state
                ),
            )
            .with_attr("operation_id", self.id));
        }
        if self.state == state {
            return Ok(());
        }
        self.state = state;
        // Event times are monotonic even if the wall clock is not.
        let time = match self.events.last() {
            Some(last) if last.time >= now => last.time + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.events.push(OperationEvent {
            time,
            state,
            attributes,
        });
        self.should_flush = true;
        if state.is_finished() {
            self.finish_time = Some(now);
            self.on_finished();
        }
        debug!(operation = %self.id, state = ?state, "operation state changed");
        Ok(())
    }

    fn on_finished(&mut self) {
        self.suspended = false;
        self.alerts.clear();
    }

    pub fn set_slot_index(&mut self, tree: impl Into<String>, value: i32) {
        self.slot_index_per_tree.insert(tree.into(), value);
    }

    pub fn find_slot_index(&self, tree: &str) -> Option<i32> {
        self.slot_index_per_tree.get(tree).copied()
    }

    pub fn slot_indices(&self) -> &BTreeMap<String, i32> {
        &self.slot_index_per_tree
    }

    pub fn runtime_parameters(&self) -> &RuntimeParameters {
        &self.runtime_parameters
    }

    /// Replaces runtime parameters; an ACL change additionally flags the
    /// ACL flush so external consumers re-synchronize.
    pub fn set_runtime_parameters(&mut self, parameters: RuntimeParameters) {
        if parameters.acl != self.runtime_parameters.acl {
            self.should_flush_acl = true;
        }
        self.should_flush = true;
        self.runtime_parameters = parameters;
    }

    /// Drops trees from the runtime parameters, remembering them as erased.
    pub fn erase_trees(&mut self, trees: &[String]) {
        if !trees.is_empty() {
            self.should_flush = true;
        }
        for tree in trees {
            self.runtime_parameters.erased_trees.push(tree.clone());
            self.runtime_parameters
                .scheduling_options_per_pool_tree
                .remove(tree);
        }
    }

    pub fn has_alert(&self, alert_type: OperationAlertType) -> bool {
        self.alerts.contains_key(&alert_type)
    }

    /// Stores an alert; re-setting an identical error is a no-op. A timeout
    /// arms a self-reset at `now + timeout`.
    pub fn set_alert(
        &mut self,
        alert_type: OperationAlertType,
        error: ArborError,
        timeout: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self.alerts.get(&alert_type)
            && existing.error == error
        {
            return;
        }
        let reset_at = timeout
            .map(|timeout| now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()));
        self.alerts.insert(alert_type, OperationAlert { error, reset_at });
        self.should_flush = true;
    }

    pub fn reset_alert(&mut self, alert_type: OperationAlertType) {
        if self.alerts.remove(&alert_type).is_some() {
            self.should_flush = true;
        }
    }

    /// Clears alerts whose reset timeout has passed.
    pub fn reset_expired_alerts(&mut self, now: DateTime<Utc>) {
        let before = self.alerts.len();
        self.alerts
            .retain(|_, alert| alert.reset_at.is_none_or(|reset_at| reset_at > now));
        if self.alerts.len() != before {
            self.should_flush = true;
        }
    }

    /// Alerts as a JSON map keyed by alert type.
    pub fn build_alerts(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (alert_type, alert) in &self.alerts {
            let key = serde_json::to_value(alert_type)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .expect("alert types serialize to strings");
            object.insert(
                key,
                serde_json::to_value(&alert.error).unwrap_or(Value::Null),
            );
        }
        Value::Object(object)
    }

    pub fn set_result_error(&mut self, error: Option<ArborError>) {
        self.result_error = error;
        self.should_flush = true;
    }

    /// The result blob persisted alongside the operation.
    pub fn build_result(&self) -> Value {
        serde_json::json!({
            "error": self.result_error.as_ref().map(|error| serde_json::to_value(error).unwrap_or(Value::Null)),
        })
    }

    pub fn set_progress(&mut self, progress: Option<Value>, brief_progress: Option<Value>) {
        self.progress = progress;
        self.brief_progress = brief_progress;
    }

    pub fn progress(&self) -> Option<&Value> {
        self.progress.as_ref()
    }

    pub fn brief_progress(&self) -> Option<&Value> {
        self.brief_progress.as_ref()
    }

    pub fn set_experiment_assignment_names(&mut self, names: Vec<String>) {
        self.experiment_assignment_names = names;
    }

    pub fn experiment_assignment_names(&self) -> &[String] {
        &self.experiment_assignment_names
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush
    }

    pub fn should_flush_acl(&self) -> bool {
        self.should_flush_acl
    }

    pub fn mark_flushed(&mut self) {
        self.should_flush = false;
        self.should_flush_acl = false;
    }

    /// Cancels in-flight work bound to the operation's context.
    pub fn cancel(&self, error: ArborError) {
        self.cancelable_context.cancel(error);
    }

    /// Swaps in a fresh cancelable context (revival); id and spec persist.
    pub fn restart(&mut self, error: ArborError) {
        self.cancelable_context.cancel(error);
        self.cancelable_context = CancelableContext::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{CellTag, IdGenerator, ObjectKind};

    fn operation_id() -> OperationId {
        IdGenerator::new(CellTag(1)).generate(ObjectKind::Operation)
    }

    fn sample_spec() -> &'static str {
        r#"{
            "pool": "research",
            "title": "daily build",
            "alias": "*daily",
            "scheduling_options_per_pool_tree": {
                "physical": {"pool": "research-physical", "weight": 2.0},
                "cloud": {"weight": 0.5}
            },
            "secure_vault": {"token": "s3cret"}
        }"#
    }

    fn sample_operation() -> Operation {
        let parsed = parse_spec(sample_spec(), None, None).unwrap();
        Operation::new(
            operation_id(),
            OperationType::Vanilla,
            "alice",
            parsed,
            Utc::now(),
        )
    }

    #[test]
    fn test_parse_spec_strips_secure_vault() {
        let parsed = parse_spec(sample_spec(), None, None).unwrap();
        assert!(parsed.spec_node.get("secure_vault").is_none());
        assert_eq!(parsed.spec.pool.as_deref(), Some("research"));
        assert_eq!(parsed.spec.alias.as_deref(), Some("*daily"));
    }

    #[test]
    fn test_per_tree_spec_overrides_only_set_fields() {
        let parsed = parse_spec(sample_spec(), None, None).unwrap();
        let physical = &parsed.custom_per_tree["physical"];
        assert_eq!(physical.pool.as_deref(), Some("research-physical"));
        assert_eq!(physical.weight, Some(2.0));
        // The cloud tree sets only the weight; the pool falls through.
        let cloud = &parsed.custom_per_tree["cloud"];
        assert_eq!(cloud.pool.as_deref(), Some("research"));
        assert_eq!(cloud.weight, Some(0.5));
    }

    #[test]
    fn test_spec_template_merges_under_spec() {
        let template = serde_json::json!({
            "pool": "default",
            "max_failed_job_count": 10,
        });
        let parsed = parse_spec(r#"{"pool": "research"}"#, Some(&template), None).unwrap();
        assert_eq!(parsed.spec.pool.as_deref(), Some("research"));
        assert_eq!(parsed.spec.max_failed_job_count, Some(10));
    }

    #[test]
    fn test_revive_drops_malformed_acl() {
        let spec = r#"{"pool": "p", "acl": [{"bogus": true}]}"#;
        assert!(parse_spec(spec, None, None).is_err());
        let parsed = parse_spec(spec, None, Some(operation_id())).unwrap();
        assert!(parsed.spec.acl.is_none());
    }

    #[test]
    fn test_state_machine_happy_path_and_finish() {
        let mut operation = sample_operation();
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
                .set_state_and_enqueue_event(state, BTreeMap::new(), now)
                .unwrap();
        }
        assert!(operation.state().is_finished());
        assert!(operation.finish_time().is_some());
        assert_eq!(operation.events().len(), 7);
    }

    #[test]
    fn test_aborting_reachable_from_anywhere_but_finished() {
        assert!(can_transition(OperationState::Running, OperationState::Aborting));
        assert!(can_transition(OperationState::Starting, OperationState::Aborted));
        assert!(!can_transition(OperationState::Completed, OperationState::Aborting));
        assert!(!can_transition(OperationState::Completed, OperationState::Running));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut operation = sample_operation();
        let err = operation
            .set_state_and_enqueue_event(OperationState::Completed, BTreeMap::new(), Utc::now())
            .unwrap_err();
        assert!(err.message.contains("invalid operation state transition"));
    }

    #[test]
    fn test_event_times_strictly_monotonic() {
        let mut operation = sample_operation();
        let now = Utc::now();
        operation
            .set_state_and_enqueue_event(OperationState::WaitingForAgent, BTreeMap::new(), now)
            .unwrap();
        operation
            .set_state_and_enqueue_event(OperationState::Initializing, BTreeMap::new(), now)
            .unwrap();
        let events = operation.events();
        assert!(events[1].time > events[0].time);
    }

    #[test]
    fn test_finish_clears_alerts_and_suspension() {
        let mut operation = sample_operation();
        let now = Utc::now();
        operation.set_suspended(true);
        operation.set_alert(
            OperationAlertType::LongAbortedJobs,
            ArborError::new(ErrorCode::Generic, "too many aborted jobs"),
            None,
            now,
        );
        operation
            .set_state_and_enqueue_event(OperationState::Aborting, BTreeMap::new(), now)
            .unwrap();
        operation
            .set_state_and_enqueue_event(OperationState::Aborted, BTreeMap::new(), now)
            .unwrap();
        assert!(!operation.is_suspended());
        assert!(!operation.has_alert(OperationAlertType::LongAbortedJobs));
    }

    #[test]
    fn test_alert_timeout_reset() {
        let mut operation = sample_operation();
        let now = Utc::now();
        operation.set_alert(
            OperationAlertType::IntermediateDataSkew,
            ArborError::new(ErrorCode::Generic, "skewed"),
            Some(std::time::Duration::from_secs(30)),
            now,
        );
        operation.reset_expired_alerts(now + chrono::Duration::seconds(10));
        assert!(operation.has_alert(OperationAlertType::IntermediateDataSkew));
        operation.reset_expired_alerts(now + chrono::Duration::seconds(31));
        assert!(!operation.has_alert(OperationAlertType::IntermediateDataSkew));
    }

    #[test]
    fn test_identical_alert_is_noop() {
        let mut operation = sample_operation();
        let now = Utc::now();
        let error = ArborError::new(ErrorCode::Generic, "same");
        operation.set_alert(OperationAlertType::InvalidAcl, error.clone(), None, now);
        operation.mark_flushed();
        operation.set_alert(OperationAlertType::InvalidAcl, error, None, now);
        assert!(!operation.should_flush());
    }

    #[test]
    fn test_runtime_parameter_flush_flags() {
        let mut operation = sample_operation();
        operation.mark_flushed();

        let mut parameters = operation.runtime_parameters().clone();
        parameters.annotations = Some(serde_json::json!({"team": "infra"}));
        operation.set_runtime_parameters(parameters.clone());
        assert!(operation.should_flush());
        assert!(!operation.should_flush_acl());

        parameters.acl = vec![Ace::allow(&["bob"], &[crate::cypress::acl::Permission::Read])];
        operation.set_runtime_parameters(parameters);
        assert!(operation.should_flush_acl());
    }

    #[test]
    fn test_erase_trees() {
        let mut operation = sample_operation();
        operation.erase_trees(&["physical".to_string()]);
        let parameters = operation.runtime_parameters();
        assert_eq!(parameters.erased_trees, vec!["physical".to_string()]);
        assert!(
            !parameters
                .scheduling_options_per_pool_tree
                .contains_key("physical")
        );
    }

    #[test]
    fn test_task_names_for_vanilla_only() {
        let spec = r#"{"tasks": {"master": {}, "worker": {}}}"#;
        let parsed = parse_spec(spec, None, None).unwrap();
        let operation = Operation::new(
            operation_id(),
            OperationType::Vanilla,
            "alice",
            parsed.clone(),
            Utc::now(),
        );
        assert_eq!(operation.task_names(), vec!["master", "worker"]);

        let map_operation =
            Operation::new(operation_id(), OperationType::Map, "alice", parsed, Utc::now());
        assert!(map_operation.task_names().is_empty());
    }

    #[test]
    fn test_restart_replaces_cancelable_context() {
        let mut operation = sample_operation();
        let old_context = operation.cancelable_context().clone();
        operation.restart(ArborError::new(ErrorCode::Cancelled, "revival"));
        assert!(old_context.is_cancelled());
        assert!(!operation.cancelable_context().is_cancelled());
    }

    #[test]
    fn test_strategy_spec_for_unknown_tree_falls_back() {
        let operation = sample_operation();
        assert_eq!(
            operation.strategy_spec_for_tree("no_such_tree").pool.as_deref(),
            Some("research")
        );
    }
}
