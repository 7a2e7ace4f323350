//! Property-based tests for core invariants.
//!
//! These verify properties that should hold for all inputs:
//! - Tree integrity: parents contain their children; no reachable cycles
//! - Branch transparency: committed writes become visible, aborted ones
//!   never do
//! - Lock conflict soundness: no two unrelated transactions ever hold
//!   incompatible locks on the same trunk node
//! - Retention bound: the analysis tick honors the hard and per-user caps

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use arbor_types::{CellTag, ObjectKind};

    use crate::config::ArborConfig;
    use crate::cypress::locks::{LockMode, LockState};
    use crate::master::Master;
    use crate::transaction::manager::StartOptions;

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-d]"
    }

    /// A small op language over a two-level namespace.
    #[derive(Debug, Clone)]
    enum TreeOp {
        Create(String, String),
        Remove(String),
        Set(String, i64),
    }

    fn tree_op_strategy() -> impl Strategy<Value = TreeOp> {
        prop_oneof![
            (name_strategy(), name_strategy()).prop_map(|(a, b)| TreeOp::Create(a, b)),
            name_strategy().prop_map(TreeOp::Remove),
            (name_strategy(), any::<i64>()).prop_map(|(a, v)| TreeOp::Set(a, v)),
        ]
    }

    fn check_tree_integrity(master: &Master) {
        let root = master.cypress.root_id();
        let subtree = master.cypress.subtree_ids(root, &[]).unwrap();
        // Every reachable node appears exactly once (no cycles, no sharing).
        let mut seen = std::collections::BTreeSet::new();
        for id in &subtree {
            assert!(seen.insert(*id), "node {id} reachable twice");
        }
        // Every reachable non-root node is contained by its parent.
        for &id in &subtree {
            let node = master.cypress.trunk(id).unwrap();
            if let Some(parent_id) = node.parent_id {
                let parent = master.cypress.trunk(parent_id).unwrap();
                assert!(
                    parent.content.child_ids().contains(&id),
                    "parent {parent_id} does not contain {id}"
                );
            } else {
                assert_eq!(id, root);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Tree integrity holds after any sequence of untransacted ops.
        #[test]
        fn tree_integrity_under_random_ops(ops in prop::collection::vec(tree_op_strategy(), 1..40)) {
            let mut master = Master::single_cell(CellTag(1), ArborConfig::default());
            for op in ops {
                match op {
                    TreeOp::Create(a, b) => {
                        let mut options = crate::cypress::service::CreateOptions::default();
                        options.recursive = true;
                        options.ignore_existing = true;
                        let _ = master.create(
                            ObjectKind::MapNode,
                            &format!("/{a}/{b}"),
                            None,
                            "alice",
                            &options,
                        );
                    }
                    TreeOp::Remove(a) => {
                        let _ = master.remove(&format!("/{a}"), true, true, None, "alice");
                    }
                    TreeOp::Set(a, v) => {
                        let _ = master.set(&format!("/{a}/@weight"), json!(v), None, "alice");
                    }
                }
                check_tree_integrity(&master);
            }
        }

        /// A committed transactional write is visible afterwards; an aborted
        /// one never is.
        #[test]
        fn branch_transparency(value in any::<i64>(), commit in any::<bool>()) {
            let mut master = Master::single_cell(CellTag(1), ArborConfig::default());
            master
                .create(ObjectKind::Int64Node, "/x", None, "alice", &Default::default())
                .unwrap();
            master.set("/x", json!(1), None, "alice").unwrap();

            let txn = master.start_transaction(StartOptions::new("alice")).unwrap();
            master.set("/x", json!(value), Some(txn), "alice").unwrap();
            // Trunk remains unchanged while the transaction is open.
            prop_assert_eq!(
                master.get("/x", None, "alice", &Default::default()).unwrap(),
                json!(1)
            );

            if commit {
                master.commit_transaction(txn, 10).unwrap();
                prop_assert_eq!(
                    master.get("/x", None, "alice", &Default::default()).unwrap(),
                    json!(value)
                );
            } else {
                master.abort_transaction(txn, false, None).unwrap();
                prop_assert_eq!(
                    master.get("/x", None, "alice", &Default::default()).unwrap(),
                    json!(1)
                );
            }
        }

        /// After any sequence of lock requests by unrelated transactions,
        /// no two of them hold incompatible acquired locks on one node.
        #[test]
        fn lock_conflict_soundness(
            requests in prop::collection::vec((0usize..3, 0u8..4, name_strategy(), any::<bool>()), 1..30)
        ) {
            let mut master = Master::single_cell(CellTag(1), ArborConfig::default());
            master
                .create(ObjectKind::MapNode, "/m", None, "alice", &Default::default())
                .unwrap();
            let txns: Vec<_> = (0..3)
                .map(|_| master.start_transaction(StartOptions::new("alice")).unwrap())
                .collect();

            use crate::cypress::locks::LockRequest;
            use crate::cypress::service::LockOptions;
            for (txn_index, mode, key, waitable) in requests {
                let request = match mode {
                    0 => LockRequest::exclusive(),
                    1 => LockRequest::shared(),
                    2 => LockRequest::shared_child(key),
                    _ => LockRequest::snapshot(None),
                };
                let _ = master.lock(
                    "/m",
                    Some(txns[txn_index]),
                    "alice",
                    &LockOptions { request, waitable },
                );
            }

            let node_id = {
                let resolved = master.get("/m/@id", None, "alice", &Default::default()).unwrap();
                resolved.as_str().unwrap().parse().unwrap()
            };
            let locks = master.cypress.locks.node_locks(node_id);
            for a in &locks {
                for b in &locks {
                    if a.id == b.id
                        || a.transaction_id == b.transaction_id
                        || a.state != LockState::Acquired
                        || b.state != LockState::Acquired
                    {
                        continue;
                    }
                    let incompatible = match (a.mode, b.mode) {
                        (LockMode::Snapshot, _) | (_, LockMode::Snapshot) => false,
                        (LockMode::Exclusive, _) | (_, LockMode::Exclusive) => true,
                        (LockMode::Shared, LockMode::Shared) => {
                            a.key.is_some() && a.key == b.key
                        }
                    };
                    prop_assert!(
                        !incompatible,
                        "transactions {} and {} hold incompatible locks ({:?} vs {:?})",
                        a.transaction_id,
                        b.transaction_id,
                        a.mode,
                        b.mode
                    );
                }
            }
        }
    }

    mod retention {
        use super::*;
        use crate::config::CleanerConfig;
        use crate::scheduler::archive::ArchiveRequest;
        use crate::scheduler::archive::testing::InMemoryArchive;
        use crate::scheduler::cleaner::{
            CleanerHost, OperationNodeClient, OperationsCleaner, SchedulerAlertType,
        };
        use crate::scheduler::operation::{OperationState, OperationType};
        use arbor_types::{ArborError, ArborResult, IdGenerator, OperationId};
        use chrono::Utc;
        use std::collections::BTreeMap;
        use std::sync::Arc;

        struct NullHost;
        impl CleanerHost for NullHost {
            fn set_scheduler_alert(&self, _: SchedulerAlertType, _: Option<ArborError>) {}
        }

        struct NullNodes;
        #[async_trait::async_trait]
        impl OperationNodeClient for NullNodes {
            async fn get_lock_counts(
                &self,
                ids: &[OperationId],
            ) -> ArborResult<BTreeMap<OperationId, u64>> {
                Ok(ids.iter().map(|id| (*id, 0)).collect())
            }
            async fn remove_operations(
                &self,
                ids: &[OperationId],
            ) -> Vec<(OperationId, ArborResult<()>)> {
                ids.iter().map(|id| (*id, Ok(()))).collect()
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// After one analysis tick the retained set respects the hard
            /// cap and the per-user cap.
            #[test]
            fn retention_bound(
                users in prop::collection::vec(0u8..4, 1..60),
                hard in 0usize..20,
                per_user in 1usize..6,
            ) {
                let mut config = CleanerConfig::default();
                config.clean_delay = std::time::Duration::ZERO;
                config.hard_retained_operation_count = hard;
                config.soft_retained_operation_count = hard;
                config.max_operation_count_per_user = per_user;
                let mut cleaner = OperationsCleaner::new(
                    config,
                    Arc::new(InMemoryArchive::new()),
                    Arc::new(NullNodes),
                    Arc::new(NullHost),
                );

                let mut id_generator = IdGenerator::new(CellTag(1));
                let now = Utc::now();
                let mut submitted_per_user: BTreeMap<String, usize> = BTreeMap::new();
                for user in users {
                    let user = format!("user{user}");
                    *submitted_per_user.entry(user.clone()).or_default() += 1;
                    cleaner.submit_for_archivation(ArchiveRequest {
                        id: id_generator.generate(ObjectKind::Operation),
                        start_time: now - chrono::Duration::minutes(10),
                        finish_time: now - chrono::Duration::minutes(1),
                        state: OperationState::Failed,
                        authenticated_user: user,
                        operation_type: OperationType::Map,
                        spec: json!({}),
                        result: json!({"error": null}),
                        events: json!([]),
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
                        experiment_assignment_names: vec![],
                        controller_features: None,
                    });
                }

                cleaner.analyze_operations(now);
                let max_by_user: usize = submitted_per_user
                    .values()
                    .map(|count| (*count).min(per_user))
                    .sum();
                prop_assert!(cleaner.retained_count() <= hard);
                prop_assert!(cleaner.retained_count() <= max_by_user);
            }
        }
    }
}
