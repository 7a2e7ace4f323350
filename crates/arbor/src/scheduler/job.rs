//! One attempt of one worker within an operation.
//!
//! The scheduler tracks jobs per operation and per exec node; resource
//! accounting starts at the granted limits and shrinks as the job releases
//! what it no longer needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_types::{ArborError, OperationId};

pub type JobId = arbor_types::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Map,
    SortedMerge,
    OrderedMerge,
    UnorderedMerge,
    Partition,
    SimpleSort,
    FinalSort,
    SortedReduce,
    PartitionMap,
    PartitionReduce,
    ReduceCombiner,
    RemoteCopy,
    JoinReduce,
    Vanilla,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    Normal,
    Graceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Aborting,
    Completed,
    Failed,
    Aborted,
}

/// Resources granted to or consumed by one job.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JobResources {
    pub cpu: f64,
    pub memory: u64,
    pub user_slots: u32,
    pub network: u32,
}

/// Descriptor of the exec node the job landed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecNodeDescriptor {
    pub address: String,
    pub resource_limits: JobResources,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub operation_id: OperationId,
    pub node: ExecNodeDescriptor,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub state: JobState,
    pub interruptible: bool,
    pub preemption_mode: PreemptionMode,
    pub tree_id: String,
    pub scheduling_index: i32,
    pub resource_limits: JobResources,
    pub resource_usage: JobResources,
    pub result_error: Option<ArborError>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        job_type: JobType,
        operation_id: OperationId,
        node: ExecNodeDescriptor,
        start_time: DateTime<Utc>,
        resource_limits: JobResources,
        interruptible: bool,
        preemption_mode: PreemptionMode,
        tree_id: impl Into<String>,
        scheduling_index: i32,
    ) -> Self {
        Job {
            id,
            job_type,
            operation_id,
            node,
            start_time,
            finish_time: None,
            state: JobState::Waiting,
            interruptible,
            preemption_mode,
            tree_id: tree_id.into(),
            scheduling_index,
            // Usage starts at the granted limits and only shrinks.
            resource_usage: resource_limits,
            resource_limits,
            result_error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }

    /// Wall time of a finished job.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finish_time.map(|finish| finish - self.start_time)
    }

    pub fn set_resource_usage(&mut self, usage: JobResources) {
        self.resource_usage = usage;
    }

    pub fn finish(
        &mut self,
        state: JobState,
        result_error: Option<ArborError>,
        now: DateTime<Utc>,
    ) {
        self.state = state;
        self.finish_time = Some(now);
        self.result_error = result_error;
        self.resource_usage = JobResources::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{CellTag, ErrorCode, IdGenerator, ObjectKind};

    fn sample_job() -> Job {
        let mut id_generator = IdGenerator::new(CellTag(1));
        let operation_id = id_generator.generate(ObjectKind::Operation);
        Job::new(
            id_generator.generate(ObjectKind::Job),
            JobType::Map,
            operation_id,
            ExecNodeDescriptor {
                address: "node-17.cluster:9012".to_string(),
                resource_limits: JobResources {
                    cpu: 32.0,
                    memory: 256 << 30,
                    user_slots: 40,
                    network: 100,
                },
            },
            Utc::now(),
            JobResources {
                cpu: 1.0,
                memory: 4 << 30,
                user_slots: 1,
                network: 0,
            },
            true,
            PreemptionMode::Normal,
            "physical",
            7,
        )
    }

    #[test]
    fn test_usage_starts_at_limits() {
        let job = sample_job();
        assert_eq!(job.resource_usage, job.resource_limits);
        assert_eq!(job.state, JobState::Waiting);
        assert!(!job.is_finished());
        assert!(job.duration().is_none());
    }

    #[test]
    fn test_finish_releases_resources_and_stamps_time() {
        let mut job = sample_job();
        job.state = JobState::Running;
        let finish = job.start_time + chrono::Duration::seconds(90);
        job.finish(
            JobState::Failed,
            Some(ArborError::new(ErrorCode::Generic, "user code exited with 1")),
            finish,
        );
        assert!(job.is_finished());
        assert_eq!(job.duration(), Some(chrono::Duration::seconds(90)));
        assert_eq!(job.resource_usage, JobResources::default());
        assert!(job.result_error.is_some());
    }
}
