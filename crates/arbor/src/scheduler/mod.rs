//! Scheduler operation lifecycle and the operations cleaner.

/// Archive requests, row families, and the tabular-storage seam.
pub mod archive;

/// The archival/removal pipelines with retention analysis.
pub mod cleaner;

/// Jobs: one attempt of one worker within an operation.
pub mod job;

/// Operation state machine, events, alerts, runtime parameters.
pub mod operation;
