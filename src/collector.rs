use serde::Serialize;
use std::collections::HashSet;

use crate::types::{EvaluationRecord, FailureReason, TaskFailure, TaskOutcome};

/// Completed records and failures of one run, in arrival order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationRun {
    pub records: Vec<EvaluationRecord>,
    pub failures: Vec<TaskFailure>,
}

impl EvaluationRun {
    pub fn total(&self) -> usize {
        self.records.len() + self.failures.len()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.sample_id.as_str()).collect()
    }
}

/// Append-only sink for worker outcomes. Fed from the dispatcher's result
/// channel by a single consumer, so no locking is needed.
#[derive(Debug)]
pub struct ResultCollector {
    pending: HashSet<String>,
    run: EvaluationRun,
}

impl ResultCollector {
    /// `submitted` are the sample IDs expected to report back.
    pub fn new<I, S>(submitted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pending: HashSet<String> = submitted.into_iter().map(Into::into).collect();
        Self {
            run: EvaluationRun {
                records: Vec::with_capacity(pending.len()),
                failures: Vec::new(),
            },
            pending,
        }
    }

    /// Record one outcome. Outcomes for unknown or already-reported samples
    /// are dropped so each task counts once.
    pub fn push(&mut self, outcome: TaskOutcome) {
        if !self.pending.remove(outcome.sample_id()) {
            tracing::warn!(sample_id = outcome.sample_id(), "Ignoring duplicate or unknown outcome");
            return;
        }
        match outcome {
            TaskOutcome::Completed(record) => self.run.records.push(record),
            TaskOutcome::Failed(failure) => self.run.failures.push(failure),
        }
    }

    /// Record a failure for a task that was never dispatched.
    pub fn reject(&mut self, failure: TaskFailure) {
        self.run.failures.push(failure);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Close the collector. Samples that never reported are recorded as
    /// failed, so every submitted task yields exactly one outcome.
    pub fn finish(mut self) -> EvaluationRun {
        let mut unreported: Vec<String> = self.pending.drain().collect();
        unreported.sort();
        for sample_id in unreported {
            tracing::error!(sample_id = %sample_id, "Task finished without reporting an outcome");
            self.run.failures.push(TaskFailure {
                sample_id,
                reason: FailureReason::WorkerAborted,
                message: "worker stopped before reporting".to_string(),
            });
        }
        self.run
    }
}
