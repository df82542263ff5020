use futures::future::join_all;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::client::{ClassifierClient, ImageLoader};
use crate::collector::{EvaluationRun, ResultCollector};
use crate::config::DispatchConfig;
use crate::error::TaskError;
use crate::label::normalize;
use crate::parser::ResponseParser;
use crate::rate_limiter::RateLimiter;
use crate::types::{
    EvaluationRecord, FailureReason, Indicator, Labels, Task, TaskFailure, TaskOutcome,
};

/// Runs every task through load → rate limit → classify → parse on a fixed
/// pool of workers fed from a bounded queue.
pub struct TaskDispatcher {
    processor: Arc<TaskProcessor>,
    config: DispatchConfig,
}

impl TaskDispatcher {
    pub fn new(
        config: DispatchConfig,
        limiter: Arc<RateLimiter>,
        client: Arc<dyn ClassifierClient>,
        images: Arc<dyn ImageLoader>,
        parser: Arc<dyn ResponseParser>,
    ) -> Self {
        Self {
            processor: Arc::new(TaskProcessor {
                limiter,
                client,
                images,
                parser,
            }),
            config,
        }
    }

    /// Process all tasks and return once each one has produced exactly one
    /// outcome. Per-task failures never abort the run.
    #[tracing::instrument(skip(self, tasks), fields(task_count = tasks.len(), workers = self.config.workers))]
    pub async fn run(&self, tasks: Vec<Task>) -> EvaluationRun {
        let run_start = Instant::now();
        let (tasks, duplicates) = split_duplicates(tasks);
        let mut collector = ResultCollector::new(tasks.iter().map(|task| task.sample_id.clone()));
        for task in duplicates {
            counter!("tasks_failed_total", "reason" => FailureReason::DuplicateSample.as_str())
                .increment(1);
            tracing::warn!(sample_id = %task.sample_id, "Duplicate sample ID, not dispatched");
            collector.reject(TaskFailure {
                sample_id: task.sample_id,
                reason: FailureReason::DuplicateSample,
                message: "sample ID already submitted in this run".to_string(),
            });
        }
        let workers = self.config.workers.clamp(1, tasks.len().max(1));

        let (task_tx, task_rx) = flume::bounded::<Task>(workers);
        let (outcome_tx, outcome_rx) = flume::bounded::<TaskOutcome>(workers);

        let feeder = tokio::spawn(async move {
            for task in tasks {
                if task_tx.send_async(task).await.is_err() {
                    tracing::error!("All workers stopped, remaining tasks will not be dispatched");
                    break;
                }
            }
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    task_rx: task_rx.clone(),
                    outcome_tx: outcome_tx.clone(),
                    processor: Arc::clone(&self.processor),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(task_rx);
        drop(outcome_tx);

        // Ends once every worker has dropped its sender.
        while let Ok(outcome) = outcome_rx.recv_async().await {
            collector.push(outcome);
            tracing::trace!(pending = collector.pending(), "Outcome collected");
        }

        for (worker_id, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(worker_id, error = %e, "Worker terminated abnormally");
            }
        }
        if let Err(e) = feeder.await {
            tracing::error!(error = %e, "Task feeder terminated abnormally");
        }

        let run = collector.finish();
        tracing::info!(
            completed = run.records.len(),
            failed = run.failures.len(),
            elapsed_ms = run_start.elapsed().as_millis() as u64,
            "Dispatch finished"
        );
        run
    }
}

/// Keep the first task per sample ID; later repeats are returned separately.
fn split_duplicates(tasks: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    let mut seen = HashSet::with_capacity(tasks.len());
    tasks
        .into_iter()
        .partition(|task| seen.insert(task.sample_id.clone()))
}

struct Worker {
    worker_id: usize,
    task_rx: flume::Receiver<Task>,
    outcome_tx: flume::Sender<TaskOutcome>,
    processor: Arc<TaskProcessor>,
}

impl Worker {
    #[tracing::instrument(skip(self), fields(worker_id = self.worker_id))]
    async fn run(self) {
        while let Ok(task) = self.task_rx.recv_async().await {
            let outcome = self.processor.process(task).await;
            if self.outcome_tx.send_async(outcome).await.is_err() {
                tracing::warn!("Result channel closed, worker exiting");
                break;
            }
        }
        tracing::debug!("Task queue drained");
    }
}

struct TaskProcessor {
    limiter: Arc<RateLimiter>,
    client: Arc<dyn ClassifierClient>,
    images: Arc<dyn ImageLoader>,
    parser: Arc<dyn ResponseParser>,
}

impl TaskProcessor {
    #[tracing::instrument(skip(self, task), fields(sample_id = %task.sample_id))]
    async fn process(&self, task: Task) -> TaskOutcome {
        match self.evaluate(&task).await {
            Ok(record) => {
                counter!("tasks_completed_total").increment(1);
                tracing::debug!("Task completed");
                TaskOutcome::Completed(record)
            }
            Err(e) => {
                let reason = e.reason();
                counter!("tasks_failed_total", "reason" => reason.as_str()).increment(1);
                tracing::warn!(reason = reason.as_str(), error = %e, "Task failed");
                TaskOutcome::Failed(TaskFailure {
                    sample_id: task.sample_id,
                    reason,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn evaluate(&self, task: &Task) -> Result<EvaluationRecord, TaskError> {
        // Unresolvable images fail before a rate-limit slot is taken.
        let image = self.images.load(&task.image).await?;

        let raw_response = {
            let _permit = self.limiter.acquire().await;
            counter!("classifier_calls_total").increment(1);
            let call_start = Instant::now();
            let response = self
                .client
                .classify(&image)
                .await
                .map_err(|e| TaskError::Transport(format!("{e:#}")))?;
            tracing::debug!(
                elapsed_ms = call_start.elapsed().as_millis() as u64,
                "Classifier responded"
            );
            response
        };

        if raw_response.trim().is_empty() {
            return Err(TaskError::EmptyResponse);
        }

        let prediction = self.parser.parse(&raw_response)?;

        let ground_truth: Labels = Indicator::ALL
            .into_iter()
            .map(|indicator| {
                let raw = task.ground_truth.get(&indicator).and_then(|v| v.as_deref());
                (indicator, normalize(raw))
            })
            .collect();
        let predictions: Labels = Indicator::ALL
            .into_iter()
            .map(|indicator| {
                let raw = prediction.labels.get(&indicator).and_then(|v| v.as_deref());
                (indicator, normalize(raw))
            })
            .collect();

        Ok(EvaluationRecord {
            sample_id: task.sample_id.clone(),
            ground_truth,
            predictions,
            raw_response,
        })
    }
}
