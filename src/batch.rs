use crate::error::LookupError;
use crate::orchestrator::{LookupContext, LookupOrchestrator};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::types::{AddressBatch, AddressOutcome, LookupResult, LookupTask, TaskStatus};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl From<Result<LookupResult, LookupError>> for AddressOutcome {
    fn from(outcome: Result<LookupResult, LookupError>) -> Self {
        match outcome {
            Ok(result) => AddressOutcome::Data(result),
            Err(e) => AddressOutcome::Error(e.to_body()),
        }
    }
}

/// Drives a batch through the orchestrator in fixed-size chunks.
///
/// Each chunk runs concurrently and is awaited as a whole before the next
/// one starts, which bounds simultaneous session demand to `chunk_size`.
pub struct BatchCoordinator {
    orchestrator: Arc<LookupOrchestrator>,
    chunk_size: usize,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<LookupOrchestrator>, chunk_size: usize) -> Self {
        Self {
            orchestrator,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn run(
        &self,
        batch: AddressBatch,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> LookupTask {
        let mut task = LookupTask::new(batch.queries);
        self.run_task(&mut task, sink, cancel).await;
        task
    }

    /// Runs `task` to completion, filling in its results. A failed address
    /// is recorded and the batch carries on; only cancellation marks the
    /// task Failed.
    pub async fn run_task(&self, task: &mut LookupTask, sink: Arc<dyn ProgressSink>, cancel: CancellationToken) {
        let total = task.addresses.len();
        let tracker = Arc::new(ProgressTracker::new(total));
        let ctx = LookupContext::new(task.id.clone(), sink)
            .with_cancel(cancel.clone())
            .with_tracker(tracker.clone());

        task.status = TaskStatus::Running;
        info!(
            "Task {}: {} addresses in chunks of {}",
            task.id, total, self.chunk_size
        );

        let queries = task.addresses.clone();
        let mut processed = 0;
        for (index, chunk) in queries.chunks(self.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let outcomes = join_all(chunk.iter().map(|query| self.orchestrator.lookup(query, &ctx))).await;
            for (query, outcome) in chunk.iter().zip(outcomes) {
                task.results.insert(query.address.clone(), outcome.into());
            }
            processed += chunk.len();
            task.progress = tracker.percent();

            let info = tracker.get_progress();
            info!(
                "Task {}: chunk {} done, {}/{} addresses ({} errors)",
                task.id,
                index + 1,
                info.completed,
                info.total,
                info.errors
            );
        }

        if processed < total {
            warn!(
                "Task {} cancelled with {} addresses not started",
                task.id,
                total - processed
            );
            for query in &queries[processed..] {
                let outcome = Err(LookupError::Cancelled);
                ctx.finish(&query.address, &outcome);
                task.results.insert(query.address.clone(), outcome.into());
            }
        }

        task.progress = tracker.percent();
        task.status = if cancel.is_cancelled() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        info!(
            "Task {} {:?}: {} succeeded, {} failed",
            task.id,
            task.status,
            task.success_count(),
            task.error_count()
        );
    }
}
