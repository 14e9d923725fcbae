//! Queue worker pool.
//!
//! Polls the queue and runs each job through [`WorkflowEngine::execute_claimed`]
//! on its own task, with at most `worker_concurrency` jobs in flight. A job
//! is acknowledged once it returns `Ok`; an infrastructure error
//! moves it to the queue's failed set instead. Jobs whose claim outlived
//! `job_lease` (their worker died) are periodically made visible again.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use queue::{JobQueue, QueuedJob};

use crate::{EngineError, StepOutcome, executor::WorkflowEngine};

/// Run until `shutdown` flips to `true`, then wait for in-flight jobs.
pub async fn run(
    engine: Arc<WorkflowEngine>,
    queue: Arc<dyn JobQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let concurrency = engine.config().worker_concurrency.max(1);
    let poll_interval = engine.config().poll_interval;
    let lease = engine.config().job_lease;
    let reclaim_every = (lease / 2).max(poll_interval);
    let mut last_reclaim: Option<Instant> = None;
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    info!(concurrency, "worker started");

    while !*shutdown.borrow() {
        // Reap finished tasks so the set does not grow without bound.
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!("worker task panicked: {e}");
            }
        }

        if last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every) {
            if let Err(e) = queue.reclaim_stale(lease).await {
                warn!("reclaiming expired jobs failed: {e}");
            }
            last_reclaim = Some(Instant::now());
        }

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let job = match queue.dequeue().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
                continue;
            }
            Err(e) => {
                drop(permit);
                warn!("dequeue failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
                continue;
            }
        };

        let engine = engine.clone();
        let queue = queue.clone();
        tasks.spawn(async move {
            process(&engine, queue.as_ref(), job).await;
            drop(permit);
        });
    }

    info!(in_flight = tasks.len(), "worker draining");
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!("worker task panicked: {e}");
        }
    }
    info!("worker stopped");
    Ok(())
}

/// Execute one claimed job and settle it with the queue.
pub async fn process(engine: &WorkflowEngine, queue: &dyn JobQueue, job: QueuedJob) {
    match engine.execute_claimed(&job).await {
        Ok(outcome) => {
            debug!(key = %job.key, ?outcome, "job done");
            if let Err(e) = queue.complete(job.id).await {
                error!(key = %job.key, "could not acknowledge job: {e}");
                return;
            }
            // The key is free now; pick up a step whose re-enqueue collided with it.
            if outcome == StepOutcome::Ignored {
                if let Err(e) = engine.requeue_dropped(&job.job).await {
                    error!(key = %job.key, "could not requeue dropped step: {e}");
                }
            }
        }
        Err(err) => {
            error!(key = %job.key, attempts = job.attempts, "job failed: {err}");
            if let Err(e) = queue.fail(job.id, &err.to_string()).await {
                error!(key = %job.key, "could not record job failure: {e}");
            }
        }
    }
}
