//! `queue` crate: the durable work queue between the orchestrator
//! (producer) and the worker pool (consumers).
//!
//! Delivery is at-least-once. Each job carries a stable key of
//! `(run_id, node_id, retry_count)`; a key is unique while its job is live,
//! so the identical retry attempt can never be queued twice concurrently.
//! A job whose worker died is redelivered once its lease runs out.

pub mod error;
pub mod job;
pub mod memory;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use error::QueueError;
pub use job::{QueuedJob, StepJob};
pub use memory::MemoryQueue;
pub use pg::PgQueue;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule `job` to become visible after `delay`.
    ///
    /// Returns `false` when a live job with the same key already exists.
    async fn enqueue(&self, job: StepJob, delay: Duration) -> Result<bool, QueueError>;

    /// Claim the oldest due job, if any.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge a claimed job; its key becomes free again.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Move a claimed job to the failed set, where it is retained for
    /// debugging. Its key becomes free again.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Make jobs claimed more than `lease` ago visible again, keeping their
    /// key live. The next claim counts as a further delivery attempt.
    /// Returns how many jobs were reclaimed.
    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError>;
}
