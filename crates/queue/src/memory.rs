//! In-process job queue on the tokio clock.
//!
//! Honors unique live keys, delays and claim leases like the Postgres
//! queue, and keeps failed jobs for inspection. Because due times use
//! `tokio::time::Instant`, tests running with a paused clock observe
//! backoff delays without real sleeping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{JobQueue, QueueError, QueuedJob, StepJob};

#[derive(Default)]
struct Inner {
    /// Ordered by (due time, insertion sequence).
    pending: BTreeMap<(Instant, u64), QueuedJob>,
    /// Claimed jobs with their claim time.
    in_flight: HashMap<Uuid, (QueuedJob, Instant)>,
    live_keys: HashSet<String>,
    failed: Vec<(QueuedJob, String)>,
    seq: u64,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting (due or delayed).
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Time until the earliest pending job is due; `None` if nothing is queued.
    pub async fn next_due_in(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner
            .pending
            .keys()
            .next()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()))
    }

    /// Keys of the pending jobs in due order.
    pub async fn pending_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.pending.values().map(|j| j.key.clone()).collect()
    }

    /// Failed jobs with their error messages.
    pub async fn failed_jobs(&self) -> Vec<(QueuedJob, String)> {
        self.inner.lock().await.failed.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: StepJob, delay: Duration) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let key = job.key();
        if !inner.live_keys.insert(key.clone()) {
            return Ok(false);
        }

        inner.seq += 1;
        let seq = inner.seq;
        let due = Instant::now() + delay;
        inner.pending.insert(
            (due, seq),
            QueuedJob {
                id: Uuid::new_v4(),
                key,
                attempts: 0,
                job,
            },
        );
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let due = match inner.pending.keys().next() {
            Some(&slot) if slot.0 <= now => slot,
            _ => return Ok(None),
        };

        let Some(mut job) = inner.pending.remove(&due) else {
            return Ok(None);
        };
        job.attempts += 1;
        inner.in_flight.insert(job.id, (job.clone(), now));
        Ok(Some(job))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let (job, _) = inner.in_flight.remove(&id).ok_or(QueueError::JobNotFound(id))?;
        inner.live_keys.remove(&job.key);
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let (job, _) = inner.in_flight.remove(&id).ok_or(QueueError::JobNotFound(id))?;
        inner.live_keys.remove(&job.key);
        inner.failed.push((job, error.to_owned()));
        Ok(())
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, (_, claimed_at))| now.saturating_duration_since(*claimed_at) >= lease)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some((job, _)) = inner.in_flight.remove(id) {
                inner.seq += 1;
                let seq = inner.seq;
                inner.pending.insert((now, seq), job);
            }
        }
        Ok(expired.len() as u64)
    }
}
