//! Queue error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("job payload could not be (de)serialized: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),
}
