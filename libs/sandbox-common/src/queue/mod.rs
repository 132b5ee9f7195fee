//! Job queue and result store
//!
//! `JobQueue` is the seam between the API, the workers and the broker. The
//! Redis backend is what runs in production; the in-memory backend serves
//! tests and single-process setups. Both implement the same lifecycle:
//!
//! ```text
//! enqueue -> waiting --dequeue--> processing --complete--> completed
//!                ^                    |
//!                |              retry_or_fail
//!                |                    |
//!                +--promote_due-- delayed      (attempts exhausted -> failed)
//! ```
//!
//! A delivery in `processing` is protected by a lease. The worker holding it
//! renews the lease with `extend_lease` while the attempt runs; `reap` only
//! recovers deliveries whose lease has lapsed.

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Delivery, ExecutionResult, JobRequest, JobSnapshot, QueueStats};

#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable or command failed; callers may retry
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    /// Stored data could not be decoded
    #[error("corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Attempt cap and exponential backoff for infrastructure failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempt` (1-based)
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Decide what happens after `failed_attempt` of a job allowed `max_attempts`
    pub fn decide(&self, failed_attempt: u32, max_attempts: u32) -> RetryDecision {
        let cap = max_attempts.clamp(1, self.max_attempts.max(1));
        if failed_attempt < cap {
            RetryDecision::Retry {
                delay: self.delay_after(failed_attempt),
            }
        } else {
            RetryDecision::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Failed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store the job as `queued` and make it visible to workers. Never blocks
    /// on execution.
    async fn enqueue(&self, job: &JobRequest) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next job. The returned delivery is owned by
    /// the caller until it calls `complete` or `retry_or_fail`.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Push back the lease of an in-flight delivery by another full lease
    /// period. `false` means the caller no longer holds the job: it settled
    /// or the reaper already handed it back.
    async fn extend_lease(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Attach the terminal result and mark the job `completed`. A job that is
    /// already terminal is left untouched.
    async fn complete(&self, job_id: Uuid, result: &ExecutionResult) -> Result<(), QueueError>;

    /// Record an infrastructure failure of `delivery`: schedule another
    /// attempt with backoff, or mark the job `failed` once attempts run out.
    async fn retry_or_fail(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<RetryDecision, QueueError>;

    /// Current view of a job; `None` when unknown or evicted
    async fn status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Move delayed retries whose backoff elapsed back to the waiting list
    async fn promote_due(&self) -> Result<usize, QueueError>;

    /// Route deliveries held by dead workers to the retry path
    async fn reap(&self) -> Result<usize, QueueError>;
}
