use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{JobQueue, QueueError, RetryDecision, RetryPolicy};
use crate::types::{
    Delivery, ExecutionResult, JobMetadata, JobRequest, JobSnapshot, JobState, QueueStats,
};

struct Record {
    job: JobRequest,
    state: JobState,
    attempts: u32,
    last_error: Option<String>,
    result: Option<ExecutionResult>,
    settled_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, Record>,
    waiting: VecDeque<Uuid>,
    processing: HashSet<Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    completed: u64,
    failed: u64,
}

impl Inner {
    fn evict_expired(&mut self, retention: Duration) {
        let now = Instant::now();
        self.records.retain(|_, record| match record.settled_at {
            Some(at) => now.duration_since(at) < retention,
            None => true,
        });
    }

    fn promote_due(&mut self) -> usize {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;
        for (_, id) in &due {
            self.waiting.push_back(*id);
        }
        due.len()
    }

    fn next_delayed(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }

    fn claim(&mut self) -> Option<Delivery> {
        while let Some(id) = self.waiting.pop_front() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.state.is_terminal() {
                continue;
            }
            record.state = JobState::Active;
            record.attempts += 1;
            self.processing.insert(id);
            return Some(Delivery {
                job: record.job.clone(),
                attempt: record.attempts,
            });
        }
        None
    }

    fn settle(
        &mut self,
        job_id: Uuid,
        state: JobState,
        result: ExecutionResult,
        last_error: Option<String>,
    ) {
        self.processing.remove(&job_id);
        let Some(record) = self.records.get_mut(&job_id) else {
            return;
        };
        if !record.state.can_transition_to(state) {
            return;
        }
        record.state = state;
        record.result = Some(result);
        record.settled_at = Some(Instant::now());
        if last_error.is_some() {
            record.last_error = last_error;
        }
        match state {
            JobState::Failed => self.failed += 1,
            _ => self.completed += 1,
        }
    }
}

/// In-process queue with the same lifecycle as the Redis backend
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    policy: RetryPolicy,
    retention: Duration,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            policy,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Duration::from_secs(3600))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &JobRequest) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            inner.records.insert(
                job.id,
                Record {
                    job: job.clone(),
                    state: JobState::Queued,
                    attempts: 0,
                    last_error: None,
                    result: None,
                    settled_at: None,
                },
            );
            inner.waiting.push_back(job.id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let next_wake = {
                let mut inner = self.lock();
                inner.promote_due();
                if let Some(delivery) = inner.claim() {
                    return Ok(Some(delivery));
                }
                inner
                    .next_delayed()
                    .map_or(deadline, |ready_at| ready_at.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(next_wake) => {}
            }
        }
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.lock().processing.contains(&job_id))
    }

    async fn complete(&self, job_id: Uuid, result: &ExecutionResult) -> Result<(), QueueError> {
        self.lock()
            .settle(job_id, JobState::Completed, result.clone(), None);
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<RetryDecision, QueueError> {
        let job_id = delivery.job.id;
        let decision = self.policy.decide(delivery.attempt, delivery.job.max_attempts);

        let mut inner = self.lock();
        match decision {
            RetryDecision::Retry { delay } => {
                inner.processing.remove(&job_id);
                let Some(record) = inner.records.get_mut(&job_id) else {
                    return Ok(decision);
                };
                if record.state.is_terminal() {
                    return Ok(decision);
                }
                record.last_error = Some(reason.to_string());
                inner.delayed.push((Instant::now() + delay, job_id));
            }
            RetryDecision::Failed => {
                inner.settle(
                    job_id,
                    JobState::Failed,
                    ExecutionResult::infrastructure_failure(),
                    Some(reason.to_string()),
                );
            }
        }
        Ok(decision)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, QueueError> {
        let mut inner = self.lock();
        inner.evict_expired(self.retention);
        Ok(inner.records.get(&job_id).map(|record| JobSnapshot {
            id: job_id,
            language: record.job.language,
            state: record.state,
            metadata: JobMetadata {
                attempts: record.attempts,
                max_attempts: record.job.max_attempts,
                last_failure_reason: record.last_error.clone(),
            },
            result: record.result.clone(),
            created_at: record.job.created_at,
        }))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.lock();
        Ok(QueueStats::new(
            inner.waiting.len() as u64,
            (inner.processing.len() + inner.delayed.len()) as u64,
            inner.completed,
            inner.failed,
        ))
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let promoted = self.lock().promote_due();
        if promoted > 0 {
            self.notify.notify_one();
        }
        Ok(promoted)
    }

    async fn reap(&self) -> Result<usize, QueueError> {
        // Workers share the process; a dead worker takes the queue with it
        Ok(0)
    }
}
