/// Execution Worker - dequeue, execute one job, record the outcome
///
/// Each worker is strictly sequential. A program's own failure is a result
/// and is completed as-is; only sandbox failures go back to the queue's
/// retry path.
use std::sync::Arc;
use std::time::Duration;

use sandbox_common::{Delivery, JobQueue, RetryDecision};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tracing::{debug, error, info, warn};

use crate::runner::LanguageRunner;

/// How long one dequeue blocks before the shutdown flag is checked again
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often a running attempt renews its delivery lease
pub const LEASE_RENEWAL: Duration = Duration::from_secs(10);
const BROKER_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    id: usize,
    queue: Arc<dyn JobQueue>,
    runner: Arc<LanguageRunner>,
    poll_interval: Duration,
    lease_renewal: Duration,
}

impl Worker {
    pub fn new(id: usize, queue: Arc<dyn JobQueue>, runner: Arc<LanguageRunner>) -> Self {
        Self {
            id,
            queue,
            runner,
            poll_interval: POLL_INTERVAL,
            lease_renewal: LEASE_RENEWAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_renewal(mut self, lease_renewal: Duration) -> Self {
        self.lease_renewal = lease_renewal;
        self
    }

    /// Run until `shutdown` fires. A job already dequeued is always finished.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = self.id, "Worker started");

        while !shutdown.is_cancelled() {
            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = self.id, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(BROKER_BACKOFF) => {}
                    }
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    pub async fn process(&self, delivery: Delivery) {
        let job_id = delivery.job.id;
        info!(
            worker = self.id,
            job_id = %job_id,
            language = %delivery.job.language,
            attempt = delivery.attempt,
            timeout_ms = delivery.job.timeout_ms,
            "Processing job"
        );

        // Own task so a panic in execution is contained to this attempt
        let runner = self.runner.clone();
        let job = delivery.job.clone();
        let mut attempt = tokio::spawn(async move { runner.execute(&job).await });

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.lease_renewal,
            self.lease_renewal,
        );
        let joined = loop {
            tokio::select! {
                joined = &mut attempt => break joined,
                _ = heartbeat.tick() => self.renew_lease(job_id).await,
            }
        };

        let reason = match joined {
            Ok(Ok(result)) => {
                info!(
                    worker = self.id,
                    job_id = %job_id,
                    status = %result.status,
                    runtime_ms = result.runtime_ms,
                    "Job finished"
                );
                if let Err(e) = self.queue.complete(job_id, &result).await {
                    // The lease runs out and the reaper retries the job
                    error!(worker = self.id, job_id = %job_id, error = %e, "Failed to record result");
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("execution task aborted: {}", e),
        };

        warn!(worker = self.id, job_id = %job_id, attempt = delivery.attempt, reason = %reason, "Infrastructure failure");
        match self.queue.retry_or_fail(&delivery, &reason).await {
            Ok(RetryDecision::Retry { delay }) => {
                info!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Retry scheduled")
            }
            Ok(RetryDecision::Failed) => {
                warn!(job_id = %job_id, attempts = delivery.attempt, "Job failed after final attempt")
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to schedule retry")
            }
        }
    }

    async fn renew_lease(&self, job_id: Uuid) {
        match self.queue.extend_lease(job_id).await {
            Ok(true) => debug!(worker = self.id, job_id = %job_id, "Lease renewed"),
            Ok(false) => {
                warn!(worker = self.id, job_id = %job_id, "Lease already lapsed; job may be redelivered")
            }
            Err(e) => warn!(worker = self.id, job_id = %job_id, error = %e, "Lease renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LaunchError;
    use crate::runner::tests::{exited, job, killed, ScriptedLauncher};
    use async_trait::async_trait;
    use sandbox_common::{
        ExecutionResult, ExecutionStatus, JobRequest, JobSnapshot, JobState, Language, MemoryQueue,
        QueueError, QueueStats, RetryPolicy, INFRASTRUCTURE_FAILURE_MESSAGE,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lease renewals on top of an in-memory queue
    struct RenewalCounter {
        inner: MemoryQueue,
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for RenewalCounter {
        async fn enqueue(&self, job: &JobRequest) -> Result<(), QueueError> {
            self.inner.enqueue(job).await
        }
        async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
            self.inner.dequeue(wait).await
        }
        async fn extend_lease(&self, job_id: Uuid) -> Result<bool, QueueError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.inner.extend_lease(job_id).await
        }
        async fn complete(&self, job_id: Uuid, result: &ExecutionResult) -> Result<(), QueueError> {
            self.inner.complete(job_id, result).await
        }
        async fn retry_or_fail(
            &self,
            delivery: &Delivery,
            reason: &str,
        ) -> Result<RetryDecision, QueueError> {
            self.inner.retry_or_fail(delivery, reason).await
        }
        async fn status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, QueueError> {
            self.inner.status(job_id).await
        }
        async fn stats(&self) -> Result<QueueStats, QueueError> {
            self.inner.stats().await
        }
        async fn promote_due(&self) -> Result<usize, QueueError> {
            self.inner.promote_due().await
        }
        async fn reap(&self) -> Result<usize, QueueError> {
            self.inner.reap().await
        }
    }

    fn worker(queue: Arc<MemoryQueue>, launcher: Arc<ScriptedLauncher>, root: &std::path::Path) -> Worker {
        let runner = Arc::new(LanguageRunner::new(launcher, root, Duration::from_secs(10)));
        Worker::new(0, queue, runner).with_poll_interval(Duration::from_millis(10))
    }

    fn fast_retries() -> Arc<MemoryQueue> {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        Arc::new(MemoryQueue::new(policy, Duration::from_secs(3600)))
    }

    fn unavailable() -> Result<crate::launcher::LaunchOutput, LaunchError> {
        Err(LaunchError::Unavailable("docker daemon not reachable".into()))
    }

    #[tokio::test]
    async fn test_successful_job_is_completed() {
        let root = tempfile::tempdir().unwrap();
        let queue = fast_retries();
        let launcher = Arc::new(ScriptedLauncher::new(vec![Ok(exited(0, "3\n", ""))]));
        let job = job(Language::Javascript, "console.log(1+2)", "");
        queue.enqueue(&job).await.unwrap();

        let worker = worker(queue.clone(), launcher, root.path());
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        worker.process(delivery).await;

        let snapshot = queue.status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        let result = snapshot.result.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "3\n");
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_not_retried() {
        let root = tempfile::tempdir().unwrap();
        let queue = fast_retries();
        let launcher = Arc::new(ScriptedLauncher::new(vec![Ok(killed())]));
        let job = job(Language::Python, "while True: pass", "");
        queue.enqueue(&job).await.unwrap();

        let worker = worker(queue.clone(), launcher.clone(), root.path());
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        worker.process(delivery).await;

        let snapshot = queue.status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.result.unwrap().status, ExecutionStatus::Timeout);
        assert_eq!(snapshot.metadata.attempts, 1);
        assert_eq!(launcher.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_retries_then_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let queue = fast_retries();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            unavailable(),
            Ok(exited(0, "ok\n", "")),
        ]));
        let job = job(Language::Python, "print('ok')", "");
        queue.enqueue(&job).await.unwrap();
        let worker = worker(queue.clone(), launcher.clone(), root.path());

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        worker.process(first).await;
        assert_eq!(
            queue.status(job.id).await.unwrap().unwrap().state,
            JobState::Active
        );

        queue.promote_due().await.unwrap();
        let second = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        worker.process(second).await;

        let snapshot = queue.status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.metadata.attempts, 2);

        let calls = launcher.calls.lock().unwrap();
        assert_ne!(calls[0].workspace, calls[1].workspace);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let queue = fast_retries();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            Ok(exited(0, "never\n", "")),
        ]));
        let job = job(Language::Python, "print('never')", "");
        queue.enqueue(&job).await.unwrap();
        let worker = worker(queue.clone(), launcher.clone(), root.path());

        for _ in 0..3 {
            queue.promote_due().await.unwrap();
            let delivery = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
            worker.process(delivery).await;
        }

        queue.promote_due().await.unwrap();
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());

        let snapshot = queue.status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        let result = snapshot.result.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stderr, INFRASTRUCTURE_FAILURE_MESSAGE);
        assert_eq!(launcher.calls.lock().unwrap().len(), 3);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_long_attempt_keeps_renewing_its_lease() {
        let root = tempfile::tempdir().unwrap();
        let queue = Arc::new(RenewalCounter {
            inner: MemoryQueue::default(),
            renewals: AtomicUsize::new(0),
        });
        let launcher = Arc::new(
            ScriptedLauncher::new(vec![Ok(exited(0, "done\n", ""))])
                .with_delay(Duration::from_millis(200)),
        );
        let job = job(Language::Python, "import time; time.sleep(60)", "");
        queue.enqueue(&job).await.unwrap();

        let runner = Arc::new(LanguageRunner::new(launcher, root.path(), Duration::from_secs(10)));
        let worker = Worker::new(0, queue.clone(), runner).with_lease_renewal(Duration::from_millis(20));
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        worker.process(delivery).await;

        assert!(queue.renewals.load(Ordering::SeqCst) >= 3);
        let snapshot = queue.status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.metadata.attempts, 1);
    }

    #[tokio::test]
    async fn test_quick_attempt_does_not_renew() {
        let root = tempfile::tempdir().unwrap();
        let queue = Arc::new(RenewalCounter {
            inner: MemoryQueue::default(),
            renewals: AtomicUsize::new(0),
        });
        let launcher = Arc::new(ScriptedLauncher::new(vec![Ok(exited(0, "1\n", ""))]));
        let job = job(Language::Python, "print(1)", "");
        queue.enqueue(&job).await.unwrap();

        let runner = Arc::new(LanguageRunner::new(launcher, root.path(), Duration::from_secs(10)));
        let worker = Worker::new(0, queue.clone(), runner);
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        worker.process(delivery).await;

        assert_eq!(queue.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_loop_drains_and_stops_on_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let queue = fast_retries();
        let launcher = Arc::new(ScriptedLauncher::default());
        let first = job(Language::Python, "print(1)", "");
        let second = job(Language::Python, "print(2)", "");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker(queue.clone(), launcher, root.path()).run(shutdown.clone()));

        for _ in 0..100 {
            if queue.stats().await.unwrap().completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total, 0);
    }
}
