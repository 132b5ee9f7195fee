/// Wall-clock deadlines
///
/// Every bounded wait in the worker goes through `Deadline::run`, so a
/// compile step, a run step and a Docker API call all expire the same way.
/// The deadline never asks the bounded work to stop: the caller decides what
/// to kill once `Bounded::Expired` comes back.
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub enum Bounded<T> {
    Finished(T),
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start the clock now
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.started + self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[cfg(test)]
    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }

    /// Drive `work` until it finishes or the deadline passes. On expiry the
    /// future is dropped.
    pub async fn run<F: Future>(&self, work: F) -> Bounded<F::Output> {
        match tokio::time::timeout_at(self.expires_at(), work).await {
            Ok(value) => Bounded::Finished(value),
            Err(_) => Bounded::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_finishes_within_budget() {
        let deadline = Deadline::after(Duration::from_millis(500));
        let outcome = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                42
            })
            .await;

        assert!(matches!(outcome, Bounded::Finished(42)));
        assert!(!deadline.remaining().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_on_runaway_work() {
        let deadline = Deadline::after(Duration::from_millis(500));
        let outcome = deadline.run(std::future::pending::<()>()).await;

        assert!(matches!(outcome, Bounded::Expired));
        assert!(deadline.remaining().is_zero());
        assert!(deadline.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_shared_across_steps() {
        let deadline = Deadline::after(Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(deadline.remaining(), Duration::from_millis(100));

        let outcome = deadline
            .run(tokio::time::sleep(Duration::from_millis(150)))
            .await;
        assert!(matches!(outcome, Bounded::Expired));
    }
}
