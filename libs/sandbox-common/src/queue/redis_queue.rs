use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobQueue, QueueError, RetryDecision, RetryPolicy};
use crate::redis::{
    job_key, lease_key, COMPLETED_COUNTER, COMPLETIONS_CHANNEL, DELAYED_KEY, FAILED_COUNTER,
    PROCESSING_KEY, WAITING_KEY,
};
use crate::types::{
    CompletionEvent, Delivery, ExecutionResult, JobMetadata, JobRequest, JobSnapshot, JobState,
    Language, QueueStats,
};

/// Claims a popped job id: marks it active, bumps the attempt counter and
/// takes the delivery lease. Returns nil for evicted or already-settled jobs.
const ACTIVATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('LREM', KEYS[3], 0, ARGV[1])
  return false
end
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'completed' or state == 'failed' then
  redis.call('LREM', KEYS[3], 0, ARGV[1])
  return false
end
redis.call('HSET', KEYS[1], 'state', 'active')
local attempts = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[2])
return {redis.call('HGET', KEYS[1], 'job'), attempts}
"#;

/// Moves a job into a terminal state exactly once. Returns the job language
/// when this call settled the job, nil when it was already terminal.
const SETTLE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('DEL', KEYS[2])
if not state or state == 'completed' or state == 'failed' then
  return false
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'result', ARGV[3])
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[1], 'last_error', ARGV[5])
end
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('INCR', KEYS[4])
return redis.call('HGET', KEYS[1], 'language')
"#;

/// Parks a job in the delayed set until its backoff elapses. The job stays
/// `active` so its state never moves backwards.
const RETRY_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('DEL', KEYS[2])
if not state or state == 'completed' or state == 'failed' then
  return 0
end
redis.call('HSET', KEYS[1], 'last_error', ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[1])
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

const PROMOTE_BATCH: usize = 100;

struct Scripts {
    activate: Script,
    settle: Script,
    retry: Script,
    promote: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            activate: Script::new(ACTIVATE_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
        }
    }
}

/// Redis-backed queue and result store.
///
/// Each instance owns its own connection, so a blocking `dequeue` only ever
/// stalls the worker that issued it. Construct one per worker.
pub struct RedisQueue {
    conn: ConnectionManager,
    policy: RetryPolicy,
    result_ttl: Duration,
    lease: Duration,
    scripts: Scripts,
    /// Processing entries seen without a lease on the previous reap sweep
    suspects: Mutex<HashSet<String>>,
}

impl RedisQueue {
    pub async fn connect(
        client: &::redis::Client,
        policy: RetryPolicy,
        result_ttl: Duration,
        lease: Duration,
    ) -> Result<Self, QueueError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            conn,
            policy,
            result_ttl,
            lease,
            scripts: Scripts::new(),
            suspects: Mutex::new(HashSet::new()),
        })
    }

    /// Connect using the shared configuration
    pub async fn from_config(config: &crate::Config) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(config.redis_url.as_str())?;
        Self::connect(
            &client,
            config.retry_policy(),
            config.result_ttl(),
            config.lease_duration(),
        )
        .await
    }

    async fn settle(
        &self,
        job_id: Uuid,
        state: JobState,
        result: &ExecutionResult,
        last_error: &str,
    ) -> Result<(), QueueError> {
        let counter = match state {
            JobState::Failed => FAILED_COUNTER,
            _ => COMPLETED_COUNTER,
        };
        let payload = serde_json::to_string(result).map_err(|e| QueueError::Corrupt {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })?;

        let mut conn = self.conn.clone();
        let settled: Option<String> = self
            .scripts
            .settle
            .key(job_key(&job_id))
            .key(lease_key(&job_id))
            .key(PROCESSING_KEY)
            .key(counter)
            .arg(job_id.to_string())
            .arg(state.as_str())
            .arg(&payload)
            .arg(self.result_ttl.as_secs().max(1))
            .arg(last_error)
            .invoke_async(&mut conn)
            .await?;

        let Some(language) = settled else {
            debug!(job_id = %job_id, "Job already settled; result left untouched");
            return Ok(());
        };

        if let Some(language) = Language::from_str(&language) {
            let event = CompletionEvent {
                job_id,
                language,
                state,
                status: result.status,
                runtime_ms: result.runtime_ms,
            };
            if let Ok(json) = serde_json::to_string(&event) {
                // No subscribers is not an error
                let _: ::redis::RedisResult<()> = conn.publish(COMPLETIONS_CHANNEL, json).await;
            }
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn corrupt(job_id: impl ToString, reason: impl ToString) -> QueueError {
    QueueError::Corrupt {
        job_id: job_id.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &JobRequest) -> Result<(), QueueError> {
        let json = serde_json::to_string(job).map_err(|e| corrupt(job.id, e))?;
        let fields = vec![
            ("state", JobState::Queued.as_str().to_string()),
            ("job", json),
            ("attempts", "0".to_string()),
            ("max_attempts", job.max_attempts.to_string()),
            ("language", job.language.to_string()),
            ("created_at", job.created_at.to_rfc3339()),
        ];

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .hset_multiple(job_key(&job.id), &fields[..])
            .ignore()
            .lpush(WAITING_KEY, job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = ::redis::cmd("BLMOVE")
            .arg(WAITING_KEY)
            .arg(PROCESSING_KEY)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await?;

        let Some(raw_id) = popped else {
            return Ok(None);
        };
        let job_id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(&raw_id, e))?;

        let claimed: Option<(String, u32)> = self
            .scripts
            .activate
            .key(job_key(&job_id))
            .key(lease_key(&job_id))
            .key(PROCESSING_KEY)
            .arg(&raw_id)
            .arg(self.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some((json, attempt)) = claimed else {
            warn!(job_id = %job_id, "Dropped queue entry for evicted or settled job");
            return Ok(None);
        };
        let job: JobRequest = serde_json::from_str(&json).map_err(|e| corrupt(job_id, e))?;

        Ok(Some(Delivery { job, attempt }))
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let renewed: bool = conn
            .pexpire(lease_key(&job_id), self.lease.as_millis() as i64)
            .await?;
        Ok(renewed)
    }

    async fn complete(&self, job_id: Uuid, result: &ExecutionResult) -> Result<(), QueueError> {
        self.settle(job_id, JobState::Completed, result, "").await
    }

    async fn retry_or_fail(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<RetryDecision, QueueError> {
        let job_id = delivery.job.id;
        let decision = self.policy.decide(delivery.attempt, delivery.job.max_attempts);

        match decision {
            RetryDecision::Retry { delay } => {
                let ready_at = now_millis() + delay.as_millis() as i64;
                let mut conn = self.conn.clone();
                let _: i64 = self
                    .scripts
                    .retry
                    .key(job_key(&job_id))
                    .key(lease_key(&job_id))
                    .key(PROCESSING_KEY)
                    .key(DELAYED_KEY)
                    .arg(job_id.to_string())
                    .arg(ready_at)
                    .arg(reason)
                    .invoke_async(&mut conn)
                    .await?;
            }
            RetryDecision::Failed => {
                self.settle(
                    job_id,
                    JobState::Failed,
                    &ExecutionResult::infrastructure_failure(),
                    reason,
                )
                .await?;
            }
        }

        Ok(decision)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(&job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| corrupt(job_id, format!("missing field {}", name)))
        };

        let job: JobRequest =
            serde_json::from_str(field("job")?).map_err(|e| corrupt(job_id, e))?;
        let state = JobState::parse(field("state")?)
            .ok_or_else(|| corrupt(job_id, "unknown state"))?;
        let attempts = fields
            .get("attempts")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0);
        let result = match fields.get("result") {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| corrupt(job_id, e))?),
            None => None,
        };
        let created_at = fields
            .get("created_at")
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc))
            .unwrap_or(job.created_at);

        Ok(Some(JobSnapshot {
            id: job_id,
            language: job.language,
            state,
            metadata: JobMetadata {
                attempts,
                max_attempts: job.max_attempts,
                last_failure_reason: fields.get("last_error").cloned(),
            },
            result,
            created_at,
        }))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, processing, delayed, completed, failed): (
            u64,
            u64,
            u64,
            Option<u64>,
            Option<u64>,
        ) = ::redis::pipe()
            .llen(WAITING_KEY)
            .llen(PROCESSING_KEY)
            .zcard(DELAYED_KEY)
            .get(COMPLETED_COUNTER)
            .get(FAILED_COUNTER)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats::new(
            waiting,
            processing + delayed,
            completed.unwrap_or(0),
            failed.unwrap_or(0),
        ))
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .scripts
            .promote
            .key(DELAYED_KEY)
            .key(WAITING_KEY)
            .arg(now_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            debug!(count = promoted, "Promoted delayed retries");
        }
        Ok(promoted)
    }

    async fn reap(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let in_flight: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;

        let mut unleased = HashSet::new();
        for raw_id in in_flight {
            let Ok(job_id) = Uuid::parse_str(&raw_id) else {
                let _: i64 = conn.lrem(PROCESSING_KEY, 0, &raw_id).await?;
                continue;
            };
            let leased: bool = conn.exists(lease_key(&job_id)).await?;
            if !leased {
                unleased.insert(raw_id);
            }
        }

        // An entry must be unleased on two consecutive sweeps; a worker that
        // just popped a job has not taken its lease yet.
        let orphans: Vec<String> = {
            let mut suspects = self
                .suspects
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let orphans = unleased.intersection(&suspects).cloned().collect();
            *suspects = unleased;
            orphans
        };

        let mut reaped = 0;
        for raw_id in orphans {
            let Ok(job_id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            let (json, attempts): (Option<String>, Option<u32>) = conn
                .hget(job_key(&job_id), &["job", "attempts"])
                .await?;
            let Some(json) = json else {
                let _: i64 = conn.lrem(PROCESSING_KEY, 0, &raw_id).await?;
                continue;
            };
            let job: JobRequest = serde_json::from_str(&json).map_err(|e| corrupt(job_id, e))?;

            let delivery = Delivery {
                job,
                attempt: attempts.unwrap_or(1).max(1),
            };
            let decision = self
                .retry_or_fail(&delivery, "worker lost while processing job")
                .await?;
            info!(job_id = %job_id, attempt = delivery.attempt, ?decision, "Reaped orphaned delivery");
            reaped += 1;
        }

        Ok(reaped)
    }
}
