use uuid::Uuid;

/// Redis key semantics - defines only naming, not runtime logic
/// Ensures API and worker never drift and keys are deterministic

pub const KEY_PREFIX: &str = "sandbox";

/// Job ids waiting for a worker (LPUSH in, pop from the right)
pub const WAITING_KEY: &str = "sandbox:queue:waiting";
/// Job ids currently delivered to a worker
pub const PROCESSING_KEY: &str = "sandbox:queue:processing";
/// Job ids waiting out a retry backoff, scored by ready-at millis
pub const DELAYED_KEY: &str = "sandbox:queue:delayed";

pub const COMPLETED_COUNTER: &str = "sandbox:stats:completed";
pub const FAILED_COUNTER: &str = "sandbox:stats:failed";

/// Pub/sub channel carrying `CompletionEvent`s
pub const COMPLETIONS_CHANNEL: &str = "sandbox:events:completions";

/// Hash holding the job request, state, attempts and result
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:job:{}", KEY_PREFIX, job_id)
}

/// Expiring marker proving a worker still owns a delivery
pub fn lease_key(job_id: &Uuid) -> String {
    format!("{}:lease:{}", KEY_PREFIX, job_id)
}
