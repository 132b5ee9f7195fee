use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::RetryPolicy;
use crate::types::ResourceLimits;
use crate::validator::RequestLimits;

/// Bounded Docker calls per launch: create, attach, start, kill, the
/// post-kill wait and remove
const LAUNCH_STEPS: u64 = 6;
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,

    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_code_length: usize,
    pub max_input_length: usize,
    pub blocklist_enabled: bool,

    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub result_ttl_secs: u64,

    pub worker_concurrency: usize,
    pub worker_poll_ms: u64,
    pub worker_health_port: u16,
    pub sandbox_image: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub output_limit_bytes: usize,
    pub compile_timeout_ms: u64,
    pub launch_timeout_ms: u64,
    pub scratch_root: PathBuf,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            port: var_or("PORT", 3000),

            default_timeout_ms: var_or("DEFAULT_TIMEOUT_MS", 2000),
            min_timeout_ms: var_or("MIN_TIMEOUT_MS", 100),
            max_timeout_ms: var_or("MAX_TIMEOUT_MS", 5000),
            max_code_length: var_or("MAX_CODE_LENGTH", 10_000),
            max_input_length: var_or("MAX_INPUT_LENGTH", 1_000),
            blocklist_enabled: flag("SANDBOX_BLOCKLIST"),

            max_attempts: var_or("MAX_ATTEMPTS", 3),
            backoff_base_ms: var_or("BACKOFF_BASE_MS", 1000),
            backoff_max_ms: var_or("BACKOFF_MAX_MS", 30_000),
            result_ttl_secs: var_or("RESULT_TTL_SECS", 3600),

            worker_concurrency: var_or("WORKER_CONCURRENCY", 2),
            worker_poll_ms: var_or("WORKER_POLL_MS", 1000),
            worker_health_port: var_or("WORKER_HEALTH_PORT", 3001),
            sandbox_image: env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| "devwars-sandbox:latest".to_string()),
            memory_limit_mb: var_or("SANDBOX_MEMORY_MB", 256),
            cpu_limit: var_or("SANDBOX_CPUS", 0.5),
            pids_limit: var_or("SANDBOX_PIDS_LIMIT", 50),
            output_limit_bytes: var_or("SANDBOX_OUTPUT_LIMIT_BYTES", 1024 * 1024),
            compile_timeout_ms: var_or("COMPILE_TIMEOUT_MS", 10_000),
            launch_timeout_ms: var_or("LAUNCH_TIMEOUT_MS", 10_000),
            scratch_root: env::var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    pub fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            max_code_length: self.max_code_length,
            max_input_length: self.max_input_length,
            min_timeout_ms: self.min_timeout_ms,
            max_timeout_ms: self.max_timeout_ms,
            default_timeout_ms: self.default_timeout_ms,
            blocklist_enabled: self.blocklist_enabled,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_limit_mb,
            cpus: self.cpu_limit,
            pids_limit: self.pids_limit,
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// How long one dequeue blocks before a worker checks for shutdown
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms.max(1))
    }

    /// Worst case for one attempt when every step runs to its bound: a
    /// compile and a run launch, each spending up to `LAUNCH_STEPS` Docker
    /// calls of `launch_timeout_ms` on top of its own execution deadline
    pub fn attempt_budget(&self) -> Duration {
        Duration::from_millis(
            2 * LAUNCH_STEPS * self.launch_timeout_ms
                + self.compile_timeout_ms
                + self.max_timeout_ms,
        )
    }

    /// How long a delivery stays leased without renewal before the reaper
    /// treats its worker as dead
    pub fn lease_duration(&self) -> Duration {
        self.attempt_budget() + LEASE_MARGIN
    }

    /// Workers renew their lease this often while an attempt runs
    pub fn lease_renewal_interval(&self) -> Duration {
        self.lease_duration() / 3
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.default_timeout_ms, 2000);
        assert_eq!(config.min_timeout_ms, 100);
        assert_eq!(config.max_timeout_ms, 5000);
        assert_eq!(config.max_code_length, 10_000);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, config.max_attempts);
        assert_eq!(policy.base_delay, Duration::from_millis(config.backoff_base_ms));

        let limits = config.request_limits();
        assert_eq!(limits.max_timeout_ms, config.max_timeout_ms);

        assert!(config.lease_duration() > Duration::from_millis(config.max_timeout_ms));
    }

    #[test]
    fn test_lease_outlives_slowest_bounded_attempt() {
        let config = Config::default();
        let launch_steps = Duration::from_millis(LAUNCH_STEPS * config.launch_timeout_ms);
        let compile = launch_steps + Duration::from_millis(config.compile_timeout_ms);
        let run = launch_steps + Duration::from_millis(config.max_timeout_ms);

        assert!(config.lease_duration() > compile + run);
        assert_eq!(config.lease_duration(), Duration::from_secs(165));
    }

    #[test]
    fn test_lease_is_renewed_well_before_it_lapses() {
        let config = Config::default();
        assert!(config.lease_renewal_interval() * 2 < config.lease_duration());
        assert!(!config.lease_renewal_interval().is_zero());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
