use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Strongly-typed language enum
/// Canonical identifiers only; aliases are resolved by `Language::from_str`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Java,
    Go,
    Cpp,
}

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for available languages
    pub fn all_variants() -> &'static [Language] {
        &[
            Language::Javascript,
            Language::Python,
            Language::Java,
            Language::Go,
            Language::Cpp,
        ]
    }

    /// Parse a language from string (case-insensitive, aliases accepted)
    pub fn from_str(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "javascript" | "node" => Some(Language::Javascript),
            "python" | "python3" => Some(Language::Python),
            "java" => Some(Language::Java),
            "go" => Some(Language::Go),
            "cpp" | "c++" => Some(Language::Cpp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Go => "go",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job Input (Immutable)
/// A job is write-once - never mutate input fields. Retries reuse the same
/// request under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub language: Language,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Job Metadata for Retry and Failure Handling
/// Owned by the queue backend, updated on every delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

/// Job State Machine
/// queued -> active -> {completed | failed}, never backwards.
/// A job waiting for an infrastructure retry stays `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position in the lifecycle; transitions may only increase it
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Active => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit classification of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Message recorded for jobs that exhaust their attempts on infrastructure failures
pub const INFRASTRUCTURE_FAILURE_MESSAGE: &str =
    "Execution failed: sandbox infrastructure unavailable";

/// Execution Output
/// Written once by a worker, read by the API. This is the terminal payload
/// of `GET /job/:id`: `runtime` is wall-clock milliseconds, `memory` is the
/// peak memory estimate in kilobytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "runtime")]
    pub runtime_ms: u64,
    #[serde(rename = "memory")]
    pub memory_kb: u64,
    pub killed: bool,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    /// Terminal payload for a job that never produced an attempt result
    pub fn infrastructure_failure() -> Self {
        Self {
            status: ExecutionStatus::Error,
            stdout: String::new(),
            stderr: INFRASTRUCTURE_FAILURE_MESSAGE.to_string(),
            runtime_ms: 0,
            memory_kb: 0,
            killed: false,
            truncated: false,
        }
    }
}

/// Per-attempt container resource ceilings
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub output_limit_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpus: 0.5,
            pids_limit: 50,
            output_limit_bytes: 1024 * 1024,
        }
    }
}

/// One delivery of a job to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: JobRequest,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
}

/// Point-in-time view of a job, as served by `GET /job/:id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub language: Language,
    pub state: JobState,
    pub metadata: JobMetadata,
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for `GET /queue/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn new(waiting: u64, active: u64, completed: u64, failed: u64) -> Self {
        Self {
            waiting,
            active,
            completed,
            failed,
            total: waiting + active,
        }
    }
}

/// Published by workers whenever a job settles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: Uuid,
    pub language: Language,
    pub state: JobState,
    pub status: ExecutionStatus,
    pub runtime_ms: u64,
}
