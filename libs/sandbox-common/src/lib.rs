pub mod config;
pub mod language;
pub mod queue;
pub mod redis;
pub mod types;
pub mod validator;

// Re-export commonly used types for convenience
pub use config::Config;
pub use language::LanguageProfile;
pub use queue::{JobQueue, MemoryQueue, QueueError, RedisQueue, RetryDecision, RetryPolicy};
pub use types::{
    CompletionEvent, Delivery, ExecutionResult, ExecutionStatus, JobMetadata, JobRequest,
    JobSnapshot, JobState, Language, QueueStats, ResourceLimits, INFRASTRUCTURE_FAILURE_MESSAGE,
};
pub use validator::{validate, RequestLimits, SubmitRequest, ValidatedRequest, ValidationError};
