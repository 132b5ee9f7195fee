//! Request validation
//!
//! Runs synchronously in the API before anything touches the queue. A request
//! that fails here never gets a job id.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{JobRequest, Language};

/// Body of `POST /execute`
/// Every field is optional at the wire level so that missing fields produce
/// a validation message instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_code_length: usize,
    pub max_input_length: usize,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub blocklist_enabled: bool,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_code_length: 10_000,
            max_input_length: 1_000,
            min_timeout_ms: 100,
            max_timeout_ms: 5000,
            default_timeout_ms: 2000,
            blocklist_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Language is required")]
    MissingLanguage,
    #[error("Unsupported language: {language}. Supported: {supported}")]
    UnsupportedLanguage { language: String, supported: String },
    #[error("Code is required and must not be empty")]
    MissingCode,
    #[error("Code exceeds maximum length of {max} characters")]
    CodeTooLong { max: usize },
    #[error("Input exceeds maximum length of {max} characters")]
    InputTooLong { max: usize },
    #[error("Timeout must be at least {min}ms")]
    TimeoutTooSmall { min: u64 },
    #[error("Timeout cannot exceed {max}ms")]
    TimeoutTooLarge { max: u64 },
    #[error("{0}")]
    BlockedPattern(&'static str),
}

impl ValidationError {
    /// Short machine-friendly label, used as a metrics dimension
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::MissingLanguage => "missing_language",
            ValidationError::UnsupportedLanguage { .. } => "unsupported_language",
            ValidationError::MissingCode => "missing_code",
            ValidationError::CodeTooLong { .. } => "code_too_long",
            ValidationError::InputTooLong { .. } => "input_too_long",
            ValidationError::TimeoutTooSmall { .. } | ValidationError::TimeoutTooLarge { .. } => {
                "timeout_out_of_range"
            }
            ValidationError::BlockedPattern(_) => "blocked_pattern",
        }
    }
}

/// A request that passed validation, with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub language: Language,
    pub code: String,
    pub input: String,
    pub timeout_ms: u64,
}

impl ValidatedRequest {
    pub fn into_job(self, max_attempts: u32) -> JobRequest {
        JobRequest {
            id: Uuid::new_v4(),
            language: self.language,
            source_code: self.code,
            stdin: self.input,
            timeout_ms: self.timeout_ms,
            max_attempts,
            created_at: Utc::now(),
        }
    }
}

pub fn supported_languages() -> Vec<&'static str> {
    Language::all_variants().iter().map(|l| l.as_str()).collect()
}

pub fn validate(
    request: SubmitRequest,
    limits: &RequestLimits,
) -> Result<ValidatedRequest, ValidationError> {
    let raw_language = request
        .language
        .filter(|l| !l.trim().is_empty())
        .ok_or(ValidationError::MissingLanguage)?;
    let language =
        Language::from_str(&raw_language).ok_or_else(|| ValidationError::UnsupportedLanguage {
            language: raw_language.clone(),
            supported: supported_languages().join(", "),
        })?;

    let code = request
        .code
        .filter(|c| !c.is_empty())
        .ok_or(ValidationError::MissingCode)?;
    if code.chars().count() > limits.max_code_length {
        return Err(ValidationError::CodeTooLong {
            max: limits.max_code_length,
        });
    }

    let input = request.input.unwrap_or_default();
    if input.chars().count() > limits.max_input_length {
        return Err(ValidationError::InputTooLong {
            max: limits.max_input_length,
        });
    }

    let timeout_ms = request.timeout.unwrap_or(limits.default_timeout_ms);
    if timeout_ms < limits.min_timeout_ms {
        return Err(ValidationError::TimeoutTooSmall {
            min: limits.min_timeout_ms,
        });
    }
    if timeout_ms > limits.max_timeout_ms {
        return Err(ValidationError::TimeoutTooLarge {
            max: limits.max_timeout_ms,
        });
    }

    if limits.blocklist_enabled {
        screen_source(&code)?;
    }

    Ok(ValidatedRequest {
        language,
        code,
        input,
        timeout_ms,
    })
}

const BLOCKLIST: &[(&str, &str)] = &[
    (r"\beval\s*\(", "Use of eval() is not allowed"),
    (r"\bFunction\s*\(", "Dynamic function creation is not allowed"),
    (r"\bimport\s+os\b", "OS module import is not allowed"),
    (r#"require\s*\(\s*['"]os['"]\s*\)"#, "OS module import is not allowed"),
    (r"\bimport\s+subprocess\b", "Subprocess module import is not allowed"),
    (r#"require\s*\(\s*['"]child_process['"]\s*\)"#, "Process spawning is not allowed"),
    (r"\bexec\s*\(", "exec() is not allowed"),
    (r"\bspawn\s*\(", "Process spawning is not allowed"),
];

fn blocklist() -> &'static [(Regex, &'static str)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        BLOCKLIST
            .iter()
            .filter_map(|(pattern, message)| Regex::new(pattern).ok().map(|re| (re, *message)))
            .collect()
    })
}

/// Best-effort pattern screen. Trivially bypassed; the container is the
/// security boundary.
pub fn screen_source(code: &str) -> Result<(), ValidationError> {
    match blocklist().iter().find(|(re, _)| re.is_match(code)) {
        Some((_, message)) => Err(ValidationError::BlockedPattern(message)),
        None => Ok(()),
    }
}
