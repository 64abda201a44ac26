//! Error types for sandboxed execution

use crate::sanitizer::BlockedCategory;
use chrono::{DateTime, Utc};
use coderealm_common::{ErrorInfo, SessionId};
use serde::Serialize;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Every way a sandbox request can end without a clean `done`.
///
/// Session-level variants are never returned to callers of the supervisor as
/// `Err`; they are attached to the [`ExecutionOutcome`](crate::ExecutionOutcome).
/// Only [`SandboxError::Busy`] is returned directly.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    /// Request malformed, oversized, or empty after sanitization
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// Caller exceeded the allowed request rate
    #[error("Rate limit exceeded ({limit} per window), retry after {reset_time}")]
    RateLimited {
        reset_time: DateTime<Utc>,
        limit: u32,
    },

    /// Static sanitizer found a forbidden construct
    #[error("Blocked {category} pattern: {pattern}")]
    BlockedPattern {
        category: BlockedCategory,
        pattern: String,
    },

    /// Language tag accepted but not executable
    #[error("Language '{language}' is not supported for execution")]
    UnsupportedLanguage { language: String },

    /// Uncaught exception or unhandled rejection inside the realm
    #[error("Runtime error: {error}")]
    Runtime { error: ErrorInfo },

    /// Realm did not finish in time
    #[error("Execution timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Realm creation or injection failed
    #[error("Sandbox setup failed: {reason}")]
    Setup { reason: String },

    /// Another session is already running on this supervisor
    #[error("Supervisor busy with session {active}")]
    Busy { active: SessionId },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl SandboxError {
    pub fn validation(reason: impl Into<String>) -> Self {
        SandboxError::Validation {
            reason: reason.into(),
        }
    }

    pub fn setup(reason: impl Into<String>) -> Self {
        SandboxError::Setup {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        SandboxError::Config {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation { .. } => "validation",
            SandboxError::RateLimited { .. } => "rate_limited",
            SandboxError::BlockedPattern { .. } => "blocked_pattern",
            SandboxError::UnsupportedLanguage { .. } => "unsupported_language",
            SandboxError::Runtime { .. } => "runtime",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::Setup { .. } => "setup",
            SandboxError::Busy { .. } => "busy",
            SandboxError::Config { .. } => "config",
        }
    }

    /// Whether a caller may reasonably resubmit the same request later.
    /// The sandbox itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::RateLimited { .. } | SandboxError::Busy { .. } | SandboxError::Setup { .. }
        )
    }

    /// Time left until a rate-limited caller may submit again
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self {
            SandboxError::RateLimited { reset_time, .. } => {
                Some((*reset_time - now).max(chrono::Duration::zero()))
            }
            _ => None,
        }
    }
}

impl From<toml::de::Error> for SandboxError {
    fn from(err: toml::de::Error) -> Self {
        SandboxError::config(format!("Failed to parse config: {}", err))
    }
}
