//! Request and outcome types for sandbox execution

use crate::error::SandboxError;
use coderealm_common::{Language, OutcomeState, SessionId};
use serde::{Deserialize, Serialize};

/// Caller identity used when none is supplied
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Request to execute untrusted source text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The code to execute
    pub source_text: String,

    /// Language tag as submitted (`javascript`, `js`, ...)
    pub language_tag: String,

    /// Requested timeout in milliseconds (None = configured default)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Identity the rate limiter counts against
    #[serde(default = "default_caller")]
    pub caller_id: String,
}

fn default_caller() -> String {
    ANONYMOUS_CALLER.to_string()
}

impl ExecutionRequest {
    /// Create a JavaScript request from an anonymous caller
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            language_tag: Language::JavaScript.to_string(),
            timeout_ms: None,
            caller_id: default_caller(),
        }
    }

    pub fn with_language(mut self, tag: impl Into<String>) -> Self {
        self.language_tag = tag.into();
        self
    }

    /// Set timeout in milliseconds
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn language(&self) -> Language {
        // Unknown tags become `Language::Other`.
        match self.language_tag.parse::<Language>() {
            Ok(language) => language,
            Err(never) => match never {},
        }
    }
}

/// Live, externally visible view of the current (or last) execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub session_id: Option<SessionId>,

    /// Concatenated `output` payloads, in arrival order
    pub output: String,

    pub error: Option<SandboxError>,

    pub state: OutcomeState,
}

impl ExecutionOutcome {
    /// Nothing has run yet
    pub fn idle() -> Self {
        Self {
            session_id: None,
            output: String::new(),
            error: None,
            state: OutcomeState::Idle,
        }
    }

    /// A session has just started
    pub fn running(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            output: String::new(),
            error: None,
            state: OutcomeState::Running,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == OutcomeState::Done
    }

    /// Finished with no error
    pub fn success(&self) -> bool {
        self.is_done() && self.error.is_none()
    }
}

impl Default for ExecutionOutcome {
    fn default() -> Self {
        Self::idle()
    }
}
