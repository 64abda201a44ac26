//! Realm wire protocol.
//!
//! Every message crossing the isolation boundary is a JSON object of the form
//! `{"type": ..., "data": ...}`. Anything that does not deserialize into
//! [`ExecutionEvent`] is not a message and gets dropped by the receiver.

use crate::types::truncate_chars;
use serde::{Deserialize, Serialize};

/// Maximum length (in characters) of an error message carried on the wire
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Error payload of an `error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ErrorInfo {
    /// Build an error payload, truncating the message to the wire limit
    pub fn new(message: impl AsRef<str>) -> Self {
        Self {
            message: truncate_chars(message.as_ref(), MAX_ERROR_MESSAGE_CHARS).to_string(),
            line: None,
            column: None,
        }
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Re-apply the wire limit to a payload received from a realm
    pub fn clamped(mut self) -> Self {
        if self.message.chars().count() > MAX_ERROR_MESSAGE_CHARS {
            self.message = truncate_chars(&self.message, MAX_ERROR_MESSAGE_CHARS).to_string();
        }
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{} (line {}, column {})", self.message, line, column),
            (Some(line), None) => write!(f, "{} (line {})", self.message, line),
            _ => f.write_str(&self.message),
        }
    }
}

/// A message emitted by a realm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ExecutionEvent {
    /// One captured print call, newline-terminated
    Output(String),
    /// Uncaught error, unhandled rejection, or synthesized timeout
    Error(ErrorInfo),
    /// The script and its pending async work finished
    Done,
}

impl ExecutionEvent {
    /// Parse a raw wire message. Malformed input yields `None`.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match serde_json::from_str::<ExecutionEvent>(raw) {
            Ok(ExecutionEvent::Error(info)) => Some(ExecutionEvent::Error(info.clamped())),
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(error = %e, len = raw.len(), "Dropping malformed realm message");
                None
            }
        }
    }

    /// Serialize to the wire format
    pub fn to_wire(&self) -> String {
        // Serializing these variants cannot fail: all fields are plain strings/ints.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"done"}"#.to_string())
    }

    /// `error` and `done` end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::Error(_) | ExecutionEvent::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_event() {
        let event = ExecutionEvent::from_wire(r#"{"type":"output","data":"hi\n"}"#);
        assert_eq!(event, Some(ExecutionEvent::Output("hi\n".to_string())));
    }

    #[test]
    fn test_parse_done_without_data() {
        let event = ExecutionEvent::from_wire(r#"{"type":"done"}"#);
        assert_eq!(event, Some(ExecutionEvent::Done));
        assert!(event.unwrap().is_terminal());
    }

    #[test]
    fn test_parse_error_with_position() {
        let event = ExecutionEvent::from_wire(
            r#"{"type":"error","data":{"message":"boom","line":3,"column":7}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ExecutionEvent::Error(ErrorInfo::new("boom").with_position(3, 7))
        );
    }

    #[test]
    fn test_malformed_messages_are_rejected() {
        assert!(ExecutionEvent::from_wire("not json").is_none());
        assert!(ExecutionEvent::from_wire(r#"{"type":"exec","data":"x"}"#).is_none());
        assert!(ExecutionEvent::from_wire(r#"{"type":"output","data":{"a":1}}"#).is_none());
        assert!(ExecutionEvent::from_wire(
            r#"{"type":"error","data":{"message":"x","stack":"y"}}"#
        )
        .is_none());
    }

    #[test]
    fn test_error_message_is_truncated() {
        let long = "x".repeat(2_000);
        let info = ErrorInfo::new(&long);
        assert_eq!(info.message.chars().count(), MAX_ERROR_MESSAGE_CHARS);

        let raw = format!(r#"{{"type":"error","data":{{"message":"{}"}}}}"#, long);
        match ExecutionEvent::from_wire(&raw) {
            Some(ExecutionEvent::Error(info)) => {
                assert_eq!(info.message.len(), MAX_ERROR_MESSAGE_CHARS)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_wire_format_shape() {
        let wire = ExecutionEvent::Output("a\n".to_string()).to_wire();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["data"], "a\n");
    }
}
