//! Error taxonomy shared across the client core.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// REST boundary errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("deserialization error: {0}")]
    Deserialize(String),
    /// HTTP 422 with a field → messages map, surfaced inline by forms.
    #[error("validation failed")]
    Validation(HashMap<String, Vec<String>>),
    /// The bearer token was rejected. The session token has already been
    /// cleared by the time this is returned.
    #[error("authentication expired")]
    AuthExpired,
}

/// Connection-level transport errors. These are logged and reflected in the
/// connection state; they are never propagated into subscriber callbacks.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Local media acquisition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no usable camera or microphone")]
    DeviceUnavailable,
}

/// Call signaling errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalingError {
    #[error("call session {0} not found")]
    SessionNotFound(String),
    #[error("answer already recorded for session {0}")]
    AnswerAlreadySet(String),
    #[error("signaling store unavailable: {0}")]
    Store(String),
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Error body shape the API returns alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: Option<HashMap<String, Vec<String>>>,
}

/// Extract a user-facing message from an error response body, preferring the
/// `message` field. Returns `None` for bodies that are not the standard shape.
pub fn try_error_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.message.filter(|m| !m.trim().is_empty())
}

/// Extract the validation map from a 422 body, if present.
pub fn try_validation_errors(body: &str) -> Option<HashMap<String, Vec<String>>> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.errors.filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_prefers_message_field() {
        let body = r#"{"message":"Post not found"}"#;
        assert_eq!(try_error_detail(body), Some("Post not found".to_string()));
        assert_eq!(try_error_detail("not json"), None);
        assert_eq!(try_error_detail(r#"{"message":"  "}"#), None);
    }

    #[test]
    fn validation_errors_parse_field_map() {
        let body = r#"{"message":"The given data was invalid.","errors":{"body":["Required."]}}"#;
        let errors = try_validation_errors(body).unwrap();
        assert_eq!(errors["body"], vec!["Required.".to_string()]);
        assert_eq!(try_validation_errors(r#"{"message":"x"}"#), None);
    }
}
