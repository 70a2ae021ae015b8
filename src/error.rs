//! Error types shared across the pipe.

use thiserror::Error;

/// Maximum number of upstream body bytes kept in an error.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum PipeError {
    /// No API keys configured. Fatal at initialization.
    #[error("no API keys configured")]
    PoolExhausted,

    #[error("pipe is not configured: {0}")]
    NotConfigured(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no text content could be extracted from the conversation")]
    EmptyConversation,

    #[error("gateway returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("gateway response contained no candidates")]
    EmptyResponse,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipeError {
    /// Build an upstream error, truncating the body on a char boundary.
    pub fn upstream(status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(MAX_ERROR_BODY) {
            Some((idx, _)) => &body[..idx],
            None => body,
        };
        PipeError::Upstream {
            status,
            body: body.to_string(),
        }
    }

    /// Whether this failure should count against the key that was used.
    ///
    /// Auth rejections, rate limits, server errors and transport failures
    /// are attributed to the key; malformed requests and unknown models are not.
    pub fn is_key_failure(&self) -> bool {
        match self {
            PipeError::Transport(_) => true,
            PipeError::Upstream { status, .. } => {
                matches!(*status, 401 | 403 | 408 | 429) || *status >= 500
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PipeError {
    fn from(e: reqwest::Error) -> Self {
        PipeError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_failure_classification() {
        assert!(PipeError::upstream(429, "RESOURCE_EXHAUSTED").is_key_failure());
        assert!(PipeError::upstream(403, "forbidden").is_key_failure());
        assert!(PipeError::upstream(408, "request timeout").is_key_failure());
        assert!(PipeError::upstream(503, "unavailable").is_key_failure());
        assert!(PipeError::Transport("timed out".into()).is_key_failure());

        assert!(!PipeError::upstream(400, "bad request").is_key_failure());
        assert!(!PipeError::upstream(404, "no such model").is_key_failure());
        assert!(!PipeError::EmptyConversation.is_key_failure());
    }

    #[test]
    fn test_upstream_body_truncated() {
        let body = "é".repeat(800);
        match PipeError::upstream(500, &body) {
            PipeError::Upstream { body, .. } => assert_eq!(body.chars().count(), 500),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
