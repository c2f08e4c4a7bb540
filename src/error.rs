//! Error taxonomy for the pipeline

use crate::types::LaneErrorKind;
use thiserror::Error;

/// Top-level failure kinds surfaced by the orchestrator and server.
/// Lane-local failures stay inside `LaneResult` and never abort a query.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("no retrieval backends available")]
    BackendUnavailable,

    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("global deadline exceeded")]
    GlobalDeadline,

    #[error("query cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable taxonomy kind for events, metrics, and audit
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InputInvalid(_) => "input_invalid",
            PipelineError::BackendUnavailable => "backend_unavailable",
            PipelineError::SynthesisFailed(_) => "synthesis_failed",
            PipelineError::GlobalDeadline => "global_deadline",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Config(_) => "configuration",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    /// Process exit code when running as a CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) | PipelineError::InputInvalid(_) => 64,
            PipelineError::BackendUnavailable => 69,
            PipelineError::GlobalDeadline => 124,
            _ => 1,
        }
    }
}

/// Lane-boundary error carrying a structured kind and a short message
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct LaneError {
    pub kind: LaneErrorKind,
    pub message: String,
}

impl LaneError {
    pub fn new(kind: LaneErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LaneErrorKind::NetworkError, message)
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::new(LaneErrorKind::Empty, message)
    }

    /// Retrying is pointless for auth failures and explicit empties
    pub fn retryable(&self) -> bool {
        matches!(self.kind, LaneErrorKind::NetworkError | LaneErrorKind::RateLimited)
    }
}

impl From<reqwest::Error> for LaneError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            LaneErrorKind::Timeout
        } else if let Some(status) = err.status() {
            classify_status(status.as_u16())
        } else {
            LaneErrorKind::NetworkError
        };
        Self::new(kind, err.to_string())
    }
}

/// Map an HTTP status to the lane error taxonomy
pub fn classify_status(status: u16) -> LaneErrorKind {
    match status {
        401 | 403 => LaneErrorKind::AuthFailed,
        429 => LaneErrorKind::RateLimited,
        _ => LaneErrorKind::NetworkError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(PipelineError::Config("x".into()).exit_code(), 64);
        assert_eq!(PipelineError::BackendUnavailable.exit_code(), 69);
        assert_eq!(PipelineError::GlobalDeadline.exit_code(), 124);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), LaneErrorKind::RateLimited);
        assert_eq!(classify_status(401), LaneErrorKind::AuthFailed);
        assert_eq!(classify_status(500), LaneErrorKind::NetworkError);
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(LaneError::network("boom").retryable());
        assert!(LaneError::new(LaneErrorKind::RateLimited, "slow down").retryable());
        assert!(!LaneError::new(LaneErrorKind::AuthFailed, "bad key").retryable());
        assert!(!LaneError::empty("nothing").retryable());
    }
}
