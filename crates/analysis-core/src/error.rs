use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrency limit reached: {limit} requests already active")]
    ConcurrencyLimit { limit: usize },

    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request cancelled before completion")]
    Cancelled,

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification attached to failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ConcurrencyLimit,
    ProviderUnavailable,
    Timeout,
    Internal,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::ConcurrencyLimit { .. } => ErrorKind::ConcurrencyLimit,
            AnalysisError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            AnalysisError::Timeout { .. } | AnalysisError::Cancelled => ErrorKind::Timeout,
            AnalysisError::CacheError(_) | AnalysisError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-equivalent status for transports that need one.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::ConcurrencyLimit => 429,
            ErrorKind::ProviderUnavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Message safe to hand back to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "Internal error while processing the analysis request".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn provider_unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        AnalysisError::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_are_hidden() {
        let err = AnalysisError::Internal("join handle poisoned at batch.rs:42".to_string());
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.status_code(), 500);
        assert!(!err.public_message().contains("batch.rs"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AnalysisError::Validation("x".into()).status_code(), 400);
        assert_eq!(AnalysisError::ConcurrencyLimit { limit: 4 }.status_code(), 429);
        assert_eq!(AnalysisError::Timeout { timeout_ms: 10 }.status_code(), 504);
        assert_eq!(AnalysisError::Cancelled.status_code(), 504);
        assert_eq!(AnalysisError::provider_unavailable("esg", "down").status_code(), 503);
    }

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = AnalysisError::Validation("symbols must not be empty".into());
        assert_eq!(err.public_message(), "Validation error: symbols must not be empty");
    }
}
