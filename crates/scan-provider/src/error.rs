//! Provider error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Classified provider failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Must not be retried, e.g. a misconfiguration or an unsupported asset.
    #[error("{0}")]
    Fatal(String),

    /// The operation is in progress or a resource is not ready yet.
    #[error("{message} (retry after {after:?})")]
    Retryable { after: Duration, message: String },

    /// Unclassified failure.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn retryable(after: Duration, msg: impl Into<String>) -> Self {
        Self::Retryable {
            after,
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Combines failures of concurrent steps.
    ///
    /// Any fatal error makes the result fatal. Only retryable errors yield a
    /// retryable error that waits for the slowest step. Anything else is `Other`.
    pub fn join(errors: Vec<ProviderError>) -> Option<ProviderError> {
        if errors.len() <= 1 {
            return errors.into_iter().next();
        }

        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        if errors.iter().any(ProviderError::is_fatal) {
            return Some(Self::Fatal(message));
        }

        let afters: Option<Vec<Duration>> = errors.iter().map(ProviderError::retry_after).collect();
        match afters.and_then(|a| a.into_iter().max()) {
            Some(after) => Some(Self::Retryable {
                after,
                message: errors
                    .iter()
                    .map(|e| match e {
                        Self::Retryable { message, .. } => message.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
            None => Some(Self::Other(message)),
        }
    }
}
