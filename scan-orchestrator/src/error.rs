//! Orchestrator error types.

use std::time::Duration;

use thiserror::Error;

/// Orchestrator result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Backend API error: {0}")]
    Api(#[from] scan_api::ApiError),

    #[error("Provider error: {0}")]
    Provider(#[from] scan_provider::ProviderError),

    /// Not a failure: the reconciler puts the item back after `after`.
    #[error("Requeue after {after:?}: {message}")]
    RequeueAfter { after: Duration, message: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid {kind}: {reason}")]
    InvalidEntity { kind: &'static str, reason: String },

    #[error("Failed to {action} {failed} of {total} {kind}(s): {first}")]
    FanOut {
        action: &'static str,
        kind: &'static str,
        failed: usize,
        total: usize,
        first: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn requeue_after(after: Duration, message: impl Into<String>) -> Self {
        Self::RequeueAfter {
            after,
            message: message.into(),
        }
    }

    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidEntity {
            kind,
            reason: reason.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Delay requested by a [`Error::RequeueAfter`] outcome.
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::RequeueAfter { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// True when the backend reported that the entity already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_conflict())
    }
}
