//! Backend error types.

use thiserror::Error;

/// Result type for backend calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors returned by a [`BackendClient`](crate::BackendClient).
#[derive(Error, Debug)]
pub enum ApiError {
    /// The entity already exists for its natural key.
    #[error("Conflict: {kind} already exists with id {existing_id}")]
    Conflict {
        kind: &'static str,
        existing_id: String,
    },

    #[error("Entity not found: {kind} with id {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn conflict(kind: &'static str, existing_id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            existing_id: existing_id.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Returns true when the entity already existed. Creation paths treat this as success.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Id of the entity that caused a conflict, if any.
    pub fn conflicting_id(&self) -> Option<&str> {
        match self {
            Self::Conflict { existing_id, .. } => Some(existing_id),
            _ => None,
        }
    }
}
