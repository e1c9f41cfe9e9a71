use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity status: a state, the reason for entering it and an optional message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status<S, R> {
    pub state: S,
    pub reason: R,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl<S, R> Status<S, R> {
    /// Creates a status stamped with the current time.
    pub fn new(state: S, reason: R, message: Option<String>) -> Self {
        Self {
            state,
            reason,
            message,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_message(state: S, reason: R, message: impl Into<String>) -> Self {
        Self::new(state, reason, Some(message.into()))
    }
}
