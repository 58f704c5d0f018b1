use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::SubscriptionState;

/// Broad error category used for caller-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Channel-level failure; retried up to the reconnect budget.
    Transport,
    /// No caller identity. Fatal immediately, never retried.
    AuthRequired,
    /// One send RPC failed. Recorded on that message only.
    SendFailure,
    /// Malformed or unexpected payload. Logged and dropped at the boundary.
    Data,
    /// Invalid input or configuration.
    Config,
    /// Request does not fit the current room or message state.
    State,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Transport, code, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::AuthRequired, "auth_required", message)
    }

    pub fn send_failure(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::SendFailure, "send_failed", message)
    }

    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Data, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SubscriptionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while subscription is in state {current:?}"),
        )
    }

    /// Whether a retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        self.category == SyncErrorCategory::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(SyncError::transport("channel_closed", "gone").is_retryable());
        assert!(!SyncError::auth_required("no session").is_retryable());
        assert!(!SyncError::send_failure("nope").is_retryable());
        assert!(!SyncError::data("malformed_payload", "bad").is_retryable());
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(SubscriptionState::Closed, "on_subscribed");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
    }

    #[test]
    fn auth_required_has_its_own_category_and_code() {
        let err = SyncError::auth_required("no caller identity");
        assert_eq!(err.category, SyncErrorCategory::AuthRequired);
        assert_eq!(err.code, "auth_required");
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::transport("rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
