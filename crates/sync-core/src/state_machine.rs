use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::SyncError, retry::ReconnectPolicy};

/// Lifecycle of one channel subscription handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Not subscribed. Terminal once the handle has been disposed.
    Closed,
    /// First subscribe handshake in flight.
    Connecting,
    /// Receiving events.
    Open,
    /// Waiting for or running a resubscribe after a transport error.
    Reconnecting,
    /// Retry budget exhausted or identity missing; needs an explicit re-open.
    Failed,
}

/// What the caller should do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Schedule another attempt after `delay`.
    Retry { failed_count: u32, delay: Duration },
    /// The failure reached the retry budget; the handle is now `Failed`.
    GiveUp { failed_count: u32 },
}

impl FailureOutcome {
    pub fn failed_count(&self) -> u32 {
        match self {
            Self::Retry { failed_count, .. } | Self::GiveUp { failed_count } => *failed_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine {
    state: SubscriptionState,
    failure_count: u32,
    disposed: bool,
    policy: ReconnectPolicy,
}

impl SubscriptionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: SubscriptionState::Closed,
            failure_count: 0,
            disposed: false,
            policy,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful subscribe.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Start the first handshake (`Closed`/`Failed` -> `Connecting`).
    pub fn open(&mut self) -> Result<SubscriptionState, SyncError> {
        let can_open = match self.state {
            SubscriptionState::Closed => !self.disposed,
            SubscriptionState::Failed => true,
            _ => false,
        };
        if !can_open {
            return Err(SyncError::invalid_state(self.state, "open"));
        }
        self.failure_count = 0;
        self.state = SubscriptionState::Connecting;
        Ok(self.state)
    }

    /// Handshake succeeded (`Connecting`/`Reconnecting` -> `Open`).
    pub fn on_subscribed(&mut self) -> Result<SubscriptionState, SyncError> {
        self.transition_from_any_of(
            &[
                SubscriptionState::Connecting,
                SubscriptionState::Reconnecting,
            ],
            SubscriptionState::Open,
            "on_subscribed",
        )?;
        self.failure_count = 0;
        Ok(self.state)
    }

    /// Record one failed attempt or a channel error while open.
    pub fn on_transport_error(&mut self) -> Result<FailureOutcome, SyncError> {
        if !matches!(
            self.state,
            SubscriptionState::Connecting
                | SubscriptionState::Open
                | SubscriptionState::Reconnecting
        ) {
            return Err(SyncError::invalid_state(self.state, "on_transport_error"));
        }

        self.failure_count = self.failure_count.saturating_add(1);
        let failed_count = self.failure_count;
        if self.policy.should_retry(failed_count) {
            self.state = SubscriptionState::Reconnecting;
            Ok(FailureOutcome::Retry {
                failed_count,
                delay: self.policy.delay_for_failure(failed_count),
            })
        } else {
            self.state = SubscriptionState::Failed;
            Ok(FailureOutcome::GiveUp { failed_count })
        }
    }

    /// Missing identity is fatal and does not count as a failed attempt.
    pub fn on_auth_required(&mut self) -> Result<SubscriptionState, SyncError> {
        self.transition_from_any_of(
            &[
                SubscriptionState::Connecting,
                SubscriptionState::Open,
                SubscriptionState::Reconnecting,
            ],
            SubscriptionState::Failed,
            "on_auth_required",
        )
    }

    /// Move to `Closed` from any state. Returns `false` if already disposed.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.state = SubscriptionState::Closed;
        true
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SubscriptionState],
        next: SubscriptionState,
        action: &str,
    ) -> Result<SubscriptionState, SyncError> {
        if !expected.contains(&self.state) {
            return Err(SyncError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
