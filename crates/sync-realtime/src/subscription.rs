//! Channel subscriptions with linear reconnect.
//!
//! Every open scope owns one background task that drives a
//! [`SubscriptionStateMachine`] through handshake, event pumping and
//! reconnect attempts. The task reports back through an unbounded sender
//! so the owner can consume signals from its own mailbox.

use std::{collections::HashMap, sync::Arc};

use sync_core::{
    FailureOutcome, RawChannelEvent, ReconnectPolicy, SubscriptionScope, SubscriptionState,
    SubscriptionStateMachine, SyncError, SyncErrorCategory,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{ChatBackend, FeedItem};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    StateChanged(SubscriptionState),
    Event(RawChannelEvent),
    /// One failed attempt. `gave_up` marks the attempt that exhausted the budget.
    Error { failed_count: u32, gave_up: bool },
    AuthRequired,
}

/// Report from a subscription task, tagged with the handle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSignal {
    pub subscription_id: SubscriptionId,
    pub scope: SubscriptionScope,
    pub kind: SignalKind,
}

/// Live subscription. Dropping the handle disposes it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    scope: SubscriptionScope,
    stop: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl SubscriptionHandle {
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Cancel the task and any pending reconnect timer. Idempotent.
    ///
    /// The state is `Closed` when this returns; the task never overwrites it.
    pub fn dispose(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        self.state.send_replace(SubscriptionState::Closed);
        debug!(scope = %self.scope.label(), id = self.id, "subscription disposed");
        true
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Registry holding at most one live handle per scope.
pub struct SubscriptionManager<M = SubscriptionSignal> {
    backend: Arc<dyn ChatBackend>,
    policy: ReconnectPolicy,
    sink: mpsc::UnboundedSender<M>,
    handles: HashMap<SubscriptionScope, SubscriptionHandle>,
    next_id: SubscriptionId,
}

impl<M> SubscriptionManager<M>
where
    M: From<SubscriptionSignal> + Send + 'static,
{
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        policy: ReconnectPolicy,
        sink: mpsc::UnboundedSender<M>,
    ) -> Self {
        Self {
            backend,
            policy,
            sink,
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    /// Open `scope`, disposing any handle already registered for it.
    pub fn open(&mut self, scope: SubscriptionScope) -> SubscriptionId {
        if let Some(prior) = self.handles.remove(&scope) {
            prior.dispose();
        }

        let id = self.next_id;
        self.next_id += 1;

        let stop = CancellationToken::new();
        let state = Arc::new(watch::Sender::new(SubscriptionState::Closed));
        let task = SubscriptionTask {
            id,
            scope: scope.clone(),
            backend: Arc::clone(&self.backend),
            policy: self.policy,
            sink: self.sink.clone(),
            stop: stop.clone(),
            state: Arc::clone(&state),
        };
        tokio::spawn(task.run());

        info!(scope = %scope.label(), id, "subscription opened");
        self.handles.insert(
            scope.clone(),
            SubscriptionHandle {
                id,
                scope,
                stop,
                state,
            },
        );
        id
    }

    /// Dispose the handle for `scope`. Returns `false` when none was live.
    pub fn dispose(&mut self, scope: &SubscriptionScope) -> bool {
        self.handles
            .remove(scope)
            .is_some_and(|handle| handle.dispose())
    }

    pub fn dispose_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.dispose();
        }
    }

    /// `Closed` for scopes without a live handle.
    pub fn state(&self, scope: &SubscriptionScope) -> SubscriptionState {
        self.handles
            .get(scope)
            .map(SubscriptionHandle::state)
            .unwrap_or(SubscriptionState::Closed)
    }

    /// Whether `signal` comes from the handle currently registered for its scope.
    pub fn is_current(&self, signal: &SubscriptionSignal) -> bool {
        self.handles
            .get(&signal.scope)
            .is_some_and(|handle| handle.id == signal.subscription_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

struct SubscriptionTask<M> {
    id: SubscriptionId,
    scope: SubscriptionScope,
    backend: Arc<dyn ChatBackend>,
    policy: ReconnectPolicy,
    sink: mpsc::UnboundedSender<M>,
    stop: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
}

enum Attempt {
    Retry,
    Stop,
}

impl<M> SubscriptionTask<M>
where
    M: From<SubscriptionSignal> + Send + 'static,
{
    async fn run(self) {
        let mut machine = SubscriptionStateMachine::new(self.policy);
        match machine.open() {
            Ok(state) => self.publish_state(state),
            Err(err) => {
                error!(scope = %self.scope.label(), error = %err, "subscription could not open");
                return;
            }
        }

        loop {
            if self.backend.current_user_id().is_none() {
                self.auth_required(&mut machine);
                break;
            }

            let handshake = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                result = self.backend.subscribe(&self.scope) => result,
            };

            let failure = match handshake {
                Ok(mut feed) => {
                    match machine.on_subscribed() {
                        Ok(state) => self.publish_state(state),
                        Err(err) => {
                            error!(
                                scope = %self.scope.label(),
                                error = %err,
                                "subscription state rejected handshake"
                            );
                            break;
                        }
                    }

                    loop {
                        tokio::select! {
                            biased;
                            _ = self.stop.cancelled() => return,
                            item = feed.events.recv() => match item {
                                Some(FeedItem::Change(event)) => {
                                    self.signal(SignalKind::Event(event));
                                }
                                Some(FeedItem::Error(err)) => break err,
                                None => {
                                    break SyncError::transport(
                                        "channel_closed",
                                        "channel closed by transport",
                                    );
                                }
                            }
                        }
                    }
                }
                Err(err) => err,
            };

            if failure.category == SyncErrorCategory::AuthRequired {
                self.auth_required(&mut machine);
                break;
            }

            match self.on_failure(&mut machine, &failure).await {
                Attempt::Retry => continue,
                Attempt::Stop => break,
            }
        }
    }

    async fn on_failure(&self, machine: &mut SubscriptionStateMachine, err: &SyncError) -> Attempt {
        let outcome = match machine.on_transport_error() {
            Ok(outcome) => outcome,
            Err(invalid) => {
                error!(
                    scope = %self.scope.label(),
                    error = %invalid,
                    "subscription state rejected failure"
                );
                return Attempt::Stop;
            }
        };
        self.publish_state(machine.state());

        match outcome {
            FailureOutcome::Retry {
                failed_count,
                delay,
            } => {
                warn!(
                    scope = %self.scope.label(),
                    failed_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "subscription attempt failed; retrying"
                );
                self.signal(SignalKind::Error {
                    failed_count,
                    gave_up: false,
                });
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => Attempt::Stop,
                    _ = tokio::time::sleep(delay) => Attempt::Retry,
                }
            }
            FailureOutcome::GiveUp { failed_count } => {
                error!(
                    scope = %self.scope.label(),
                    failed_count,
                    error = %err,
                    "subscription gave up after repeated failures"
                );
                self.signal(SignalKind::Error {
                    failed_count,
                    gave_up: true,
                });
                Attempt::Stop
            }
        }
    }

    fn auth_required(&self, machine: &mut SubscriptionStateMachine) {
        warn!(scope = %self.scope.label(), "no caller identity; subscription not retried");
        if let Ok(state) = machine.on_auth_required() {
            self.publish_state(state);
        }
        self.signal(SignalKind::AuthRequired);
    }

    fn publish_state(&self, next: SubscriptionState) {
        let changed = self.state.send_if_modified(|current| {
            if self.stop.is_cancelled() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            self.signal(SignalKind::StateChanged(next));
        }
    }

    fn signal(&self, kind: SignalKind) {
        if self.stop.is_cancelled() {
            return;
        }
        let _ = self.sink.send(M::from(SubscriptionSignal {
            subscription_id: self.id,
            scope: self.scope.clone(),
            kind,
        }));
    }
}
