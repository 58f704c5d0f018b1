//! Read-receipt debouncing.
//!
//! Each trigger replaces the room's timer with a fresh cancellable task. A
//! timer that elapses posts [`DebounceFired`] to the owner's mailbox; the owner
//! confirms it with [`ReadReceiptDebouncer::take_if_current`] so a timer that
//! lost a race with a newer trigger or a cancel is ignored.

use std::{collections::HashMap, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Timer elapsed for `room_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceFired {
    pub room_id: String,
    pub generation: u64,
}

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct ReadReceiptDebouncer<M = DebounceFired> {
    window: Duration,
    sink: mpsc::UnboundedSender<M>,
    pending: HashMap<String, PendingTimer>,
    next_generation: u64,
    root: CancellationToken,
}

impl<M> ReadReceiptDebouncer<M>
where
    M: From<DebounceFired> + Send + 'static,
{
    pub fn new(window: Duration, sink: mpsc::UnboundedSender<M>) -> Self {
        Self {
            window,
            sink,
            pending: HashMap::new(),
            next_generation: 0,
            root: CancellationToken::new(),
        }
    }

    /// Restart the window for `room_id`.
    pub fn trigger(&mut self, room_id: &str) {
        if self.root.is_cancelled() {
            return;
        }
        if let Some(prior) = self.pending.remove(room_id) {
            prior.cancel.cancel();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = self.root.child_token();
        let timer = cancel.clone();
        let sink = self.sink.clone();
        let window = self.window;
        let fired = DebounceFired {
            room_id: room_id.to_owned(),
            generation,
        };

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    let _ = sink.send(M::from(fired));
                }
            }
        });

        trace!(room_id, generation, "read receipt debounce armed");
        self.pending.insert(
            room_id.to_owned(),
            PendingTimer { generation, cancel },
        );
    }

    /// Consume `fired` if it belongs to the room's latest trigger.
    pub fn take_if_current(&mut self, fired: &DebounceFired) -> bool {
        let current = self
            .pending
            .get(&fired.room_id)
            .is_some_and(|timer| timer.generation == fired.generation);
        if current {
            self.pending.remove(&fired.room_id);
        }
        current
    }

    /// Drop the pending timer for `room_id`, if any.
    pub fn cancel(&mut self, room_id: &str) -> bool {
        match self.pending.remove(room_id) {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, room_id: &str) -> bool {
        self.pending.contains_key(room_id)
    }

    /// Cancel every timer. Later triggers are ignored.
    pub fn dispose(&mut self) {
        self.root.cancel();
        self.pending.clear();
    }
}

impl<M> Drop for ReadReceiptDebouncer<M> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
