use std::fmt;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SyncCommand, SyncEvent};

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Errors returned by engine channel operations.
#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The engine mailbox is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The engine stopped before answering a query.
    #[error("engine dropped the reply")]
    ReplyDropped,
}

/// Command/event channel pair shared by the engine and its callers.
///
/// Commands go through an unbounded channel so timers and `Drop` impls can
/// post without awaiting.
pub struct SyncChannels<C = SyncCommand> {
    command_tx: mpsc::UnboundedSender<C>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl<C> Clone for SyncChannels<C> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl<C> fmt::Debug for SyncChannels<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncChannels")
            .field("command_closed", &self.command_tx.is_closed())
            .field("event_receivers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl<C> SyncChannels<C> {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(event_buffer: usize) -> (Self, mpsc::UnboundedReceiver<C>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the command sender.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<C> {
        self.command_tx.clone()
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Post one command to the engine.
    pub fn send_command(&self, command: C) -> Result<(), SyncChannelError> {
        self.command_tx
            .send(command)
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}
