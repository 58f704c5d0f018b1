//! Runtime-free core of the realtime message synchronization engine.
//!
//! This crate holds the command/event protocol, the subscription lifecycle
//! model, reconnect policy, and the in-memory views (messages, unread
//! counters, room list) that the runtime patches from channel events.

/// Command/event channel primitives.
pub mod channel;
/// Stable error types shared across the engine boundary.
pub mod error;
/// Merged, deduplicated per-room message view.
pub mod message_store;
/// Channel payload decoding and send acknowledgement normalization.
pub mod normalization;
/// Optimistic send bookkeeping.
pub mod outbox;
/// Linear reconnect backoff.
pub mod retry;
/// Ordered room summaries patched from events.
pub mod room_list;
/// Subscription lifecycle state machine.
pub mod state_machine;
/// Protocol types (commands, events, rows).
pub mod types;
/// Race-safe unread counters.
pub mod unread;

pub use channel::{EventStream, SyncChannelError, SyncChannels};
pub use error::{SyncError, SyncErrorCategory};
pub use message_store::{ApplyOutcome, MessageStore, MessageStoreError};
pub use normalization::{
    SendOutcome, decode_channel_event, normalize_command_error, normalize_send_outcome,
};
pub use outbox::{OptimisticSender, is_temp_id};
pub use retry::ReconnectPolicy;
pub use room_list::{ChatRoomListCache, patch_room_list};
pub use state_machine::{FailureOutcome, SubscriptionState, SubscriptionStateMachine};
pub use types::{
    ChangeEvent, ChangeKind, ChatRoomSummary, DeliveryState, Message, MessagePage,
    OutgoingMessage, PendingMessage, RawChannelEvent, RoomPatch, SendAck, SubscriptionScope,
    SyncCommand, SyncEvent, TimelineEntry, TimelineItem,
};
pub use unread::{InboundOutcome, MarkReadTicket, UnreadCounter, ViewerContext};
