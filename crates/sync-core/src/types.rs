use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::SubscriptionState;

/// Channel address the transport can subscribe to.
///
/// The scope is also the (room, purpose) key: at most one live subscription
/// exists per scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Room-scoped `messages` channel.
    Room {
        /// Target chat room ID.
        room_id: String,
    },
    /// Global channel for one signed-in user (`messages` and `chat_rooms`).
    User {
        /// Signed-in user ID.
        user_id: String,
    },
}

impl SubscriptionScope {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room {
            room_id: room_id.into(),
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
        }
    }

    /// Stable label used in logs and channel names.
    pub fn label(&self) -> String {
        match self {
            Self::Room { room_id } => format!("room:{room_id}"),
            Self::User { user_id } => format!("user:{user_id}"),
        }
    }
}

/// Server-confirmed chat message as mirrored by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_room_id: String,
    pub sender_id: String,
    pub content: String,
    /// Server timestamp, ISO-8601 on the wire.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Temporary ID of the optimistic message this row confirms, when the
    /// server echoes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_txn_id: Option<String>,
}

/// Delivery state of a locally created message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryState {
    /// Send RPC is in flight or succeeded and the echo has not arrived yet.
    Sending,
    /// Send RPC failed. Only an explicit resend retries it.
    Failed,
}

/// Optimistic message shown before its server echo arrives. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    /// Locally unique temporary ID (`temp-<uuid>`).
    pub temp_id: String,
    pub chat_room_id: String,
    pub sender_id: String,
    pub content: String,
    /// Local clock reading taken when the send was initiated.
    pub local_created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl PendingMessage {
    /// `true` while the message waits for the send RPC or its echo.
    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Sending
    }

    /// `true` once the send RPC failed.
    pub fn is_error(&self) -> bool {
        self.state == DeliveryState::Failed
    }
}

/// Borrowed element of a room's merged view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEntry<'a> {
    Confirmed(&'a Message),
    Pending(&'a PendingMessage),
}

impl TimelineEntry<'_> {
    /// Message ID for confirmed rows, temporary ID for pending ones.
    pub fn id(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.id,
            Self::Pending(pending) => &pending.temp_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.content,
            Self::Pending(pending) => &pending.content,
        }
    }

    pub fn to_item(&self) -> TimelineItem {
        match self {
            Self::Confirmed(message) => TimelineItem::Confirmed((*message).clone()),
            Self::Pending(pending) => TimelineItem::Pending((*pending).clone()),
        }
    }
}

/// Owned element of a room's merged view, as published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineItem {
    Confirmed(Message),
    Pending(PendingMessage),
}

impl TimelineItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.id,
            Self::Pending(pending) => &pending.temp_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.content,
            Self::Pending(pending) => &pending.content,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingMessage> {
        match self {
            Self::Pending(pending) => Some(pending),
            Self::Confirmed(_) => None,
        }
    }
}

/// Room summary row shown in the chat room list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomSummary {
    pub id: String,
    /// Participant user IDs: two for direct chats, N for gatherings.
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    /// Unread count for the viewing user.
    #[serde(default)]
    pub unread_count: u64,
}

/// Partial update applied to one cached room summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPatch {
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: Option<u64>,
}

impl RoomPatch {
    /// Patch produced by a new message landing in the room.
    pub fn last_message(message: &Message) -> Self {
        Self {
            last_message: Some(message.content.clone()),
            last_message_time: Some(message.timestamp),
            unread_count: None,
        }
    }

    pub fn unread(count: u64) -> Self {
        Self {
            unread_count: Some(count),
            ..Self::default()
        }
    }
}

/// One page of room history, newest page first when walking backwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Page rows in any order; the store sorts them.
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// Timestamp of the oldest message in the page when `has_more` is true.
    pub next_cursor: Option<DateTime<Utc>>,
}

/// Payload handed to the send RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    /// Temporary ID the server echoes back as `clientTxnId`.
    pub client_txn_id: String,
}

/// Row change kind carried by channel events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Undecoded change event as delivered by the channel transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawChannelEvent {
    /// Logical relation name, `messages` or `chat_rooms`.
    pub table: String,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

/// Decoded channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Message {
        kind: ChangeKind,
        message: Message,
    },
    Room {
        kind: ChangeKind,
        room_id: String,
        patch: RoomPatch,
    },
}

/// Commands accepted by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncCommand {
    /// Open the signed-in user's global channel and cold-load the room list.
    SubscribeToRoomList,
    /// Refetch room summaries and the authoritative unread snapshot.
    LoadRoomList,
    /// Mount a room view: make it active, subscribe, fetch the newest page.
    OpenRoom { room_id: String },
    /// Unmount a room view and tear down everything it owns.
    CloseRoom { room_id: String },
    /// Fetch the next older history page.
    LoadMore { room_id: String },
    /// Optimistically send a message.
    SendMessage { room_id: String, content: String },
    /// Retry a failed optimistic message under a new temporary ID.
    Resend { room_id: String, temp_id: String },
    /// Viewer is looking at the room; feeds the read-receipt debouncer.
    MarkRoomViewed { room_id: String },
    /// Delete a room through the backend.
    DeleteRoom { room_id: String },
    /// Dispose all subscriptions and pending timers.
    Shutdown,
}

/// Acknowledgement for a send or resend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub room_id: String,
    /// Temporary ID of the optimistic message.
    pub client_txn_id: String,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Events emitted by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Merged view of a room changed.
    RoomMessagesChanged {
        room_id: String,
        items: Vec<TimelineItem>,
    },
    /// Room list order or content changed.
    RoomListChanged {
        rooms: Vec<Arc<ChatRoomSummary>>,
    },
    /// Per-room or aggregate unread count changed.
    UnreadChanged {
        room_id: String,
        count: u64,
        aggregate: u64,
    },
    /// Whole unread state replaced by an authoritative snapshot.
    UnreadReplaced {
        counts: HashMap<String, u64>,
        aggregate: u64,
    },
    SubscriptionStateChanged {
        scope: SubscriptionScope,
        state: SubscriptionState,
    },
    /// A subscribe attempt failed. `gave_up` is set on the attempt that
    /// exhausted the retry budget.
    SubscriptionError {
        scope: SubscriptionScope,
        failed_count: u32,
        gave_up: bool,
    },
    /// No caller identity; the subscription was not retried.
    AuthRequired { scope: SubscriptionScope },
    SendAck(SendAck),
    /// A history page was merged.
    HistoryLoaded {
        room_id: String,
        added: usize,
        has_more: bool,
    },
    RoomDeleted { room_id: String },
    /// A command could not be carried out.
    CommandFailed {
        code: String,
        message: String,
        recoverable: bool,
    },
}
