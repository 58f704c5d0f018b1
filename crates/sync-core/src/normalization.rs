use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    error::SyncError,
    types::{ChangeEvent, Message, RawChannelEvent, RoomPatch, SendAck, SyncEvent},
};

const MESSAGES_TABLE: &str = "messages";
const CHAT_ROOMS_TABLE: &str = "chat_rooms";

/// Internal helper describing send RPC success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Server accepted the message; the echo arrives through the channel.
    Accepted,
    /// Send failed with error details.
    Failure { error: SyncError },
}

/// Convert a send outcome to a stable `SyncEvent::SendAck`.
pub fn normalize_send_outcome(
    room_id: impl Into<String>,
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> SyncEvent {
    let error_code = match outcome {
        SendOutcome::Accepted => None,
        SendOutcome::Failure { error } => Some(error.code),
    };
    SyncEvent::SendAck(SendAck {
        room_id: room_id.into(),
        client_txn_id: client_txn_id.into(),
        error_code,
    })
}

/// Convert an error into a `CommandFailed` event.
pub fn normalize_command_error(error: SyncError) -> SyncEvent {
    let recoverable = error.is_retryable();
    SyncEvent::CommandFailed {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

/// Room row as carried by `chat_rooms` events. Only the fields the list
/// cache mirrors are read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRoomRecord {
    id: String,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Option<DateTime<Utc>>,
}

/// Decode a raw channel event. Malformed payloads become `Data` errors so the
/// caller can log and drop them without tearing down the subscription.
pub fn decode_channel_event(event: &RawChannelEvent) -> Result<ChangeEvent, SyncError> {
    match event.table.as_str() {
        MESSAGES_TABLE => {
            let message = Message::deserialize(&event.record).map_err(|err| {
                SyncError::data("malformed_payload", format!("messages row: {err}"))
            })?;
            Ok(ChangeEvent::Message {
                kind: event.kind,
                message,
            })
        }
        CHAT_ROOMS_TABLE => {
            let record = ChatRoomRecord::deserialize(&event.record).map_err(|err| {
                SyncError::data("malformed_payload", format!("chat_rooms row: {err}"))
            })?;
            Ok(ChangeEvent::Room {
                kind: event.kind,
                room_id: record.id,
                patch: RoomPatch {
                    last_message: record.last_message,
                    last_message_time: record.last_message_time,
                    unread_count: None,
                },
            })
        }
        other => Err(SyncError::data(
            "unknown_table",
            format!("unexpected relation '{other}'"),
        )),
    }
}

/// Name of the relation events for a message are published on.
pub fn messages_table() -> &'static str {
    MESSAGES_TABLE
}

/// Name of the relation events for a room row are published on.
pub fn chat_rooms_table() -> &'static str {
    CHAT_ROOMS_TABLE
}
