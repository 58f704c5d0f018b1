use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncErrorCategory},
    message_store::{MessageStore, MessageStoreError},
    types::{DeliveryState, OutgoingMessage, PendingMessage},
};

const TEMP_ID_PREFIX: &str = "temp-";

/// Creates, tracks and retires optimistic messages in a [`MessageStore`].
///
/// Nothing here talks to the network: the caller transmits the returned
/// [`OutgoingMessage`] exactly once and reports failures back.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimisticSender;

impl OptimisticSender {
    /// Record a pending entry for a fresh user send.
    pub fn begin_send(
        &self,
        store: &mut MessageStore,
        room_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> OutgoingMessage {
        let pending = PendingMessage {
            temp_id: new_temp_id(),
            chat_room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            local_created_at: now,
            state: DeliveryState::Sending,
        };
        let outgoing = OutgoingMessage {
            room_id: pending.chat_room_id.clone(),
            sender_id: pending.sender_id.clone(),
            content: pending.content.clone(),
            client_txn_id: pending.temp_id.clone(),
        };
        store.add_pending(pending);
        outgoing
    }

    /// Replace a failed entry with a new pending one under a new ID.
    pub fn begin_resend(
        &self,
        store: &mut MessageStore,
        room_id: &str,
        temp_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage, SyncError> {
        let failed = store
            .discard_failed(room_id, temp_id)
            .map_err(map_store_error)?;
        Ok(self.begin_send(store, room_id, &failed.sender_id, &failed.content, now))
    }

    /// Mark the entry as failed after its send RPC failed. Never retries.
    pub fn record_failure(&self, store: &mut MessageStore, room_id: &str, temp_id: &str) -> bool {
        store.mark_failed(room_id, temp_id)
    }
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

fn map_store_error(err: MessageStoreError) -> SyncError {
    let code = match err {
        MessageStoreError::PendingNotFound(_) => "pending_not_found",
        MessageStoreError::PendingNotFailed(_) => "pending_not_failed",
    };
    SyncError::new(SyncErrorCategory::SendFailure, code, err.to_string())
}
