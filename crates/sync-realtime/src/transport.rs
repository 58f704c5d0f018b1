//! Boundary to the managed backend: channel transport plus the handful of
//! request/response calls the sync engine depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_core::{
    ChatRoomSummary, MessagePage, OutgoingMessage, RawChannelEvent, SubscriptionScope, SyncError,
};
use tokio::sync::mpsc;

/// One item delivered on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Change(RawChannelEvent),
    /// Channel-level failure. The feed is unusable afterwards.
    Error(SyncError),
}

/// Live channel returned by a successful subscribe handshake.
///
/// The channel is torn down when this value is dropped; a closed receiver
/// means the transport lost the channel.
#[derive(Debug)]
pub struct ChannelFeed {
    pub events: mpsc::Receiver<FeedItem>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Signed-in user, `None` when there is no caller identity.
    fn current_user_id(&self) -> Option<String>;

    /// Subscribe handshake for `scope`.
    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<ChannelFeed, SyncError>;

    /// One history page of at most `limit` rows older than `before`.
    async fn fetch_messages(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: u16,
    ) -> Result<MessagePage, SyncError>;

    /// Room summaries for `user_id`, unread counts computed server-side.
    async fn fetch_room_list(&self, user_id: &str) -> Result<Vec<ChatRoomSummary>, SyncError>;

    /// Returns `false` when the server rejected the message.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<bool, SyncError>;

    /// Marks the room read for `user_id` and returns the number of rows updated.
    async fn mark_as_read(&self, room_id: &str, user_id: &str) -> Result<u64, SyncError>;

    async fn delete_room(&self, room_id: &str) -> Result<(), SyncError>;
}
