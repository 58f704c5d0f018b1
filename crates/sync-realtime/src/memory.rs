//! In-memory [`ChatBackend`] used by tests and the smoke app.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_core::{
    ChangeKind, ChatRoomSummary, Message, MessagePage, OutgoingMessage, RawChannelEvent,
    SubscriptionScope, SyncError, SyncErrorCategory,
    normalization::{chat_rooms_table, messages_table},
};
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::transport::{ChannelFeed, ChatBackend, FeedItem};

const FEED_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct BackendState {
    current_user: Option<String>,
    rooms: Vec<ChatRoomSummary>,
    messages: HashMap<String, Vec<Message>>,
    subscribers: HashMap<SubscriptionScope, Vec<mpsc::Sender<FeedItem>>>,
    failing_subscribes: u32,
    failing_sends: u32,
    echo_disabled: bool,
    mark_read_gate: Option<Arc<Semaphore>>,
    fetch_gate: Option<Arc<Semaphore>>,
    subscribe_calls: u32,
    mark_read_calls: u32,
    sent: Vec<OutgoingMessage>,
}

impl BackendState {
    fn publish(&mut self, scope: &SubscriptionScope, item: FeedItem) {
        let Some(senders) = self.subscribers.get_mut(scope) else {
            return;
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let _ = tx.try_send(item.clone());
        }
    }

    /// Deliver a message row to its room channel and to every participant.
    fn fan_out_message(&mut self, kind: ChangeKind, message: &Message) {
        let record = match serde_json::to_value(message) {
            Ok(record) => record,
            Err(err) => {
                debug!(error = %err, "failed encoding message row");
                return;
            }
        };
        let event = FeedItem::Change(RawChannelEvent {
            table: messages_table().to_owned(),
            kind,
            record,
        });

        self.publish(&SubscriptionScope::room(&message.chat_room_id), event.clone());
        let participants = self
            .rooms
            .iter()
            .find(|room| room.id == message.chat_room_id)
            .map(|room| room.participants.clone())
            .unwrap_or_default();
        for participant in participants {
            self.publish(&SubscriptionScope::user(participant), event.clone());
        }
    }

    fn store_message(&mut self, message: Message) {
        if let Some(room) = self.rooms.iter_mut().find(|room| room.id == message.chat_room_id) {
            room.last_message = Some(message.content.clone());
            room.last_message_time = Some(message.timestamp);
        }
        self.messages
            .entry(message.chat_room_id.clone())
            .or_default()
            .push(message);
    }

    fn unread_for(&self, room_id: &str, user_id: &str) -> u64 {
        self.messages
            .get(room_id)
            .map(|rows| {
                rows.iter()
                    .filter(|m| !m.read && m.sender_id != user_id)
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

/// Shared in-memory backend. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    /// Backend with `user_id` signed in.
    pub fn with_user(user_id: impl Into<String>) -> Self {
        let backend = Self::default();
        backend.set_current_user(Some(user_id.into()));
        backend
    }

    pub fn set_current_user(&self, user_id: Option<String>) {
        self.lock().current_user = user_id;
    }

    pub fn add_room(&self, room_id: &str, participants: &[&str]) {
        self.lock().rooms.push(ChatRoomSummary {
            id: room_id.to_owned(),
            participants: participants.iter().map(|p| (*p).to_owned()).collect(),
            last_message: None,
            last_message_time: None,
            unread_count: 0,
        });
    }

    /// Store a historical message without publishing it.
    pub fn seed_message(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Message {
        let message = new_message(room_id, sender_id, content, timestamp, None);
        self.lock().store_message(message.clone());
        message
    }

    /// Store a message from `sender_id` and publish its INSERT event.
    pub fn publish_message(&self, room_id: &str, sender_id: &str, content: &str) -> Message {
        let message = new_message(room_id, sender_id, content, Utc::now(), None);
        let mut state = self.lock();
        state.store_message(message.clone());
        state.fan_out_message(ChangeKind::Insert, &message);
        message
    }

    /// Publish the INSERT of an already stored message again, as a provider
    /// redelivery would.
    pub fn redeliver(&self, message: &Message) {
        self.lock().fan_out_message(ChangeKind::Insert, message);
    }

    /// Publish an arbitrary change on one scope.
    pub fn publish_raw(&self, scope: &SubscriptionScope, event: RawChannelEvent) {
        self.lock().publish(scope, FeedItem::Change(event));
    }

    /// Publish a `chat_rooms` UPDATE for `room_id` on the participants' scopes.
    pub fn publish_room_update(&self, room_id: &str, record: serde_json::Value) {
        let mut state = self.lock();
        let participants = state
            .rooms
            .iter()
            .find(|room| room.id == room_id)
            .map(|room| room.participants.clone())
            .unwrap_or_default();
        let event = FeedItem::Change(RawChannelEvent {
            table: chat_rooms_table().to_owned(),
            kind: ChangeKind::Update,
            record,
        });
        for participant in participants {
            state.publish(&SubscriptionScope::user(participant), event.clone());
        }
    }

    /// Fail every live channel on `scope` with a transport error.
    pub fn break_channel(&self, scope: &SubscriptionScope) {
        let mut state = self.lock();
        state.publish(
            scope,
            FeedItem::Error(SyncError::transport("channel_error", "channel dropped")),
        );
        state.subscribers.remove(scope);
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.lock().failing_subscribes = count;
    }

    /// Make the next `count` sends report rejection.
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    /// Stop echoing accepted sends back through the channels.
    pub fn disable_echo(&self) {
        self.lock().echo_disabled = true;
    }

    /// Hold every mark-as-read call until a permit is added to the gate.
    pub fn gate_mark_read(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().mark_read_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every history fetch until a permit is added to the gate.
    pub fn gate_fetch_messages(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().fetch_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.lock().subscribe_calls
    }

    pub fn mark_read_calls(&self) -> u32 {
        self.lock().mark_read_calls
    }

    /// Send RPCs received, accepted or not.
    pub fn send_calls(&self) -> usize {
        self.lock().sent.len()
    }

    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.lock().sent.clone()
    }

    /// Live channels currently open on `scope`.
    pub fn live_channels(&self, scope: &SubscriptionScope) -> usize {
        self.lock()
            .subscribers
            .get(scope)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn unread_for(&self, room_id: &str, user_id: &str) -> u64 {
        self.lock().unread_for(room_id, user_id)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChatBackend for InMemoryBackend {
    fn current_user_id(&self) -> Option<String> {
        self.lock().current_user.clone()
    }

    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<ChannelFeed, SyncError> {
        let mut state = self.lock();
        state.subscribe_calls += 1;
        if state.current_user.is_none() {
            return Err(SyncError::auth_required("no signed-in user"));
        }
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SyncError::transport(
                "subscribe_failed",
                format!("subscribe to {} failed", scope.label()),
            ));
        }

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        state.subscribers.entry(scope.clone()).or_default().push(tx);
        Ok(ChannelFeed { events: rx })
    }

    async fn fetch_messages(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: u16,
    ) -> Result<MessagePage, SyncError> {
        let gate = self.lock().fetch_gate.clone();
        if let Some(gate) = gate {
            pass_gate(&gate).await?;
        }

        let state = self.lock();
        let mut older: Vec<Message> = state
            .messages
            .get(room_id)
            .map(|rows| {
                rows.iter()
                    .filter(|m| before.is_none_or(|cursor| m.timestamp < cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        older.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let limit = usize::from(limit.max(1));
        let has_more = older.len() > limit;
        let page = older.split_off(older.len().saturating_sub(limit));
        let next_cursor = if has_more {
            page.first().map(|m| m.timestamp)
        } else {
            None
        };

        Ok(MessagePage {
            messages: page,
            has_more,
            next_cursor,
        })
    }

    async fn fetch_room_list(&self, user_id: &str) -> Result<Vec<ChatRoomSummary>, SyncError> {
        let state = self.lock();
        let mut rooms: Vec<ChatRoomSummary> = state
            .rooms
            .iter()
            .filter(|room| room.participants.iter().any(|p| p == user_id))
            .map(|room| ChatRoomSummary {
                unread_count: state.unread_for(&room.id, user_id),
                ..room.clone()
            })
            .collect();
        rooms.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(rooms)
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<bool, SyncError> {
        let mut state = self.lock();
        state.sent.push(message.clone());
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Ok(false);
        }
        if !state.rooms.iter().any(|room| room.id == message.room_id) {
            return Err(SyncError::new(
                SyncErrorCategory::State,
                "room_not_found",
                format!("room not found: {}", message.room_id),
            ));
        }

        let stored = new_message(
            &message.room_id,
            &message.sender_id,
            &message.content,
            Utc::now(),
            Some(message.client_txn_id.clone()),
        );
        state.store_message(stored.clone());
        if !state.echo_disabled {
            state.fan_out_message(ChangeKind::Insert, &stored);
        }
        Ok(true)
    }

    async fn mark_as_read(&self, room_id: &str, user_id: &str) -> Result<u64, SyncError> {
        let gate = {
            let mut state = self.lock();
            state.mark_read_calls += 1;
            state.mark_read_gate.clone()
        };
        if let Some(gate) = gate {
            pass_gate(&gate).await?;
        }

        let mut state = self.lock();
        let mut updated = 0;
        if let Some(rows) = state.messages.get_mut(room_id) {
            for row in rows.iter_mut().filter(|m| !m.read && m.sender_id != user_id) {
                row.read = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), SyncError> {
        let mut state = self.lock();
        let before = state.rooms.len();
        state.rooms.retain(|room| room.id != room_id);
        if state.rooms.len() == before {
            return Err(SyncError::new(
                SyncErrorCategory::State,
                "room_not_found",
                format!("room not found: {room_id}"),
            ));
        }
        state.messages.remove(room_id);
        Ok(())
    }
}

async fn pass_gate(gate: &Semaphore) -> Result<(), SyncError> {
    let permit = gate
        .acquire()
        .await
        .map_err(|err| SyncError::transport("request_aborted", err.to_string()))?;
    permit.forget();
    Ok(())
}

fn new_message(
    room_id: &str,
    sender_id: &str,
    content: &str,
    timestamp: DateTime<Utc>,
    client_txn_id: Option<String>,
) -> Message {
    Message {
        id: format!("msg-{}", Uuid::new_v4()),
        chat_room_id: room_id.to_owned(),
        sender_id: sender_id.to_owned(),
        content: content.to_owned(),
        timestamp,
        read: false,
        client_txn_id,
    }
}
