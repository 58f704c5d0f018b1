//! Sync engine actor and its public handles.
//!
//! One task owns every cache. Commands, subscription signals, debounce timers
//! and I/O completions all arrive through the same mailbox and are applied
//! one at a time, so no cache is ever touched concurrently. Network calls run
//! in spawned tasks that post a [`Completion`] back when they finish.

use std::{collections::HashMap, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use sync_core::{
    ChangeEvent, ChangeKind, ChatRoomListCache, ChatRoomSummary, EventStream, InboundOutcome,
    MarkReadTicket, Message, MessagePage, MessageStore, OptimisticSender, OutgoingMessage,
    RoomPatch, SendOutcome, SubscriptionScope, SubscriptionState, SyncChannelError, SyncChannels,
    SyncCommand, SyncError, SyncErrorCategory, SyncEvent, TimelineItem, UnreadCounter,
    ViewerContext, decode_channel_event, normalize_command_error, normalize_send_outcome,
};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::{
    config::SyncConfig,
    debounce::{DebounceFired, ReadReceiptDebouncer},
    subscription::{SignalKind, SubscriptionManager, SubscriptionSignal},
    transport::ChatBackend,
};

#[derive(Debug)]
pub(crate) enum EngineMessage {
    Command(SyncCommand),
    Query(Query),
    Signal(SubscriptionSignal),
    DebounceFired(DebounceFired),
    Completion(Completion),
}

impl From<SubscriptionSignal> for EngineMessage {
    fn from(signal: SubscriptionSignal) -> Self {
        Self::Signal(signal)
    }
}

impl From<DebounceFired> for EngineMessage {
    fn from(fired: DebounceFired) -> Self {
        Self::DebounceFired(fired)
    }
}

#[derive(Debug)]
pub(crate) enum Query {
    Messages {
        room_id: String,
        reply: oneshot::Sender<Vec<TimelineItem>>,
    },
    UnreadCount {
        room_id: String,
        reply: oneshot::Sender<u64>,
    },
    AggregateUnread {
        reply: oneshot::Sender<u64>,
    },
    RoomList {
        reply: oneshot::Sender<Vec<Arc<ChatRoomSummary>>>,
    },
    SubscriptionState {
        scope: SubscriptionScope,
        reply: oneshot::Sender<SubscriptionState>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    /// First page after opening the room.
    Initial,
    /// Next older page requested by `load_more`.
    Older,
    /// Newest page refetched after a reconnect.
    Refresh,
}

#[derive(Debug)]
pub(crate) enum Completion {
    RoomListLoaded {
        generation: u64,
        result: Result<Vec<ChatRoomSummary>, SyncError>,
    },
    PageLoaded {
        room_id: String,
        generation: u64,
        kind: PageKind,
        result: Result<MessagePage, SyncError>,
    },
    SendFinished {
        room_id: String,
        temp_id: String,
        result: Result<bool, SyncError>,
    },
    MarkReadFinished {
        ticket: MarkReadTicket,
        result: Result<u64, SyncError>,
    },
    RoomDeleted {
        room_id: String,
        result: Result<(), SyncError>,
    },
}

/// Per-open-room bookkeeping. `generation` identifies one open/close cycle.
#[derive(Debug)]
struct RoomContext {
    generation: u64,
    has_more: bool,
    cursor: Option<DateTime<Utc>>,
    loading_more: bool,
}

/// Sends `Shutdown` once the last handle clone is gone.
#[derive(Debug)]
struct EngineGuard {
    channels: SyncChannels<EngineMessage>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        let _ = self
            .channels
            .send_command(EngineMessage::Command(SyncCommand::Shutdown));
    }
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    channels: SyncChannels<EngineMessage>,
    _guard: Arc<EngineGuard>,
}

impl SyncHandle {
    pub fn events(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Post a raw protocol command.
    pub fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(EngineMessage::Command(command))
    }

    /// Open the signed-in user's channel and cold-load the room list.
    pub fn subscribe_to_room_list(&self) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::SubscribeToRoomList)
    }

    pub fn load_room_list(&self) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::LoadRoomList)
    }

    /// Mount a room view. The room closes when the session is closed or dropped.
    pub fn open_room(&self, room_id: impl Into<String>) -> Result<RoomSession, SyncChannelError> {
        let room_id = room_id.into();
        self.send(SyncCommand::OpenRoom {
            room_id: room_id.clone(),
        })?;
        Ok(RoomSession {
            room_id,
            handle: self.clone(),
            closed: false,
        })
    }

    pub fn mark_room_viewed(&self, room_id: impl Into<String>) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::MarkRoomViewed {
            room_id: room_id.into(),
        })
    }

    pub fn load_more(&self, room_id: impl Into<String>) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::LoadMore {
            room_id: room_id.into(),
        })
    }

    pub fn send_message(
        &self,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::SendMessage {
            room_id: room_id.into(),
            content: content.into(),
        })
    }

    /// Retry a failed optimistic message.
    pub fn resend(
        &self,
        room_id: impl Into<String>,
        temp_id: impl Into<String>,
    ) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::Resend {
            room_id: room_id.into(),
            temp_id: temp_id.into(),
        })
    }

    pub fn delete_room(&self, room_id: impl Into<String>) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::DeleteRoom {
            room_id: room_id.into(),
        })
    }

    /// Merged confirmed and pending messages for `room_id`.
    pub async fn messages(
        &self,
        room_id: impl Into<String>,
    ) -> Result<Vec<TimelineItem>, SyncChannelError> {
        let room_id = room_id.into();
        self.query(|reply| Query::Messages { room_id, reply }).await
    }

    pub async fn unread_count(&self, room_id: impl Into<String>) -> Result<u64, SyncChannelError> {
        let room_id = room_id.into();
        self.query(|reply| Query::UnreadCount { room_id, reply }).await
    }

    pub async fn aggregate_unread(&self) -> Result<u64, SyncChannelError> {
        self.query(|reply| Query::AggregateUnread { reply }).await
    }

    pub async fn room_list(&self) -> Result<Vec<Arc<ChatRoomSummary>>, SyncChannelError> {
        self.query(|reply| Query::RoomList { reply }).await
    }

    pub async fn subscription_state(
        &self,
        scope: SubscriptionScope,
    ) -> Result<SubscriptionState, SyncChannelError> {
        self.query(|reply| Query::SubscriptionState { scope, reply }).await
    }

    /// Dispose every subscription and timer and stop the engine.
    pub fn shutdown(&self) -> Result<(), SyncChannelError> {
        self.send(SyncCommand::Shutdown)
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Query,
    ) -> Result<T, SyncChannelError> {
        let (reply, rx) = oneshot::channel();
        self.channels.send_command(EngineMessage::Query(build(reply)))?;
        rx.await.map_err(|_| SyncChannelError::ReplyDropped)
    }
}

/// A mounted room view.
#[derive(Debug)]
pub struct RoomSession {
    room_id: String,
    handle: SyncHandle,
    closed: bool,
}

impl RoomSession {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn send_message(&self, content: impl Into<String>) -> Result<(), SyncChannelError> {
        self.handle.send_message(self.room_id.clone(), content)
    }

    pub fn resend(&self, temp_id: impl Into<String>) -> Result<(), SyncChannelError> {
        self.handle.resend(self.room_id.clone(), temp_id)
    }

    pub fn mark_viewed(&self) -> Result<(), SyncChannelError> {
        self.handle.mark_room_viewed(self.room_id.clone())
    }

    pub fn load_more(&self) -> Result<(), SyncChannelError> {
        self.handle.load_more(self.room_id.clone())
    }

    pub async fn messages(&self) -> Result<Vec<TimelineItem>, SyncChannelError> {
        self.handle.messages(self.room_id.clone()).await
    }

    pub async fn unread_count(&self) -> Result<u64, SyncChannelError> {
        self.handle.unread_count(self.room_id.clone()).await
    }

    /// Unmount: dispose the room channel, cancel its debounce and drop
    /// in-flight fetches.
    pub fn close(mut self) -> Result<(), SyncChannelError> {
        self.closed = true;
        self.handle.send(SyncCommand::CloseRoom {
            room_id: self.room_id.clone(),
        })
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.handle.send(SyncCommand::CloseRoom {
            room_id: self.room_id.clone(),
        });
    }
}

/// Start the engine on the current tokio runtime.
pub fn spawn_engine(backend: Arc<dyn ChatBackend>, config: SyncConfig) -> SyncHandle {
    let (channels, mailbox) = SyncChannels::new(config.event_buffer);
    let engine = SyncEngine::new(backend, config, channels.clone(), mailbox);
    tokio::spawn(engine.run());

    SyncHandle {
        _guard: Arc::new(EngineGuard {
            channels: channels.clone(),
        }),
        channels,
    }
}

struct SyncEngine {
    backend: Arc<dyn ChatBackend>,
    config: SyncConfig,
    channels: SyncChannels<EngineMessage>,
    mailbox: tokio::sync::mpsc::UnboundedReceiver<EngineMessage>,
    subscriptions: SubscriptionManager<EngineMessage>,
    debouncer: ReadReceiptDebouncer<EngineMessage>,
    store: MessageStore,
    room_list: ChatRoomListCache,
    unread: UnreadCounter,
    outbox: OptimisticSender,
    rooms: HashMap<String, RoomContext>,
    active_room: Option<String>,
    scope_states: HashMap<SubscriptionScope, SubscriptionState>,
    next_room_generation: u64,
    list_generation: u64,
}

impl SyncEngine {
    fn new(
        backend: Arc<dyn ChatBackend>,
        config: SyncConfig,
        channels: SyncChannels<EngineMessage>,
        mailbox: tokio::sync::mpsc::UnboundedReceiver<EngineMessage>,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&backend),
            config.reconnect_policy(),
            channels.command_sender(),
        );
        let debouncer =
            ReadReceiptDebouncer::new(config.debounce_window(), channels.command_sender());
        Self {
            backend,
            config,
            channels,
            mailbox,
            subscriptions,
            debouncer,
            store: MessageStore::new(),
            room_list: ChatRoomListCache::default(),
            unread: UnreadCounter::new(),
            outbox: OptimisticSender,
            rooms: HashMap::new(),
            active_room: None,
            scope_states: HashMap::new(),
            next_room_generation: 0,
            list_generation: 0,
        }
    }

    async fn run(mut self) {
        info!(page_size = self.config.page_size, "sync engine started");
        while let Some(message) = self.mailbox.recv().await {
            match message {
                EngineMessage::Command(SyncCommand::Shutdown) => break,
                EngineMessage::Command(command) => {
                    if let Err(err) = self.handle_command(command) {
                        warn!(code = %err.code, error = %err, "sync command failed");
                        self.channels.emit(normalize_command_error(err));
                    }
                }
                EngineMessage::Query(query) => self.answer(query),
                EngineMessage::Signal(signal) => self.handle_signal(signal),
                EngineMessage::DebounceFired(fired) => self.handle_debounce_fired(fired),
                EngineMessage::Completion(completion) => self.handle_completion(completion),
            }
        }
        self.shutdown();
        info!("sync engine stopped");
    }

    fn handle_command(&mut self, command: SyncCommand) -> Result<(), SyncError> {
        match command {
            SyncCommand::SubscribeToRoomList => self.handle_subscribe_to_room_list(),
            SyncCommand::LoadRoomList => self.load_room_list(),
            SyncCommand::OpenRoom { room_id } => {
                self.handle_open_room(room_id);
                Ok(())
            }
            SyncCommand::CloseRoom { room_id } => {
                self.handle_close_room(&room_id);
                Ok(())
            }
            SyncCommand::LoadMore { room_id } => self.handle_load_more(&room_id),
            SyncCommand::SendMessage { room_id, content } => {
                self.handle_send_message(&room_id, &content)
            }
            SyncCommand::Resend { room_id, temp_id } => self.handle_resend(&room_id, &temp_id),
            SyncCommand::MarkRoomViewed { room_id } => {
                self.debouncer.trigger(&room_id);
                Ok(())
            }
            SyncCommand::DeleteRoom { room_id } => {
                self.handle_delete_room(room_id);
                Ok(())
            }
            SyncCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    fn handle_subscribe_to_room_list(&mut self) -> Result<(), SyncError> {
        let user_id = self.require_identity()?;
        self.subscriptions.open(SubscriptionScope::user(user_id));
        self.load_room_list()
    }

    fn load_room_list(&mut self) -> Result<(), SyncError> {
        let user_id = self.require_identity()?;
        self.list_generation += 1;
        let generation = self.list_generation;
        let backend = Arc::clone(&self.backend);
        debug!(generation, "fetching room list");
        self.spawn_io(async move {
            let result = backend.fetch_room_list(&user_id).await;
            Completion::RoomListLoaded { generation, result }
        });
        Ok(())
    }

    fn handle_open_room(&mut self, room_id: String) {
        if self.rooms.contains_key(&room_id) {
            debug!(%room_id, "room reopened; replacing previous context");
        }
        self.next_room_generation += 1;
        let generation = self.next_room_generation;
        self.rooms.insert(
            room_id.clone(),
            RoomContext {
                generation,
                has_more: true,
                cursor: None,
                loading_more: true,
            },
        );
        self.active_room = Some(room_id.clone());
        self.subscriptions.open(SubscriptionScope::room(&room_id));
        self.fetch_page(&room_id, generation, None, PageKind::Initial);

        if self.unread.count(&room_id) > 0 {
            self.debouncer.trigger(&room_id);
        }
        info!(%room_id, generation, "room opened");
    }

    fn handle_close_room(&mut self, room_id: &str) {
        if self.rooms.remove(room_id).is_none() {
            trace!(room_id, "close for room that is not open");
            return;
        }
        self.subscriptions.dispose(&SubscriptionScope::room(room_id));
        self.scope_states.remove(&SubscriptionScope::room(room_id));
        self.debouncer.cancel(room_id);
        self.store.clear_room(room_id);
        if self.active_room.as_deref() == Some(room_id) {
            self.active_room = None;
        }
        info!(room_id, "room closed");
    }

    fn handle_load_more(&mut self, room_id: &str) -> Result<(), SyncError> {
        let Some(context) = self.rooms.get_mut(room_id) else {
            return Err(room_not_open(room_id));
        };
        if context.loading_more {
            debug!(room_id, "history fetch already in flight");
            return Ok(());
        }
        if !context.has_more {
            debug!(room_id, "no older history");
            return Ok(());
        }
        context.loading_more = true;
        let generation = context.generation;
        let cursor = context.cursor.or_else(|| self.store.oldest_timestamp(room_id));
        self.fetch_page(room_id, generation, cursor, PageKind::Older);
        Ok(())
    }

    fn fetch_page(
        &self,
        room_id: &str,
        generation: u64,
        before: Option<DateTime<Utc>>,
        kind: PageKind,
    ) {
        let backend = Arc::clone(&self.backend);
        let room_id = room_id.to_owned();
        let limit = self.config.page_size;
        self.spawn_io(async move {
            let result = backend.fetch_messages(&room_id, before, limit).await;
            Completion::PageLoaded {
                room_id,
                generation,
                kind,
                result,
            }
        });
    }

    fn handle_send_message(&mut self, room_id: &str, content: &str) -> Result<(), SyncError> {
        let user_id = self.require_identity()?;
        self.require_open(room_id)?;
        let outgoing = self
            .outbox
            .begin_send(&mut self.store, room_id, &user_id, content, Utc::now());
        debug!(room_id, temp_id = %outgoing.client_txn_id, "optimistic send");
        self.emit_room_messages(room_id);
        self.transmit(outgoing);
        Ok(())
    }

    fn handle_resend(&mut self, room_id: &str, temp_id: &str) -> Result<(), SyncError> {
        self.require_identity()?;
        self.require_open(room_id)?;
        let outgoing = self
            .outbox
            .begin_resend(&mut self.store, room_id, temp_id, Utc::now())?;
        debug!(
            room_id,
            old_temp_id = temp_id,
            temp_id = %outgoing.client_txn_id,
            "resending failed message"
        );
        self.emit_room_messages(room_id);
        self.transmit(outgoing);
        Ok(())
    }

    /// Hand one message to the send RPC. Called once per user action.
    fn transmit(&self, outgoing: OutgoingMessage) {
        let backend = Arc::clone(&self.backend);
        self.spawn_io(async move {
            let result = backend.send_message(&outgoing).await;
            Completion::SendFinished {
                room_id: outgoing.room_id,
                temp_id: outgoing.client_txn_id,
                result,
            }
        });
    }

    fn handle_delete_room(&mut self, room_id: String) {
        let backend = Arc::clone(&self.backend);
        self.spawn_io(async move {
            let result = backend.delete_room(&room_id).await;
            Completion::RoomDeleted { room_id, result }
        });
    }

    fn handle_debounce_fired(&mut self, fired: DebounceFired) {
        if !self.debouncer.take_if_current(&fired) {
            trace!(room_id = %fired.room_id, "stale debounce timer ignored");
            return;
        }
        let Some(user_id) = self.backend.current_user_id() else {
            warn!(room_id = %fired.room_id, "skipping mark as read without identity");
            return;
        };

        let ticket = self.unread.begin_mark_read(&fired.room_id);
        debug!(
            room_id = %ticket.room_id,
            count_at_call_time = ticket.count_at_call_time,
            "marking room as read"
        );
        let backend = Arc::clone(&self.backend);
        self.spawn_io(async move {
            let result = backend.mark_as_read(&ticket.room_id, &user_id).await;
            Completion::MarkReadFinished { ticket, result }
        });
    }

    fn handle_signal(&mut self, signal: SubscriptionSignal) {
        if !self.subscriptions.is_current(&signal) {
            trace!(
                scope = %signal.scope.label(),
                id = signal.subscription_id,
                "dropping signal from disposed subscription"
            );
            return;
        }

        let SubscriptionSignal { scope, kind, .. } = signal;
        match kind {
            SignalKind::StateChanged(state) => {
                let previous = self.scope_states.insert(scope.clone(), state);
                self.channels.emit(SyncEvent::SubscriptionStateChanged {
                    scope: scope.clone(),
                    state,
                });
                if previous == Some(SubscriptionState::Reconnecting)
                    && state == SubscriptionState::Open
                {
                    self.resync(&scope);
                }
            }
            SignalKind::Event(raw) => match decode_channel_event(&raw) {
                Ok(change) => self.route_change(&scope, change),
                Err(err) => {
                    warn!(
                        scope = %scope.label(),
                        code = %err.code,
                        error = %err,
                        "dropping malformed channel event"
                    );
                }
            },
            SignalKind::Error {
                failed_count,
                gave_up,
            } => {
                self.channels.emit(SyncEvent::SubscriptionError {
                    scope,
                    failed_count,
                    gave_up,
                });
            }
            SignalKind::AuthRequired => {
                self.channels.emit(SyncEvent::AuthRequired { scope });
            }
        }
    }

    /// Catch up on whatever was missed while the channel was down.
    fn resync(&mut self, scope: &SubscriptionScope) {
        match scope {
            SubscriptionScope::User { .. } => {
                info!(scope = %scope.label(), "channel recovered; reloading room list");
                if let Err(err) = self.load_room_list() {
                    self.channels.emit(normalize_command_error(err));
                }
            }
            SubscriptionScope::Room { room_id } => {
                let Some(context) = self.rooms.get(room_id) else {
                    return;
                };
                info!(%room_id, "channel recovered; refetching newest page");
                self.fetch_page(room_id, context.generation, None, PageKind::Refresh);
            }
        }
    }

    fn route_change(&mut self, scope: &SubscriptionScope, change: ChangeEvent) {
        match (scope, change) {
            (
                SubscriptionScope::User { .. },
                ChangeEvent::Message {
                    kind: ChangeKind::Insert,
                    message,
                },
            ) => self.on_inbound_message(message),
            (
                SubscriptionScope::Room { room_id },
                ChangeEvent::Message {
                    kind: ChangeKind::Insert,
                    message,
                },
            ) => {
                if message.chat_room_id != *room_id {
                    debug!(
                        %room_id,
                        message_room = %message.chat_room_id,
                        "message on foreign room channel"
                    );
                    return;
                }
                self.apply_room_message(message);
            }
            (
                _,
                ChangeEvent::Message {
                    kind: ChangeKind::Update,
                    message,
                },
            ) => {
                let room_id = message.chat_room_id.clone();
                if self.rooms.contains_key(&room_id) && self.store.apply_update(message) {
                    self.emit_room_messages(&room_id);
                }
            }
            (SubscriptionScope::User { .. }, ChangeEvent::Room { kind, room_id, patch }) => {
                if self.room_list.contains(&room_id) {
                    self.apply_list_patch(&room_id, &patch);
                } else if kind == ChangeKind::Insert {
                    debug!(%room_id, "new room announced; reloading room list");
                    if let Err(err) = self.load_room_list() {
                        self.channels.emit(normalize_command_error(err));
                    }
                }
            }
            (SubscriptionScope::Room { room_id }, ChangeEvent::Room { .. }) => {
                trace!(%room_id, "ignoring room row on room channel");
            }
        }
    }

    /// Message seen on the user channel: list, unread, and open room view.
    fn on_inbound_message(&mut self, message: Message) {
        let room_id = message.chat_room_id.clone();

        if self.room_list.contains(&room_id) {
            let outcome = match self.backend.current_user_id() {
                Some(self_id) => {
                    let viewer = ViewerContext {
                        self_id: &self_id,
                        active_room_id: self.active_room.as_deref(),
                    };
                    self.unread.on_inbound_message(
                        &room_id,
                        &message.id,
                        &message.sender_id,
                        &viewer,
                    )
                }
                None => InboundOutcome::Ignored,
            };
            if outcome == InboundOutcome::Redelivered {
                trace!(%room_id, message_id = %message.id, "redelivered message not recounted");
                if self.rooms.contains_key(&room_id) {
                    self.apply_room_message(message);
                }
                return;
            }

            let mut patch = RoomPatch::last_message(&message);
            if outcome == InboundOutcome::Counted {
                let count = self.unread.count(&room_id);
                patch.unread_count = Some(count);
                self.channels.emit(SyncEvent::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                    aggregate: self.unread.aggregate(),
                });
            }
            self.apply_list_patch(&room_id, &patch);
        } else {
            debug!(%room_id, "message for unknown room; reloading room list");
            if let Err(err) = self.load_room_list() {
                self.channels.emit(normalize_command_error(err));
            }
        }

        if self.rooms.contains_key(&room_id) {
            self.apply_room_message(message);
        }
    }

    fn apply_room_message(&mut self, message: Message) {
        let room_id = message.chat_room_id.clone();
        if !self.rooms.contains_key(&room_id) {
            trace!(%room_id, "message for closed room ignored");
            return;
        }
        let from_other = self
            .backend
            .current_user_id()
            .is_none_or(|self_id| self_id != message.sender_id);

        let outcome = self.store.apply_confirmed([message]);
        if !outcome.changed() {
            trace!(%room_id, "duplicate message ignored");
            return;
        }
        if !outcome.reconciled.is_empty() {
            debug!(%room_id, reconciled = ?outcome.reconciled, "optimistic messages confirmed");
        }
        self.emit_room_messages(&room_id);

        if outcome.inserted > 0 && from_other && self.active_room.as_deref() == Some(&room_id) {
            self.debouncer.trigger(&room_id);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::RoomListLoaded { generation, result } => {
                self.on_room_list_loaded(generation, result)
            }
            Completion::PageLoaded {
                room_id,
                generation,
                kind,
                result,
            } => self.on_page_loaded(&room_id, generation, kind, result),
            Completion::SendFinished {
                room_id,
                temp_id,
                result,
            } => self.on_send_finished(&room_id, &temp_id, result),
            Completion::MarkReadFinished { ticket, result } => {
                self.on_mark_read_finished(&ticket, result)
            }
            Completion::RoomDeleted { room_id, result } => self.on_room_deleted(&room_id, result),
        }
    }

    fn on_room_list_loaded(
        &mut self,
        generation: u64,
        result: Result<Vec<ChatRoomSummary>, SyncError>,
    ) {
        if generation != self.list_generation {
            debug!(generation, current = self.list_generation, "stale room list discarded");
            return;
        }
        let rooms = match result {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!(code = %err.code, error = %err, "room list fetch failed");
                self.channels.emit(normalize_command_error(err));
                return;
            }
        };

        self.unread
            .replace_all(rooms.iter().map(|room| (room.id.clone(), room.unread_count)));
        self.room_list = ChatRoomListCache::from_rooms(rooms);
        debug!(
            rooms = self.room_list.len(),
            aggregate = self.unread.aggregate(),
            "room list loaded"
        );

        self.channels.emit(SyncEvent::RoomListChanged {
            rooms: self.room_list.list().to_vec(),
        });
        self.channels.emit(SyncEvent::UnreadReplaced {
            counts: self.unread.counts().clone(),
            aggregate: self.unread.aggregate(),
        });
    }

    fn on_page_loaded(
        &mut self,
        room_id: &str,
        generation: u64,
        kind: PageKind,
        result: Result<MessagePage, SyncError>,
    ) {
        let Some(context) = self.rooms.get_mut(room_id) else {
            debug!(room_id, "history page for closed room discarded");
            return;
        };
        if context.generation != generation {
            debug!(room_id, generation, "history page from previous open discarded");
            return;
        }
        if kind != PageKind::Refresh {
            context.loading_more = false;
        }

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(room_id, code = %err.code, error = %err, "history fetch failed");
                self.channels.emit(normalize_command_error(err));
                return;
            }
        };

        if kind != PageKind::Refresh {
            context.has_more = page.has_more;
            context.cursor = page.next_cursor;
        }
        let has_more = context.has_more;

        let outcome = self.store.apply_confirmed(page.messages);
        if kind != PageKind::Refresh {
            self.channels.emit(SyncEvent::HistoryLoaded {
                room_id: room_id.to_owned(),
                added: outcome.inserted,
                has_more,
            });
        }
        if outcome.changed() || kind == PageKind::Initial {
            self.emit_room_messages(room_id);
        }
    }

    fn on_send_finished(&mut self, room_id: &str, temp_id: &str, result: Result<bool, SyncError>) {
        let failure = match result {
            Ok(true) => {
                trace!(room_id, temp_id, "send accepted");
                self.channels
                    .emit(normalize_send_outcome(room_id, temp_id, SendOutcome::Accepted));
                return;
            }
            Ok(false) => SyncError::send_failure("server rejected the message"),
            Err(err) => SyncError::new(SyncErrorCategory::SendFailure, err.code, err.message),
        };

        warn!(room_id, temp_id, code = %failure.code, "send failed");
        if self.outbox.record_failure(&mut self.store, room_id, temp_id) {
            self.emit_room_messages(room_id);
        }
        self.channels.emit(normalize_send_outcome(
            room_id,
            temp_id,
            SendOutcome::Failure { error: failure },
        ));
    }

    fn on_mark_read_finished(&mut self, ticket: &MarkReadTicket, result: Result<u64, SyncError>) {
        match result {
            Ok(updated) => {
                let before = self.unread.count(&ticket.room_id);
                self.unread.on_mark_read_completed(ticket);
                let count = self.unread.count(&ticket.room_id);
                debug!(room_id = %ticket.room_id, updated, before, count, "room marked as read");
                if count != before {
                    self.publish_unread(&ticket.room_id);
                }
            }
            Err(err) => {
                warn!(
                    room_id = %ticket.room_id,
                    code = %err.code,
                    error = %err,
                    "mark as read failed"
                );
                self.channels.emit(normalize_command_error(err));
            }
        }
    }

    fn on_room_deleted(&mut self, room_id: &str, result: Result<(), SyncError>) {
        if let Err(err) = result {
            warn!(room_id, code = %err.code, error = %err, "delete room failed");
            self.channels.emit(normalize_command_error(err));
            return;
        }

        self.handle_close_room(room_id);
        self.store.clear_room(room_id);
        self.unread.remove_room(room_id);
        self.room_list = self.room_list.remove(room_id);
        info!(room_id, "room deleted");

        self.channels.emit(SyncEvent::RoomDeleted {
            room_id: room_id.to_owned(),
        });
        self.channels.emit(SyncEvent::UnreadChanged {
            room_id: room_id.to_owned(),
            count: 0,
            aggregate: self.unread.aggregate(),
        });
        self.channels.emit(SyncEvent::RoomListChanged {
            rooms: self.room_list.list().to_vec(),
        });
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Messages { room_id, reply } => {
                let _ = reply.send(self.timeline(&room_id));
            }
            Query::UnreadCount { room_id, reply } => {
                let _ = reply.send(self.unread.count(&room_id));
            }
            Query::AggregateUnread { reply } => {
                let _ = reply.send(self.unread.aggregate());
            }
            Query::RoomList { reply } => {
                let _ = reply.send(self.room_list.list().to_vec());
            }
            Query::SubscriptionState { scope, reply } => {
                let _ = reply.send(self.subscriptions.state(&scope));
            }
        }
    }

    /// Emit the unread change and mirror it into the cached summary.
    fn publish_unread(&mut self, room_id: &str) {
        let count = self.unread.count(room_id);
        self.channels.emit(SyncEvent::UnreadChanged {
            room_id: room_id.to_owned(),
            count,
            aggregate: self.unread.aggregate(),
        });
        self.apply_list_patch(room_id, &RoomPatch::unread(count));
    }

    fn apply_list_patch(&mut self, room_id: &str, patch: &RoomPatch) {
        let next = self.room_list.patch(room_id, patch);
        if next.same_entries(&self.room_list) {
            return;
        }
        self.room_list = next;
        self.channels.emit(SyncEvent::RoomListChanged {
            rooms: self.room_list.list().to_vec(),
        });
    }

    fn timeline(&self, room_id: &str) -> Vec<TimelineItem> {
        self.store
            .merged_view(room_id)
            .map(|entry| entry.to_item())
            .collect()
    }

    fn emit_room_messages(&self, room_id: &str) {
        self.channels.emit(SyncEvent::RoomMessagesChanged {
            room_id: room_id.to_owned(),
            items: self.timeline(room_id),
        });
    }

    fn require_identity(&self) -> Result<String, SyncError> {
        self.backend
            .current_user_id()
            .ok_or_else(|| SyncError::auth_required("no signed-in user"))
    }

    /// Sends are only accepted for rooms with a live session, whose channel
    /// delivers the echo that retires the pending entry.
    fn require_open(&self, room_id: &str) -> Result<(), SyncError> {
        if self.rooms.contains_key(room_id) {
            Ok(())
        } else {
            Err(room_not_open(room_id))
        }
    }

    fn spawn_io<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let mailbox = self.channels.command_sender();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = mailbox.send(EngineMessage::Completion(completion));
        });
    }

    /// Idempotent.
    fn shutdown(&mut self) {
        if !self.subscriptions.is_empty() {
            info!(subscriptions = self.subscriptions.len(), "disposing subscriptions");
        }
        self.subscriptions.dispose_all();
        self.debouncer.dispose();
        self.rooms.clear();
        self.scope_states.clear();
        self.active_room = None;
    }
}

fn room_not_open(room_id: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::State,
        "room_not_open",
        format!("room is not open: {room_id}"),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tokio::{sync::broadcast::error::RecvError, time::timeout};

    use super::*;
    use crate::memory::InMemoryBackend;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            reconnect_base_delay_ms: 100,
            ..SyncConfig::default()
        }
    }

    fn start(backend: &InMemoryBackend) -> (SyncHandle, EventStream) {
        let handle = spawn_engine(Arc::new(backend.clone()), test_config());
        let events = handle.events();
        (handle, events)
    }

    async fn wait_for<F>(events: &mut EventStream, mut matches: F) -> SyncEvent
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("expected event should arrive")
    }

    async fn wait_until_open(events: &mut EventStream, scope: &SubscriptionScope) {
        wait_for(events, |event| {
            matches!(
                event,
                SyncEvent::SubscriptionStateChanged { scope: s, state: SubscriptionState::Open }
                    if s == scope
            )
        })
        .await;
    }

    /// Subscribe to the room list and wait until both the channel and the
    /// cold load are in.
    async fn subscribe_room_list(handle: &SyncHandle, events: &mut EventStream) {
        handle.subscribe_to_room_list().expect("engine running");
        let (mut loaded, mut open) = (false, false);
        while !(loaded && open) {
            match wait_for(events, |event| {
                matches!(
                    event,
                    SyncEvent::UnreadReplaced { .. }
                        | SyncEvent::SubscriptionStateChanged {
                            state: SubscriptionState::Open,
                            ..
                        }
                )
            })
            .await
            {
                SyncEvent::UnreadReplaced { .. } => loaded = true,
                _ => open = true,
            }
        }
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should become true");
    }

    fn is_confirmed_only(items: &[TimelineItem], content: &str) -> bool {
        items.len() == 1
            && matches!(&items[0], TimelineItem::Confirmed(message) if message.content == content)
    }

    #[tokio::test(start_paused = true)]
    async fn send_then_echo_leaves_single_bubble() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;

        let session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;

        session.send_message("see you at the station").expect("engine running");
        let pending = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if items.len() == 1 && items[0].as_pending().is_some())
        })
        .await;
        let SyncEvent::RoomMessagesChanged { items, .. } = pending else {
            panic!("expected a room messages event");
        };
        assert!(items[0].as_pending().is_some_and(|p| p.is_pending()));

        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if is_confirmed_only(items, "see you at the station"))
        })
        .await;

        let items = session.messages().await.expect("engine running");
        assert!(is_confirmed_only(&items, "see you at the station"));
        assert_eq!(backend.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_identical_sends_keep_two_bubbles() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        let session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;

        session.send_message("ok").expect("engine running");
        session.send_message("ok").expect("engine running");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if items.len() == 2
                    && items.iter().all(|item| matches!(item, TimelineItem::Confirmed(_))))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_waits_for_explicit_resend() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.fail_next_sends(1);
        let (handle, mut events) = start(&backend);
        let session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;

        session.send_message("hello").expect("engine running");
        let ack = wait_for(&mut events, |event| matches!(event, SyncEvent::SendAck(_))).await;
        let SyncEvent::SendAck(ack) = ack else {
            panic!("expected a send ack");
        };
        assert_eq!(ack.error_code.as_deref(), Some("send_failed"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.send_calls(), 1);
        let items = session.messages().await.expect("engine running");
        assert_eq!(items.len(), 1);
        let failed = items[0].as_pending().expect("still pending");
        assert!(failed.is_error());
        assert_eq!(failed.temp_id, ack.client_txn_id);

        session.resend(&failed.temp_id).expect("engine running");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if is_confirmed_only(items, "hello"))
        })
        .await;

        let items = session.messages().await.expect("engine running");
        assert!(items.iter().all(|item| item.id() != failed.temp_id));
        assert_eq!(backend.send_calls(), 2);
        let sent = backend.sent_messages();
        assert_ne!(sent[0].client_txn_id, sent[1].client_txn_id);
    }

    #[tokio::test(start_paused = true)]
    async fn resending_unknown_message_is_rejected() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        let session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;
        session.resend("temp-missing").expect("engine running");

        let failed =
            wait_for(&mut events, |event| matches!(event, SyncEvent::CommandFailed { .. })).await;
        assert_eq!(
            failed,
            SyncEvent::CommandFailed {
                code: "pending_not_found".to_owned(),
                message: "pending message 'temp-missing' was not found".to_owned(),
                recoverable: false,
            }
        );
    }

    #[test]
    fn room_not_open_is_a_state_error() {
        let err = room_not_open("room-9");
        assert_eq!(err.category, SyncErrorCategory::State);
        assert_eq!(err.code, "room_not_open");
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_room_without_session_is_rejected() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);

        handle
            .send_message("room-1", "anyone there?")
            .expect("engine running");
        let failed =
            wait_for(&mut events, |event| matches!(event, SyncEvent::CommandFailed { .. })).await;
        assert!(matches!(failed, SyncEvent::CommandFailed { code, .. } if code == "room_not_open"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.send_calls(), 0);
        let items = handle.messages("room-1").await.expect("engine running");
        assert!(items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn counts_unread_for_inactive_rooms_and_moves_room_to_head() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.add_room("room-2", &["me", "carol"]);
        backend.seed_message("room-2", "carol", "boarding now", at(10));
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;

        let before = handle.room_list().await.expect("engine running");
        assert_eq!(before[0].id, "room-2");

        for n in 0..3 {
            backend.publish_message("room-1", "bob", &format!("ping {n}"));
        }
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { room_id, count: 3, .. } if room_id == "room-1")
        })
        .await;

        assert_eq!(handle.unread_count("room-1").await.expect("engine running"), 3);
        assert_eq!(handle.aggregate_unread().await.expect("engine running"), 4);

        let after = handle.room_list().await.expect("engine running");
        assert_eq!(after[0].id, "room-1");
        assert_eq!(after[0].unread_count, 3);
        assert_eq!(after[0].last_message.as_deref(), Some("ping 2"));
        assert!(Arc::ptr_eq(&before[0], &after[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_message_is_counted_once() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.add_room("room-2", &["me", "carol"]);
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;

        let hi = backend.publish_message("room-1", "bob", "hi");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { room_id, count: 1, .. } if room_id == "room-1")
        })
        .await;

        backend.redeliver(&hi);
        backend.publish_message("room-2", "carol", "after the redelivery");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { room_id, count: 1, .. } if room_id == "room-2")
        })
        .await;

        assert_eq!(handle.unread_count("room-1").await.expect("engine running"), 1);
        assert_eq!(handle.aggregate_unread().await.expect("engine running"), 2);
        let rooms = handle.room_list().await.expect("engine running");
        let room_1 = rooms.iter().find(|room| room.id == "room-1").expect("room listed");
        assert_eq!(room_1.unread_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_older_message_keeps_room_list() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.add_room("room-2", &["me", "carol"]);
        let old = backend.seed_message("room-1", "me", "old", at(1));
        backend.seed_message("room-1", "me", "new", at(2));
        backend.seed_message("room-2", "me", "latest", at(3));
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;

        let before = handle.room_list().await.expect("engine running");
        assert_eq!(before[0].id, "room-2");
        assert_eq!(before[1].last_message.as_deref(), Some("new"));

        backend.redeliver(&old);
        backend.publish_message("room-2", "carol", "marker");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { room_id, .. } if room_id == "room-2")
        })
        .await;

        let after = handle.room_list().await.expect("engine running");
        assert_eq!(after[0].id, "room-2");
        assert_eq!(after[1].id, "room-1");
        assert_eq!(after[1].last_message.as_deref(), Some("new"));
        assert!(Arc::ptr_eq(&before[1], &after[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn active_room_does_not_count_unread() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;
        let _session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;

        backend.publish_message("room-1", "bob", "are you here?");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if is_confirmed_only(items, "are you here?"))
        })
        .await;

        assert_eq!(handle.unread_count("room-1").await.expect("engine running"), 0);
        wait_until(|| backend.mark_read_calls() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn mark_read_race_keeps_message_that_arrived_in_flight() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.seed_message("room-1", "bob", "one", at(1));
        backend.seed_message("room-1", "bob", "two", at(2));
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;
        assert_eq!(handle.unread_count("room-1").await.expect("engine running"), 2);

        let gate = backend.gate_mark_read();
        handle.mark_room_viewed("room-1").expect("engine running");
        wait_until(|| backend.mark_read_calls() == 1).await;

        backend.publish_message("room-1", "bob", "three");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { count: 3, .. })
        })
        .await;

        gate.add_permits(1);
        let done = wait_for(&mut events, |event| {
            matches!(event, SyncEvent::UnreadChanged { count: 1, .. })
        })
        .await;
        assert_eq!(
            done,
            SyncEvent::UnreadChanged {
                room_id: "room-1".to_owned(),
                count: 1,
                aggregate: 1,
            }
        );
        let rooms = handle.room_list().await.expect("engine running");
        assert_eq!(rooms[0].unread_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn viewed_burst_makes_one_mark_read_call() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, _events) = start(&backend);

        for _ in 0..5 {
            handle.mark_room_viewed("room-1").expect("engine running");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.mark_read_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_room_cancels_pending_mark_read() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, _events) = start(&backend);

        let session = handle.open_room("room-1").expect("engine running");
        session.mark_viewed().expect("engine running");
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(session);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.mark_read_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_gives_up_after_three_failures() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.fail_next_subscribes(10);
        let (handle, mut events) = start(&backend);
        let scope = SubscriptionScope::room("room-1");
        let _session = handle.open_room("room-1").expect("engine running");

        let mut failures = Vec::new();
        while failures.len() < 3 {
            if let SyncEvent::SubscriptionError {
                failed_count,
                gave_up,
                ..
            } = wait_for(&mut events, |event| {
                matches!(event, SyncEvent::SubscriptionError { .. })
            })
            .await
            {
                failures.push((failed_count, gave_up));
            }
        }
        assert_eq!(failures, vec![(1, false), (2, false), (3, true)]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.subscribe_calls(), 3);
        assert_eq!(
            handle.subscription_state(scope).await.expect("engine running"),
            SubscriptionState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closing_room_stops_reconnect_attempts() {
        let backend = InMemoryBackend::with_user("me");
        backend.fail_next_subscribes(10);
        let (handle, mut events) = start(&backend);
        let session = handle.open_room("room-1").expect("engine running");

        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::SubscriptionError { failed_count: 1, .. })
        })
        .await;
        session.close().expect("engine running");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.subscribe_calls(), 1);
        assert_eq!(
            handle
                .subscription_state(SubscriptionScope::room("room-1"))
                .await
                .expect("engine running"),
            SubscriptionState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_identity_is_reported_without_retry() {
        let backend = InMemoryBackend::default();
        let (handle, mut events) = start(&backend);

        let _session = handle.open_room("room-1").expect("engine running");
        let event =
            wait_for(&mut events, |event| matches!(event, SyncEvent::AuthRequired { .. })).await;
        assert_eq!(
            event,
            SyncEvent::AuthRequired {
                scope: SubscriptionScope::room("room-1"),
            }
        );

        handle.subscribe_to_room_list().expect("engine running");
        let failed =
            wait_for(&mut events, |event| matches!(event, SyncEvent::CommandFailed { .. })).await;
        assert!(matches!(failed, SyncEvent::CommandFailed { code, .. } if code == "auth_required"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.subscribe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_history_page_for_closed_room_is_discarded() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.seed_message("room-1", "bob", "old news", at(1));
        let gate = backend.gate_fetch_messages();
        let (handle, _events) = start(&backend);

        let session = handle.open_room("room-1").expect("engine running");
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close().expect("engine running");
        gate.add_permits(1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.messages("room-1").await.expect("engine running").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_walks_history_backwards() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        for n in 0..45 {
            backend.seed_message("room-1", "bob", &format!("m{n:02}"), at(n));
        }
        let (handle, mut events) = start(&backend);
        let session = handle.open_room("room-1").expect("engine running");

        let mut pages = Vec::new();
        for _ in 0..3 {
            let event =
                wait_for(&mut events, |event| matches!(event, SyncEvent::HistoryLoaded { .. }))
                    .await;
            if let SyncEvent::HistoryLoaded { added, has_more, .. } = event {
                pages.push((added, has_more));
            }
            session.load_more().expect("engine running");
        }
        assert_eq!(pages, vec![(20, true), (20, true), (5, false)]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let items = session.messages().await.expect("engine running");
        assert_eq!(items.len(), 45);
        assert_eq!(items[0].content(), "m00");
        assert_eq!(items[44].content(), "m44");
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_user_channel_reloads_room_list() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;

        backend.break_channel(&SubscriptionScope::user("me"));
        backend.seed_message("room-1", "bob", "sent while offline", at(5));

        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::SubscriptionStateChanged {
                state: SubscriptionState::Reconnecting,
                ..
            })
        })
        .await;
        let replaced =
            wait_for(&mut events, |event| matches!(event, SyncEvent::UnreadReplaced { .. })).await;
        let SyncEvent::UnreadReplaced { counts, aggregate } = replaced else {
            panic!("expected an unread snapshot");
        };
        assert_eq!(counts.get("room-1"), Some(&1));
        assert_eq!(aggregate, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_event_is_dropped_without_closing_channel() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        let scope = SubscriptionScope::room("room-1");
        let session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &scope).await;

        backend.publish_raw(
            &scope,
            sync_core::RawChannelEvent {
                table: "messages".to_owned(),
                kind: ChangeKind::Insert,
                record: serde_json::json!({"id": "m-1", "timestamp": "not a date"}),
            },
        );
        backend.publish_message("room-1", "bob", "still here");
        wait_for(&mut events, |event| {
            matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
                if is_confirmed_only(items, "still here"))
        })
        .await;

        assert_eq!(
            handle.subscription_state(scope).await.expect("engine running"),
            SubscriptionState::Open
        );
        drop(session);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_room_clears_every_cache() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        backend.seed_message("room-1", "bob", "bye", at(1));
        let (handle, mut events) = start(&backend);
        subscribe_room_list(&handle, &mut events).await;
        let _session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &SubscriptionScope::room("room-1")).await;

        handle.delete_room("room-1").expect("engine running");
        wait_for(&mut events, |event| matches!(event, SyncEvent::RoomDeleted { .. })).await;

        assert!(handle.room_list().await.expect("engine running").is_empty());
        assert_eq!(handle.aggregate_unread().await.expect("engine running"), 0);
        assert!(handle.messages("room-1").await.expect("engine running").is_empty());
        assert_eq!(
            handle
                .subscription_state(SubscriptionScope::room("room-1"))
                .await
                .expect("engine running"),
            SubscriptionState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disposes_subscriptions() {
        let backend = InMemoryBackend::with_user("me");
        backend.add_room("room-1", &["me", "bob"]);
        let (handle, mut events) = start(&backend);
        let scope = SubscriptionScope::room("room-1");
        let _session = handle.open_room("room-1").expect("engine running");
        wait_until_open(&mut events, &scope).await;

        handle.shutdown().expect("engine running");
        wait_until(|| backend.live_channels(&scope) == 0).await;
        assert!(handle.aggregate_unread().await.is_err());
    }
}
