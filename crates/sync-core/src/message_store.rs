use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;

use crate::types::{DeliveryState, Message, PendingMessage, TimelineEntry};

/// Errors raised by pending-message lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageStoreError {
    /// No pending entry with this temporary ID exists in the room.
    #[error("pending message '{0}' was not found")]
    PendingNotFound(String),
    /// The entry exists but its send has not failed.
    #[error("pending message '{0}' has not failed")]
    PendingNotFailed(String),
}

/// Result of merging a batch of confirmed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows that were new to the store.
    pub inserted: usize,
    /// Rows ignored because their ID was already present.
    pub duplicates: usize,
    /// Temporary IDs of pending entries retired by an echo.
    pub reconciled: Vec<String>,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || !self.reconciled.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct RoomTimeline {
    /// Sorted by `(timestamp, id)`.
    confirmed: Vec<Message>,
    ids: HashSet<String>,
    /// Creation order.
    pending: Vec<PendingMessage>,
}

impl RoomTimeline {
    fn insert_confirmed(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let position = self
            .confirmed
            .binary_search_by(|existing| order(existing, &message))
            .unwrap_or_else(|index| index);
        self.confirmed.insert(position, message);
        true
    }

    /// Retire the oldest pending entry confirmed by `echo`.
    fn reconcile(&mut self, echo: &Message) -> Option<String> {
        let index = echo
            .client_txn_id
            .as_deref()
            .and_then(|txn_id| self.pending.iter().position(|p| p.temp_id == txn_id))
            .or_else(|| {
                self.pending.iter().position(|p| {
                    p.sender_id == echo.sender_id
                        && p.content == echo.content
                        && echo.timestamp >= p.local_created_at
                })
            })?;
        Some(self.pending.remove(index).temp_id)
    }
}

fn order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

/// Per-room merged view of confirmed and optimistic messages.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    rooms: HashMap<String, RoomTimeline>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge confirmed rows. Known IDs are ignored; each new row retires at
    /// most one pending entry it confirms.
    pub fn apply_confirmed(&mut self, rows: impl IntoIterator<Item = Message>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for row in rows {
            let timeline = self.rooms.entry(row.chat_room_id.clone()).or_default();
            if timeline.ids.contains(&row.id) {
                outcome.duplicates += 1;
                continue;
            }
            if let Some(temp_id) = timeline.reconcile(&row) {
                trace!(%temp_id, message_id = %row.id, "pending message reconciled");
                outcome.reconciled.push(temp_id);
            }
            timeline.insert_confirmed(row);
            outcome.inserted += 1;
        }
        outcome
    }

    /// Replace a confirmed row in place (for example a `read` flag flip), or
    /// insert it when unknown. Returns `true` when the view changed.
    pub fn apply_update(&mut self, row: Message) -> bool {
        let timeline = self.rooms.entry(row.chat_room_id.clone()).or_default();
        if let Some(existing) = timeline.confirmed.iter_mut().find(|m| m.id == row.id) {
            if *existing == row {
                return false;
            }
            if existing.timestamp == row.timestamp {
                *existing = row;
                return true;
            }
            let id = row.id.clone();
            timeline.confirmed.retain(|m| m.id != id);
            timeline.ids.remove(&id);
            timeline.insert_confirmed(row);
            return true;
        }
        timeline.reconcile(&row);
        timeline.insert_confirmed(row);
        true
    }

    /// Append an optimistic entry. Visible immediately in `merged_view`.
    pub fn add_pending(&mut self, pending: PendingMessage) {
        self.rooms
            .entry(pending.chat_room_id.clone())
            .or_default()
            .pending
            .push(pending);
    }

    /// Flip a pending entry to failed. Returns `false` when it is gone
    /// (already reconciled or discarded).
    pub fn mark_failed(&mut self, room_id: &str, temp_id: &str) -> bool {
        let Some(pending) = self
            .rooms
            .get_mut(room_id)
            .and_then(|timeline| timeline.pending.iter_mut().find(|p| p.temp_id == temp_id))
        else {
            return false;
        };
        pending.state = DeliveryState::Failed;
        true
    }

    /// Remove a failed entry so it can be resent under a new ID.
    pub fn discard_failed(
        &mut self,
        room_id: &str,
        temp_id: &str,
    ) -> Result<PendingMessage, MessageStoreError> {
        let timeline = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| MessageStoreError::PendingNotFound(temp_id.to_owned()))?;
        let index = timeline
            .pending
            .iter()
            .position(|p| p.temp_id == temp_id)
            .ok_or_else(|| MessageStoreError::PendingNotFound(temp_id.to_owned()))?;
        if !timeline.pending[index].is_error() {
            return Err(MessageStoreError::PendingNotFailed(temp_id.to_owned()));
        }
        Ok(timeline.pending.remove(index))
    }

    /// Confirmed rows ascending by `(timestamp, id)`, then remaining pending
    /// entries in creation order. Recomputed on every call.
    pub fn merged_view<'a>(
        &'a self,
        room_id: &str,
    ) -> impl Iterator<Item = TimelineEntry<'a>> + use<'a> {
        self.rooms.get(room_id).into_iter().flat_map(|timeline| {
            timeline
                .confirmed
                .iter()
                .map(TimelineEntry::Confirmed)
                .chain(timeline.pending.iter().map(TimelineEntry::Pending))
        })
    }

    pub fn confirmed_len(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |timeline| timeline.confirmed.len())
    }

    pub fn pending(&self, room_id: &str) -> &[PendingMessage] {
        self.rooms
            .get(room_id)
            .map(|timeline| timeline.pending.as_slice())
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: &str, message_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|timeline| timeline.ids.contains(message_id))
    }

    /// Timestamp of the oldest confirmed row, used as a pagination cursor.
    pub fn oldest_timestamp(&self, room_id: &str) -> Option<DateTime<Utc>> {
        self.rooms
            .get(room_id)
            .and_then(|timeline| timeline.confirmed.first())
            .map(|message| message.timestamp)
    }

    /// Drop everything held for a room.
    pub fn clear_room(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}
