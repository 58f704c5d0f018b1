use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Inbound message ids remembered per room for redelivery detection.
const SEEN_IDS_PER_ROOM: usize = 256;

/// Who is looking at what. Passed explicitly into counter updates instead of
/// living in shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerContext<'a> {
    pub self_id: &'a str,
    pub active_room_id: Option<&'a str>,
}

/// Snapshot taken when a mark-as-read call is initiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkReadTicket {
    pub room_id: String,
    pub count_at_call_time: u64,
}

/// What an inbound message did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// First delivery from someone else into an unviewed room.
    Counted,
    /// First delivery, but own message or the room is being viewed.
    Ignored,
    /// Id already delivered on this room.
    Redelivered,
}

/// Bounded FIFO of recently delivered message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Returns `false` when `id` was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_IDS_PER_ROOM
            && let Some(evicted) = self.order.pop_front()
        {
            self.ids.remove(&evicted);
        }
        self.order.push_back(id.to_owned());
        self.ids.insert(id.to_owned());
        true
    }
}

/// Per-room unread counters plus their sum.
///
/// Invariant: `aggregate == per_room.values().sum()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounter {
    per_room: HashMap<String, u64>,
    aggregate: u64,
    seen: HashMap<String, SeenIds>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, room_id: &str) -> u64 {
        self.per_room.get(room_id).copied().unwrap_or(0)
    }

    pub fn aggregate(&self) -> u64 {
        self.aggregate
    }

    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.per_room
    }

    /// Count an inbound message unless it is a redelivery, our own, or the
    /// room is being viewed.
    pub fn on_inbound_message(
        &mut self,
        room_id: &str,
        message_id: &str,
        sender_id: &str,
        viewer: &ViewerContext<'_>,
    ) -> InboundOutcome {
        let first_delivery = self
            .seen
            .entry(room_id.to_owned())
            .or_default()
            .insert(message_id);
        if !first_delivery {
            return InboundOutcome::Redelivered;
        }
        if sender_id == viewer.self_id || viewer.active_room_id == Some(room_id) {
            return InboundOutcome::Ignored;
        }
        *self.per_room.entry(room_id.to_owned()).or_insert(0) += 1;
        self.aggregate += 1;
        InboundOutcome::Counted
    }

    /// Snapshot the room's count before issuing the mark-as-read call.
    pub fn begin_mark_read(&self, room_id: &str) -> MarkReadTicket {
        MarkReadTicket {
            room_id: room_id.to_owned(),
            count_at_call_time: self.count(room_id),
        }
    }

    /// Apply a completed mark-as-read using the count known when it started.
    ///
    /// Messages counted after the snapshot survive the decrement.
    pub fn on_mark_read_completed(&mut self, ticket: &MarkReadTicket) {
        let Some(current) = self.per_room.get_mut(&ticket.room_id) else {
            return;
        };
        let removed = ticket.count_at_call_time.min(*current);
        *current -= removed;
        self.aggregate = self.aggregate.saturating_sub(removed);
    }

    /// Replace all counters with an authoritative server snapshot.
    ///
    /// Delivery history is kept for rooms still in the snapshot, whose counts
    /// already include those messages.
    pub fn replace_all(&mut self, counts: impl IntoIterator<Item = (String, u64)>) {
        self.per_room = counts.into_iter().collect();
        self.aggregate = self.per_room.values().sum();
        let per_room = &self.per_room;
        self.seen.retain(|room_id, _| per_room.contains_key(room_id));
    }

    pub fn remove_room(&mut self, room_id: &str) {
        self.seen.remove(room_id);
        if let Some(count) = self.per_room.remove(room_id) {
            self.aggregate = self.aggregate.saturating_sub(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "me";

    fn viewer(active: Option<&str>) -> ViewerContext<'_> {
        ViewerContext {
            self_id: ME,
            active_room_id: active,
        }
    }

    fn assert_consistent(counter: &UnreadCounter) {
        assert_eq!(counter.aggregate(), counter.counts().values().sum::<u64>());
    }

    #[test]
    fn counts_messages_from_others_in_inactive_rooms() {
        let mut counter = UnreadCounter::new();
        for i in 0..4 {
            let id = format!("m{i}");
            let outcome = counter.on_inbound_message("room-1", &id, "bob", &viewer(None));
            assert_eq!(outcome, InboundOutcome::Counted);
        }
        assert_eq!(counter.count("room-1"), 4);
        assert_eq!(counter.aggregate(), 4);
        assert_consistent(&counter);
    }

    #[test]
    fn ignores_own_messages_and_active_room() {
        let mut counter = UnreadCounter::new();
        let active = viewer(Some("room-1"));
        assert_eq!(
            counter.on_inbound_message("room-1", "m1", ME, &viewer(None)),
            InboundOutcome::Ignored
        );
        assert_eq!(
            counter.on_inbound_message("room-1", "m2", "bob", &active),
            InboundOutcome::Ignored
        );
        assert_eq!(
            counter.on_inbound_message("room-2", "m3", "bob", &active),
            InboundOutcome::Counted
        );

        assert_eq!(counter.count("room-1"), 0);
        assert_eq!(counter.count("room-2"), 1);
        assert_eq!(counter.aggregate(), 1);
    }

    #[test]
    fn mark_read_completion_keeps_messages_that_arrived_in_flight() {
        let mut counter = UnreadCounter::new();
        counter.replace_all([("room-1".to_owned(), 5), ("room-2".to_owned(), 2)]);

        let ticket = counter.begin_mark_read("room-1");
        assert_eq!(ticket.count_at_call_time, 5);

        counter.on_inbound_message("room-1", "m6", "bob", &viewer(None));
        assert_eq!(counter.count("room-1"), 6);
        assert_eq!(counter.aggregate(), 8);

        counter.on_mark_read_completed(&ticket);
        assert_eq!(counter.count("room-1"), 1);
        assert_eq!(counter.aggregate(), 3);
        assert_consistent(&counter);
    }

    #[test]
    fn completion_after_authoritative_reload_never_underflows() {
        let mut counter = UnreadCounter::new();
        counter.replace_all([("room-1".to_owned(), 3)]);
        let ticket = counter.begin_mark_read("room-1");

        counter.replace_all([("room-1".to_owned(), 1), ("room-2".to_owned(), 4)]);
        counter.on_mark_read_completed(&ticket);

        assert_eq!(counter.count("room-1"), 0);
        assert_eq!(counter.aggregate(), 4);
        assert_consistent(&counter);
    }

    #[test]
    fn replace_all_discards_previous_state() {
        let mut counter = UnreadCounter::new();
        counter.on_inbound_message("stale", "m1", "bob", &viewer(None));
        counter.replace_all([("room-1".to_owned(), 2)]);

        assert_eq!(counter.count("stale"), 0);
        assert_eq!(counter.aggregate(), 2);
    }

    #[test]
    fn removing_room_adjusts_aggregate() {
        let mut counter = UnreadCounter::new();
        counter.replace_all([("room-1".to_owned(), 2), ("room-2".to_owned(), 3)]);
        counter.remove_room("room-2");
        assert_eq!(counter.aggregate(), 2);
        assert_consistent(&counter);
    }

    #[test]
    fn redelivered_message_is_counted_once() {
        let mut counter = UnreadCounter::new();
        assert_eq!(
            counter.on_inbound_message("room-1", "m1", "bob", &viewer(None)),
            InboundOutcome::Counted
        );
        assert_eq!(
            counter.on_inbound_message("room-1", "m1", "bob", &viewer(None)),
            InboundOutcome::Redelivered
        );
        assert_eq!(counter.count("room-1"), 1);
        assert_eq!(counter.aggregate(), 1);

        // Same id on another room is a different delivery.
        assert_eq!(
            counter.on_inbound_message("room-2", "m1", "bob", &viewer(None)),
            InboundOutcome::Counted
        );
        assert_consistent(&counter);
    }

    #[test]
    fn message_seen_while_viewing_is_not_counted_on_redelivery() {
        let mut counter = UnreadCounter::new();
        counter.on_inbound_message("room-1", "m1", "bob", &viewer(Some("room-1")));
        assert_eq!(
            counter.on_inbound_message("room-1", "m1", "bob", &viewer(None)),
            InboundOutcome::Redelivered
        );
        assert_eq!(counter.count("room-1"), 0);
    }

    #[test]
    fn snapshot_keeps_history_only_for_listed_rooms() {
        let mut counter = UnreadCounter::new();
        counter.on_inbound_message("room-1", "m1", "bob", &viewer(None));
        counter.on_inbound_message("room-2", "m2", "bob", &viewer(None));
        counter.replace_all([("room-1".to_owned(), 1)]);

        assert_eq!(
            counter.on_inbound_message("room-1", "m1", "bob", &viewer(None)),
            InboundOutcome::Redelivered
        );
        assert_eq!(counter.count("room-1"), 1);
        assert_eq!(
            counter.on_inbound_message("room-2", "m2", "bob", &viewer(None)),
            InboundOutcome::Counted
        );
        assert_consistent(&counter);
    }

    #[test]
    fn delivery_history_is_bounded_per_room() {
        let mut counter = UnreadCounter::new();
        for i in 0..=SEEN_IDS_PER_ROOM {
            counter.on_inbound_message("room-1", &format!("m{i}"), ME, &viewer(None));
        }
        let seen = &counter.seen["room-1"];
        assert_eq!(seen.order.len(), SEEN_IDS_PER_ROOM);
        assert_eq!(seen.ids.len(), SEEN_IDS_PER_ROOM);
        assert!(!seen.ids.contains("m0"));
    }
}
