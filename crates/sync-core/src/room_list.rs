use std::sync::Arc;

use crate::types::{ChatRoomSummary, RoomPatch};

/// Ordered room summaries, patched incrementally from events.
///
/// Entries are shared behind `Arc` so consumers can skip unchanged rows with
/// `Arc::ptr_eq`.
#[derive(Debug, Clone, Default)]
pub struct ChatRoomListCache {
    rooms: Vec<Arc<ChatRoomSummary>>,
}

impl ChatRoomListCache {
    /// Build from a fetched list, keeping server order.
    pub fn from_rooms(rooms: impl IntoIterator<Item = ChatRoomSummary>) -> Self {
        Self {
            rooms: rooms.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn list(&self) -> &[Arc<ChatRoomSummary>] {
        &self.rooms
    }

    pub fn get(&self, room_id: &str) -> Option<&Arc<ChatRoomSummary>> {
        self.rooms.iter().find(|room| room.id == room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.get(room_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// New cache with `fields` applied to `room_id`. See [`patch_room_list`].
    pub fn patch(&self, room_id: &str, fields: &RoomPatch) -> Self {
        Self {
            rooms: patch_room_list(&self.rooms, room_id, fields),
        }
    }

    /// Whether both caches hold the same `Arc`s in the same order.
    pub fn same_entries(&self, other: &Self) -> bool {
        self.rooms.len() == other.rooms.len()
            && self
                .rooms
                .iter()
                .zip(&other.rooms)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// New cache without `room_id`.
    pub fn remove(&self, room_id: &str) -> Self {
        Self {
            rooms: self
                .rooms
                .iter()
                .filter(|room| room.id != room_id)
                .cloned()
                .collect(),
        }
    }
}

/// Pure list patch: `(old, room_id, fields) -> new`.
///
/// A patch carrying `last_message_time` moves the room to the head, unless
/// that time is older than the stored one, in which case its message fields
/// are dropped. Every other entry keeps its position and its `Arc`. Unknown
/// rooms and patches that change nothing return the old entries untouched.
pub fn patch_room_list(
    old: &[Arc<ChatRoomSummary>],
    room_id: &str,
    fields: &RoomPatch,
) -> Vec<Arc<ChatRoomSummary>> {
    let Some(index) = old.iter().position(|room| room.id == room_id) else {
        return old.to_vec();
    };

    let current = &old[index];
    let stale = match (fields.last_message_time, current.last_message_time) {
        (Some(incoming), Some(stored)) => incoming < stored,
        _ => false,
    };

    let mut updated = ChatRoomSummary::clone(current);
    if !stale {
        if let Some(last_message) = &fields.last_message {
            updated.last_message = Some(last_message.clone());
        }
        if let Some(last_message_time) = fields.last_message_time {
            updated.last_message_time = Some(last_message_time);
        }
    }
    if let Some(unread_count) = fields.unread_count {
        updated.unread_count = unread_count;
    }

    if updated == **current {
        return old.to_vec();
    }

    let updated = Arc::new(updated);
    if fields.last_message_time.is_some() && !stale {
        let mut next = Vec::with_capacity(old.len());
        next.push(updated);
        next.extend(
            old.iter()
                .enumerate()
                .filter(|(position, _)| *position != index)
                .map(|(_, room)| Arc::clone(room)),
        );
        next
    } else {
        let mut next = old.to_vec();
        next[index] = updated;
        next
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn room(id: &str) -> ChatRoomSummary {
        ChatRoomSummary {
            id: id.to_owned(),
            participants: vec!["me".to_owned(), format!("peer-{id}")],
            last_message: None,
            last_message_time: None,
            unread_count: 0,
        }
    }

    fn ids(cache: &ChatRoomListCache) -> Vec<&str> {
        cache.list().iter().map(|room| room.id.as_str()).collect()
    }

    fn message_patch(content: &str) -> RoomPatch {
        message_patch_at(content, 1_760_000_000)
    }

    fn message_patch_at(content: &str, secs: i64) -> RoomPatch {
        RoomPatch {
            last_message: Some(content.to_owned()),
            last_message_time: Utc.timestamp_opt(secs, 0).single(),
            unread_count: None,
        }
    }

    #[test]
    fn new_message_moves_room_to_head_and_keeps_other_references() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b"), room("c")]);
        let patched = cache.patch("b", &message_patch("hey"));

        assert_eq!(ids(&patched), vec!["b", "a", "c"]);
        assert_eq!(patched.list()[0].last_message.as_deref(), Some("hey"));
        assert!(Arc::ptr_eq(&patched.list()[1], &cache.list()[0]));
        assert!(Arc::ptr_eq(&patched.list()[2], &cache.list()[2]));
        assert!(!Arc::ptr_eq(&patched.list()[0], &cache.list()[1]));
    }

    #[test]
    fn patch_leaves_previous_list_untouched() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b")]);
        let _ = cache.patch("b", &message_patch("hey"));

        assert_eq!(ids(&cache), vec!["a", "b"]);
        assert_eq!(cache.list()[1].last_message, None);
    }

    #[test]
    fn unread_only_patch_keeps_position() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b"), room("c")]);
        let patched = cache.patch("c", &RoomPatch::unread(4));

        assert_eq!(ids(&patched), vec!["a", "b", "c"]);
        assert_eq!(patched.list()[2].unread_count, 4);
        assert!(Arc::ptr_eq(&patched.list()[0], &cache.list()[0]));
    }

    #[test]
    fn no_op_and_unknown_patches_share_every_entry() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b")]);

        let unknown = cache.patch("zzz", &message_patch("hey"));
        let no_op = cache.patch("a", &RoomPatch::unread(0));

        for patched in [unknown, no_op] {
            assert_eq!(ids(&patched), vec!["a", "b"]);
            assert!(patched.same_entries(&cache));
        }

        let moved = cache.patch("b", &message_patch("hey"));
        assert!(!moved.same_entries(&cache));
    }

    #[test]
    fn remove_drops_only_target_room() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b")]);
        let removed = cache.remove("a");
        assert_eq!(ids(&removed), vec!["b"]);
        assert!(Arc::ptr_eq(&removed.list()[0], &cache.list()[1]));
    }

    #[test]
    fn older_message_patch_neither_rolls_back_nor_reorders() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b")])
            .patch("a", &message_patch_at("new", 200))
            .patch("b", &message_patch_at("latest", 300));
        assert_eq!(ids(&cache), vec!["b", "a"]);

        let stale = cache.patch("a", &message_patch_at("old", 100));
        assert!(stale.same_entries(&cache));
        assert_eq!(stale.list()[1].last_message.as_deref(), Some("new"));

        let mut with_unread = message_patch_at("old", 100);
        with_unread.unread_count = Some(2);
        let counted = cache.patch("a", &with_unread);
        assert_eq!(ids(&counted), vec!["b", "a"]);
        assert_eq!(counted.list()[1].last_message.as_deref(), Some("new"));
        assert_eq!(counted.list()[1].unread_count, 2);
        assert!(Arc::ptr_eq(&counted.list()[0], &cache.list()[0]));
    }

    #[test]
    fn same_time_patch_still_applies() {
        let cache = ChatRoomListCache::from_rooms([room("a"), room("b")])
            .patch("a", &message_patch_at("first", 200));
        let patched = cache.patch("b", &message_patch_at("tie", 200));
        assert_eq!(ids(&patched), vec!["b", "a"]);

        let replaced = patched.patch("a", &message_patch_at("second", 200));
        assert_eq!(ids(&replaced), vec!["a", "b"]);
        assert_eq!(replaced.list()[0].last_message.as_deref(), Some("second"));
    }
}
