//! Per-room presence records: cursor, editing flag, last-seen.
//!
//! ## Data flow
//!
//! ```text
//! remote Envelope ──► PresenceStore::upsert_cursor / set_editing / touch
//!                              │
//!                              ├──► snapshot(room)       (UI, conflict detection)
//!                              │
//! reaper tick ───────► evict_stale(now, ttl)   (abrupt disconnects)
//! ```
//!
//! `last_seen` never moves backwards: an update stamped earlier than the
//! current value keeps the newer stamp.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::identity::{SessionId, UserId};
use crate::room::RoomId;

/// Cursor position relative to the entity's rendered viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Who produced a presence update.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Author {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl Author {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self { session_id, user_id }
    }
}

/// One session's state inside one room.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub room_id: RoomId,
    /// Filled in once the session's `presence_join` has been seen.
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub cursor: Option<CursorPosition>,
    pub is_editing: bool,
    pub last_seen: Instant,
}

impl PresenceRecord {
    fn new(room: &RoomId, author: &Author, at: Instant) -> Self {
        Self {
            session_id: author.session_id,
            user_id: author.user_id.clone(),
            room_id: room.clone(),
            display_name: None,
            avatar_url: None,
            cursor: None,
            is_editing: false,
            last_seen: at,
        }
    }

    fn seen(&mut self, at: Instant) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }
}

/// Presence records keyed by room, then session.
///
/// Payloads (cursor, editing flag, profile) are last-writer-wins in arrival
/// order, not timestamp order; only `last_seen` is kept monotonic.
#[derive(Debug, Default)]
pub struct PresenceStore {
    rooms: HashMap<RoomId, HashMap<SessionId, PresenceRecord>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_mut(&mut self, room: &RoomId, author: &Author, at: Instant) -> &mut PresenceRecord {
        self.rooms
            .entry(room.clone())
            .or_default()
            .entry(author.session_id)
            .or_insert_with(|| PresenceRecord::new(room, author, at))
    }

    /// Create the record for a freshly joined session (cursor unset, not
    /// editing) or refresh its profile if it already exists.
    pub fn announce(
        &mut self,
        room: &RoomId,
        author: &Author,
        display_name: &str,
        avatar_url: Option<&str>,
        at: Instant,
    ) {
        let record = self.record_mut(room, author, at);
        record.display_name = Some(display_name.to_string());
        record.avatar_url = avatar_url.map(str::to_string);
        record.seen(at);
    }

    /// Overwrite the cursor. Creates the record if a cursor event raced
    /// ahead of the session's join.
    pub fn upsert_cursor(&mut self, room: &RoomId, author: &Author, x: f32, y: f32, at: Instant) {
        let record = self.record_mut(room, author, at);
        record.cursor = Some(CursorPosition::new(x, y));
        record.seen(at);
    }

    pub fn set_editing(&mut self, room: &RoomId, author: &Author, editing: bool, at: Instant) {
        let record = self.record_mut(room, author, at);
        record.is_editing = editing;
        record.seen(at);
    }

    /// Refresh `last_seen` only (heartbeat).
    pub fn touch(&mut self, room: &RoomId, author: &Author, at: Instant) {
        self.record_mut(room, author, at).seen(at);
    }

    pub fn get(&self, room: &RoomId, session: SessionId) -> Option<&PresenceRecord> {
        self.rooms.get(room).and_then(|r| r.get(&session))
    }

    pub fn remove(&mut self, room: &RoomId, session: SessionId) -> Option<PresenceRecord> {
        let records = self.rooms.get_mut(room)?;
        let removed = records.remove(&session);
        if records.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Forget every record of `room`.
    pub fn drop_room(&mut self, room: &RoomId) -> usize {
        self.rooms.remove(room).map_or(0, |r| r.len())
    }

    /// Records of `room`, ordered by session id.
    pub fn snapshot(&self, room: &RoomId) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .rooms
            .get(room)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.session_id);
        records
    }

    /// Sessions of `room` whose editing flag is set.
    pub fn editing_in(&self, room: &RoomId) -> impl Iterator<Item = &PresenceRecord> {
        self.rooms
            .get(room)
            .into_iter()
            .flat_map(|r| r.values())
            .filter(|r| r.is_editing)
    }

    /// Number of distinct users present in `room`.
    pub fn distinct_users(&self, room: &RoomId) -> usize {
        let mut users: Vec<&UserId> = self
            .rooms
            .get(room)
            .into_iter()
            .flat_map(|r| r.values())
            .map(|r| &r.user_id)
            .collect();
        users.sort();
        users.dedup();
        users.len()
    }

    /// Remove every record not seen within `ttl`. Returns what was removed.
    pub fn evict_stale(&mut self, now: Instant, ttl: Duration) -> Vec<PresenceRecord> {
        let mut evicted = Vec::new();
        self.rooms.retain(|_, records| {
            records.retain(|_, record| {
                if record.is_stale(now, ttl) {
                    evicted.push(record.clone());
                    false
                } else {
                    true
                }
            });
            !records.is_empty()
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.rooms.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
