//! Room identifiers and the reference-counted room registry.
//!
//! A room is `entity_type:entity_id`. Rooms are created on first join and
//! deleted as soon as their last member goes away.
//!
//! Membership is reference counted per (room, session): every `join`
//! hands out a [`Subscription`], and the session stays a member until the
//! last of its subscriptions is released or an explicit `leave` drops
//! them all. A component and its parent can therefore join the same room
//! independently without tearing each other's membership down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::SessionId;

/// Kinds of shared entity a room can be about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Requirement,
    Document,
    Prototype,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Requirement => "requirement",
            EntityKind::Document => "document",
            EntityKind::Prototype => "prototype",
        }
    }
}

/// `entity_type:entity_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId {
    entity_type: String,
    entity_id: String,
}

impl RoomId {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Result<Self, ProtocolError> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        if entity_type.is_empty() || entity_type.contains(':') || entity_id.is_empty() {
            return Err(ProtocolError::InvalidRoomId(format!("{entity_type}:{entity_id}")));
        }
        Ok(Self { entity_type, entity_id })
    }

    /// Room for a well-known entity kind.
    pub fn for_entity(kind: EntityKind, entity_id: impl fmt::Display) -> Self {
        Self {
            entity_type: kind.as_str().to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) => RoomId::new(kind, id),
            None => Err(ProtocolError::InvalidRoomId(s.to_string())),
        }
    }
}

/// Handle for one join of (room, session).
///
/// Hand it back to [`RoomRegistry::release`] to undo that join. Releasing
/// a handle whose membership was already dropped by `leave` is a no-op.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "membership is held until the subscription is released"]
pub struct Subscription {
    room: RoomId,
    session: SessionId,
    handle: u64,
}

impl Subscription {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// Outcome of releasing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other handles still hold the membership.
    StillHeld(usize),
    /// This was the last handle; the session left the room.
    Left { room_deleted: bool },
    /// The membership was already gone.
    Stale,
}

#[derive(Debug, Default)]
struct Room {
    /// session → outstanding subscription handles
    members: HashMap<SessionId, HashSet<u64>>,
}

/// Tracks which sessions belong to which room.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    next_handle: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room` as `session`. Re-joining an already joined pair keeps
    /// the membership and only adds another handle.
    pub fn join(&mut self, room: &RoomId, session: SessionId) -> Subscription {
        self.next_handle += 1;
        let handle = self.next_handle;
        let entry = self.rooms.entry(room.clone()).or_default();
        let handles = entry.members.entry(session).or_default();
        if handles.is_empty() {
            log::debug!("session {session} joined room {room}");
        }
        handles.insert(handle);
        Subscription {
            room: room.clone(),
            session,
            handle,
        }
    }

    /// Give back one join handle.
    pub fn release(&mut self, subscription: Subscription) -> Release {
        let Subscription { room, session, handle } = subscription;
        let Some(entry) = self.rooms.get_mut(&room) else {
            return Release::Stale;
        };
        let Some(handles) = entry.members.get_mut(&session) else {
            return Release::Stale;
        };
        if !handles.remove(&handle) {
            return Release::Stale;
        }
        if !handles.is_empty() {
            return Release::StillHeld(handles.len());
        }
        let room_deleted = self.remove_member(&room, session);
        Release::Left { room_deleted }
    }

    /// Drop the membership of `session` regardless of outstanding handles.
    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, room: &RoomId, session: SessionId) -> bool {
        let was_member = self
            .rooms
            .get(room)
            .is_some_and(|r| r.members.contains_key(&session));
        if was_member {
            self.remove_member(room, session);
        }
        was_member
    }

    fn remove_member(&mut self, room: &RoomId, session: SessionId) -> bool {
        let Some(entry) = self.rooms.get_mut(room) else {
            return false;
        };
        entry.members.remove(&session);
        log::debug!("session {session} left room {room}");
        if entry.members.is_empty() {
            self.rooms.remove(room);
            log::debug!("room {room} destroyed");
            return true;
        }
        false
    }

    pub fn members_of(&self, room: &RoomId) -> HashSet<SessionId> {
        self.rooms
            .get(room)
            .map(|r| r.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room: &RoomId, session: SessionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|r| r.members.contains_key(&session))
    }

    /// Outstanding join handles for (room, session).
    pub fn handle_count(&self, room: &RoomId, session: SessionId) -> usize {
        self.rooms
            .get(room)
            .and_then(|r| r.members.get(&session))
            .map_or(0, HashSet::len)
    }

    /// Rooms `session` currently belongs to.
    pub fn rooms_of(&self, session: SessionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.members.contains_key(&session))
            .map(|(id, _)| id.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: u32) -> RoomId {
        RoomId::for_entity(EntityKind::Document, id)
    }

    // ── RoomId ───────────────────────────────────────────────────

    #[test]
    fn test_room_id_display_and_parse() {
        let room = doc(42);
        assert_eq!(room.to_string(), "document:42");
        let parsed: RoomId = "document:42".parse().unwrap();
        assert_eq!(parsed, room);
        assert_eq!(parsed.entity_type(), "document");
        assert_eq!(parsed.entity_id(), "42");
    }

    #[test]
    fn test_room_id_id_may_contain_colon() {
        let room: RoomId = "prototype:a:b".parse().unwrap();
        assert_eq!(room.entity_id(), "a:b");
    }

    #[test]
    fn test_room_id_rejects_malformed() {
        assert!("document".parse::<RoomId>().is_err());
        assert!(":42".parse::<RoomId>().is_err());
        assert!("document:".parse::<RoomId>().is_err());
    }

    // ── RoomRegistry ─────────────────────────────────────────────

    #[test]
    fn test_join_creates_room_lazily() {
        let mut registry = RoomRegistry::new();
        assert!(!registry.contains_room(&doc(1)));
        let s = SessionId::new();
        let _sub = registry.join(&doc(1), s);
        assert!(registry.contains_room(&doc(1)));
        assert!(registry.members_of(&doc(1)).contains(&s));
    }

    #[test]
    fn test_release_last_handle_deletes_room() {
        let mut registry = RoomRegistry::new();
        let s = SessionId::new();
        let sub = registry.join(&doc(1), s);
        assert_eq!(registry.release(sub), Release::Left { room_deleted: true });
        assert!(!registry.contains_room(&doc(1)));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_rejoin_is_reference_counted() {
        let mut registry = RoomRegistry::new();
        let s = SessionId::new();
        let parent = registry.join(&doc(1), s);
        let child = registry.join(&doc(1), s);
        assert_eq!(registry.handle_count(&doc(1), s), 2);
        assert_eq!(registry.members_of(&doc(1)).len(), 1);

        assert_eq!(registry.release(child), Release::StillHeld(1));
        assert!(registry.is_member(&doc(1), s));

        assert_eq!(registry.release(parent), Release::Left { room_deleted: true });
        assert!(!registry.is_member(&doc(1), s));
    }

    #[test]
    fn test_room_survives_while_others_remain() {
        let mut registry = RoomRegistry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let sub_a = registry.join(&doc(1), a);
        let _sub_b = registry.join(&doc(1), b);
        assert_eq!(registry.release(sub_a), Release::Left { room_deleted: false });
        assert_eq!(registry.members_of(&doc(1)).len(), 1);
    }

    #[test]
    fn test_leave_drops_all_handles() {
        let mut registry = RoomRegistry::new();
        let s = SessionId::new();
        let first = registry.join(&doc(1), s);
        let _second = registry.join(&doc(1), s);
        assert!(registry.leave(&doc(1), s));
        assert!(!registry.contains_room(&doc(1)));
        // releasing after a forced leave is harmless
        assert_eq!(registry.release(first), Release::Stale);
        assert!(!registry.leave(&doc(1), s));
    }

    #[test]
    fn test_stale_handle_does_not_touch_new_membership() {
        let mut registry = RoomRegistry::new();
        let s = SessionId::new();
        let old = registry.join(&doc(1), s);
        registry.leave(&doc(1), s);
        let _fresh = registry.join(&doc(1), s);
        assert_eq!(registry.release(old), Release::Stale);
        assert!(registry.is_member(&doc(1), s));
    }

    #[test]
    fn test_rooms_of_session() {
        let mut registry = RoomRegistry::new();
        let s = SessionId::new();
        let _a = registry.join(&doc(2), s);
        let _b = registry.join(&doc(1), s);
        let _c = registry.join(&doc(3), SessionId::new());
        assert_eq!(registry.rooms_of(s), vec![doc(1), doc(2)]);
    }

    #[test]
    fn test_membership_matches_outstanding_joins() {
        // Deterministic interleaving over three sessions and two rooms.
        let mut registry = RoomRegistry::new();
        let sessions = [SessionId::new(), SessionId::new(), SessionId::new()];
        let rooms = [doc(1), doc(2)];
        let mut held: Vec<Subscription> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let session = sessions[(seed % 3) as usize];
            let room = &rooms[((seed >> 8) % 2) as usize];
            if (seed >> 16) % 3 == 0 && !held.is_empty() {
                let idx = ((seed >> 24) as usize) % held.len();
                let sub = held.swap_remove(idx);
                assert_ne!(registry.release(sub), Release::Stale);
            } else {
                held.push(registry.join(room, session));
            }

            for room in &rooms {
                let expected: HashSet<SessionId> = held
                    .iter()
                    .filter(|s| s.room() == room)
                    .map(Subscription::session)
                    .collect();
                assert_eq!(registry.members_of(room), expected);
                assert_eq!(registry.contains_room(room), !expected.is_empty());
            }
        }
    }
}
