//! Session lifecycle: room joins, heartbeats, reconnects and stale
//! eviction.
//!
//! [`SessionCore`] owns every piece of client-side state (room registry,
//! presence store, per-room cursor broadcasters and conflict detectors)
//! and never performs I/O. Each input returns a list of [`Effect`]s that
//! the async driver in [`crate::runtime`] executes in order.
//!
//! ```text
//!  host input ─┐
//!  envelope ───┼──► SessionCore ──► Vec<Effect> ──► driver ──► Transport
//!  timer tick ─┘                                      └──────► CollabEvent
//! ```
//!
//! While the link is down nothing is published. Joins still register
//! locally and are replayed, together with the current editing flag,
//! once the link comes back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::color::{color_for, CursorColor};
use crate::config::{BackoffConfig, CollabConfig};
use crate::conflict::{EditAdvisory, EditConflictDetector, Transition};
use crate::cursor::{ContainerRect, CursorBroadcaster};
use crate::features::{CollabFeature, FeatureSet};
use crate::identity::{Session, SessionId, UserId, ViewMode};
use crate::presence::{Author, CursorPosition, PresenceRecord, PresenceStore};
use crate::protocol::{Envelope, PresenceEvent};
use crate::room::{Release, RoomId, RoomRegistry, Subscription};

/// Connection state of the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The link dropped; presence records are kept until reconnect or TTL.
    Stale,
    Reconnecting,
    Closed,
}

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    Advisory { room: RoomId, advisory: EditAdvisory },
    /// Someone's cursor, editing flag or membership changed in `room`.
    PresenceChanged { room: RoomId },
    Connection(ConnectionState),
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start receiving envelopes for the room.
    Subscribe(RoomId),
    Unsubscribe(RoomId),
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    Publish { room: RoomId, event: PresenceEvent },
    /// Second and last attempt of a failed editing-status publish.
    Retry { room: RoomId, event: PresenceEvent },
    Emit(CollabEvent),
}

/// A remote cursor ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub color: CursorColor,
    pub position: CursorPosition,
    pub is_editing: bool,
}

struct LocalRoom {
    broadcaster: CursorBroadcaster,
    detector: EditConflictDetector,
    /// Last conflict state reported to the host while focused.
    conflicted: bool,
}

/// Sans-IO state machine of one client session.
pub struct SessionCore {
    session: Session,
    author: Author,
    features: FeatureSet,
    ttl: Duration,
    debounce: Duration,
    retry_delay: Duration,
    state: ConnectionState,
    registry: RoomRegistry,
    store: PresenceStore,
    rooms: BTreeMap<RoomId, LocalRoom>,
    /// Host join handles.
    handles: HashMap<u64, Subscription>,
    /// Memberships of remote sessions, as learned from their traffic.
    remote: HashMap<(RoomId, SessionId), Subscription>,
    retries: HashMap<RoomId, (PresenceEvent, Instant)>,
}

impl SessionCore {
    /// A core for a session the transport has just connected.
    pub fn new(session: Session, config: &CollabConfig, features: FeatureSet) -> Self {
        let author = Author::new(session.session_id, session.user_id.clone());
        Self {
            session,
            author,
            features,
            ttl: config.presence_ttl(),
            debounce: config.debounce_window(),
            retry_delay: config.editing_retry_delay(),
            state: ConnectionState::Connected,
            registry: RoomRegistry::new(),
            store: PresenceStore::new(),
            rooms: BTreeMap::new(),
            handles: HashMap::new(),
            remote: HashMap::new(),
            retries: HashMap::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_joined(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Rooms the local session belongs to, in order.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    pub fn is_editing(&self, room: &RoomId) -> bool {
        self.rooms.get(room).is_some_and(|r| r.detector.is_editing())
    }

    /// Live join handles held by the host for `room`.
    pub fn handle_count(&self, room: &RoomId) -> usize {
        self.registry.handle_count(room, self.session.session_id)
    }

    /// Sessions known to be in `room`, local one included.
    pub fn members_of(&self, room: &RoomId) -> Vec<SessionId> {
        let mut members: Vec<SessionId> = self.registry.members_of(room).into_iter().collect();
        members.sort();
        members
    }

    pub fn snapshot(&self, room: &RoomId) -> Vec<PresenceRecord> {
        self.store.snapshot(room)
    }

    fn join_event(&self) -> PresenceEvent {
        PresenceEvent::PresenceJoin {
            user_id: self.session.user_id.clone(),
            display_name: self.session.display_name.clone(),
            avatar_url: self.session.avatar_url.clone(),
        }
    }

    fn push_publish(&mut self, effects: &mut Vec<Effect>, room: &RoomId, event: PresenceEvent) {
        if matches!(event, PresenceEvent::EditingStatus { .. }) {
            // a newer status supersedes any pending retry
            self.retries.remove(room);
        }
        if self.is_connected() {
            effects.push(Effect::Publish {
                room: room.clone(),
                event,
            });
        } else {
            log::debug!("link down, {} for {room} deferred to reconnect", event.name());
        }
    }

    fn changed(room: &RoomId) -> Effect {
        Effect::Emit(CollabEvent::PresenceChanged { room: room.clone() })
    }

    // ── Membership ───────────────────────────────────────────────

    /// Join `room` on behalf of one host component. Returns the handle to
    /// pass back to [`release_local`](Self::release_local).
    pub fn join_local(&mut self, room: &RoomId, now: Instant) -> (u64, Vec<Effect>) {
        let first = !self.rooms.contains_key(room);
        let subscription = self.registry.join(room, self.session.session_id);
        let handle = subscription.handle();
        self.handles.insert(handle, subscription);

        let mut effects = Vec::new();
        if !first {
            return (handle, effects);
        }

        self.rooms.insert(
            room.clone(),
            LocalRoom {
                broadcaster: CursorBroadcaster::new(room.clone(), self.debounce),
                detector: EditConflictDetector::new(
                    room.clone(),
                    self.session.session_id,
                    self.session.user_id.clone(),
                ),
                conflicted: false,
            },
        );
        self.store.announce(
            room,
            &self.author,
            &self.session.display_name,
            self.session.avatar_url.as_deref(),
            now,
        );

        effects.push(Effect::Subscribe(room.clone()));
        if self.is_connected() {
            effects.push(Effect::JoinRoom(room.clone()));
        } else {
            log::info!("join of {room} queued until reconnect");
        }
        if self.features.is_enabled(CollabFeature::Presence) {
            let join = self.join_event();
            self.push_publish(&mut effects, room, join);
        }
        effects.push(Self::changed(room));
        (handle, effects)
    }

    /// Give back one host join handle. The room is left once the last
    /// handle for it is released.
    pub fn release_local(&mut self, handle: u64) -> Vec<Effect> {
        let Some(subscription) = self.handles.remove(&handle) else {
            return Vec::new();
        };
        let room = subscription.room().clone();
        match self.registry.release(subscription) {
            Release::Left { .. } => self.teardown(&room),
            Release::StillHeld(remaining) => {
                log::debug!("{room} still held by {remaining} handle(s)");
                Vec::new()
            }
            Release::Stale => Vec::new(),
        }
    }

    /// Leave `room` entirely: cancel its cursor timer, drop it from the
    /// heartbeat and forget its presence records.
    fn teardown(&mut self, room: &RoomId) -> Vec<Effect> {
        let Some(mut local) = self.rooms.remove(room) else {
            return Vec::new();
        };
        local.broadcaster.cancel();
        self.retries.remove(room);

        let mut effects = Vec::new();
        if self.is_connected() {
            if local.detector.is_editing() {
                effects.push(Effect::Publish {
                    room: room.clone(),
                    event: PresenceEvent::EditingStatus { is_editing: false },
                });
            }
            if self.features.is_enabled(CollabFeature::Presence) {
                effects.push(Effect::Publish {
                    room: room.clone(),
                    event: PresenceEvent::PresenceLeave {
                        user_id: self.session.user_id.clone(),
                    },
                });
            }
            effects.push(Effect::LeaveRoom(room.clone()));
        }
        effects.push(Effect::Unsubscribe(room.clone()));

        self.store.drop_room(room);
        self.registry.leave(room, self.session.session_id);
        self.handles.retain(|_, sub| sub.room() != room);
        let remote: Vec<(RoomId, SessionId)> = self
            .remote
            .keys()
            .filter(|(r, _)| r == room)
            .cloned()
            .collect();
        for key in remote {
            if let Some(sub) = self.remote.remove(&key) {
                self.registry.release(sub);
            }
        }
        effects.push(Self::changed(room));
        effects
    }

    fn ensure_remote(&mut self, room: &RoomId, session: SessionId) {
        let key = (room.clone(), session);
        if !self.remote.contains_key(&key) {
            let subscription = self.registry.join(room, session);
            self.remote.insert(key, subscription);
        }
    }

    fn forget_remote(&mut self, room: &RoomId, session: SessionId) {
        self.store.remove(room, session);
        if let Some(sub) = self.remote.remove(&(room.clone(), session)) {
            self.registry.release(sub);
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply an envelope delivered by the transport.
    pub fn apply_remote(&mut self, envelope: Envelope, now: Instant) -> Vec<Effect> {
        if envelope.session_id == self.session.session_id {
            return Vec::new();
        }
        if !self.rooms.contains_key(&envelope.room) {
            log::debug!("ignoring {} for unjoined room {}", envelope.event.name(), envelope.room);
            return Vec::new();
        }
        if let Err(e) = envelope.validate() {
            log::warn!(
                "discarding {} from session {}: {e}",
                envelope.event.name(),
                envelope.session_id
            );
            return Vec::new();
        }

        let Envelope {
            room,
            session_id,
            user_id,
            event,
        } = envelope;
        let author = Author::new(session_id, user_id);
        let mut effects = Vec::new();

        match event {
            PresenceEvent::PresenceJoin {
                display_name,
                avatar_url,
                ..
            } => {
                self.ensure_remote(&room, session_id);
                self.store
                    .announce(&room, &author, &display_name, avatar_url.as_deref(), now);
            }
            PresenceEvent::CursorMove { x, y } => {
                self.ensure_remote(&room, session_id);
                if self.features.is_enabled(CollabFeature::Cursors) {
                    self.store.upsert_cursor(&room, &author, x, y, now);
                } else {
                    self.store.touch(&room, &author, now);
                }
            }
            PresenceEvent::EditingStatus { is_editing } => {
                self.ensure_remote(&room, session_id);
                self.store.set_editing(&room, &author, is_editing, now);
                effects.extend(self.reassess(&room));
            }
            PresenceEvent::PresenceLeave { .. } => {
                self.forget_remote(&room, session_id);
                effects.extend(self.reassess(&room));
            }
            PresenceEvent::Heartbeat => {
                self.ensure_remote(&room, session_id);
                self.store.touch(&room, &author, now);
                return effects;
            }
        }
        effects.push(Self::changed(&room));
        effects
    }

    /// Re-evaluate the conflict state of a focused room after remote
    /// editing flags changed. Emits an advisory only when it flips.
    fn reassess(&mut self, room: &RoomId) -> Option<Effect> {
        if !self.features.is_enabled(CollabFeature::EditConflicts) {
            return None;
        }
        let local = self.rooms.get_mut(room)?;
        if !local.detector.is_editing() {
            return None;
        }
        let conflicted = local.detector.detect(&self.store).is_some();
        if conflicted == local.conflicted {
            return None;
        }
        local.conflicted = conflicted;
        let advisory = if conflicted {
            EditAdvisory::conflict()
        } else {
            EditAdvisory::clear()
        };
        Some(Effect::Emit(CollabEvent::Advisory {
            room: room.clone(),
            advisory,
        }))
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Republish own presence to every joined room.
    pub fn heartbeat(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        for room in self.registry.rooms_of(self.session.session_id) {
            self.store.touch(&room, &self.author, now);
            if self.is_connected() && self.features.is_enabled(CollabFeature::Presence) {
                effects.push(Effect::Publish {
                    room,
                    event: PresenceEvent::Heartbeat,
                });
            }
        }
        effects
    }

    /// Evict remote sessions not heard from within the TTL.
    pub fn reap(&mut self, now: Instant) -> Vec<Effect> {
        // the local session is alive for as long as the core is
        for room in self.rooms.keys() {
            self.store.touch(room, &self.author, now);
        }
        let evicted = self.store.evict_stale(now, self.ttl);
        let mut affected = BTreeSet::new();
        for record in evicted {
            log::info!(
                "evicting stale session {} ({}) from {}",
                record.session_id,
                record.user_id,
                record.room_id
            );
            if let Some(sub) = self.remote.remove(&(record.room_id.clone(), record.session_id)) {
                self.registry.release(sub);
            }
            affected.insert(record.room_id);
        }

        let mut effects = Vec::new();
        for room in affected {
            effects.extend(self.reassess(&room));
            effects.push(Self::changed(&room));
        }
        effects
    }

    /// Publish every cursor whose debounce window has elapsed.
    pub fn flush_cursors(&mut self, now: Instant) -> Vec<Effect> {
        let connected = self.is_connected();
        let mut effects = Vec::new();
        for (room, local) in self.rooms.iter_mut() {
            let Some((position, event)) = local.broadcaster.poll(now) else {
                continue;
            };
            self.store
                .upsert_cursor(room, &self.author, position.x, position.y, now);
            if connected {
                effects.push(Effect::Publish {
                    room: room.clone(),
                    event,
                });
            } else {
                log::debug!("link down, dropping cursor for {room}");
            }
        }
        effects
    }

    /// Arrange the single retry of an editing-status publish that failed.
    pub fn schedule_retry(&mut self, room: &RoomId, event: PresenceEvent, now: Instant) {
        if !self.rooms.contains_key(room) {
            return;
        }
        log::warn!("{} for {room} failed, retrying once", event.name());
        self.retries
            .insert(room.clone(), (event, now + self.retry_delay));
    }

    pub fn due_retries(&mut self, now: Instant) -> Vec<Effect> {
        let due: Vec<RoomId> = self
            .retries
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(room, _)| room.clone())
            .collect();
        let mut effects = Vec::new();
        for room in due {
            if let Some((event, _)) = self.retries.remove(&room) {
                effects.push(Effect::Retry { room, event });
            }
        }
        effects
    }

    /// Earliest pending cursor flush or retry.
    pub fn next_deadline(&self) -> Option<Instant> {
        let cursors = self.rooms.values().filter_map(|r| r.broadcaster.deadline());
        let retries = self.retries.values().map(|(_, at)| *at);
        cursors.chain(retries).min()
    }

    // ── Host input ───────────────────────────────────────────────

    /// Raw pointer move over the room's container.
    pub fn pointer_move(&mut self, room: &RoomId, rect: &ContainerRect, client_x: f32, client_y: f32, now: Instant) -> bool {
        if !self.features.is_enabled(CollabFeature::Cursors) {
            return false;
        }
        match self.rooms.get_mut(room) {
            Some(local) => local.broadcaster.pointer_move(rect, client_x, client_y, now),
            None => false,
        }
    }

    /// Container-relative cursor position.
    pub fn cursor_move(&mut self, room: &RoomId, x: f32, y: f32, now: Instant) -> bool {
        if !self.features.is_enabled(CollabFeature::Cursors) {
            return false;
        }
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return false;
        }
        match self.rooms.get_mut(room) {
            Some(local) => {
                local.broadcaster.schedule_send(CursorPosition::new(x, y), now);
                true
            }
            None => false,
        }
    }

    pub fn focus(&mut self, room: &RoomId, now: Instant) -> Vec<Effect> {
        if !self.features.is_enabled(CollabFeature::EditConflicts) {
            return Vec::new();
        }
        let Some(local) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        let transition = local.detector.on_focus(&self.store);
        if let Some(advisory) = &transition.advisory {
            local.conflicted = advisory.is_conflict();
        }
        self.apply_transition(room, transition, now)
    }

    pub fn blur(&mut self, room: &RoomId, now: Instant) -> Vec<Effect> {
        if !self.features.is_enabled(CollabFeature::EditConflicts) {
            return Vec::new();
        }
        let Some(local) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        let transition = local.detector.on_blur();
        local.conflicted = false;
        self.apply_transition(room, transition, now)
    }

    pub fn click(&mut self, room: &RoomId, now: Instant) -> Vec<Effect> {
        if !self.features.is_enabled(CollabFeature::EditConflicts) {
            return Vec::new();
        }
        let Some(local) = self.rooms.get(room) else {
            return Vec::new();
        };
        let transition = local.detector.on_click(&self.store);
        self.apply_transition(room, transition, now)
    }

    fn apply_transition(&mut self, room: &RoomId, transition: Transition, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(editing) = transition.editing {
            self.store.set_editing(room, &self.author, editing, now);
        }
        if let Some(event) = transition.publish {
            self.push_publish(&mut effects, room, event);
        }
        if let Some(advisory) = transition.advisory {
            effects.push(Effect::Emit(CollabEvent::Advisory {
                room: room.clone(),
                advisory,
            }));
        }
        if transition.editing.is_some() {
            effects.push(Self::changed(room));
        }
        effects
    }

    // ── Connection ───────────────────────────────────────────────

    /// The link dropped without an explicit close.
    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        log::warn!("session {} is stale, link lost", self.session.session_id);
        self.state = ConnectionState::Stale;
        // reconnect republishes the current editing flag
        self.retries.clear();
        vec![Effect::Emit(CollabEvent::Connection(ConnectionState::Stale))]
    }

    pub fn on_reconnecting(&mut self, attempt: u32) -> Vec<Effect> {
        match self.state {
            ConnectionState::Stale => {
                log::info!("reconnecting session {} (attempt {attempt})", self.session.session_id);
                self.state = ConnectionState::Reconnecting;
                vec![Effect::Emit(CollabEvent::Connection(ConnectionState::Reconnecting))]
            }
            _ => Vec::new(),
        }
    }

    /// The link is back: re-join every room and republish presence and
    /// the current editing flag so remote stores heal.
    pub fn on_reconnected(&mut self, now: Instant) -> Vec<Effect> {
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Closed) {
            return Vec::new();
        }
        log::info!(
            "session {} reconnected, rejoining {} room(s)",
            self.session.session_id,
            self.rooms.len()
        );
        self.state = ConnectionState::Connected;

        let mut effects = Vec::new();
        let rooms: Vec<(RoomId, bool)> = self
            .rooms
            .iter()
            .map(|(room, local)| (room.clone(), local.detector.is_editing()))
            .collect();
        for (room, editing) in rooms {
            self.store.touch(&room, &self.author, now);
            effects.push(Effect::JoinRoom(room.clone()));
            if self.features.is_enabled(CollabFeature::Presence) {
                effects.push(Effect::Publish {
                    room: room.clone(),
                    event: self.join_event(),
                });
            }
            if self.features.is_enabled(CollabFeature::EditConflicts) {
                effects.push(Effect::Publish {
                    room,
                    event: PresenceEvent::EditingStatus { is_editing: editing },
                });
            }
        }
        effects.push(Effect::Emit(CollabEvent::Connection(ConnectionState::Connected)));
        effects
    }

    /// Explicit teardown: leave every room, clearing the editing flag on
    /// the way out so peers need not wait for the TTL.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        let mut effects = Vec::new();
        for room in self.rooms() {
            effects.extend(self.teardown(&room));
        }
        self.handles.clear();
        self.retries.clear();
        self.state = ConnectionState::Closed;
        log::info!("session {} disconnected", self.session.session_id);
        effects.push(Effect::Emit(CollabEvent::Connection(ConnectionState::Closed)));
        effects
    }

    // ── Rendering ────────────────────────────────────────────────

    /// Cursors of other users in `room`, filtered by the view mode.
    /// Sessions of the local user are never drawn.
    pub fn remote_cursors(&self, room: &RoomId, mode: ViewMode) -> Vec<RemoteCursor> {
        if !self.features.is_enabled(CollabFeature::Cursors) || !self.rooms.contains_key(room) {
            return Vec::new();
        }
        if !mode.shows_remote(self.store.distinct_users(room)) {
            return Vec::new();
        }
        self.store
            .snapshot(room)
            .into_iter()
            .filter(|r| r.user_id != self.session.user_id)
            .filter_map(|r| {
                let position = r.cursor?;
                Some(RemoteCursor {
                    color: color_for(r.user_id.as_str()),
                    session_id: r.session_id,
                    user_id: r.user_id,
                    display_name: r.display_name,
                    position,
                    is_editing: r.is_editing,
                })
            })
            .collect()
    }
}

/// Exponential reconnect delay: `initial × multiplier^n`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier.max(1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = scaled.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(capped as u64)
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{AdvisoryReason, CONFLICT_MESSAGE};
    use crate::identity::UserProfile;
    use crate::room::EntityKind;

    fn room() -> RoomId {
        RoomId::for_entity(EntityKind::Document, 42)
    }

    fn core_for(user: &str, features: FeatureSet) -> SessionCore {
        let profile = UserProfile::new(user, user.to_uppercase());
        let session = Session::new(SessionId::new(), &profile, Instant::now());
        SessionCore::new(session, &CollabConfig::default(), features)
    }

    fn core(user: &str) -> SessionCore {
        core_for(user, FeatureSet::all())
    }

    fn remote(user: &str, event: PresenceEvent) -> (SessionId, Envelope) {
        let session = SessionId::new();
        (session, Envelope::new(room(), session, UserId::new(user), event))
    }

    fn from(session: SessionId, user: &str, event: PresenceEvent) -> Envelope {
        Envelope::new(room(), session, UserId::new(user), event)
    }

    fn advisories(effects: &[Effect]) -> Vec<EditAdvisory> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(CollabEvent::Advisory { advisory, .. }) => Some(advisory.clone()),
                _ => None,
            })
            .collect()
    }

    fn publishes(effects: &[Effect]) -> Vec<PresenceEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Publish { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    // ── Membership ───────────────────────────────────────────────

    #[test]
    fn test_first_join_subscribes_and_announces() {
        let mut c = core("alice");
        let (_, effects) = c.join_local(&room(), Instant::now());
        assert_eq!(effects[0], Effect::Subscribe(room()));
        assert_eq!(effects[1], Effect::JoinRoom(room()));
        let events = publishes(&effects);
        assert!(matches!(events[..], [PresenceEvent::PresenceJoin { .. }]));
        let own = c.snapshot(&room());
        assert_eq!(own.len(), 1);
        assert!(own[0].cursor.is_none());
        assert!(!own[0].is_editing);
    }

    #[test]
    fn test_nested_joins_leave_on_last_release() {
        let mut c = core("alice");
        let now = Instant::now();
        let (parent, _) = c.join_local(&room(), now);
        let (child, effects) = c.join_local(&room(), now);
        assert!(effects.is_empty());
        assert_eq!(c.handle_count(&room()), 2);

        assert!(c.release_local(child).is_empty());
        assert!(c.is_joined(&room()));

        let effects = c.release_local(parent);
        assert!(effects.contains(&Effect::LeaveRoom(room())));
        assert!(effects.contains(&Effect::Unsubscribe(room())));
        assert!(!c.is_joined(&room()));
        assert!(c.snapshot(&room()).is_empty());
        assert!(c.members_of(&room()).is_empty());
        // double release is harmless
        assert!(c.release_local(parent).is_empty());
    }

    #[test]
    fn test_leave_while_editing_clears_flag_remotely() {
        let mut c = core("alice");
        let now = Instant::now();
        let (handle, _) = c.join_local(&room(), now);
        c.focus(&room(), now);
        let events = publishes(&c.release_local(handle));
        assert_eq!(events[0], PresenceEvent::EditingStatus { is_editing: false });
        assert!(matches!(events[1], PresenceEvent::PresenceLeave { .. }));
    }

    // ── Inbound ──────────────────────────────────────────────────

    #[test]
    fn test_remote_cursor_rendered_with_color() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (alice, join) = remote(
            "alice",
            PresenceEvent::PresenceJoin {
                user_id: UserId::new("alice"),
                display_name: "Alice".into(),
                avatar_url: None,
            },
        );
        c.apply_remote(join, now);
        let effects = c.apply_remote(
            from(alice, "alice", PresenceEvent::CursorMove { x: 120.0, y: 80.0 }),
            now,
        );
        assert_eq!(effects, vec![Effect::Emit(CollabEvent::PresenceChanged { room: room() })]);

        let cursors = c.remote_cursors(&room(), ViewMode::All);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].session_id, alice);
        assert_eq!(cursors[0].position, CursorPosition::new(120.0, 80.0));
        assert_eq!(cursors[0].color, color_for("alice"));
        assert_eq!(cursors[0].display_name.as_deref(), Some("Alice"));
        assert_eq!(c.members_of(&room()).len(), 2);
    }

    #[test]
    fn test_view_mode_filters_cursors() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (_, env) = remote("alice", PresenceEvent::CursorMove { x: 1.0, y: 1.0 });
        c.apply_remote(env, now);

        assert!(c.remote_cursors(&room(), ViewMode::JustMe).is_empty());
        assert_eq!(c.remote_cursors(&room(), ViewMode::Collaborators).len(), 1);
    }

    #[test]
    fn test_own_user_other_tab_not_drawn() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (_, env) = remote("bob", PresenceEvent::CursorMove { x: 1.0, y: 1.0 });
        c.apply_remote(env, now);
        assert!(c.remote_cursors(&room(), ViewMode::All).is_empty());
        // only one distinct user present
        assert!(c.remote_cursors(&room(), ViewMode::Collaborators).is_empty());
    }

    #[test]
    fn test_own_echo_and_unjoined_rooms_ignored() {
        let mut c = core("bob");
        let now = Instant::now();
        let own = c.session().session_id;
        let (_, env) = remote("alice", PresenceEvent::Heartbeat);
        assert!(c.apply_remote(env, now).is_empty());

        let _ = c.join_local(&room(), now);
        let echo = from(own, "bob", PresenceEvent::CursorMove { x: 5.0, y: 5.0 });
        assert!(c.apply_remote(echo, now).is_empty());
        assert!(c.snapshot(&room())[0].cursor.is_none());
    }

    #[test]
    fn test_malformed_envelope_discarded() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (_, env) = remote("alice", PresenceEvent::CursorMove { x: f32::NAN, y: 1.0 });
        assert!(c.apply_remote(env, now).is_empty());
        assert_eq!(c.snapshot(&room()).len(), 1);
    }

    #[test]
    fn test_presence_leave_removes_record_and_membership() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (alice, env) = remote("alice", PresenceEvent::Heartbeat);
        c.apply_remote(env, now);
        assert_eq!(c.members_of(&room()).len(), 2);

        c.apply_remote(
            from(alice, "alice", PresenceEvent::PresenceLeave { user_id: UserId::new("alice") }),
            now,
        );
        assert_eq!(c.members_of(&room()), vec![c.session().session_id]);
        assert_eq!(c.snapshot(&room()).len(), 1);
    }

    // ── Conflicts ────────────────────────────────────────────────

    #[test]
    fn test_focus_warns_when_other_user_editing() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (_, env) = remote("alice", PresenceEvent::EditingStatus { is_editing: true });
        c.apply_remote(env, now);

        let effects = c.focus(&room(), now);
        let found = advisories(&effects);
        let advisory = &found[0];
        assert!(!advisory.allowed);
        assert_eq!(advisory.message.as_deref(), Some(CONFLICT_MESSAGE));
        assert_eq!(publishes(&effects), vec![PresenceEvent::EditingStatus { is_editing: true }]);
        assert!(c.is_editing(&room()));
    }

    #[test]
    fn test_remote_editing_while_focused_raises_then_clears() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let focus = c.focus(&room(), now);
        assert_eq!(advisories(&focus)[0].reason, AdvisoryReason::Clear);

        let (alice, env) = remote("alice", PresenceEvent::EditingStatus { is_editing: true });
        let raised = advisories(&c.apply_remote(env, now));
        assert_eq!(raised.len(), 1);
        assert!(raised[0].is_conflict());

        let cleared = advisories(&c.apply_remote(
            from(alice, "alice", PresenceEvent::EditingStatus { is_editing: false }),
            now,
        ));
        assert_eq!(cleared.len(), 1);
        assert!(cleared[0].allowed);
    }

    #[test]
    fn test_conflict_features_disabled() {
        let features = FeatureSet::resolve(&[CollabFeature::Presence]).unwrap();
        let mut c = core_for("bob", features);
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        assert!(c.focus(&room(), now).is_empty());
        assert!(!c.cursor_move(&room(), 1.0, 1.0, now));
        assert!(!c.is_editing(&room()));
    }

    // ── Timers ───────────────────────────────────────────────────

    #[test]
    fn test_reaper_evicts_silent_remote_but_not_self() {
        let mut c = core("bob");
        let t0 = Instant::now();
        let _ = c.join_local(&room(), t0);
        let (_, env) = remote("alice", PresenceEvent::EditingStatus { is_editing: true });
        c.apply_remote(env, t0);

        let later = t0 + Duration::from_secs(31);
        let effects = c.reap(later);
        assert!(effects.contains(&Effect::Emit(CollabEvent::PresenceChanged { room: room() })));
        let snapshot = c.snapshot(&room());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, c.session().session_id);
        assert_eq!(c.members_of(&room()), vec![c.session().session_id]);
    }

    #[test]
    fn test_heartbeat_covers_every_joined_room() {
        let mut c = core("bob");
        let now = Instant::now();
        let other = RoomId::for_entity(EntityKind::Prototype, 1);
        let _ = c.join_local(&room(), now);
        let _ = c.join_local(&other, now);
        let beats = publishes(&c.heartbeat(now));
        assert_eq!(beats, vec![PresenceEvent::Heartbeat, PresenceEvent::Heartbeat]);
    }

    #[test]
    fn test_cursor_flush_after_window() {
        let mut c = core("bob");
        let t0 = Instant::now();
        let _ = c.join_local(&room(), t0);
        let rect = ContainerRect::new(100.0, 50.0, 400.0, 300.0);
        assert!(c.pointer_move(&room(), &rect, 210.0, 100.0, t0));
        assert!(c.pointer_move(&room(), &rect, 220.0, 130.0, t0 + Duration::from_millis(10)));
        assert!(c.flush_cursors(t0 + Duration::from_millis(40)).is_empty());

        let deadline = c.next_deadline().unwrap();
        assert_eq!(deadline, t0 + Duration::from_millis(60));
        let events = publishes(&c.flush_cursors(deadline));
        assert_eq!(events, vec![PresenceEvent::CursorMove { x: 120.0, y: 80.0 }]);
        assert!(c.next_deadline().is_none());
    }

    #[test]
    fn test_leaving_cancels_pending_cursor() {
        let mut c = core("bob");
        let t0 = Instant::now();
        let (handle, _) = c.join_local(&room(), t0);
        c.cursor_move(&room(), 1.0, 1.0, t0);
        c.release_local(handle);
        assert!(c.next_deadline().is_none());
        assert!(c.flush_cursors(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_retry_due_once_and_superseded() {
        let mut c = core("bob");
        let t0 = Instant::now();
        let _ = c.join_local(&room(), t0);
        let on = PresenceEvent::EditingStatus { is_editing: true };
        c.schedule_retry(&room(), on.clone(), t0);
        assert!(c.due_retries(t0).is_empty());
        let due = c.due_retries(t0 + Duration::from_millis(250));
        assert_eq!(due, vec![Effect::Retry { room: room(), event: on.clone() }]);
        assert!(c.due_retries(t0 + Duration::from_secs(1)).is_empty());

        c.schedule_retry(&room(), on, t0);
        c.focus(&room(), t0);
        assert!(c.due_retries(t0 + Duration::from_secs(1)).is_empty());
    }

    // ── Connection ───────────────────────────────────────────────

    #[test]
    fn test_join_while_stale_is_replayed_on_reconnect() {
        let mut c = core("bob");
        let now = Instant::now();
        c.on_disconnected();
        assert_eq!(c.state(), ConnectionState::Stale);

        let (_, effects) = c.join_local(&room(), now);
        assert!(effects.contains(&Effect::Subscribe(room())));
        assert!(!effects.contains(&Effect::JoinRoom(room())));
        assert!(publishes(&effects).is_empty());

        c.focus(&room(), now);
        c.on_reconnecting(1);
        assert_eq!(c.state(), ConnectionState::Reconnecting);
        let effects = c.on_reconnected(now);
        assert_eq!(effects[0], Effect::JoinRoom(room()));
        let events = publishes(&effects);
        assert!(matches!(events[0], PresenceEvent::PresenceJoin { .. }));
        assert_eq!(events[1], PresenceEvent::EditingStatus { is_editing: true });
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_stale_session_keeps_remote_records() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        let (_, env) = remote("alice", PresenceEvent::Heartbeat);
        c.apply_remote(env, now);
        c.on_disconnected();
        assert_eq!(c.snapshot(&room()).len(), 2);
    }

    #[test]
    fn test_explicit_disconnect_clears_editing() {
        let mut c = core("bob");
        let now = Instant::now();
        let _ = c.join_local(&room(), now);
        c.focus(&room(), now);
        let effects = c.disconnect();
        let events = publishes(&effects);
        assert_eq!(events[0], PresenceEvent::EditingStatus { is_editing: false });
        assert!(effects.contains(&Effect::LeaveRoom(room())));
        assert_eq!(
            effects.last(),
            Some(&Effect::Emit(CollabEvent::Connection(ConnectionState::Closed)))
        );
        assert!(c.rooms().is_empty());
        assert!(c.disconnect().is_empty());
        assert!(c.on_reconnected(now).is_empty());
    }

    // ── Backoff ──────────────────────────────────────────────────

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new(&BackoffConfig {
            initial_ms: 500,
            max_ms: 3_000,
            multiplier: 2.0,
        });
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
        assert_eq!(b.attempt(), 5);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
