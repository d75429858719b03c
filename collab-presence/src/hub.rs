//! Server-side room fan-out: one actor task per room.
//!
//! ```text
//! connection task ──join/leave/publish──► RoomHub directory (room → mailbox)
//!                                               │
//!                                               ▼
//!                                        RoomActor (owns members)
//!                                               │  try_send, sender excluded
//!                          ┌────────────────────┼────────────────────┐
//!                          ▼                    ▼                    ▼
//!                      outbox A             outbox B             outbox C
//! ```
//!
//! Membership is only ever mutated inside the room's actor, so there is no
//! shared lock on the hot path. The directory lock is taken when a room is
//! created or retired.
//!
//! A room actor retires as soon as its last member leaves: it removes its
//! directory entry, closes its mailbox, and answers joins that were already
//! queued with a refusal so the caller retries against a fresh actor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::identity::SessionId;
use crate::protocol::{Envelope, PresenceEvent};
use crate::room::RoomId;

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub rooms_created: u64,
    pub active_rooms: usize,
}

/// Lock-free counters updated by room actors.
#[derive(Debug, Default)]
struct AtomicHubStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    rooms_created: AtomicU64,
}

enum RoomCommand {
    Join {
        session: SessionId,
        outbox: mpsc::Sender<Envelope>,
        ack: oneshot::Sender<bool>,
    },
    Leave {
        session: SessionId,
    },
    Publish {
        envelope: Envelope,
    },
    Members {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
}

#[derive(Clone)]
struct RoomEntry {
    generation: u64,
    mailbox: mpsc::Sender<RoomCommand>,
}

type Directory = Arc<RwLock<HashMap<RoomId, RoomEntry>>>;

/// Routes room traffic to per-room actors.
#[derive(Clone)]
pub struct RoomHub {
    directory: Directory,
    stats: Arc<AtomicHubStats>,
    next_generation: Arc<AtomicU64>,
    room_buffer: usize,
}

impl RoomHub {
    pub fn new(room_buffer: usize) -> Self {
        Self {
            directory: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicHubStats::default()),
            next_generation: Arc::new(AtomicU64::new(0)),
            room_buffer: room_buffer.max(1),
        }
    }

    /// Get or spawn the actor for `room`.
    async fn mailbox(&self, room: &RoomId) -> mpsc::Sender<RoomCommand> {
        // Fast path: read lock
        {
            let directory = self.directory.read().await;
            if let Some(entry) = directory.get(room) {
                if !entry.mailbox.is_closed() {
                    return entry.mailbox.clone();
                }
            }
        }

        // Slow path: write lock to create
        let mut directory = self.directory.write().await;
        if let Some(entry) = directory.get(room) {
            if !entry.mailbox.is_closed() {
                return entry.mailbox.clone();
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.room_buffer);
        directory.insert(
            room.clone(),
            RoomEntry {
                generation,
                mailbox: tx.clone(),
            },
        );
        self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);

        let actor = RoomActor {
            room: room.clone(),
            generation,
            members: HashMap::new(),
            directory: self.directory.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(actor.run(rx));
        log::debug!("room actor for {room} started (generation {generation})");
        tx
    }

    async fn existing_mailbox(&self, room: &RoomId) -> Option<mpsc::Sender<RoomCommand>> {
        self.directory.read().await.get(room).map(|e| e.mailbox.clone())
    }

    /// Add `session` to `room`; envelopes for it are pushed into `outbox`.
    /// Joining again replaces the outbox and keeps cached presence.
    pub async fn join(&self, room: &RoomId, session: SessionId, outbox: mpsc::Sender<Envelope>) {
        loop {
            let mailbox = self.mailbox(room).await;
            let (ack, accepted) = oneshot::channel();
            let command = RoomCommand::Join {
                session,
                outbox: outbox.clone(),
                ack,
            };
            if mailbox.send(command).await.is_err() {
                continue;
            }
            if accepted.await.unwrap_or(false) {
                return;
            }
            log::debug!("room {room} was retiring, retrying join for {session}");
        }
    }

    pub async fn leave(&self, room: &RoomId, session: SessionId) {
        if let Some(mailbox) = self.existing_mailbox(room).await {
            let _ = mailbox.send(RoomCommand::Leave { session }).await;
        }
    }

    /// Fan `envelope` out to the other members of its room. Ignored when
    /// the sender is not a member.
    pub async fn publish(&self, envelope: Envelope) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.existing_mailbox(&envelope.room).await {
            Some(mailbox) => {
                let _ = mailbox.send(RoomCommand::Publish { envelope }).await;
            }
            None => {
                log::debug!("publish to unknown room {} dropped", envelope.room);
            }
        }
    }

    pub async fn members_of(&self, room: &RoomId) -> Vec<SessionId> {
        let Some(mailbox) = self.existing_mailbox(room).await else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if mailbox.send(RoomCommand::Members { reply }).await.is_err() {
            return Vec::new();
        }
        let mut members = rx.await.unwrap_or_default();
        members.sort();
        members
    }

    pub async fn room_count(&self) -> usize {
        self.directory.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_published: self.stats.published.load(Ordering::Relaxed),
            messages_delivered: self.stats.delivered.load(Ordering::Relaxed),
            messages_dropped: self.stats.dropped.load(Ordering::Relaxed),
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
        }
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(128)
    }
}

struct Member {
    outbox: mpsc::Sender<Envelope>,
    /// Latest `presence_join`, replayed to newcomers.
    announce: Option<Envelope>,
    /// Latest `editing_status`, replayed to newcomers.
    editing: Option<Envelope>,
}

struct RoomActor {
    room: RoomId,
    generation: u64,
    members: HashMap<SessionId, Member>,
    directory: Directory,
    stats: Arc<AtomicHubStats>,
}

impl RoomActor {
    async fn run(mut self, mut mailbox: mpsc::Receiver<RoomCommand>) {
        while let Some(command) = mailbox.recv().await {
            match command {
                RoomCommand::Join { session, outbox, ack } => {
                    self.admit(session, outbox);
                    let _ = ack.send(true);
                }
                RoomCommand::Leave { session } => {
                    if self.members.remove(&session).is_some() {
                        log::debug!("session {session} left room {}", self.room);
                    }
                }
                RoomCommand::Publish { envelope } => self.fan_out(envelope),
                RoomCommand::Members { reply } => {
                    let _ = reply.send(self.members.keys().copied().collect());
                }
            }

            if self.members.is_empty() {
                self.retire(&mut mailbox).await;
                return;
            }
        }
    }

    fn admit(&mut self, session: SessionId, outbox: mpsc::Sender<Envelope>) {
        // Bring the newcomer up to date with everyone already present.
        for (other, member) in &self.members {
            if *other == session {
                continue;
            }
            for cached in [&member.announce, &member.editing].into_iter().flatten() {
                if outbox.try_send(cached.clone()).is_ok() {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match self.members.get_mut(&session) {
            Some(member) => member.outbox = outbox,
            None => {
                self.members.insert(
                    session,
                    Member {
                        outbox,
                        announce: None,
                        editing: None,
                    },
                );
                log::debug!("session {session} joined room {}", self.room);
            }
        }
    }

    fn fan_out(&mut self, envelope: Envelope) {
        let sender = envelope.session_id;
        let Some(member) = self.members.get_mut(&sender) else {
            log::debug!("non-member {sender} published to {}", self.room);
            return;
        };
        match envelope.event {
            PresenceEvent::PresenceJoin { .. } => member.announce = Some(envelope.clone()),
            PresenceEvent::EditingStatus { .. } => member.editing = Some(envelope.clone()),
            _ => {}
        }

        let mut gone = Vec::new();
        for (session, member) in &self.members {
            if *session == sender {
                continue;
            }
            match member.outbox.try_send(envelope.clone()) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("outbox of {session} full, dropped {}", envelope.event.name());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*session),
            }
        }
        for session in gone {
            self.members.remove(&session);
            log::debug!("session {session} dropped from {}: outbox closed", self.room);
        }

        if let PresenceEvent::PresenceLeave { .. } = envelope.event {
            self.members.remove(&sender);
        }
    }

    async fn retire(&mut self, mailbox: &mut mpsc::Receiver<RoomCommand>) {
        {
            let mut directory = self.directory.write().await;
            if directory
                .get(&self.room)
                .is_some_and(|e| e.generation == self.generation)
            {
                directory.remove(&self.room);
            }
        }
        mailbox.close();
        while let Some(command) = mailbox.recv().await {
            match command {
                RoomCommand::Join { ack, .. } => {
                    let _ = ack.send(false);
                }
                RoomCommand::Members { reply } => {
                    let _ = reply.send(Vec::new());
                }
                RoomCommand::Leave { .. } | RoomCommand::Publish { .. } => {}
            }
        }
        log::debug!("room {} destroyed", self.room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{UserId, UserProfile};
    use crate::room::EntityKind;
    use tokio::time::{timeout, Duration};

    fn room() -> RoomId {
        RoomId::for_entity(EntityKind::Document, 42)
    }

    fn envelope(session: SessionId, user: &str, event: PresenceEvent) -> Envelope {
        Envelope::new(room(), session, UserId::new(user), event)
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Option<Envelope> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender() {
        let hub = RoomHub::new(16);
        let (a, b) = (SessionId::new(), SessionId::new());
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        hub.join(&room(), a, a_tx).await;
        hub.join(&room(), b, b_tx).await;

        hub.publish(envelope(a, "alice", PresenceEvent::CursorMove { x: 1.0, y: 2.0 }))
            .await;

        let got = recv(&mut b_rx).await.unwrap();
        assert_eq!(got.session_id, a);
        assert_eq!(got.event, PresenceEvent::CursorMove { x: 1.0, y: 2.0 });
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_room_destroyed_when_empty() {
        let hub = RoomHub::new(16);
        let a = SessionId::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.join(&room(), a, tx).await;
        assert_eq!(hub.room_count().await, 1);
        assert_eq!(hub.members_of(&room()).await, vec![a]);

        hub.leave(&room(), a).await;
        for _ in 0..50 {
            if hub.room_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.room_count().await, 0);
        assert!(hub.members_of(&room()).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_after_retire_gets_fresh_actor() {
        let hub = RoomHub::new(16);
        let a = SessionId::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.join(&room(), a, tx.clone()).await;
        hub.leave(&room(), a).await;
        hub.join(&room(), a, tx).await;
        assert_eq!(hub.members_of(&room()).await, vec![a]);
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_newcomer_receives_cached_presence() {
        let hub = RoomHub::new(16);
        let (a, b) = (SessionId::new(), SessionId::new());
        let (a_tx, _a_rx) = mpsc::channel(8);
        hub.join(&room(), a, a_tx).await;
        hub.publish(envelope(
            a,
            "alice",
            PresenceEvent::join(&UserProfile::new("alice", "Alice")),
        ))
        .await;
        hub.publish(envelope(a, "alice", PresenceEvent::EditingStatus { is_editing: true }))
            .await;

        let (b_tx, mut b_rx) = mpsc::channel(8);
        hub.join(&room(), b, b_tx).await;

        let first = recv(&mut b_rx).await.unwrap();
        let second = recv(&mut b_rx).await.unwrap();
        assert!(matches!(first.event, PresenceEvent::PresenceJoin { .. }));
        assert_eq!(second.event, PresenceEvent::EditingStatus { is_editing: true });
    }

    #[tokio::test]
    async fn test_non_member_publish_is_ignored() {
        let hub = RoomHub::new(16);
        let a = SessionId::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.join(&room(), a, tx).await;
        hub.publish(envelope(SessionId::new(), "eve", PresenceEvent::Heartbeat))
            .await;
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_full_outbox_counts_drop() {
        let hub = RoomHub::new(16);
        let (a, b) = (SessionId::new(), SessionId::new());
        let (a_tx, _a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(1);
        hub.join(&room(), a, a_tx).await;
        hub.join(&room(), b, b_tx).await;
        for _ in 0..3 {
            hub.publish(envelope(a, "alice", PresenceEvent::Heartbeat)).await;
        }
        // members_of round-trips through the actor, so all publishes are processed
        hub.members_of(&room()).await;
        let stats = hub.stats().await;
        assert_eq!(stats.messages_published, 3);
        assert_eq!(stats.messages_delivered, 1);
        assert_eq!(stats.messages_dropped, 2);
    }

    #[tokio::test]
    async fn test_presence_leave_removes_sender() {
        let hub = RoomHub::new(16);
        let (a, b) = (SessionId::new(), SessionId::new());
        let (a_tx, _a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        hub.join(&room(), a, a_tx).await;
        hub.join(&room(), b, b_tx).await;
        hub.publish(envelope(
            a,
            "alice",
            PresenceEvent::PresenceLeave { user_id: UserId::new("alice") },
        ))
        .await;
        assert!(matches!(
            recv(&mut b_rx).await.unwrap().event,
            PresenceEvent::PresenceLeave { .. }
        ));
        assert_eq!(hub.members_of(&room()).await, vec![b]);
    }
}
