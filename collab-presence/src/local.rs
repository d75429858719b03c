//! In-process transport over a shared [`RoomHub`].
//!
//! Several `LocalTransport`s sharing one hub behave like clients of the
//! same relay, which makes this the transport of choice for embedding and
//! for tests. [`LocalTransport::sever`] simulates a transient network
//! drop: the hub forgets the session's memberships exactly as the relay
//! does when a socket dies.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::hub::RoomHub;
use crate::identity::{SessionId, UserProfile};
use crate::protocol::{Envelope, PresenceEvent};
use crate::room::RoomId;
use crate::transport::{LinkStatus, RoomDemux, Transport};

#[derive(Default)]
struct LocalLink {
    session: Option<SessionId>,
    user: Option<UserProfile>,
    outbox: Option<mpsc::Sender<Envelope>>,
    pump: Option<JoinHandle<()>>,
    rooms: HashSet<RoomId>,
}

pub struct LocalTransport {
    hub: RoomHub,
    demux: RoomDemux,
    link: Mutex<LocalLink>,
    status: watch::Sender<LinkStatus>,
    buffer: usize,
}

impl LocalTransport {
    pub fn new(hub: RoomHub) -> Self {
        Self::with_buffer(hub, 256)
    }

    pub fn with_buffer(hub: RoomHub, buffer: usize) -> Self {
        let (status, _) = watch::channel(LinkStatus::Idle);
        Self {
            hub,
            demux: RoomDemux::new(buffer),
            link: Mutex::new(LocalLink::default()),
            status,
            buffer: buffer.max(1),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.link.try_lock().ok().and_then(|link| link.session)
    }

    /// Open the outbox and start routing it into the demux.
    fn open(&self, link: &mut LocalLink) -> mpsc::Sender<Envelope> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.buffer);
        let demux = self.demux.clone();
        let pump = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                demux.route(envelope).await;
            }
        });
        if let Some(old) = link.pump.replace(pump) {
            old.abort();
        }
        link.outbox = Some(tx.clone());
        tx
    }

    async fn drop_memberships(&self, link: &mut LocalLink) {
        if let Some(session) = link.session {
            for room in link.rooms.drain() {
                self.hub.leave(&room, session).await;
            }
        }
        link.outbox = None;
        if let Some(pump) = link.pump.take() {
            pump.abort();
        }
    }

    /// Simulate losing the network: memberships vanish on the hub side
    /// without any `presence_leave`, and the link reports `Disconnected`.
    pub async fn sever(&self) {
        let mut link = self.link.lock().await;
        self.drop_memberships(&mut link).await;
        self.status.send_replace(LinkStatus::Disconnected);
        log::info!("local transport severed");
    }

    fn connected(link: &LocalLink) -> Result<(SessionId, &UserProfile, &mpsc::Sender<Envelope>), TransportError> {
        match (link.session, link.user.as_ref(), link.outbox.as_ref()) {
            (Some(session), Some(user), Some(outbox)) => Ok((session, user, outbox)),
            _ => Err(TransportError::Disconnected),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, user: &UserProfile) -> Result<SessionId, TransportError> {
        let mut link = self.link.lock().await;
        let session = SessionId::new();
        link.session = Some(session);
        link.user = Some(user.clone());
        self.open(&mut link);
        self.status.send_replace(LinkStatus::Connected);
        Ok(session)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.session.is_none() {
            return Err(TransportError::Disconnected);
        }
        if *self.status.borrow() == LinkStatus::Closed {
            return Err(TransportError::ConnectionClosed);
        }
        if link.outbox.is_none() {
            self.open(&mut link);
        }
        self.status.send_replace(LinkStatus::Connected);
        Ok(())
    }

    async fn join_room(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        let (session, _, outbox) = Self::connected(&link)?;
        let outbox = outbox.clone();
        self.hub.join(room, session, outbox).await;
        link.rooms.insert(room.clone());
        Ok(())
    }

    async fn leave_room(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        let (session, _, _) = Self::connected(&link)?;
        self.hub.leave(room, session).await;
        link.rooms.remove(room);
        Ok(())
    }

    async fn publish(&self, room: &RoomId, event: PresenceEvent) -> Result<(), TransportError> {
        let envelope = {
            let link = self.link.lock().await;
            let (session, user, _) = Self::connected(&link)?;
            Envelope::new(room.clone(), session, user.id.clone(), event)
        };
        envelope.validate()?;
        self.hub.publish(envelope).await;
        Ok(())
    }

    async fn subscribe(&self, room: &RoomId) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        Ok(self.demux.subscribe(room).await)
    }

    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        let mut link = self.link.lock().await;
        self.drop_memberships(&mut link).await;
        self.status.send_replace(LinkStatus::Closed);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.link.get_mut().pump.take() {
            pump.abort();
        }
    }
}
