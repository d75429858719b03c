//! The pub/sub transport contract the presence layer runs on.
//!
//! ```text
//! connect(user)        -> SessionId
//! join_room(room)
//! leave_room(room)
//! publish(room, event)
//! subscribe(room)      -> receiver of Envelopes (drop it to unsubscribe)
//! ```
//!
//! Implementations: [`LocalTransport`](crate::local::LocalTransport)
//! (in-process) and [`WsTransport`](crate::client::WsTransport) (relay).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::TransportError;
use crate::identity::{SessionId, UserProfile};
use crate::protocol::{Envelope, PresenceEvent};
use crate::room::RoomId;

/// Link health as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No session yet.
    Idle,
    Connected,
    /// Lost without an explicit close; `reconnect` may restore it.
    Disconnected,
    /// Closed on purpose.
    Closed,
}

/// Bidirectional room pub/sub channel for one client session.
///
/// All calls are fire-and-forget from the caller's point of view: they
/// return as soon as the request is handed to the link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link and obtain a session id.
    async fn connect(&self, user: &UserProfile) -> Result<SessionId, TransportError>;

    /// Re-open a lost link, keeping the session id. Room memberships are
    /// not restored by the transport; the caller re-joins.
    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn join_room(&self, room: &RoomId) -> Result<(), TransportError>;

    async fn leave_room(&self, room: &RoomId) -> Result<(), TransportError>;

    async fn publish(&self, room: &RoomId, event: PresenceEvent) -> Result<(), TransportError>;

    /// Receive every envelope delivered for `room` until the receiver is
    /// dropped. Subscriptions survive reconnects.
    async fn subscribe(&self, room: &RoomId) -> Result<mpsc::Receiver<Envelope>, TransportError>;

    fn link_status(&self) -> watch::Receiver<LinkStatus>;

    /// Close the link for good.
    async fn close(&self);
}

/// Routes inbound envelopes to per-room subscribers.
#[derive(Debug, Clone)]
pub struct RoomDemux {
    routes: Arc<Mutex<HashMap<RoomId, Vec<mpsc::Sender<Envelope>>>>>,
    capacity: usize,
}

impl RoomDemux {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn subscribe(&self, room: &RoomId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.lock().await.entry(room.clone()).or_default().push(tx);
        rx
    }

    /// Hand `envelope` to every live subscriber of its room. Returns how
    /// many subscribers took it.
    pub async fn route(&self, envelope: Envelope) -> usize {
        let mut routes = self.routes.lock().await;
        let Some(subscribers) = routes.get_mut(&envelope.room) else {
            log::debug!("no subscriber for {}, dropping {}", envelope.room, envelope.event.name());
            return 0;
        };
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("subscriber of {} is lagging, dropping {}", envelope.room, envelope.event.name());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if subscribers.is_empty() {
            routes.remove(&envelope.room);
        }
        delivered
    }

    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.routes
            .lock()
            .await
            .get(room)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

impl Default for RoomDemux {
    fn default() -> Self {
        Self::new(256)
    }
}
