//! WebSocket relay: the server side of [`WsTransport`](crate::client::WsTransport).
//!
//! ```text
//! Client A ──┐                     ┌── room actor (document:42) ──┐
//!            ├── connection task ──┤                              ├──► other members
//! Client B ──┘                     └── room actor (prototype:7) ──┘
//! ```
//!
//! One task per connection reads frames and hands membership and fan-out
//! to the [`RoomHub`]. A connection starts with `Hello`, gets `Welcome`
//! with its session id, then joins rooms and publishes into them. The
//! relay stamps every published event with the connection's session and
//! user before fanning it out.
//!
//! When a socket dies the session's memberships are dropped without a
//! `presence_leave`: peers clean up through their TTL reaper.
//!
//! Session ids are visible to every room peer, so resuming one takes the
//! [`ResumeTicket`] token handed out in `Welcome`. A session is only
//! resumable by the same user, after its previous connection is gone and
//! within `resume_window_ms`; any other `Hello` gets a fresh session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::hub::{HubStats, RoomHub};
use crate::identity::{SessionId, UserId, UserProfile};
use crate::protocol::{Envelope, Frame, ResumeTicket};
use crate::room::RoomId;

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub rejected_frames: u64,
}

pub(crate) fn io_error(e: impl fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

pub(crate) async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = frame.encode()?;
    sink.send(Message::Binary(encoded.into())).await.map_err(io_error)
}

struct Lease {
    user: UserId,
    token: Uuid,
    /// `None` while a connection holds the session.
    detached_at: Option<Instant>,
}

/// Sessions issued by the relay and who may resume them.
#[derive(Default)]
struct SessionLeases {
    leases: HashMap<SessionId, Lease>,
}

impl SessionLeases {
    /// Grant a session to `user`. The ticket's session comes back only
    /// when it is detached, owned by `user` and the token matches.
    fn attach(
        &mut self,
        user: &UserId,
        resume: Option<ResumeTicket>,
        now: Instant,
        window: Duration,
    ) -> ResumeTicket {
        self.prune(now, window);
        if let Some(ticket) = resume {
            match self.leases.get_mut(&ticket.session_id) {
                Some(lease)
                    if lease.detached_at.is_some()
                        && lease.token == ticket.token
                        && lease.user == *user =>
                {
                    let renewed = ResumeTicket::issue(ticket.session_id);
                    lease.token = renewed.token;
                    lease.detached_at = None;
                    return renewed;
                }
                Some(_) => log::warn!("refusing to resume session {} for {user}", ticket.session_id),
                None => log::debug!("session {} unknown or expired", ticket.session_id),
            }
        }
        let ticket = ResumeTicket::issue(SessionId::new());
        self.leases.insert(
            ticket.session_id,
            Lease {
                user: user.clone(),
                token: ticket.token,
                detached_at: None,
            },
        );
        ticket
    }

    fn detach(&mut self, session: SessionId, now: Instant) {
        if let Some(lease) = self.leases.get_mut(&session) {
            lease.detached_at = Some(now);
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        self.leases.retain(|_, lease| match lease.detached_at {
            Some(at) => now.saturating_duration_since(at) <= window,
            None => true,
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.leases.len()
    }
}

/// The presence relay.
pub struct RelayServer {
    config: RelayConfig,
    hub: RoomHub,
    stats: Arc<RwLock<RelayStats>>,
    leases: Arc<Mutex<SessionLeases>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = RoomHub::new(config.room_buffer);
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            leases: Arc::new(Mutex::new(SessionLeases::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await.map_err(io_error)?;
        log::info!("presence relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(io_error)?;
            log::debug!("new TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let leases = self.leases.clone();
            let member_buffer = self.config.member_buffer;
            let window = self.config.resume_window();
            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, hub, stats, leases, member_buffer, window).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: RoomHub,
        stats: Arc<RwLock<RelayStats>>,
        leases: Arc<Mutex<SessionLeases>>,
        member_buffer: usize,
        window: Duration,
    ) -> Result<(), TransportError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await.map_err(io_error)?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = match Self::handshake(&mut ws_sender, &mut ws_receiver, addr, &leases, window).await {
            Ok(Some((session, user))) => {
                log::info!("session {session} ({}) connected from {addr}", user.id);
                let result = Self::session_loop(
                    &mut ws_sender,
                    &mut ws_receiver,
                    &hub,
                    &stats,
                    member_buffer,
                    session,
                    &user,
                )
                .await;
                leases.lock().await.detach(session, Instant::now());
                result
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        stats.write().await.active_connections -= 1;
        result
    }

    /// Wait for `Hello` and answer `Welcome`. `None` when the peer went
    /// away or sent something else first.
    async fn handshake<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        addr: SocketAddr,
        leases: &Mutex<SessionLeases>,
        window: Duration,
    ) -> Result<Option<(SessionId, UserProfile)>, TransportError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = ws_receiver.next().await {
            let data = match msg.map_err(io_error)? {
                Message::Binary(data) => data,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            return match Frame::decode(&data) {
                Ok(Frame::Hello { user, resume }) if !user.id.as_str().is_empty() && !user.name.trim().is_empty() => {
                    let ticket = leases.lock().await.attach(&user.id, resume, Instant::now(), window);
                    if let Err(e) = send_frame(ws_sender, &Frame::Welcome { ticket }).await {
                        leases.lock().await.detach(ticket.session_id, Instant::now());
                        return Err(e);
                    }
                    Ok(Some((ticket.session_id, user)))
                }
                Ok(Frame::Hello { .. }) => {
                    let reason = "hello without user id or name".to_string();
                    send_frame(ws_sender, &Frame::Error { reason }).await?;
                    Ok(None)
                }
                Ok(other) => {
                    log::warn!("{addr} sent {other:?} before hello");
                    let reason = "expected hello".to_string();
                    send_frame(ws_sender, &Frame::Error { reason }).await?;
                    Ok(None)
                }
                Err(e) => {
                    log::warn!("undecodable handshake from {addr}: {e}");
                    Ok(None)
                }
            };
        }
        Ok(None)
    }

    async fn session_loop<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        hub: &RoomHub,
        stats: &RwLock<RelayStats>,
        member_buffer: usize,
        session: SessionId,
        user: &UserProfile,
    ) -> Result<(), TransportError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let (outbox, mut deliveries) = mpsc::channel::<Envelope>(member_buffer.max(1));
        let mut joined: HashSet<RoomId> = HashSet::new();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(io_error(e));
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("session {session} closed its connection");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("websocket error on session {session}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };
                    stats.write().await.total_frames += 1;

                    let frame = match Frame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("discarding frame from session {session}: {e}");
                            stats.write().await.rejected_frames += 1;
                            continue;
                        }
                    };
                    let reply = match frame {
                        Frame::Join { room } => match RoomId::new(room.entity_type(), room.entity_id()) {
                            Ok(room) => {
                                hub.join(&room, session, outbox.clone()).await;
                                joined.insert(room);
                                None
                            }
                            Err(e) => Some(e.to_string()),
                        },
                        Frame::Leave { room } => {
                            if joined.remove(&room) {
                                hub.leave(&room, session).await;
                            }
                            None
                        }
                        Frame::Publish { room, event } => {
                            if !joined.contains(&room) {
                                Some(format!("not a member of {room}"))
                            } else {
                                let envelope = Envelope::new(room, session, user.id.clone(), event);
                                match envelope.validate() {
                                    Ok(()) => {
                                        hub.publish(envelope).await;
                                        None
                                    }
                                    Err(e) => {
                                        log::warn!("rejecting publish from session {session}: {e}");
                                        Some(e.to_string())
                                    }
                                }
                            }
                        }
                        Frame::Ping => {
                            if let Err(e) = send_frame(ws_sender, &Frame::Pong).await {
                                break Err(e);
                            }
                            None
                        }
                        other => {
                            log::debug!("unexpected frame from session {session}: {other:?}");
                            None
                        }
                    };
                    if let Some(reason) = reply {
                        stats.write().await.rejected_frames += 1;
                        if let Err(e) = send_frame(ws_sender, &Frame::Error { reason }).await {
                            break Err(e);
                        }
                    }
                }
                Some(envelope) = deliveries.recv() => {
                    if let Err(e) = send_frame(ws_sender, &Frame::Deliver { envelope }).await {
                        break Err(e);
                    }
                }
            }
        };

        for room in joined {
            hub.leave(&room, session).await;
        }
        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn hub_stats(&self) -> HubStats {
        self.hub.stats().await
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
