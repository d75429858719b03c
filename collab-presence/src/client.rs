//! WebSocket client transport for the presence relay.
//!
//! Provides:
//! - `Hello`/`Welcome` handshake yielding the session id
//! - A writer task fed through an mpsc channel
//! - A reader task routing `Deliver` frames to per-room subscribers
//! - `reconnect()` that presents the relay's resume ticket to keep the
//!   same session id
//!
//! When the socket drops, the reader flips the link status to
//! `Disconnected`; the session driver then schedules reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::identity::{SessionId, UserProfile};
use crate::protocol::{Envelope, Frame, PresenceEvent, ResumeTicket};
use crate::room::RoomId;
use crate::server::{io_error, send_frame};
use crate::transport::{LinkStatus, RoomDemux, Transport};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct WsLink {
    user: Option<UserProfile>,
    ticket: Option<ResumeTicket>,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsLink {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Relay client.
pub struct WsTransport {
    url: String,
    demux: RoomDemux,
    status: Arc<watch::Sender<LinkStatus>>,
    link: Mutex<WsLink>,
}

impl WsTransport {
    /// A transport for the relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(url: impl Into<String>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Idle);
        Self {
            url: url.into(),
            demux: RoomDemux::default(),
            status: Arc::new(status),
            link: Mutex::new(WsLink::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the socket, run the handshake and start the I/O tasks.
    async fn open(
        &self,
        link: &mut WsLink,
        user: &UserProfile,
        resume: Option<ResumeTicket>,
    ) -> Result<ResumeTicket, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(io_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = Frame::Hello {
            user: user.clone(),
            resume,
        };
        send_frame(&mut ws_writer, &hello).await?;

        let handshake = async {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg.map_err(io_error)? {
                    Message::Binary(data) => data,
                    Message::Close(_) => break,
                    _ => continue,
                };
                return match Frame::decode(&data)? {
                    Frame::Welcome { ticket } => Ok(ticket),
                    Frame::Error { reason } => Err(TransportError::Rejected(reason)),
                    other => Err(TransportError::Rejected(format!("unexpected {other:?}"))),
                };
            }
            Err::<ResumeTicket, TransportError>(TransportError::ConnectionClosed)
        };
        let ticket = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Rejected("handshake timed out".into()))??;

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: route deliveries, report loss
        let demux = self.demux.clone();
        let status = self.status.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Deliver { envelope }) => {
                            demux.route(envelope).await;
                        }
                        Ok(Frame::Pong) => log::trace!("pong from relay"),
                        Ok(Frame::Error { reason }) => log::warn!("relay refused a frame: {reason}"),
                        Ok(other) => log::debug!("unexpected frame from relay: {other:?}"),
                        Err(e) => log::warn!("discarding undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            status.send_if_modified(|current| {
                if *current == LinkStatus::Connected {
                    log::warn!("connection to relay lost");
                    *current = LinkStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
        });

        link.abort_tasks();
        link.tasks = vec![writer, reader];
        link.outgoing = Some(out_tx);
        Ok(ticket)
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if *self.status.borrow() != LinkStatus::Connected {
            return Err(TransportError::Disconnected);
        }
        let outgoing = {
            let link = self.link.lock().await;
            link.outgoing.clone().ok_or(TransportError::Disconnected)?
        };
        let encoded = frame.encode()?;
        outgoing
            .send(encoded)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    /// Application-level keepalive; the relay answers with `Pong`.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.send(&Frame::Ping).await
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, user: &UserProfile) -> Result<SessionId, TransportError> {
        let mut link = self.link.lock().await;
        let ticket = self.open(&mut link, user, None).await?;
        link.user = Some(user.clone());
        link.ticket = Some(ticket);
        self.status.send_replace(LinkStatus::Connected);
        log::info!("connected to {} as session {}", self.url, ticket.session_id);
        Ok(ticket.session_id)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if *self.status.borrow() == LinkStatus::Closed {
            return Err(TransportError::ConnectionClosed);
        }
        let mut link = self.link.lock().await;
        let (Some(user), Some(previous)) = (link.user.clone(), link.ticket) else {
            return Err(TransportError::Disconnected);
        };
        link.abort_tasks();
        link.outgoing = None;
        let ticket = self.open(&mut link, &user, Some(previous)).await?;
        if ticket.session_id != previous.session_id {
            log::warn!(
                "relay assigned session {} instead of resuming {}",
                ticket.session_id,
                previous.session_id
            );
        }
        link.ticket = Some(ticket);
        self.status.send_replace(LinkStatus::Connected);
        Ok(())
    }

    async fn join_room(&self, room: &RoomId) -> Result<(), TransportError> {
        self.send(&Frame::Join { room: room.clone() }).await
    }

    async fn leave_room(&self, room: &RoomId) -> Result<(), TransportError> {
        self.send(&Frame::Leave { room: room.clone() }).await
    }

    async fn publish(&self, room: &RoomId, event: PresenceEvent) -> Result<(), TransportError> {
        event.validate()?;
        self.send(&Frame::Publish {
            room: room.clone(),
            event,
        })
        .await
    }

    async fn subscribe(&self, room: &RoomId) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        Ok(self.demux.subscribe(room).await)
    }

    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        self.status.send_replace(LinkStatus::Closed);
        let mut link = self.link.lock().await;
        // dropping the sender lets the writer send a close frame
        link.outgoing = None;
        if let Some(reader) = link.tasks.pop() {
            reader.abort();
        }
        link.tasks.clear();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.link.get_mut().abort_tasks();
    }
}
