//! Presence events and the client ↔ relay wire frames.
//!
//! Frames are bincode-encoded. Every event delivered to a client travels
//! inside an [`Envelope`] stamped by the transport with the sender's
//! session and user, so a client cannot publish on behalf of another.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::identity::{SessionId, UserId, UserProfile};
use crate::room::RoomId;

/// Events exchanged inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Viewport-relative cursor position (debounced, best effort).
    CursorMove { x: f32, y: f32 },
    /// The sender started or stopped editing the room's entity.
    EditingStatus { is_editing: bool },
    /// The sender entered the room.
    PresenceJoin {
        user_id: UserId,
        display_name: String,
        avatar_url: Option<String>,
    },
    /// The sender left the room explicitly.
    PresenceLeave { user_id: UserId },
    /// Keeps the sender's presence from expiring.
    Heartbeat,
}

/// How hard the runtime tries to deliver an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dropped on failure; the next event supersedes it.
    BestEffort,
    /// Retried once on failure.
    RetryOnce,
}

impl PresenceEvent {
    pub fn join(profile: &UserProfile) -> Self {
        PresenceEvent::PresenceJoin {
            user_id: profile.id.clone(),
            display_name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            PresenceEvent::EditingStatus { .. } => Delivery::RetryOnce,
            _ => Delivery::BestEffort,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PresenceEvent::CursorMove { .. } => "cursor_move",
            PresenceEvent::EditingStatus { .. } => "editing_status",
            PresenceEvent::PresenceJoin { .. } => "presence_join",
            PresenceEvent::PresenceLeave { .. } => "presence_leave",
            PresenceEvent::Heartbeat => "heartbeat",
        }
    }

    /// Reject payloads that must not reach a presence store.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            PresenceEvent::CursorMove { x, y } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(ProtocolError::Malformed(format!(
                        "non-finite cursor ({x}, {y})"
                    )));
                }
                if *x < 0.0 || *y < 0.0 {
                    return Err(ProtocolError::Malformed(format!(
                        "cursor outside viewport ({x}, {y})"
                    )));
                }
                Ok(())
            }
            PresenceEvent::PresenceJoin { user_id, display_name, .. } => {
                if user_id.as_str().is_empty() {
                    return Err(ProtocolError::Malformed("empty user id".into()));
                }
                if display_name.trim().is_empty() {
                    return Err(ProtocolError::Malformed("empty display name".into()));
                }
                Ok(())
            }
            PresenceEvent::PresenceLeave { user_id } if user_id.as_str().is_empty() => {
                Err(ProtocolError::Malformed("empty user id".into()))
            }
            _ => Ok(()),
        }
    }
}

/// An event as delivered to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub room: RoomId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub event: PresenceEvent,
}

impl Envelope {
    pub fn new(room: RoomId, session_id: SessionId, user_id: UserId, event: PresenceEvent) -> Self {
        Self {
            room,
            session_id,
            user_id,
            event,
        }
    }

    /// Validate the payload against the stamped sender.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        RoomId::new(self.room.entity_type(), self.room.entity_id())?;
        self.event.validate()?;
        match &self.event {
            PresenceEvent::PresenceJoin { user_id, .. } | PresenceEvent::PresenceLeave { user_id }
                if *user_id != self.user_id =>
            {
                Err(ProtocolError::Malformed(format!(
                    "{} for user {user_id} sent by {}",
                    self.event.name(),
                    self.user_id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Proof of ownership of a relay session. Issued in `Welcome`, presented
/// in `Hello` to get the same session id back after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTicket {
    pub session_id: SessionId,
    pub token: Uuid,
}

impl ResumeTicket {
    /// A fresh ticket with a random token.
    pub fn issue(session_id: SessionId) -> Self {
        Self {
            session_id,
            token: Uuid::new_v4(),
        }
    }
}

/// Client ↔ relay frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First client frame. `resume` asks for the previous session id
    /// across a reconnect.
    Hello {
        user: UserProfile,
        resume: Option<ResumeTicket>,
    },
    /// Relay's answer to `Hello`: the session granted and the ticket to
    /// resume it later.
    Welcome { ticket: ResumeTicket },
    Join { room: RoomId },
    Leave { room: RoomId },
    Publish { room: RoomId, event: PresenceEvent },
    Deliver { envelope: Envelope },
    Ping,
    Pong,
    /// Relay refused a frame.
    Error { reason: String },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}
