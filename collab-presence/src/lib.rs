//! # collab-presence: live presence and edit-conflict awareness
//!
//! Shows who else is looking at a shared entity (project, requirement,
//! document, prototype), where their cursor is, and warns when two users
//! are about to edit the same thing. Warnings are advisory: nobody is
//! ever locked out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   Transport    ┌──────────────┐
//! │ Collaboration        │ ◄────────────► │ RelayServer  │
//! │  └─ SessionCore      │  bincode Frame │  └─ RoomHub  │
//! │      ├─ RoomRegistry │                │   (1 actor   │
//! │      ├─ PresenceStore│                │    per room) │
//! │      ├─ Cursor-      │                └──────────────┘
//! │      │  Broadcaster  │
//! │      └─ EditConflict-│
//! │         Detector     │
//! └──────────┬───────────┘
//!            ▼
//!      CollabEvent → host UI
//! ```
//!
//! ## Modules
//!
//! - [`room`]: room ids and the reference-counted room registry
//! - [`presence`]: per-session presence records with TTL eviction
//! - [`cursor`]: trailing-edge cursor debounce
//! - [`conflict`]: advisory edit-conflict state machine
//! - [`color`]: deterministic cursor colors
//! - [`lifecycle`]: sans-IO session state and reconnect backoff
//! - [`runtime`]: async driver and host-facing handles
//! - [`transport`]: the transport contract
//! - [`local`] / [`client`] / [`server`]: in-process, WebSocket client
//!   and WebSocket relay transports
//! - [`hub`]: room actors shared by the in-process transport and relay
//! - [`protocol`]: events and wire frames

pub mod client;
pub mod color;
pub mod config;
pub mod conflict;
pub mod cursor;
pub mod error;
pub mod features;
pub mod hub;
pub mod identity;
pub mod lifecycle;
pub mod local;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod runtime;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::WsTransport;
pub use color::{color_for, CursorColor, PALETTE};
pub use config::{BackoffConfig, CollabConfig, RelayConfig};
pub use conflict::{AdvisoryReason, ConflictEvent, EditAdvisory, EditConflictDetector, EditState, CONFLICT_MESSAGE};
pub use cursor::{ContainerRect, CursorBroadcaster, Debouncer};
pub use error::{CollabError, ProtocolError, TransportError};
pub use features::{CollabFeature, FeatureSet};
pub use hub::{HubStats, RoomHub};
pub use identity::{
    FixedViewMode, IdentityProvider, Session, SessionId, StaticIdentity, UserId, UserProfile,
    ViewMode, ViewModeSource,
};
pub use lifecycle::{Backoff, CollabEvent, ConnectionState, Effect, RemoteCursor, SessionCore};
pub use local::LocalTransport;
pub use presence::{Author, CursorPosition, PresenceRecord, PresenceStore};
pub use protocol::{Delivery, Envelope, Frame, PresenceEvent, ResumeTicket};
pub use room::{EntityKind, Release, RoomId, RoomRegistry, Subscription};
pub use runtime::{Collaboration, ContentCollaborator};
pub use server::{RelayServer, RelayStats};
pub use transport::{LinkStatus, RoomDemux, Transport};
