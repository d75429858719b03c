//! Identities and the consumed host interfaces (identity provider,
//! view-mode preference).

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Stable application user id, as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One live connection. A user may hold several (tabs, devices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the identity provider knows about the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// The local session as established by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub connected_at: Instant,
}

impl Session {
    pub fn new(session_id: SessionId, profile: &UserProfile, connected_at: Instant) -> Self {
        Self {
            session_id,
            user_id: profile.id.clone(),
            display_name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
            connected_at,
        }
    }
}

/// Host authentication surface.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> UserProfile;
}

/// An identity provider that always returns the same profile.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub UserProfile);

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> UserProfile {
        self.0.clone()
    }
}

/// Which collaborator indicators the user wants rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewMode {
    #[default]
    All,
    JustMe,
    Collaborators,
}

impl ViewMode {
    /// Whether remote cursors and badges should be drawn given the number
    /// of distinct users (local user included) present in the room.
    pub fn shows_remote(self, active_users: usize) -> bool {
        match self {
            ViewMode::All => true,
            ViewMode::JustMe => false,
            ViewMode::Collaborators => active_users >= 2,
        }
    }
}

/// Read-only access to the host's view-mode preference.
pub trait ViewModeSource: Send + Sync {
    fn view_mode(&self) -> ViewMode;
}

/// A fixed preference.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedViewMode(pub ViewMode);

impl ViewModeSource for FixedViewMode {
    fn view_mode(&self) -> ViewMode {
        self.0
    }
}

impl ViewModeSource for watch::Receiver<ViewMode> {
    fn view_mode(&self) -> ViewMode {
        *self.borrow()
    }
}
