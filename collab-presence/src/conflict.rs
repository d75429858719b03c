//! Advisory edit-conflict detection.
//!
//! Per (room, local session) the detector moves `Idle → Focused → Idle`.
//! A conflict only ever produces a warning: the local user keeps typing
//! and the local `is_editing` flag is set regardless.
//!
//! Sessions belonging to the local user are never counted as holders, so
//! two tabs of the same person do not warn about each other.
//!
//! The advisory keeps the observed boolean contract: `allowed == false`
//! means "someone else is editing" after a focus or click, and "you are
//! no longer editing" after a blur. [`AdvisoryReason`] tells the two apart.

use std::collections::BTreeSet;

use crate::identity::{SessionId, UserId};
use crate::presence::PresenceStore;
use crate::protocol::PresenceEvent;
use crate::room::RoomId;

pub const CONFLICT_MESSAGE: &str = "Another user is currently editing this content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Focused,
}

/// Why an advisory was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvisoryReason {
    /// Other users hold the entity.
    Conflict,
    /// Nobody else is editing.
    Clear,
    /// The local user blurred the editor.
    NotEditing,
}

/// What the host is told after focus, blur or click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditAdvisory {
    pub allowed: bool,
    pub message: Option<String>,
    pub reason: AdvisoryReason,
}

impl EditAdvisory {
    pub(crate) fn conflict() -> Self {
        Self {
            allowed: false,
            message: Some(CONFLICT_MESSAGE.to_string()),
            reason: AdvisoryReason::Conflict,
        }
    }

    pub(crate) fn clear() -> Self {
        Self {
            allowed: true,
            message: None,
            reason: AdvisoryReason::Clear,
        }
    }

    pub(crate) fn not_editing() -> Self {
        Self {
            allowed: false,
            message: None,
            reason: AdvisoryReason::NotEditing,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.reason == AdvisoryReason::Conflict
    }
}

/// Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEvent {
    pub room_id: RoomId,
    pub holding_session_ids: BTreeSet<SessionId>,
    pub requesting_session_id: SessionId,
}

/// Result of a focus/blur/click transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    pub advisory: Option<EditAdvisory>,
    /// `editing_status` to publish, if the editing flag changed.
    pub publish: Option<PresenceEvent>,
    /// New local editing flag, if it changed.
    pub editing: Option<bool>,
}

#[derive(Debug)]
pub struct EditConflictDetector {
    room: RoomId,
    session_id: SessionId,
    user_id: UserId,
    state: EditState,
}

impl EditConflictDetector {
    pub fn new(room: RoomId, session_id: SessionId, user_id: UserId) -> Self {
        Self {
            room,
            session_id,
            user_id,
            state: EditState::Idle,
        }
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn is_editing(&self) -> bool {
        self.state == EditState::Focused
    }

    /// Other users' sessions currently editing the room, if any.
    pub fn detect(&self, store: &PresenceStore) -> Option<ConflictEvent> {
        let holding: BTreeSet<SessionId> = store
            .editing_in(&self.room)
            .filter(|r| r.user_id != self.user_id)
            .map(|r| r.session_id)
            .collect();
        if holding.is_empty() {
            return None;
        }
        Some(ConflictEvent {
            room_id: self.room.clone(),
            holding_session_ids: holding,
            requesting_session_id: self.session_id,
        })
    }

    fn advise(&self, store: &PresenceStore) -> EditAdvisory {
        match self.detect(store) {
            Some(conflict) => {
                log::info!(
                    "edit conflict in {}: {} other session(s) editing",
                    conflict.room_id,
                    conflict.holding_session_ids.len()
                );
                EditAdvisory::conflict()
            }
            None => EditAdvisory::clear(),
        }
    }

    /// The editable surface gained focus.
    pub fn on_focus(&mut self, store: &PresenceStore) -> Transition {
        let advisory = Some(self.advise(store));
        if self.state == EditState::Focused {
            return Transition { advisory, ..Transition::default() };
        }
        self.state = EditState::Focused;
        Transition {
            advisory,
            publish: Some(PresenceEvent::EditingStatus { is_editing: true }),
            editing: Some(true),
        }
    }

    /// The editable surface lost focus.
    pub fn on_blur(&mut self) -> Transition {
        if self.state == EditState::Idle {
            return Transition::default();
        }
        self.state = EditState::Idle;
        Transition {
            advisory: Some(EditAdvisory::not_editing()),
            publish: Some(PresenceEvent::EditingStatus { is_editing: false }),
            editing: Some(false),
        }
    }

    /// A click without a focus change: surface the conflict state early,
    /// without touching the editing flag.
    pub fn on_click(&self, store: &PresenceStore) -> Transition {
        if self.state == EditState::Focused {
            return Transition::default();
        }
        Transition {
            advisory: Some(self.advise(store)),
            ..Transition::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Author;
    use crate::room::EntityKind;
    use tokio::time::Instant;

    fn room() -> RoomId {
        RoomId::for_entity(EntityKind::Requirement, 7)
    }

    fn detector(user: &str) -> (EditConflictDetector, Author) {
        let author = Author::new(SessionId::new(), UserId::new(user));
        (
            EditConflictDetector::new(room(), author.session_id, author.user_id.clone()),
            author,
        )
    }

    #[test]
    fn test_focus_without_holders_is_clear() {
        let store = PresenceStore::new();
        let (mut d, _) = detector("bob");
        let t = d.on_focus(&store);
        assert_eq!(t.advisory, Some(EditAdvisory::clear()));
        assert_eq!(t.publish, Some(PresenceEvent::EditingStatus { is_editing: true }));
        assert_eq!(t.editing, Some(true));
        assert_eq!(d.state(), EditState::Focused);
    }

    #[test]
    fn test_focus_with_other_user_editing_warns_but_still_edits() {
        let mut store = PresenceStore::new();
        let alice = Author::new(SessionId::new(), UserId::new("alice"));
        store.set_editing(&room(), &alice, true, Instant::now());

        let (mut d, _) = detector("bob");
        let t = d.on_focus(&store);
        let advisory = t.advisory.unwrap();
        assert!(!advisory.allowed);
        assert_eq!(advisory.message.as_deref(), Some(CONFLICT_MESSAGE));
        assert!(advisory.is_conflict());
        // advisory only: the local edit proceeds
        assert_eq!(t.editing, Some(true));
        assert!(d.is_editing());

        let conflict = d.detect(&store).unwrap();
        assert!(conflict.holding_session_ids.contains(&alice.session_id));
    }

    #[test]
    fn test_same_user_other_session_is_not_a_conflict() {
        let mut store = PresenceStore::new();
        let other_tab = Author::new(SessionId::new(), UserId::new("bob"));
        store.set_editing(&room(), &other_tab, true, Instant::now());

        let (mut d, _) = detector("bob");
        assert!(d.detect(&store).is_none());
        assert_eq!(d.on_focus(&store).advisory, Some(EditAdvisory::clear()));
    }

    #[test]
    fn test_blur_publishes_false_and_reports_not_editing() {
        let store = PresenceStore::new();
        let (mut d, _) = detector("bob");
        d.on_focus(&store);
        let t = d.on_blur();
        let advisory = t.advisory.unwrap();
        assert!(!advisory.allowed);
        assert_eq!(advisory.reason, AdvisoryReason::NotEditing);
        assert_eq!(t.publish, Some(PresenceEvent::EditingStatus { is_editing: false }));
        assert_eq!(d.state(), EditState::Idle);
    }

    #[test]
    fn test_blur_while_idle_is_noop() {
        let (mut d, _) = detector("bob");
        assert_eq!(d.on_blur(), Transition::default());
    }

    #[test]
    fn test_refocus_does_not_republish() {
        let store = PresenceStore::new();
        let (mut d, _) = detector("bob");
        d.on_focus(&store);
        let again = d.on_focus(&store);
        assert!(again.publish.is_none());
        assert!(again.advisory.is_some());
    }

    #[test]
    fn test_click_surfaces_conflict_without_editing() {
        let mut store = PresenceStore::new();
        let alice = Author::new(SessionId::new(), UserId::new("alice"));
        store.set_editing(&room(), &alice, true, Instant::now());

        let (d, _) = detector("bob");
        let t = d.on_click(&store);
        assert!(t.advisory.unwrap().is_conflict());
        assert!(t.publish.is_none());
        assert!(t.editing.is_none());
        assert_eq!(d.state(), EditState::Idle);
    }

    #[test]
    fn test_conflict_clears_once_holder_stops() {
        let mut store = PresenceStore::new();
        let alice = Author::new(SessionId::new(), UserId::new("alice"));
        store.set_editing(&room(), &alice, true, Instant::now());
        let (mut d, _) = detector("bob");
        assert!(d.on_focus(&store).advisory.unwrap().is_conflict());
        d.on_blur();

        store.set_editing(&room(), &alice, false, Instant::now());
        assert_eq!(d.on_focus(&store).advisory, Some(EditAdvisory::clear()));
    }
}
