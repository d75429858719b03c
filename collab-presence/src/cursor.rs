//! Trailing-edge cursor debouncing.
//!
//! Every pointer move restarts the quiet window; only the last position
//! seen when the window finally elapses is published. Outbound cursor
//! traffic is therefore bounded to one message per window per room,
//! whatever the input event rate.
//!
//! The timer is explicit state owned by the broadcaster: the session
//! driver sleeps until [`CursorBroadcaster::deadline`] and then calls
//! [`CursorBroadcaster::poll`]. Cancelling (or dropping the broadcaster
//! on room leave) removes the deadline, so nothing fires after teardown.

use std::time::Duration;

use tokio::time::Instant;

use crate::presence::CursorPosition;
use crate::protocol::PresenceEvent;
use crate::room::RoomId;

/// A cancelable trailing-edge debounce timer carrying the latest value.
#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: None }
    }

    /// Replace the pending value and restart the window from `now`.
    pub fn schedule(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.window));
    }

    /// When the pending value becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, due)| *due)
    }

    /// Take the pending value if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.pending {
            Some((_, due)) if now >= due => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    /// Drop the pending value. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Bounding rectangle of the tracked container, in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl ContainerRect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self { left, top, width, height }
    }

    /// Container-relative position of a client-space pointer, or `None`
    /// when the pointer is outside the container.
    pub fn relative(&self, client_x: f32, client_y: f32) -> Option<CursorPosition> {
        let x = client_x - self.left;
        let y = client_y - self.top;
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if x < 0.0 || y < 0.0 || x > self.width || y > self.height {
            return None;
        }
        Some(CursorPosition::new(x, y))
    }
}

/// Debounces the local pointer for one room.
#[derive(Debug)]
pub struct CursorBroadcaster {
    room: RoomId,
    debouncer: Debouncer<CursorPosition>,
    published: u64,
}

impl CursorBroadcaster {
    pub fn new(room: RoomId, window: Duration) -> Self {
        Self {
            room,
            debouncer: Debouncer::new(window),
            published: 0,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Raw pointer move in client space. Returns `false` when the pointer
    /// is outside the container and nothing was scheduled.
    pub fn pointer_move(&mut self, rect: &ContainerRect, client_x: f32, client_y: f32, now: Instant) -> bool {
        match rect.relative(client_x, client_y) {
            Some(position) => {
                self.schedule_send(position, now);
                true
            }
            None => false,
        }
    }

    /// Restart the quiet window with `position` as the pending value.
    pub fn schedule_send(&mut self, position: CursorPosition, now: Instant) {
        self.debouncer.schedule(position, now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// The `cursor_move` to publish, once the quiet window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<(CursorPosition, PresenceEvent)> {
        let position = self.debouncer.take_due(now)?;
        self.published += 1;
        Some((
            position,
            PresenceEvent::CursorMove {
                x: position.x,
                y: position.y,
            },
        ))
    }

    pub fn cancel(&mut self) -> bool {
        self.debouncer.cancel()
    }

    /// Cursor events emitted so far.
    pub fn published(&self) -> u64 {
        self.published
    }
}
