//! Async runtime around [`SessionCore`].
//!
//! [`Collaboration::connect`] opens the transport, spawns the session
//! driver and hands back a cloneable handle plus the receiver of
//! [`CollabEvent`]s. Host components call [`Collaboration::join`] to get
//! a [`ContentCollaborator`] for the entity they render; dropping it
//! releases that join.
//!
//! The driver is a single task: host commands, inbound envelopes, the
//! heartbeat and reaper intervals, the cursor/retry deadline and link
//! status changes are all serialized through one `select!` loop, so the
//! core never sees concurrent mutation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::CollabConfig;
use crate::cursor::ContainerRect;
use crate::error::{CollabError, TransportError};
use crate::identity::{IdentityProvider, Session, ViewModeSource};
use crate::lifecycle::{Backoff, Effect, SessionCore};
use crate::presence::PresenceRecord;
use crate::protocol::{Delivery, Envelope};
use crate::room::RoomId;
use crate::transport::{LinkStatus, Transport};

pub use crate::lifecycle::{CollabEvent, ConnectionState, RemoteCursor};

enum Command {
    Join {
        room: RoomId,
        reply: oneshot::Sender<u64>,
    },
    Release {
        handle: u64,
    },
    PointerMove {
        room: RoomId,
        rect: ContainerRect,
        x: f32,
        y: f32,
    },
    MoveCursor {
        room: RoomId,
        x: f32,
        y: f32,
    },
    Focus(RoomId),
    Blur(RoomId),
    Click(RoomId),
    RemoteCursors {
        room: RoomId,
        reply: oneshot::Sender<Vec<RemoteCursor>>,
    },
    Snapshot {
        room: RoomId,
        reply: oneshot::Sender<Vec<PresenceRecord>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running collaboration session.
#[derive(Clone)]
pub struct Collaboration {
    commands: mpsc::UnboundedSender<Command>,
    session: Session,
    state: watch::Receiver<ConnectionState>,
}

impl Collaboration {
    /// Connect the current user and start the session driver.
    pub async fn connect<T, V>(
        transport: Arc<T>,
        identity: &dyn IdentityProvider,
        view_mode: V,
        config: CollabConfig,
    ) -> Result<(Self, mpsc::Receiver<CollabEvent>), CollabError>
    where
        T: Transport,
        V: ViewModeSource + 'static,
    {
        let features = config.validate()?;
        let profile = identity.current_user();
        let mut link = transport.link_status();
        let session_id = transport.connect(&profile).await?;
        link.borrow_and_update();

        let session = Session::new(session_id, &profile, Instant::now());
        log::info!("session {} connected as {}", session.session_id, session.user_id);

        let core = SessionCore::new(session.clone(), &config, features);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.event_buffer.max(1));
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            transport,
            core,
            view_mode: Box::new(view_mode),
            events: events_tx,
            state: state_tx,
            inbox: inbox_tx,
            attempts: attempts_tx,
            forwarders: HashMap::new(),
            reconnect: None,
            config,
        };
        tokio::spawn(driver.run(commands_rx, inbox_rx, attempts_rx, link));

        Ok((
            Self {
                commands: commands_tx,
                session,
                state: state_rx,
            },
            events_rx,
        ))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Join the room of one rendered entity.
    ///
    /// Joining while the link is down succeeds; the join is replayed once
    /// the session reconnects.
    pub async fn join(&self, room: RoomId) -> Result<ContentCollaborator, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join {
                room: room.clone(),
                reply,
            })
            .map_err(|_| CollabError::SessionClosed)?;
        let handle = rx.await.map_err(|_| CollabError::SessionClosed)?;
        Ok(ContentCollaborator {
            room,
            handle: Some(handle),
            commands: self.commands.clone(),
        })
    }

    /// Leave every room, clear the editing flag remotely and close the
    /// transport.
    pub async fn disconnect(&self) -> Result<(), CollabError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { reply })
            .map_err(|_| CollabError::SessionClosed)?;
        rx.await.map_err(|_| CollabError::SessionClosed)
    }
}

/// Host surface for one collaboratively rendered entity.
pub struct ContentCollaborator {
    room: RoomId,
    handle: Option<u64>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ContentCollaborator {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    fn send(&self, command: Command) -> Result<(), CollabError> {
        self.commands.send(command).map_err(|_| CollabError::SessionClosed)
    }

    /// Raw pointer move in client coordinates over the container `rect`.
    pub fn pointer_move(&self, rect: ContainerRect, client_x: f32, client_y: f32) -> Result<(), CollabError> {
        self.send(Command::PointerMove {
            room: self.room.clone(),
            rect,
            x: client_x,
            y: client_y,
        })
    }

    /// Container-relative cursor position.
    pub fn move_cursor(&self, x: f32, y: f32) -> Result<(), CollabError> {
        self.send(Command::MoveCursor {
            room: self.room.clone(),
            x,
            y,
        })
    }

    pub fn focus(&self) -> Result<(), CollabError> {
        self.send(Command::Focus(self.room.clone()))
    }

    pub fn blur(&self) -> Result<(), CollabError> {
        self.send(Command::Blur(self.room.clone()))
    }

    pub fn click(&self) -> Result<(), CollabError> {
        self.send(Command::Click(self.room.clone()))
    }

    /// Cursors to draw, after self-exclusion and view-mode filtering.
    pub async fn remote_cursors(&self) -> Result<Vec<RemoteCursor>, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoteCursors {
            room: self.room.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CollabError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<PresenceRecord>, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            room: self.room.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CollabError::SessionClosed)
    }

    /// Release this join now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            // a closed session has nothing left to release
            let _ = self.commands.send(Command::Release { handle });
        }
    }
}

impl Drop for ContentCollaborator {
    fn drop(&mut self) {
        self.release();
    }
}

struct Driver<T: Transport> {
    transport: Arc<T>,
    core: SessionCore,
    view_mode: Box<dyn ViewModeSource>,
    events: mpsc::Sender<CollabEvent>,
    state: watch::Sender<ConnectionState>,
    inbox: mpsc::Sender<Envelope>,
    attempts: mpsc::UnboundedSender<u32>,
    forwarders: HashMap<RoomId, JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    config: CollabConfig,
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::Receiver<Envelope>,
        mut attempts: mpsc::UnboundedReceiver<u32>,
        mut link: watch::Receiver<LinkStatus>,
    ) {
        let start = Instant::now();
        let mut heartbeat = time::interval_at(
            start + self.config.heartbeat_interval(),
            self.config.heartbeat_interval(),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reaper = time::interval_at(
            start + self.config.reaper_interval(),
            self.config.reaper_interval(),
        );
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut link_open = true;

        loop {
            let deadline = self.core.next_deadline();
            // attempt reports must be seen before the link flips back
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some(command) = command else {
                        log::debug!("all handles of session {} dropped", self.core.session().session_id);
                        self.shutdown().await;
                        break;
                    };
                    if !self.on_command(command).await {
                        break;
                    }
                }
                Some(envelope) = inbox.recv() => {
                    let effects = self.core.apply_remote(envelope, Instant::now());
                    self.execute(effects).await;
                }
                _ = heartbeat.tick() => {
                    let effects = self.core.heartbeat(Instant::now());
                    self.execute(effects).await;
                }
                _ = reaper.tick() => {
                    let effects = self.core.reap(Instant::now());
                    self.execute(effects).await;
                }
                _ = time::sleep_until(deadline.unwrap_or(start)), if deadline.is_some() => {
                    let now = Instant::now();
                    let mut effects = self.core.flush_cursors(now);
                    effects.extend(self.core.due_retries(now));
                    self.execute(effects).await;
                }
                Some(attempt) = attempts.recv() => {
                    let effects = self.core.on_reconnecting(attempt);
                    self.execute(effects).await;
                }
                changed = link.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                        continue;
                    }
                    let status = *link.borrow_and_update();
                    self.on_link(status).await;
                }
            }
        }

        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }

    /// Returns `false` once the session is finished.
    async fn on_command(&mut self, command: Command) -> bool {
        let now = Instant::now();
        match command {
            Command::Join { room, reply } => {
                let (handle, effects) = self.core.join_local(&room, now);
                self.execute(effects).await;
                let _ = reply.send(handle);
            }
            Command::Release { handle } => {
                let effects = self.core.release_local(handle);
                self.execute(effects).await;
            }
            Command::PointerMove { room, rect, x, y } => {
                self.core.pointer_move(&room, &rect, x, y, now);
            }
            Command::MoveCursor { room, x, y } => {
                self.core.cursor_move(&room, x, y, now);
            }
            Command::Focus(room) => {
                let effects = self.core.focus(&room, now);
                self.execute(effects).await;
            }
            Command::Blur(room) => {
                let effects = self.core.blur(&room, now);
                self.execute(effects).await;
            }
            Command::Click(room) => {
                let effects = self.core.click(&room, now);
                self.execute(effects).await;
            }
            Command::RemoteCursors { room, reply } => {
                let _ = reply.send(self.core.remote_cursors(&room, self.view_mode.view_mode()));
            }
            Command::Snapshot { room, reply } => {
                let _ = reply.send(self.core.snapshot(&room));
            }
            Command::Disconnect { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
        let effects = self.core.disconnect();
        self.execute(effects).await;
        self.transport.close().await;
    }

    async fn on_link(&mut self, status: LinkStatus) {
        match status {
            LinkStatus::Connected => {
                self.reconnect = None;
                let effects = self.core.on_reconnected(Instant::now());
                self.execute(effects).await;
            }
            LinkStatus::Disconnected => {
                let effects = self.core.on_disconnected();
                self.execute(effects).await;
                self.spawn_reconnect();
            }
            LinkStatus::Closed => {
                let effects = self.core.on_disconnected();
                self.execute(effects).await;
            }
            LinkStatus::Idle => {}
        }
    }

    fn spawn_reconnect(&mut self) {
        if self.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let transport = self.transport.clone();
        let attempts = self.attempts.clone();
        let mut backoff = Backoff::new(&self.config.backoff);
        self.reconnect = Some(tokio::spawn(async move {
            loop {
                time::sleep(backoff.next_delay()).await;
                let attempt = backoff.attempt();
                if attempts.send(attempt).is_err() {
                    break;
                }
                match transport.reconnect().await {
                    Ok(()) => {
                        log::info!("reconnected after {attempt} attempt(s)");
                        break;
                    }
                    Err(TransportError::ConnectionClosed) => break,
                    Err(e) => log::warn!("reconnect attempt {attempt} failed: {e}"),
                }
            }
        }));
    }

    async fn subscribe(&mut self, room: RoomId) {
        match self.transport.subscribe(&room).await {
            Ok(mut rx) => {
                let inbox = self.inbox.clone();
                let task = tokio::spawn(async move {
                    while let Some(envelope) = rx.recv().await {
                        if inbox.send(envelope).await.is_err() {
                            break;
                        }
                    }
                });
                if let Some(old) = self.forwarders.insert(room, task) {
                    old.abort();
                }
            }
            Err(e) => log::warn!("subscribe to {room} failed: {e}"),
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Subscribe(room) => self.subscribe(room).await,
                Effect::Unsubscribe(room) => {
                    if let Some(task) = self.forwarders.remove(&room) {
                        task.abort();
                    }
                }
                Effect::JoinRoom(room) => {
                    if let Err(e) = self.transport.join_room(&room).await {
                        log::warn!("join of {room} failed, will retry on reconnect: {e}");
                    }
                }
                Effect::LeaveRoom(room) => {
                    if let Err(e) = self.transport.leave_room(&room).await {
                        log::debug!("leave of {room} failed: {e}");
                    }
                }
                Effect::Publish { room, event } => {
                    if let Err(e) = self.transport.publish(&room, event.clone()).await {
                        match event.delivery() {
                            Delivery::RetryOnce => {
                                self.core.schedule_retry(&room, event, Instant::now());
                            }
                            Delivery::BestEffort => {
                                log::debug!("dropped {} for {room}: {e}", event.name());
                            }
                        }
                    }
                }
                Effect::Retry { room, event } => {
                    if let Err(e) = self.transport.publish(&room, event.clone()).await {
                        log::warn!("retry of {} for {room} failed, giving up: {e}", event.name());
                    }
                }
                Effect::Emit(event) => self.emit(event),
            }
        }
    }

    fn emit(&self, event: CollabEvent) {
        if let CollabEvent::Connection(state) = &event {
            self.state.send_replace(*state);
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("host event queue full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
