use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::handlers::{Handler, HandlerId, HandlerRegistry};
use crate::error::{InvalidRoomSnafu, TransportError, UnavailableSnafu};
use crate::model::ConversationId;
use crate::protocol::{ChannelEvent, ConnectionState, EventKind, RoomId};

/// Independently mounted UI area owning at most one push session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn inbox() -> Self {
        Self::new("inbox")
    }

    pub fn notification_bell() -> Self {
        Self::new("notifications")
    }

    pub fn room(conversation_id: &ConversationId) -> Self {
        Self(format!("room:{}", conversation_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room changes requested while the driver owns the link.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Join(RoomId),
    Leave(RoomId),
}

struct SessionInner {
    surface: SurfaceId,
    rooms: Mutex<BTreeSet<RoomId>>,
    handlers: HandlerRegistry,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shutdown: CancellationToken,
}

/// Handle to one surface's push session. Clones share the session.
#[derive(Clone)]
pub struct PushSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for PushSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSession")
            .field("surface", &self.inner.surface)
            .field("state", &self.state())
            .field("rooms", &self.joined_rooms())
            .finish()
    }
}

impl PushSession {
    pub(crate) fn new(surface: SurfaceId) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let session = Self {
            inner: Arc::new(SessionInner {
                surface,
                rooms: Mutex::new(BTreeSet::new()),
                handlers: HandlerRegistry::default(),
                state_tx,
                commands,
                shutdown: CancellationToken::new(),
            }),
        };
        (session, command_rx)
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.inner.surface
    }

    /// Whether both handles refer to the same underlying session.
    pub fn ptr_eq(&self, other: &PushSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms().iter().cloned().collect()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.count()
    }

    /// Add a room to the joined set and signal the server. Joining a room
    /// that is already joined is a no-op and returns `Ok(false)`.
    pub fn join_room(&self, room: RoomId) -> Result<bool, TransportError> {
        let stage = "join_room";
        if self.is_closed() {
            return UnavailableSnafu {
                stage,
                reason: format!("session {} is closed", self.inner.surface),
            }
            .fail();
        }
        if let Err(details) = room.validate() {
            return InvalidRoomSnafu {
                stage,
                room: room.to_string(),
                details,
            }
            .fail();
        }

        if !self.rooms().insert(room.clone()) {
            return Ok(false);
        }
        debug!(surface = %self.inner.surface, %room, "joining room");
        // the driver rejoins from the set after a reconnect, so a dropped
        // command only matters once the session is gone
        let _ = self.inner.commands.send(SessionCommand::Join(room));
        Ok(true)
    }

    /// Remove a room from the joined set. Leaving a room that is not joined
    /// is a no-op and returns `false`.
    pub fn leave_room(&self, room: &RoomId) -> bool {
        if !self.rooms().remove(room) {
            return false;
        }
        debug!(surface = %self.inner.surface, %room, "leaving room");
        let _ = self.inner.commands.send(SessionCommand::Leave(room.clone()));
        true
    }

    /// Append a handler for `kind`. Earlier handlers are kept.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.inner.handlers.add(kind, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    /// Stop the driver, drop every handler and mark the session closed.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.handlers.clear();
        self.set_state(ConnectionState::Closed);
        debug!(surface = %self.inner.surface, "session closed");
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            debug!(surface = %self.inner.surface, ?previous, ?state, "connection state changed");
        }
    }

    pub(crate) fn dispatch(&self, event: &ChannelEvent) -> usize {
        self.inner.handlers.dispatch(event)
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, BTreeSet<RoomId>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
