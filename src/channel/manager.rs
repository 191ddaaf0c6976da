use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info};

use super::backoff::ReconnectPolicy;
use super::driver::SessionDriver;
use super::handlers::HandlerId;
use super::session::{PushSession, SurfaceId};
use super::transport::Transport;
use crate::error::{TransportError, UnavailableSnafu};
use crate::protocol::{ChannelEvent, EventKind, RoomId};

/// Registry of push sessions keyed by surface.
///
/// Sessions are opened on surface mount and closed on unmount; there is no
/// process-wide channel. Each session owns one transport connection driven
/// by its own task.
pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    sessions: Mutex<HashMap<SurfaceId, PushSession>>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the open session for `surface`, or open one. Must be called
    /// from within a Tokio runtime, which hosts the session's driver task.
    pub fn open_session(
        &self,
        surface: SurfaceId,
        auth_token: &str,
    ) -> Result<PushSession, TransportError> {
        self.open_session_with(surface, auth_token, |_| Ok(()))
    }

    /// Like [`open_session`](Self::open_session), but a newly created
    /// session is passed to `init` before its driver starts, so handlers
    /// registered there see every event including the first `connect`.
    /// `init` is not called when an open session is returned. If it fails,
    /// the new session is dropped and the error returned.
    pub fn open_session_with<F>(
        &self,
        surface: SurfaceId,
        auth_token: &str,
        init: F,
    ) -> Result<PushSession, TransportError>
    where
        F: FnOnce(&PushSession) -> Result<(), TransportError>,
    {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&surface) {
            if !existing.is_closed() {
                debug!(%surface, "session already open");
                return Ok(existing.clone());
            }
        }

        let runtime = Handle::try_current().map_err(|e| {
            UnavailableSnafu {
                stage: "open_session",
                reason: e.to_string(),
            }
            .build()
        })?;

        let (session, commands) = PushSession::new(surface.clone());
        if let Err(e) = init(&session) {
            session.close();
            return Err(e);
        }
        let driver = SessionDriver::new(
            session.clone(),
            self.transport.clone(),
            self.policy,
            auth_token.to_string(),
            commands,
        );
        runtime.spawn(driver.run());
        sessions.insert(surface.clone(), session.clone());
        info!(%surface, "session opened");
        Ok(session)
    }

    pub fn session(&self, surface: &SurfaceId) -> Option<PushSession> {
        self.sessions()
            .get(surface)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    pub fn join_room(&self, session: &PushSession, room: RoomId) -> Result<bool, TransportError> {
        session.join_room(room)
    }

    pub fn leave_room(&self, session: &PushSession, room: &RoomId) -> bool {
        session.leave_room(room)
    }

    pub fn on<F>(&self, session: &PushSession, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        session.on(kind, handler)
    }

    pub fn off(&self, session: &PushSession, id: HandlerId) -> bool {
        session.off(id)
    }

    /// Disconnect the transport, drop all handlers and forget the session.
    pub fn close_session(&self, session: &PushSession) {
        {
            let mut sessions = self.sessions();
            let registered = sessions
                .get(session.surface())
                .is_some_and(|current| current.ptr_eq(session));
            if registered {
                sessions.remove(session.surface());
            }
        }
        session.close();
        info!(surface = %session.surface(), "session closed");
    }

    pub fn close_surface(&self, surface: &SurfaceId) -> bool {
        let removed = self.sessions().remove(surface);
        match removed {
            Some(session) => {
                session.close();
                info!(%surface, "session closed");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<PushSession> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close();
        }
    }

    /// Surfaces with a live session, sorted.
    pub fn active_sessions(&self) -> Vec<SurfaceId> {
        let mut surfaces: Vec<SurfaceId> = self
            .sessions()
            .iter()
            .filter(|(_, session)| !session.is_closed())
            .map(|(surface, _)| surface.clone())
            .collect();
        surfaces.sort();
        surfaces
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SurfaceId, PushSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
