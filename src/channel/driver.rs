//! Per-session driver task: connect, rejoin, pump frames, reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, ReconnectPolicy};
use super::session::{PushSession, SessionCommand};
use super::transport::{Transport, TransportLink};
use crate::error::TransportError;
use crate::protocol::{decode_frame, ChannelEvent, ConnectionState, RoomId};

/// Why the frame pump returned.
enum Exit {
    Shutdown,
    Dropped(String),
}

pub(crate) struct SessionDriver {
    session: PushSession,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    auth_token: String,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: CancellationToken,
}

impl SessionDriver {
    pub(crate) fn new(
        session: PushSession,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        auth_token: String,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let shutdown = session.shutdown_token();
        Self {
            session,
            transport,
            policy,
            auth_token,
            commands,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let surface = self.session.surface().clone();
        let mut backoff = Backoff::new(self.policy);
        let mut connected_once = false;

        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.transport.connect(&self.auth_token) => result,
            };

            match connected {
                Ok(mut link) => match self.rejoin(link.as_mut()).await {
                    Ok(mut joined) => {
                        let attempt = backoff.attempt();
                        backoff.reset();
                        self.session.set_state(ConnectionState::Open);
                        let event = if connected_once {
                            info!(%surface, attempt, rooms = joined.len(), "push channel reconnected");
                            ChannelEvent::Reconnected { attempt }
                        } else {
                            info!(%surface, rooms = joined.len(), "push channel connected");
                            ChannelEvent::Connected
                        };
                        connected_once = true;
                        self.session.dispatch(&event);

                        match self.pump(link.as_mut(), &mut joined).await {
                            Exit::Shutdown => {
                                link.close().await;
                                break;
                            }
                            Exit::Dropped(reason) => {
                                warn!(%surface, %reason, "push channel dropped");
                                self.session
                                    .dispatch(&ChannelEvent::Disconnected { reason });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%surface, error = %e, "rejoin failed");
                        link.close().await;
                    }
                },
                Err(e) => warn!(%surface, error = %e, attempt = backoff.attempt(), "connect failed"),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(delay) = backoff.next_delay() else {
                warn!(%surface, attempts = backoff.attempt(), "giving up on push channel");
                self.session.close();
                break;
            };
            self.session.set_state(ConnectionState::Reconnecting);
            info!(
                %surface,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting push channel"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.session.set_state(ConnectionState::Closed);
        debug!(%surface, "session driver stopped");
    }

    /// Send a join for every room in the session's set before anything is
    /// read from the new link.
    async fn rejoin(
        &mut self,
        link: &mut dyn TransportLink,
    ) -> Result<BTreeSet<RoomId>, TransportError> {
        // queued commands are superseded by the snapshot below
        while self.commands.try_recv().is_ok() {}

        let mut joined = BTreeSet::new();
        for room in self.session.joined_rooms() {
            link.send(&room.join_signal()).await?;
            joined.insert(room);
        }
        Ok(joined)
    }

    async fn pump(&mut self, link: &mut dyn TransportLink, joined: &mut BTreeSet<RoomId>) -> Exit {
        let surface = self.session.surface().clone();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Exit::Shutdown,
                Some(command) = self.commands.recv() => {
                    if let Err(e) = apply_command(link, joined, command).await {
                        return Exit::Dropped(e.to_string());
                    }
                }
                frame = link.recv() => match frame {
                    None => return Exit::Dropped("closed by server".to_string()),
                    Some(Err(e)) => return Exit::Dropped(e.to_string()),
                    Some(Ok(text)) => match decode_frame(&text) {
                        Ok(event) => {
                            let handled = self.session.dispatch(&ChannelEvent::Push(event));
                            if handled == 0 {
                                debug!(%surface, "push event had no handler");
                            }
                        }
                        Err(e) => warn!(%surface, error = %e, "dropping push frame"),
                    },
                },
            }
        }
    }
}

async fn apply_command(
    link: &mut dyn TransportLink,
    joined: &mut BTreeSet<RoomId>,
    command: SessionCommand,
) -> Result<(), TransportError> {
    match command {
        SessionCommand::Join(room) => {
            if joined.contains(&room) {
                return Ok(());
            }
            link.send(&room.join_signal()).await?;
            joined.insert(room);
        }
        SessionCommand::Leave(room) => {
            if !joined.remove(&room) {
                return Ok(());
            }
            if let Some(signal) = room.leave_signal() {
                link.send(&signal).await?;
            }
        }
    }
    Ok(())
}
