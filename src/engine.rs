//! Orchestration of the push channel, history loads and read tracking
//! around the shared `ClientState`.
//!
//! Every surface (inbox, open room, notification bell) mounts its own push
//! session. Session handlers only forward events into a crossbeam channel;
//! [`SyncEngine::process_events`] drains it and is the single place where
//! pushed data is applied. Network calls never run with the state locked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::channel::{ChannelManager, PushSession, SurfaceId, Transport, WebSocketTransport};
use crate::config::SyncConfig;
use crate::error::{
    DeliverSnafu, FetchResult, InvalidDraftSnafu, MismatchedAckSnafu, SendError, TransportError,
};
use crate::events::{apply_event, Applied, SyncEvent, Update};
use crate::history::HistoryLoader;
use crate::message_store::Origin;
use crate::model::{
    AttachmentUpload, Conversation, ConversationId, Message, MessageKind, Notification,
    NotificationId, OutgoingMessage, UserId,
};
use crate::notifications::NotificationCenter;
use crate::protocol::{ConnectionState, EventKind, RoomId};
use crate::read_tracker::{ReadOutcome, ReadTracker};
use crate::state::{self, ClientState, SharedState};
use crate::validation;

/// Result of a history page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { inserted: usize, exhausted: bool },
    /// Nothing older exists; no request was made.
    Exhausted,
    /// The surface was unmounted before the page could be applied.
    Discarded,
}

struct MountedSurface {
    session: PushSession,
    cancel: CancellationToken,
}

pub struct SyncEngine {
    config: SyncConfig,
    current_user: UserId,
    state: SharedState,
    api: Arc<dyn ChatApi>,
    history: HistoryLoader,
    reads: ReadTracker,
    channels: ChannelManager,
    surfaces: Mutex<HashMap<SurfaceId, MountedSurface>>,
    event_tx: Sender<SyncEvent>,
    event_rx: Receiver<SyncEvent>,
    local_seq: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        current_user: UserId,
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let notifications =
            NotificationCenter::new(config.notification_limit, config.alert_cues.clone());
        let state = ClientState::new(current_user.clone())
            .with_notifications(notifications)
            .with_retention(config.retention);
        let (event_tx, event_rx) = unbounded();

        Self {
            channels: ChannelManager::new(transport, config.reconnect_policy()),
            history: HistoryLoader::new(api.clone()),
            reads: ReadTracker::new(api.clone()),
            state: Arc::new(Mutex::new(state)),
            surfaces: Mutex::new(HashMap::new()),
            local_seq: AtomicU64::new(0),
            config,
            current_user,
            api,
            event_tx,
            event_rx,
        }
    }

    /// Build an engine that pushes over WebSocket to `config.push_url`.
    pub fn with_websocket(
        current_user: UserId,
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self, TransportError> {
        let transport = WebSocketTransport::new(config.push_url.clone())?;
        Ok(Self::new(current_user, config, api, Arc::new(transport)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    // --- surfaces ---

    /// Inbox list: user room; new messages, refresh requests, lifecycle.
    pub fn mount_inbox(&self, auth_token: &str) -> Result<PushSession, TransportError> {
        self.mount(
            SurfaceId::inbox(),
            auth_token,
            RoomId::User(self.current_user.clone()),
            &[EventKind::NewMessage, EventKind::RefreshConversations],
        )
    }

    /// Open chat room: conversation room; new messages, lifecycle.
    pub fn mount_room(
        &self,
        conversation_id: &ConversationId,
        auth_token: &str,
    ) -> Result<PushSession, TransportError> {
        self.mount(
            SurfaceId::room(conversation_id),
            auth_token,
            RoomId::Conversation(conversation_id.clone()),
            &[EventKind::NewMessage],
        )
    }

    /// Notification bell: user room; notifications, lifecycle.
    pub fn mount_notifications(&self, auth_token: &str) -> Result<PushSession, TransportError> {
        self.mount(
            SurfaceId::notification_bell(),
            auth_token,
            RoomId::User(self.current_user.clone()),
            &[EventKind::NewNotification],
        )
    }

    fn mount(
        &self,
        surface: SurfaceId,
        auth_token: &str,
        room: RoomId,
        kinds: &[EventKind],
    ) -> Result<PushSession, TransportError> {
        let mut attached = false;
        let session = self
            .channels
            .open_session_with(surface.clone(), auth_token, |session| {
                attached = true;
                self.attach(session, &surface, room.clone(), kinds)
            })?;

        let mut surfaces = self.surfaces();
        if let Some(mounted) = surfaces.get(&surface) {
            if mounted.session.ptr_eq(&session) {
                debug!(%surface, "surface already mounted");
                return Ok(session);
            }
        }
        // opened earlier through the channel manager; its driver may
        // already be running
        if !attached {
            if let Err(e) = self.attach(&session, &surface, room, kinds) {
                self.channels.close_session(&session);
                return Err(e);
            }
        }

        surfaces.insert(
            surface.clone(),
            MountedSurface {
                session: session.clone(),
                cancel: CancellationToken::new(),
            },
        );
        info!(%surface, "surface mounted");
        Ok(session)
    }

    /// Forward `kinds` plus lifecycle events into the event queue and join
    /// the surface's room.
    fn attach(
        &self,
        session: &PushSession,
        surface: &SurfaceId,
        room: RoomId,
        kinds: &[EventKind],
    ) -> Result<(), TransportError> {
        let lifecycle = [EventKind::Connect, EventKind::Disconnect, EventKind::Reconnect];
        for kind in kinds.iter().chain(lifecycle.iter()) {
            let tx = self.event_tx.clone();
            let source = surface.clone();
            session.on(*kind, move |event| {
                // the receiver lives as long as the engine
                let _ = tx.send(SyncEvent {
                    surface: source.clone(),
                    event: event.clone(),
                });
            });
        }
        session.join_room(room).map(|_| ())
    }

    /// Cancel the surface's in-flight fetches and close its session.
    pub fn unmount(&self, surface: &SurfaceId) -> bool {
        let Some(mounted) = self.surfaces().remove(surface) else {
            return false;
        };
        mounted.cancel.cancel();
        self.channels.close_session(&mounted.session);
        info!(%surface, "surface unmounted");
        true
    }

    pub fn unmount_all(&self) {
        let mounted: Vec<SurfaceId> = self.surfaces().keys().cloned().collect();
        for surface in mounted {
            self.unmount(&surface);
        }
    }

    pub fn mounted_surfaces(&self) -> Vec<SurfaceId> {
        let mut surfaces: Vec<SurfaceId> = self.surfaces().keys().cloned().collect();
        surfaces.sort();
        surfaces
    }

    pub fn connection_state(&self, surface: &SurfaceId) -> Option<ConnectionState> {
        self.surfaces().get(surface).map(|m| m.session.state())
    }

    /// Token for fetches on behalf of `surface`. Unmounted surfaces get a
    /// fresh token that is never cancelled.
    fn fetch_token(&self, surface: &SurfaceId) -> CancellationToken {
        self.surfaces()
            .get(surface)
            .map(|m| m.cancel.clone())
            .unwrap_or_default()
    }

    // --- push events ---

    /// Apply every queued channel event. A refresh request or reconnect in
    /// the batch triggers exactly one authoritative conversation refresh.
    pub async fn process_events(&self) -> Vec<Update> {
        let mut applied = Applied::default();
        {
            let mut state = state::lock(&self.state);
            while let Ok(event) = self.event_rx.try_recv() {
                apply_event(&mut state, event, &mut applied);
            }
        }

        if applied.needs_refresh {
            match self.refresh_conversations().await {
                Ok(()) => {
                    if !applied.updates.contains(&Update::ConversationsChanged) {
                        applied.updates.push(Update::ConversationsChanged);
                    }
                }
                Err(e) => warn!(error = %e, "scheduled refresh failed"),
            }
        }
        applied.updates
    }

    /// Refresh conversations and retry notification marks on an interval
    /// until `shutdown` is cancelled.
    pub fn spawn_periodic_refresh(
        engine: Arc<SyncEngine>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let period = engine.config.refresh_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.refresh_conversations().await {
                            warn!(error = %e, "periodic refresh failed");
                        }
                        engine.reconcile_notifications().await;
                    }
                }
            }
            debug!("periodic refresh stopped");
        })
    }

    // --- history ---

    /// Load the next older page of a thread (the newest page when the
    /// thread is empty).
    pub async fn load_older_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> FetchResult<LoadOutcome> {
        let cancel = self.fetch_token(&SurfaceId::room(conversation_id));
        let (cursor, exhausted) = {
            let state = state::lock(&self.state);
            state
                .thread(conversation_id)
                .map(|t| (t.cursor(), t.history_exhausted()))
                .unwrap_or((None, false))
        };
        if exhausted {
            return Ok(LoadOutcome::Exhausted);
        }

        let page_size = self.config.message_page_size;
        let page = tokio::select! {
            _ = cancel.cancelled() => None,
            page = self.history.fetch_message_page(conversation_id, cursor.as_ref(), page_size) => Some(page?),
        };
        let Some(page) = page else {
            debug!(%conversation_id, "history fetch abandoned after unmount");
            return Ok(LoadOutcome::Discarded);
        };

        let mut state = state::lock(&self.state);
        if cancel.is_cancelled() {
            return Ok(LoadOutcome::Discarded);
        }
        let inserted = state.insert_messages(conversation_id, page.messages, Origin::History);
        if page.exhausted {
            state.thread_mut(conversation_id).set_history_exhausted(true);
        }
        Ok(LoadOutcome::Loaded {
            inserted: inserted.messages.len(),
            exhausted: page.exhausted,
        })
    }

    /// Authoritative re-fetch of the first conversation page.
    pub async fn refresh_conversations(&self) -> FetchResult<()> {
        let page_size = self.config.conversation_page_size;
        let page = self.history.fetch_conversation_page(1, page_size).await?;
        let count = page.len();
        state::lock(&self.state).conversations.apply_refresh(page);
        debug!(count, "conversations refreshed");
        Ok(())
    }

    /// Load page `page` (1-based) of the inbox. Page 1 is a full refresh;
    /// later pages merge into what is loaded. Returns summaries merged.
    pub async fn load_conversations(&self, page: u32) -> FetchResult<usize> {
        if page <= 1 {
            self.refresh_conversations().await?;
            return Ok(state::lock(&self.state).conversations.len());
        }

        let cancel = self.fetch_token(&SurfaceId::inbox());
        let page_size = self.config.conversation_page_size;
        let summaries = self.history.fetch_conversation_page(page, page_size).await?;
        if cancel.is_cancelled() {
            return Ok(0);
        }
        Ok(state::lock(&self.state).conversations.merge_page(summaries))
    }

    pub async fn load_notifications(&self) -> FetchResult<usize> {
        let cancel = self.fetch_token(&SurfaceId::notification_bell());
        let page = self
            .history
            .fetch_notifications(self.config.notification_limit)
            .await?;
        if cancel.is_cancelled() {
            return Ok(0);
        }
        Ok(state::lock(&self.state).notifications.load(page))
    }

    // --- read state ---

    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> ReadOutcome {
        self.reads
            .on_conversation_opened(&self.state, conversation_id)
            .await
    }

    pub async fn mark_notifications_read(&self, ids: &[NotificationId]) -> usize {
        self.reads.mark_notifications_read(&self.state, ids).await
    }

    pub async fn mark_all_notifications_read(&self) -> usize {
        self.reads.mark_all_notifications_read(&self.state).await
    }

    pub async fn reconcile_notifications(&self) -> usize {
        self.reads.reconcile_notifications(&self.state).await
    }

    // --- sending ---

    /// Send a text message with an optimistic pending entry that is
    /// replaced by the acknowledged message, or removed on failure.
    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message, SendError> {
        let stage = "send_text";
        validation::validate_identifier("conversation", conversation_id.as_str())
            .map_err(|details| InvalidDraftSnafu { stage, details }.build())?;
        let content = validation::sanitize_message_content(content);
        validation::validate_message_content(&content)
            .map_err(|details| InvalidDraftSnafu { stage, details }.build())?;

        let local_id = self.next_local_id();
        let pending = Message {
            id: None,
            local_id: Some(local_id.clone()),
            conversation_id: conversation_id.clone(),
            sender_id: self.current_user.clone(),
            kind: MessageKind::Text,
            content: content.clone(),
            attachment_ref: None,
            sent_at: Utc::now(),
            read_at: None,
        };
        state::lock(&self.state).insert_messages(conversation_id, vec![pending], Origin::Push);

        let draft = OutgoingMessage {
            local_id: local_id.clone(),
            content,
        };
        let result = self.api.send_message(conversation_id, &draft).await;

        let mut state = state::lock(&self.state);
        let thread = state.thread_mut(conversation_id);
        match result {
            Ok(ack) if &ack.conversation_id == conversation_id && ack.id.is_some() => {
                thread.confirm_sent(&local_id, ack.clone());
                // the pending entry already moved the summary; this only
                // advances activity to the server's timestamp
                state.conversations.upsert_from_message(&ack);
                Ok(ack)
            }
            Ok(_) => {
                thread.discard_pending(&local_id);
                MismatchedAckSnafu { stage }.fail()
            }
            Err(source) => {
                thread.discard_pending(&local_id);
                warn!(%conversation_id, error = %source, "send failed, pending message removed");
                Err(source).context(DeliverSnafu { stage })
            }
        }
    }

    /// Upload an attachment; the created message is inserted like a push.
    pub async fn send_attachment(
        &self,
        conversation_id: &ConversationId,
        upload: AttachmentUpload,
    ) -> Result<Message, SendError> {
        let stage = "send_attachment";
        if upload.file_name.trim().is_empty() || upload.bytes.is_empty() {
            return InvalidDraftSnafu {
                stage,
                details: "attachment needs a file name and content",
            }
            .fail();
        }
        if let Some(caption) = &upload.caption {
            validation::validate_message_content(caption)
                .map_err(|details| InvalidDraftSnafu { stage, details }.build())?;
        }

        let created = self
            .api
            .upload_attachment(conversation_id, &upload)
            .await
            .context(DeliverSnafu { stage })?;
        if &created.conversation_id != conversation_id {
            return MismatchedAckSnafu { stage }.fail();
        }
        state::lock(&self.state).insert_messages(
            conversation_id,
            vec![created.clone()],
            Origin::Push,
        );
        Ok(created)
    }

    fn next_local_id(&self) -> String {
        let seq = self.local_seq.fetch_add(1, Ordering::Relaxed);
        format!("local-{}-{}", Utc::now().timestamp_millis(), seq)
    }

    // --- reads for the UI ---

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        state::lock(&self.state)
            .thread(conversation_id)
            .map(|t| t.to_vec())
            .unwrap_or_default()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        state::lock(&self.state).conversations.to_vec()
    }

    /// Local filter over loaded summaries; never hits the network.
    pub fn filter_conversations<P>(&self, predicate: P) -> Vec<Conversation>
    where
        P: Fn(&Conversation) -> bool,
    {
        state::lock(&self.state)
            .conversations
            .filter(predicate)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn total_unread(&self) -> u32 {
        state::lock(&self.state).conversations.total_unread()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        state::lock(&self.state).notifications.entries().to_vec()
    }

    pub fn badge_count(&self) -> usize {
        state::lock(&self.state).notifications.badge_count()
    }

    fn surfaces(&self) -> MutexGuard<'_, HashMap<SurfaceId, MountedSurface>> {
        self.surfaces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.unmount_all();
    }
}
