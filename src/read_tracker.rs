//! Read marking for message threads and notifications.
//!
//! Message threads are marked once the server confirms, with at most one
//! request in flight per conversation; a second open while one is pending
//! is coalesced. Notifications are marked locally first and persisted
//! afterwards; failed persists are kept for the next reconciliation pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::{MarkReadError, MarkReadSnafu};
use crate::model::{ConversationId, MessageId, NotificationId};
use crate::state::{self, SharedState};

#[derive(Debug)]
pub enum ReadOutcome {
    /// The server confirmed; this many messages were marked read.
    Marked(usize),
    NothingUnread,
    /// Another mark-read for this conversation is still in flight.
    Coalesced,
    /// Persist failed; local state is untouched and the next open retries.
    Deferred(MarkReadError),
}

pub struct ReadTracker {
    api: Arc<dyn ChatApi>,
    in_flight: Mutex<HashSet<ConversationId>>,
}

/// Clears the in-flight flag for its conversation when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ConversationId>>,
    conversation_id: ConversationId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.conversation_id);
    }
}

impl ReadTracker {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_in_flight(&self, conversation_id: &ConversationId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(conversation_id)
    }

    fn try_begin(&self, conversation_id: &ConversationId) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(conversation_id.clone()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            conversation_id: conversation_id.clone(),
        })
    }

    /// Mark every currently unread message in the loaded thread with exactly
    /// one collaborator call.
    pub async fn on_conversation_opened(
        &self,
        state: &SharedState,
        conversation_id: &ConversationId,
    ) -> ReadOutcome {
        let Some(_guard) = self.try_begin(conversation_id) else {
            debug!(%conversation_id, "mark-read already in flight, coalescing");
            return ReadOutcome::Coalesced;
        };

        let ids: Vec<MessageId> = {
            let state = state::lock(state);
            let user = state.current_user.clone();
            state
                .thread(conversation_id)
                .map(|thread| thread.unread_ids(&user))
                .unwrap_or_default()
        };
        if ids.is_empty() {
            return ReadOutcome::NothingUnread;
        }

        let result = self
            .api
            .mark_messages_read(conversation_id, &ids)
            .await
            .context(MarkReadSnafu {
                stage: "mark_messages_read",
                count: ids.len(),
            });
        if let Err(err) = result {
            warn!(%conversation_id, error = %err, "mark-read not persisted");
            return ReadOutcome::Deferred(err);
        }

        let mut state = state::lock(state);
        let marked = state.thread_mut(conversation_id).mark_read(&ids, Utc::now());
        state.conversations.acknowledge_read(conversation_id, &ids);
        info!(%conversation_id, marked, "conversation marked read");
        ReadOutcome::Marked(marked)
    }

    /// Mark notifications read locally, then persist. Returns how many
    /// entries went from unread to read.
    pub async fn mark_notifications_read(
        &self,
        state: &SharedState,
        ids: &[NotificationId],
    ) -> usize {
        let changed = state::lock(state).notifications.mark_read_local(ids);
        if changed.is_empty() {
            return 0;
        }
        self.persist_notifications(state, changed.clone()).await;
        changed.len()
    }

    pub async fn mark_all_notifications_read(&self, state: &SharedState) -> usize {
        let unread = state::lock(state).notifications.unread_ids();
        self.mark_notifications_read(state, &unread).await
    }

    /// Retry persisting notification marks that failed earlier. Returns the
    /// number of ids that are now persisted.
    pub async fn reconcile_notifications(&self, state: &SharedState) -> usize {
        let pending = state::lock(state).notifications.pending_retry();
        if pending.is_empty() {
            return 0;
        }
        debug!(count = pending.len(), "retrying notification read marks");
        if self.persist_notifications(state, pending.clone()).await {
            pending.len()
        } else {
            0
        }
    }

    async fn persist_notifications(&self, state: &SharedState, ids: Vec<NotificationId>) -> bool {
        let result = self
            .api
            .mark_notifications_read(&ids)
            .await
            .context(MarkReadSnafu {
                stage: "mark_notifications_read",
                count: ids.len(),
            });

        let mut state = state::lock(state);
        match result {
            Ok(()) => {
                state.notifications.clear_retry(&ids);
                true
            }
            Err(err) => {
                warn!(error = %err, "notification read marks queued for retry");
                state.notifications.queue_retry(ids);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_store::Origin;
    use crate::state::ClientState;
    use crate::test_support::{incoming, notification, summary, FakeApi};
    use crate::error::ApiError;

    fn shared() -> SharedState {
        let mut state = ClientState::new("host".into());
        state.conversations.apply_refresh(vec![summary("c1", 10, 2)]);
        state.insert_messages(
            &"c1".into(),
            vec![incoming("c1", "m1", 1), incoming("c1", "m2", 2)],
            Origin::History,
        );
        Arc::new(Mutex::new(state))
    }

    #[tokio::test]
    async fn test_open_marks_once_and_zeroes_unread() {
        let api = Arc::new(FakeApi::default());
        let tracker = ReadTracker::new(api.clone());
        let state = shared();

        let outcome = tracker.on_conversation_opened(&state, &"c1".into()).await;
        assert!(matches!(outcome, ReadOutcome::Marked(2)));
        assert_eq!(api.read_calls().len(), 1);

        let outcome = tracker.on_conversation_opened(&state, &"c1".into()).await;
        assert!(matches!(outcome, ReadOutcome::NothingUnread));
        assert_eq!(api.read_calls().len(), 1);

        let state = state::lock(&state);
        assert_eq!(state.conversations.get(&"c1".into()).map(|c| c.unread_count), Some(0));
        assert!(!tracker.is_in_flight(&"c1".into()));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_messages_unread() {
        let api = Arc::new(FakeApi::default());
        api.fail_mark_read(ApiError::Unreachable {
            message: "offline".into(),
        });
        let tracker = ReadTracker::new(api.clone());
        let state = shared();

        let outcome = tracker.on_conversation_opened(&state, &"c1".into()).await;
        assert!(matches!(outcome, ReadOutcome::Deferred(_)));
        let guard = state::lock(&state);
        assert_eq!(guard.conversations.get(&"c1".into()).map(|c| c.unread_count), Some(2));
        assert!(!tracker.is_in_flight(&"c1".into()));
    }

    #[tokio::test]
    async fn test_notification_failure_is_not_rolled_back() {
        let api = Arc::new(FakeApi::default());
        api.fail_mark_read(ApiError::Status {
            status: 503,
            message: "busy".into(),
        });
        let tracker = ReadTracker::new(api.clone());
        let state = shared();
        {
            let mut guard = state::lock(&state);
            guard.notifications.receive(notification("n1", 1));
            guard.notifications.receive(notification("n2", 2));
        }

        let marked = tracker.mark_notifications_read(&state, &["n1".into()]).await;
        assert_eq!(marked, 1);
        {
            let guard = state::lock(&state);
            assert_eq!(guard.notifications.badge_count(), 1);
            assert_eq!(guard.notifications.pending_retry(), vec![NotificationId::from("n1")]);
        }

        api.clear_failures();
        assert_eq!(tracker.reconcile_notifications(&state).await, 1);
        assert!(state::lock(&state).notifications.pending_retry().is_empty());
        assert_eq!(tracker.reconcile_notifications(&state).await, 0);
    }
}
