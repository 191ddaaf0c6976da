//! Core sync state, separated from I/O.
//!
//! `ClientState` holds everything the UI renders: per-conversation message
//! threads, the inbox index and the notification list. It is owned by a
//! single logical owner behind [`SharedState`]; guards are never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::conversation_index::{ConversationIndex, Upsert};
use crate::message_store::{MessageStore, Origin, DEFAULT_RETENTION};
use crate::model::{ConversationId, Message, UserId};
use crate::notifications::NotificationCenter;

pub type SharedState = Arc<Mutex<ClientState>>;

/// Lock the shared state, recovering the data if a holder panicked.
pub fn lock(state: &SharedState) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of inserting messages into a thread.
#[derive(Debug, Default)]
pub struct Inserted {
    pub messages: Vec<Message>,
    /// A pushed message referenced a conversation the index does not hold.
    pub needs_refresh: bool,
}

#[derive(Debug)]
pub struct ClientState {
    pub current_user: UserId,
    pub threads: HashMap<ConversationId, MessageStore>,
    pub conversations: ConversationIndex,
    pub notifications: NotificationCenter,
    /// Messages kept per thread before the oldest are evicted.
    pub retention: usize,
}

impl ClientState {
    pub fn new(current_user: UserId) -> Self {
        Self {
            conversations: ConversationIndex::new(current_user.clone()),
            current_user,
            threads: HashMap::new(),
            notifications: NotificationCenter::default(),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_notifications(mut self, notifications: NotificationCenter) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Get a thread, creating an empty one if needed.
    pub fn thread_mut(&mut self, conversation_id: &ConversationId) -> &mut MessageStore {
        self.threads
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageStore::new(conversation_id.clone()))
    }

    pub fn thread(&self, conversation_id: &ConversationId) -> Option<&MessageStore> {
        self.threads.get(conversation_id)
    }

    /// Drop a cached thread entirely; the summary stays in the index.
    pub fn evict_thread(&mut self, conversation_id: &ConversationId) -> bool {
        self.threads.remove(conversation_id).is_some()
    }

    /// Merge messages into a thread. Push-origin survivors also move the
    /// inbox summary and the thread is trimmed to the retention window.
    pub fn insert_messages(
        &mut self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
        origin: Origin,
    ) -> Inserted {
        let retention = self.retention;
        let thread = self.thread_mut(conversation_id);
        let mut inserted = thread.insert(messages, origin);
        if origin == Origin::Push && thread.evict_older_than(retention) > 0 {
            // a late push older than the retained window is evicted at once
            inserted.retain(|m| m.dedup_key().is_some_and(|key| thread.contains(&key)));
        }

        let mut needs_refresh = false;
        if origin == Origin::Push {
            for message in &inserted {
                if self.conversations.upsert_from_message(message) == Upsert::UnknownConversation {
                    debug!(%conversation_id, "message for unindexed conversation");
                    needs_refresh = true;
                }
            }
        }

        Inserted {
            messages: inserted,
            needs_refresh,
        }
    }
}
