//! Per-conversation message thread.
//!
//! Messages are kept ascending by `(sentAt, id)` and unique by dedup key.
//! Both invariants hold after every operation; malformed or duplicate input
//! is dropped, never reported as an error.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::model::{ConversationId, DedupKey, Message, MessageId, UserId};

/// Default number of messages kept per thread before the oldest are evicted.
pub const DEFAULT_RETENTION: usize = 2000;

/// Where a batch of messages came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Older page loaded backward; survivors are expected at the head.
    History,
    /// Live delivery or local send; survivors are expected at the tail.
    Push,
}

/// Ordered, deduplicated messages of one conversation.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: ConversationId,
    messages: VecDeque<Message>,
    keys: HashSet<DedupKey>,
    /// local id -> dedup key of optimistic sends still awaiting a durable id
    pending: HashMap<String, DedupKey>,
    /// Oldest durable id still retained after an eviction.
    resume_cursor: Option<MessageId>,
    history_exhausted: bool,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: VecDeque::new(),
            keys: HashSet::new(),
            pending: HashMap::new(),
            resume_cursor: None,
            history_exhausted: false,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    /// Merge `candidates` into the thread and return the ones that were new.
    ///
    /// Duplicates (by dedup key), messages for another conversation and
    /// messages without any identity are dropped. A candidate carrying both a
    /// durable id and the local id of a pending send confirms that send in
    /// place and is not reported as new.
    pub fn insert(&mut self, candidates: Vec<Message>, origin: Origin) -> Vec<Message> {
        let mut inserted = Vec::new();

        // history pages arrive ascending; walking them newest-first keeps
        // every survivor on the cheap head-insert path
        let ordered: Box<dyn Iterator<Item = Message>> = match origin {
            Origin::History => Box::new(candidates.into_iter().rev()),
            Origin::Push => Box::new(candidates.into_iter()),
        };

        for message in ordered {
            if message.conversation_id != self.conversation_id {
                debug!(
                    conversation_id = %self.conversation_id,
                    other = %message.conversation_id,
                    "dropping message addressed to another conversation"
                );
                continue;
            }
            let Some(key) = message.dedup_key() else {
                debug!(conversation_id = %self.conversation_id, "dropping message without identity");
                continue;
            };
            if self.keys.contains(&key) {
                trace!(conversation_id = %self.conversation_id, ?key, "duplicate message absorbed");
                continue;
            }
            if self.confirm_pending(&message) {
                continue;
            }

            if let (Some(local_id), DedupKey::Local { .. }) = (&message.local_id, &key) {
                self.pending.insert(local_id.clone(), key.clone());
            }
            self.keys.insert(key);
            let pos = self.position_for(&message, origin);
            self.messages.insert(pos, message.clone());
            inserted.push(message);
        }

        if origin == Origin::History {
            inserted.reverse();
        }
        inserted
    }

    /// Replace the pending send `local_id` with its acknowledged form.
    /// Returns false when no such pending entry exists.
    pub fn confirm_sent(&mut self, local_id: &str, acknowledged: Message) -> bool {
        let mut acknowledged = acknowledged;
        if acknowledged.local_id.is_none() {
            acknowledged.local_id = Some(local_id.to_string());
        }
        if acknowledged.id.is_none() || acknowledged.conversation_id != self.conversation_id {
            return false;
        }
        if let Some(DedupKey::Durable(id)) = acknowledged.dedup_key() {
            // the push echo may have beaten the send response
            if self.keys.contains(&DedupKey::Durable(id)) {
                return self.discard_pending(local_id);
            }
        }
        self.confirm_pending(&acknowledged)
    }

    /// Drop an optimistic send that the server rejected.
    pub fn discard_pending(&mut self, local_id: &str) -> bool {
        let Some(key) = self.pending.remove(local_id) else {
            return false;
        };
        self.keys.remove(&key);
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.is_pending() && m.local_id.as_deref() == Some(local_id)));
        before != self.messages.len()
    }

    fn confirm_pending(&mut self, message: &Message) -> bool {
        if message.id.is_none() {
            return false;
        }
        let Some(local_id) = message.local_id.as_deref() else {
            return false;
        };
        let Some(old_key) = self.pending.remove(local_id) else {
            return false;
        };
        self.keys.remove(&old_key);
        self.messages
            .retain(|m| !(m.is_pending() && m.local_id.as_deref() == Some(local_id)));

        if let Some(key) = message.dedup_key() {
            self.keys.insert(key);
        }
        let pos = self.position_for(message, Origin::Push);
        self.messages.insert(pos, message.clone());
        debug!(conversation_id = %self.conversation_id, local_id, "pending send confirmed");
        true
    }

    fn position_for(&self, message: &Message, origin: Origin) -> usize {
        let key = message.order_key();
        match origin {
            Origin::Push => {
                if self.messages.back().map_or(true, |last| last.order_key() <= key) {
                    return self.messages.len();
                }
            }
            Origin::History => {
                if self.messages.front().map_or(true, |first| key < first.order_key()) {
                    return 0;
                }
            }
        }
        self.messages.partition_point(|m| m.order_key() <= key)
    }

    /// Trim the oldest messages so at most `keep_count` remain. Returns the
    /// number evicted.
    pub fn evict_older_than(&mut self, keep_count: usize) -> usize {
        if self.messages.len() <= keep_count {
            return 0;
        }
        let excess = self.messages.len() - keep_count;
        for message in self.messages.drain(..excess) {
            if let Some(key) = message.dedup_key() {
                self.keys.remove(&key);
            }
            if let Some(local_id) = message.local_id.as_deref().filter(|_| message.is_pending()) {
                self.pending.remove(local_id);
            }
        }
        self.resume_cursor = self.messages.iter().find_map(|m| m.id.clone());
        self.history_exhausted = false;
        debug!(
            conversation_id = %self.conversation_id,
            evicted = excess,
            cursor = ?self.resume_cursor,
            "evicted old messages"
        );
        excess
    }

    /// Cursor for the next older history page: the oldest retained durable id.
    pub fn cursor(&self) -> Option<MessageId> {
        self.messages
            .iter()
            .find_map(|m| m.id.clone())
            .or_else(|| self.resume_cursor.clone())
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn set_history_exhausted(&mut self, exhausted: bool) {
        self.history_exhausted = exhausted;
    }

    /// Durable ids of messages from others that are not read yet.
    pub fn unread_ids(&self, current_user: &UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| &m.sender_id != current_user && !m.is_read())
            .filter_map(|m| m.id.clone())
            .collect()
    }

    /// Set `read_at` on the matching unread messages. Returns how many changed.
    pub fn mark_read(&mut self, ids: &[MessageId], at: DateTime<Utc>) -> usize {
        let wanted: HashSet<&MessageId> = ids.iter().collect();
        let mut changed = 0;
        for message in self.messages.iter_mut() {
            let matches = message.id.as_ref().is_some_and(|id| wanted.contains(id));
            if matches && message.read_at.is_none() {
                message.read_at = Some(at);
                changed += 1;
            }
        }
        changed
    }
}
