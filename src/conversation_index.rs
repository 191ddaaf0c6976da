//! Inbox summaries.
//!
//! Each summary's `unread_count` is a projection recomputed after every
//! mutation: the unread baseline from the last authoritative load plus the
//! ids of unread messages received live since then. Nothing increments or
//! decrements the count directly, so a message delivered twice is counted
//! once and the count can never go negative.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::model::{Conversation, ConversationId, Message, MessageId, UserId};

/// Result of applying a pushed message to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// Preview/activity and/or unread projection changed.
    Updated,
    /// Message was older than the summary, or already counted.
    Unchanged,
    /// Conversation not loaded; an authoritative refresh is needed.
    UnknownConversation,
}

#[derive(Debug, Clone, Default)]
struct UnreadLedger {
    baseline: u32,
    live: BTreeSet<MessageId>,
}

impl UnreadLedger {
    fn total(&self) -> u32 {
        self.baseline
            .saturating_add(u32::try_from(self.live.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct ConversationIndex {
    current_user: UserId,
    /// Ordered by last activity, newest first.
    conversations: Vec<Conversation>,
    unread: HashMap<ConversationId, UnreadLedger>,
}

impl ConversationIndex {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            conversations: Vec::new(),
            unread: HashMap::new(),
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }

    pub fn to_vec(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    /// Sum of per-conversation projections.
    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .fold(0u32, |acc, c| acc.saturating_add(c.unread_count))
    }

    /// Apply a newly inserted message to its conversation's summary.
    ///
    /// Preview and last activity only move forward in time. Unread messages
    /// from the counterpart join the live unread set.
    pub fn upsert_from_message(&mut self, message: &Message) -> Upsert {
        let Some(idx) = self.position(&message.conversation_id) else {
            return Upsert::UnknownConversation;
        };

        let mut changed = false;
        let is_newer = self.conversations[idx]
            .last_activity_at
            .map_or(true, |current| message.sent_at > current);
        if is_newer {
            let summary = &mut self.conversations[idx];
            summary.last_message_preview = Some(message.preview());
            summary.last_activity_at = Some(message.sent_at);
            changed = true;
        } else {
            debug!(
                conversation_id = %message.conversation_id,
                "stale message did not move the preview"
            );
        }

        if message.sender_id != self.current_user && !message.is_read() {
            if let Some(id) = &message.id {
                let ledger = self.unread.entry(message.conversation_id.clone()).or_default();
                changed |= ledger.live.insert(id.clone());
            }
        }

        if !changed {
            return Upsert::Unchanged;
        }
        self.recount(&message.conversation_id);
        if is_newer {
            self.resort();
        }
        Upsert::Updated
    }

    /// Authoritative replacement from the first conversation page. Server
    /// state wins for every summary it contains; summaries beyond the page
    /// are kept as they are.
    pub fn apply_refresh(&mut self, page: Vec<Conversation>) {
        for summary in page {
            self.unread.insert(
                summary.id.clone(),
                UnreadLedger {
                    baseline: summary.unread_count,
                    live: BTreeSet::new(),
                },
            );
            match self.position(&summary.id) {
                Some(idx) => self.conversations[idx] = summary,
                None => self.conversations.push(summary),
            }
        }
        self.resort();
    }

    /// Merge a later page loaded by scrolling. Present summaries are only
    /// replaced when the server copy is not older than the local one.
    pub fn merge_page(&mut self, page: Vec<Conversation>) -> usize {
        let mut merged = 0;
        for summary in page {
            match self.position(&summary.id) {
                Some(idx) => {
                    let local = self.conversations[idx].last_activity_at;
                    if summary.last_activity_at >= local {
                        self.unread.insert(
                            summary.id.clone(),
                            UnreadLedger {
                                baseline: summary.unread_count,
                                live: BTreeSet::new(),
                            },
                        );
                        self.conversations[idx] = summary;
                        merged += 1;
                    }
                }
                None => {
                    self.unread.insert(
                        summary.id.clone(),
                        UnreadLedger {
                            baseline: summary.unread_count,
                            live: BTreeSet::new(),
                        },
                    );
                    self.conversations.push(summary);
                    merged += 1;
                }
            }
        }
        self.resort();
        merged
    }

    /// Remove the given ids from the unread projection of `conversation_id`.
    /// Ids that were counted live are dropped from the live set; the rest are
    /// taken from the baseline, which saturates at zero.
    pub fn acknowledge_read(&mut self, conversation_id: &ConversationId, ids: &[MessageId]) {
        let ledger = self.unread.entry(conversation_id.clone()).or_default();
        let mut from_baseline = 0u32;
        for id in ids {
            if !ledger.live.remove(id) {
                from_baseline = from_baseline.saturating_add(1);
            }
        }
        ledger.baseline = ledger.baseline.saturating_sub(from_baseline);
        self.recount(conversation_id);
    }

    /// Synchronous filter over the currently loaded summaries only.
    pub fn filter<P>(&self, predicate: P) -> Vec<&Conversation>
    where
        P: Fn(&Conversation) -> bool,
    {
        self.conversations.iter().filter(|c| predicate(c)).collect()
    }

    fn position(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn recount(&mut self, id: &ConversationId) {
        let total = self.unread.get(id).map_or(0, UnreadLedger::total);
        if let Some(idx) = self.position(id) {
            self.conversations[idx].unread_count = total;
        }
    }

    fn resort(&mut self) {
        // None sorts last; ties keep their relative order
        self.conversations
            .sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
    }
}
