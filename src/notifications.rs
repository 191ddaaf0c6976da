//! Notification bell state: newest-first list, badge, alert cues and the
//! queue of read marks that still need persisting.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::model::{Notification, NotificationId};

pub const DEFAULT_NOTIFICATION_LIMIT: usize = 200;

/// Evicted ids remembered per retained entry, so late redeliveries of
/// evicted notifications are still recognised as duplicates.
const EVICTED_WINDOW_FACTOR: usize = 2;

/// What happened when a pushed notification was received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub is_new: bool,
    /// Locally chosen alert (sound, vibration pattern, …) for this type.
    pub cue: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationCenter {
    entries: Vec<Notification>,
    /// Ids of retained entries plus those in `evicted`.
    ids: HashSet<NotificationId>,
    /// Oldest evictions first; bounded by `limit * EVICTED_WINDOW_FACTOR`.
    evicted: VecDeque<NotificationId>,
    /// Ids marked read locally whose persist call has not succeeded yet.
    retry: BTreeSet<NotificationId>,
    alert_cues: HashMap<String, String>,
    limit: usize,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_LIMIT, HashMap::new())
    }
}

impl NotificationCenter {
    pub fn new(limit: usize, alert_cues: HashMap<String, String>) -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            evicted: VecDeque::new(),
            retry: BTreeSet::new(),
            alert_cues,
            limit: limit.max(1),
        }
    }

    pub fn entries(&self) -> &[Notification] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Always derived from the list, never tracked separately.
    pub fn badge_count(&self) -> usize {
        self.entries.iter().filter(|n| !n.is_read).count()
    }

    /// Insert at the head unless the id is already known, including ids
    /// recently evicted from the list.
    pub fn receive(&mut self, notification: Notification) -> Received {
        if self.ids.contains(&notification.id) {
            trace!(id = %notification.id, "duplicate notification absorbed");
            return Received {
                is_new: false,
                cue: None,
            };
        }

        let cue = if notification.is_read {
            None
        } else {
            self.alert_cues.get(&notification.kind).cloned()
        };
        self.ids.insert(notification.id.clone());
        self.entries.insert(0, notification);
        self.enforce_limit();
        Received { is_new: true, cue }
    }

    /// Seed the list from a loaded page (newest first). Known ids are skipped.
    pub fn load(&mut self, page: Vec<Notification>) -> usize {
        let mut added = 0;
        for notification in page {
            if self.ids.insert(notification.id.clone()) {
                self.entries.push(notification);
                added += 1;
            }
        }
        self.entries
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.enforce_limit();
        added
    }

    /// Optimistically mark entries read. Returns the ids that were unread
    /// before this call and exist in the list; those need persisting.
    pub fn mark_read_local(&mut self, ids: &[NotificationId]) -> Vec<NotificationId> {
        let wanted: HashSet<&NotificationId> = ids.iter().collect();
        let mut changed = Vec::new();
        for entry in self.entries.iter_mut() {
            if !entry.is_read && wanted.contains(&entry.id) {
                entry.is_read = true;
                changed.push(entry.id.clone());
            }
        }
        changed
    }

    pub fn unread_ids(&self) -> Vec<NotificationId> {
        self.entries
            .iter()
            .filter(|n| !n.is_read)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn queue_retry(&mut self, ids: impl IntoIterator<Item = NotificationId>) {
        self.retry.extend(ids);
    }

    pub fn clear_retry(&mut self, ids: &[NotificationId]) {
        for id in ids {
            self.retry.remove(id);
        }
    }

    pub fn pending_retry(&self) -> Vec<NotificationId> {
        self.retry.iter().cloned().collect()
    }

    fn enforce_limit(&mut self) {
        if self.entries.len() <= self.limit {
            return;
        }
        for evicted in self.entries.drain(self.limit..) {
            debug!(id = %evicted.id, "notification evicted from list");
            self.evicted.push_back(evicted.id);
        }
        let window = self.limit.saturating_mul(EVICTED_WINDOW_FACTOR);
        while self.evicted.len() > window {
            if let Some(forgotten) = self.evicted.pop_front() {
                self.ids.remove(&forgotten);
            }
        }
    }
}
