use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocol::{ChannelEvent, EventKind};

/// Callback invoked from the session's driver task. Must not block.
pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Token returned by `on`, used to remove exactly that handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Handlers per event name. Registration appends; nothing is replaced.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl HandlerRegistry {
    pub(crate) fn add(&self, kind: EventKind, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub(crate) fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Call every handler registered for the event, in registration order.
    /// The list is cloned first so handlers may register or remove others.
    pub(crate) fn dispatch(&self, event: &ChannelEvent) -> usize {
        let targets: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in &targets {
            handler(event);
        }
        targets.len()
    }
}
