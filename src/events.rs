//! Channel event processing: push deliveries and lifecycle changes applied
//! to `ClientState`.

use tracing::{debug, info, trace};

use crate::channel::SurfaceId;
use crate::message_store::Origin;
use crate::model::{ConversationId, Message, Notification};
use crate::protocol::{ChannelEvent, ConnectionState, PushEvent};
use crate::state::ClientState;

/// What a session handler forwards to the state owner.
#[derive(Clone, Debug)]
pub struct SyncEvent {
    pub surface: SurfaceId,
    pub event: ChannelEvent,
}

/// UI-facing change produced by applying events.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    MessagesInserted {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    ConversationsChanged,
    NotificationReceived {
        notification: Notification,
        cue: Option<String>,
    },
    ConnectionChanged {
        surface: SurfaceId,
        state: ConnectionState,
    },
}

/// Accumulated result of one drain.
#[derive(Debug, Default)]
pub struct Applied {
    pub updates: Vec<Update>,
    /// At most one authoritative refresh is scheduled per drain.
    pub needs_refresh: bool,
}

/// Apply a single event. Duplicates and stale data produce no update.
pub fn apply_event(state: &mut ClientState, sync_event: SyncEvent, applied: &mut Applied) {
    let SyncEvent { surface, event } = sync_event;
    match event {
        ChannelEvent::Push(PushEvent::NewMessage {
            conversation_id,
            message,
        }) => {
            let inserted = state.insert_messages(&conversation_id, vec![message], Origin::Push);
            applied.needs_refresh |= inserted.needs_refresh;
            if inserted.messages.is_empty() {
                trace!(%surface, %conversation_id, "duplicate push message absorbed");
                return;
            }
            applied.updates.push(Update::MessagesInserted {
                conversation_id,
                messages: inserted.messages,
            });
            if !inserted.needs_refresh {
                push_once(&mut applied.updates, Update::ConversationsChanged);
            }
        }

        ChannelEvent::Push(PushEvent::RefreshConversations) => {
            debug!(%surface, "server requested conversation refresh");
            applied.needs_refresh = true;
        }

        ChannelEvent::Push(PushEvent::NewNotification { notification }) => {
            let received = state.notifications.receive(notification.clone());
            if received.is_new {
                applied.updates.push(Update::NotificationReceived {
                    notification,
                    cue: received.cue,
                });
            }
        }

        ChannelEvent::Connected => {
            applied.updates.push(Update::ConnectionChanged {
                surface,
                state: ConnectionState::Open,
            });
        }

        ChannelEvent::Disconnected { reason } => {
            info!(%surface, %reason, "surface disconnected");
            applied.updates.push(Update::ConnectionChanged {
                surface,
                state: ConnectionState::Reconnecting,
            });
        }

        // anything pushed while disconnected is gone; only a refresh recovers it
        ChannelEvent::Reconnected { attempt } => {
            info!(%surface, attempt, "surface reconnected, scheduling refresh");
            applied.needs_refresh = true;
            applied.updates.push(Update::ConnectionChanged {
                surface,
                state: ConnectionState::Open,
            });
        }
    }
}

fn push_once(updates: &mut Vec<Update>, update: Update) {
    if !updates.contains(&update) {
        updates.push(update);
    }
}
