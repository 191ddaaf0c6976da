//! Push-channel wire protocol.
//!
//! Every frame is a JSON envelope `{"event": "<name>", "data": {...}}`.
//! Inbound frames are decoded into [`PushEvent`] and validated here, before
//! anything reaches the typed stores; outbound signals are [`ChannelSignal`].

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{
    DecodeFrameSnafu, DecodePayloadSnafu, InvalidPayloadSnafu, ProtocolError, UnknownEventSnafu,
};
use crate::model::{ConversationId, Message, Notification, UserId};
use crate::validation;

/// Events pushed by the server, one fixed payload shape per tag.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
    },
    RefreshConversations,
    NewNotification {
        notification: Notification,
    },
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::NewMessage { .. } => EventKind::NewMessage,
            PushEvent::RefreshConversations => EventKind::RefreshConversations,
            PushEvent::NewNotification { .. } => EventKind::NewNotification,
        }
    }
}

/// Everything a session hands to its registered handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Push(PushEvent),
    /// First successful connection of the session.
    Connected,
    /// The transport dropped; the session is reconnecting.
    Disconnected { reason: String },
    /// Connection re-established and all rooms rejoined.
    Reconnected { attempt: u32 },
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Push(event) => event.kind(),
            ChannelEvent::Connected => EventKind::Connect,
            ChannelEvent::Disconnected { .. } => EventKind::Disconnect,
            ChannelEvent::Reconnected { .. } => EventKind::Reconnect,
        }
    }
}

/// Event names handlers can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    NewMessage,
    RefreshConversations,
    NewNotification,
    Connect,
    Disconnect,
    Reconnect,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::NewMessage,
        EventKind::RefreshConversations,
        EventKind::NewNotification,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Reconnect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::RefreshConversations => "refresh_conversations",
            EventKind::NewNotification => "new_notification",
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Reconnect => "reconnect",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room a session can subscribe to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomId {
    /// The current user's personal event stream.
    User(UserId),
    Conversation(ConversationId),
}

impl RoomId {
    pub fn join_signal(&self) -> ChannelSignal {
        match self {
            RoomId::User(user_id) => ChannelSignal::JoinUser {
                user_id: user_id.clone(),
            },
            RoomId::Conversation(conversation_id) => ChannelSignal::JoinConversation {
                conversation_id: conversation_id.clone(),
            },
        }
    }

    /// User rooms live as long as the session and have no leave signal.
    pub fn leave_signal(&self) -> Option<ChannelSignal> {
        match self {
            RoomId::User(_) => None,
            RoomId::Conversation(conversation_id) => Some(ChannelSignal::LeaveConversation {
                conversation_id: conversation_id.clone(),
            }),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            RoomId::User(id) => validation::validate_identifier("user", id.as_str()),
            RoomId::Conversation(id) => validation::validate_identifier("conversation", id.as_str()),
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::User(id) => write!(f, "user:{}", id),
            RoomId::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

/// Signals sent from the client to the push server.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelSignal {
    JoinUser {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    JoinConversation {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    LeaveConversation {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
}

/// Connection state of a push session, surfaced to the UI as a flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether the UI should show its non-blocking "reconnecting" indicator.
    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectionState::Reconnecting)
    }
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMessagePayload {
    conversation_id: ConversationId,
    message: Message,
}

#[derive(Deserialize)]
struct NewNotificationPayload {
    notification: Notification,
}

/// Decode and validate one inbound text frame.
pub fn decode_frame(text: &str) -> Result<PushEvent, ProtocolError> {
    let stage = "decode_frame";
    let raw: RawFrame = serde_json::from_str(text).context(DecodeFrameSnafu { stage })?;

    match EventKind::from_name(&raw.event) {
        Some(EventKind::NewMessage) => {
            let event = "new_message";
            let payload: NewMessagePayload =
                serde_json::from_value(raw.data).context(DecodePayloadSnafu { stage, event })?;
            validate_new_message(&payload).map_err(|details| {
                InvalidPayloadSnafu { stage, event, details }.build()
            })?;
            Ok(PushEvent::NewMessage {
                conversation_id: payload.conversation_id,
                message: payload.message,
            })
        }
        Some(EventKind::RefreshConversations) => Ok(PushEvent::RefreshConversations),
        Some(EventKind::NewNotification) => {
            let event = "new_notification";
            let payload: NewNotificationPayload =
                serde_json::from_value(raw.data).context(DecodePayloadSnafu { stage, event })?;
            let id = payload.notification.id.as_str();
            validation::validate_identifier("notification", id).map_err(|details| {
                InvalidPayloadSnafu { stage, event, details }.build()
            })?;
            Ok(PushEvent::NewNotification {
                notification: payload.notification,
            })
        }
        // lifecycle names are local; the server never sends them as frames
        _ => UnknownEventSnafu {
            stage,
            event: raw.event,
        }
        .fail(),
    }
}

fn validate_new_message(payload: &NewMessagePayload) -> Result<(), String> {
    let message = &payload.message;
    validation::validate_identifier("conversation", payload.conversation_id.as_str())?;
    if message.conversation_id != payload.conversation_id {
        return Err(format!(
            "message belongs to {} but was pushed for {}",
            message.conversation_id, payload.conversation_id
        ));
    }
    if message.dedup_key().is_none() {
        return Err("message has neither id nor localId".to_string());
    }
    if let Some(id) = &message.id {
        validation::validate_identifier("message", id.as_str())?;
    }
    validation::validate_identifier("user", message.sender_id.as_str())
}

/// Encode an outbound signal as a text frame.
pub fn encode_signal(signal: &ChannelSignal) -> Result<String, serde_json::Error> {
    serde_json::to_string(signal)
}
