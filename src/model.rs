//! Domain records shared by the stores, the push channel and the
//! collaborator contract.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned conversation identifier.
    ConversationId
);
string_id!(
    /// Durable message identifier, assigned once the server acknowledges a send.
    MessageId
);
string_id!(UserId);
string_id!(NotificationId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// A single chat message.
///
/// Stored messages are immutable except for `read_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Absent until the server acknowledges the send.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Client-generated id carried by optimistic sends and their echoes.
    #[serde(default)]
    pub local_id: Option<String>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment_ref: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// Identity used to recognise two message objects as the same logical message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Durable(MessageId),
    Local {
        local_id: String,
        sent_at: DateTime<Utc>,
    },
}

impl Message {
    /// Durable id if present, else local id + sentAt. `None` means the
    /// message carries neither and cannot be stored.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        if let Some(id) = &self.id {
            return Some(DedupKey::Durable(id.clone()));
        }
        self.local_id.as_ref().map(|local_id| DedupKey::Local {
            local_id: local_id.clone(),
            sent_at: self.sent_at,
        })
    }

    /// Sort key: ascending by (sentAt, id). Pending messages fall back to
    /// their local id for the tie-breaker.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        let tie = self
            .id
            .as_ref()
            .map(MessageId::as_str)
            .or(self.local_id.as_deref())
            .unwrap_or("");
        (self.sent_at, tie)
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// One-line preview for conversation summaries.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => self.content.lines().next().unwrap_or("").to_string(),
            MessageKind::Image => "[image]".to_string(),
            MessageKind::File => {
                if self.content.is_empty() {
                    "[file]".to_string()
                } else {
                    format!("[file] {}", self.content)
                }
            }
        }
    }
}

/// Inbox row for one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// The other party of the conversation.
    pub counterpart_id: UserId,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    /// e.g. "booking_request", "payment_received", "claim_opened"
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub link_ref: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Draft handed to the collaborator's send endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub local_id: String,
    pub content: String,
}

/// Multipart upload handed to the collaborator's attachment endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Optional caption sent alongside the file.
    pub caption: Option<String>,
}

impl AttachmentUpload {
    /// Message kind the server is expected to create for this upload.
    pub fn kind(&self) -> MessageKind {
        if self.content_type.starts_with("image/") {
            MessageKind::Image
        } else {
            MessageKind::File
        }
    }
}
