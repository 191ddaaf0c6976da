//! Request/response collaborator contract.
//!
//! The REST-style endpoints are owned by the backend; this crate only
//! consumes them through [`ChatApi`]. Implementations are expected to map
//! transport and decode failures onto [`ApiError`].

use async_trait::async_trait;

use crate::error::ApiError;
use crate::model::{
    AttachmentUpload, Conversation, ConversationId, Message, MessageId, Notification,
    NotificationId, OutgoingMessage,
};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Messages strictly older than `before` (or the newest page when
    /// `None`), ascending by `sentAt`.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        page_size: usize,
    ) -> Result<Vec<Message>, ApiError>;

    /// One page of conversation summaries, 1-based, newest activity first.
    async fn fetch_conversations(
        &self,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<Conversation>, ApiError>;

    /// Newest notifications first.
    async fn fetch_notifications(&self, limit: usize) -> Result<Vec<Notification>, ApiError>;

    async fn mark_messages_read(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
    ) -> Result<(), ApiError>;

    async fn mark_notifications_read(&self, ids: &[NotificationId]) -> Result<(), ApiError>;

    /// Returns the created message carrying its durable id and the draft's local id.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        draft: &OutgoingMessage,
    ) -> Result<Message, ApiError>;

    /// Multipart upload; returns the created message with its attachment reference.
    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        upload: &AttachmentUpload,
    ) -> Result<Message, ApiError>;
}
