//! Paginated history loads.
//!
//! Pure I/O: no caching, no store access. A page is either returned whole
//! and well-formed or not at all.

use std::collections::HashSet;
use std::sync::Arc;

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::error::{FetchResult, MalformedPageSnafu, RequestSnafu};
use crate::model::{Conversation, ConversationId, Message, MessageId, Notification};

/// A validated page of messages, ascending by `sentAt`.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Fewer than `page_size` results came back: nothing older exists.
    pub exhausted: bool,
}

#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn ChatApi>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    pub async fn fetch_message_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        page_size: usize,
    ) -> FetchResult<MessagePage> {
        let stage = "fetch_message_page";
        debug!(%conversation_id, before = ?before, page_size, "loading message page");

        let messages = self
            .api
            .fetch_messages(conversation_id, before, page_size)
            .await
            .context(RequestSnafu { stage })?;

        if let Err(details) = check_message_page(conversation_id, before, page_size, &messages) {
            warn!(%conversation_id, %details, "discarding malformed message page");
            return MalformedPageSnafu { stage, details }.fail();
        }

        let exhausted = messages.len() < page_size;
        Ok(MessagePage {
            messages,
            exhausted,
        })
    }

    pub async fn fetch_conversation_page(
        &self,
        page: u32,
        page_size: usize,
    ) -> FetchResult<Vec<Conversation>> {
        let stage = "fetch_conversation_page";
        debug!(page, page_size, "loading conversation page");

        let summaries = self
            .api
            .fetch_conversations(page, page_size)
            .await
            .context(RequestSnafu { stage })?;

        if let Err(details) = check_conversation_page(page_size, &summaries) {
            warn!(page, %details, "discarding malformed conversation page");
            return MalformedPageSnafu { stage, details }.fail();
        }
        Ok(summaries)
    }

    pub async fn fetch_notifications(&self, limit: usize) -> FetchResult<Vec<Notification>> {
        let stage = "fetch_notifications";
        let notifications = self
            .api
            .fetch_notifications(limit)
            .await
            .context(RequestSnafu { stage })?;
        if notifications.len() > limit {
            let details = format!("{} entries for limit {}", notifications.len(), limit);
            return MalformedPageSnafu { stage, details }.fail();
        }
        Ok(notifications)
    }
}

fn check_message_page(
    conversation_id: &ConversationId,
    before: Option<&MessageId>,
    page_size: usize,
    messages: &[Message],
) -> Result<(), String> {
    if messages.len() > page_size {
        return Err(format!(
            "{} messages for page size {}",
            messages.len(),
            page_size
        ));
    }

    let mut seen = HashSet::new();
    for message in messages {
        if &message.conversation_id != conversation_id {
            return Err(format!(
                "message from conversation {} in page for {}",
                message.conversation_id, conversation_id
            ));
        }
        let Some(id) = &message.id else {
            return Err("history message without a durable id".to_string());
        };
        if Some(id) == before {
            return Err(format!("page includes its own cursor {}", id));
        }
        if !seen.insert(id) {
            return Err(format!("message {} appears twice", id));
        }
    }

    // ties on sentAt are left for the store to order
    if messages
        .windows(2)
        .any(|pair| pair[0].sent_at > pair[1].sent_at)
    {
        return Err("messages are not ascending by sent time".to_string());
    }
    Ok(())
}

fn check_conversation_page(page_size: usize, summaries: &[Conversation]) -> Result<(), String> {
    if summaries.len() > page_size {
        return Err(format!(
            "{} summaries for page size {}",
            summaries.len(),
            page_size
        ));
    }
    if summaries
        .windows(2)
        .any(|pair| pair[0].last_activity_at < pair[1].last_activity_at)
    {
        return Err("summaries are not ordered by last activity".to_string());
    }
    Ok(())
}
