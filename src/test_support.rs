//! Scripted fakes and fixtures shared by the test modules.

use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::api::ChatApi;
use crate::channel::{Transport, TransportLink};
use crate::error::{ApiError, TransportError, UnavailableSnafu};
use crate::model::{
    AttachmentUpload, Conversation, ConversationId, Message, MessageId, MessageKind,
    Notification, NotificationId, OutgoingMessage, UserId,
};
use crate::protocol::{encode_signal, ChannelSignal};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

/// Unread text message from the counterpart "guest".
pub fn incoming(conversation: &str, id: &str, secs: i64) -> Message {
    Message {
        id: Some(id.into()),
        local_id: None,
        conversation_id: conversation.into(),
        sender_id: "guest".into(),
        kind: MessageKind::Text,
        content: format!("text {}", id),
        attachment_ref: None,
        sent_at: at(secs),
        read_at: None,
    }
}

/// Ascending page with ids and timestamps taken from `ids`.
pub fn history_page(conversation: &str, ids: RangeInclusive<i64>) -> Vec<Message> {
    ids.map(|i| incoming(conversation, &i.to_string(), i)).collect()
}

pub fn summary(id: &str, secs: i64, unread: u32) -> Conversation {
    Conversation {
        id: id.into(),
        counterpart_id: "guest".into(),
        last_message_preview: Some(format!("preview {}", id)),
        last_activity_at: Some(at(secs)),
        unread_count: unread,
    }
}

pub fn notification(id: &str, secs: i64) -> Notification {
    Notification {
        id: id.into(),
        kind: "booking_request".into(),
        title: format!("Booking request {}", id),
        body: String::new(),
        link_ref: None,
        is_read: false,
        created_at: at(secs),
    }
}

/// `new_message` frame as the server would push it.
pub fn new_message_frame(message: &Message) -> String {
    serde_json::json!({
        "event": "new_message",
        "data": {
            "conversationId": message.conversation_id,
            "message": message,
        }
    })
    .to_string()
}

pub fn new_notification_frame(notification: &Notification) -> String {
    serde_json::json!({
        "event": "new_notification",
        "data": { "notification": notification }
    })
    .to_string()
}

/// Poll `condition` while letting other tasks (and paused time) advance.
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- transport ---

enum LinkInput {
    Frame(String),
    Drop,
}

struct LinkHandle {
    input: mpsc::UnboundedSender<LinkInput>,
    signals: Arc<Mutex<Vec<ChannelSignal>>>,
    closed: Arc<Mutex<bool>>,
}

#[derive(Default)]
struct TransportState {
    connects: usize,
    fail_next: usize,
    preload: Vec<String>,
    links: Vec<LinkHandle>,
}

/// In-memory transport. Every successful `connect` creates a numbered link
/// whose signals are recorded and whose inbound frames are injected by the
/// test. The journal interleaves sent signals with whatever handlers record.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn connect_count(&self) -> usize {
        locked(&self.state).connects
    }

    pub fn link_count(&self) -> usize {
        locked(&self.state).links.len()
    }

    pub fn fail_next_connects(&self, count: usize) {
        locked(&self.state).fail_next = count;
    }

    /// Frames already waiting on the next link when it is created.
    pub fn preload_next_link(&self, frames: Vec<String>) {
        locked(&self.state).preload = frames;
    }

    pub fn signals(&self, link: usize) -> Vec<ChannelSignal> {
        locked(&self.state)
            .links
            .get(link)
            .map(|l| locked(&l.signals).clone())
            .unwrap_or_default()
    }

    pub fn push_frame(&self, link: usize, frame: String) -> bool {
        locked(&self.state)
            .links
            .get(link)
            .is_some_and(|l| l.input.send(LinkInput::Frame(frame)).is_ok())
    }

    pub fn drop_link(&self, link: usize) -> bool {
        locked(&self.state)
            .links
            .get(link)
            .is_some_and(|l| l.input.send(LinkInput::Drop).is_ok())
    }

    pub fn is_closed(&self, link: usize) -> bool {
        locked(&self.state)
            .links
            .get(link)
            .is_some_and(|l| *locked(&l.closed))
    }

    pub fn record(&self, entry: impl Into<String>) {
        locked(&self.journal).push(entry.into());
    }

    pub fn journal(&self) -> Vec<String> {
        locked(&self.journal).clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _auth_token: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let mut state = locked(&self.state);
        state.connects += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return UnavailableSnafu {
                stage: "fake_connect",
                reason: "scripted connect failure",
            }
            .fail();
        }

        let (input, rx) = mpsc::unbounded_channel();
        for frame in state.preload.drain(..) {
            let _ = input.send(LinkInput::Frame(frame));
        }
        let signals = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let index = state.links.len();
        state.links.push(LinkHandle {
            input,
            signals: signals.clone(),
            closed: closed.clone(),
        });

        Ok(Box::new(FakeLink {
            index,
            rx,
            signals,
            closed,
            journal: self.journal.clone(),
        }))
    }
}

struct FakeLink {
    index: usize,
    rx: mpsc::UnboundedReceiver<LinkInput>,
    signals: Arc<Mutex<Vec<ChannelSignal>>>,
    closed: Arc<Mutex<bool>>,
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TransportLink for FakeLink {
    async fn send(&mut self, signal: &ChannelSignal) -> Result<(), TransportError> {
        let text = encode_signal(signal).unwrap_or_default();
        locked(&self.journal).push(format!("link{} {}", self.index, text));
        locked(&self.signals).push(signal.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.rx.recv().await {
            Some(LinkInput::Frame(text)) => Some(Ok(text)),
            Some(LinkInput::Drop) => Some(
                UnavailableSnafu {
                    stage: "fake_recv",
                    reason: "link dropped",
                }
                .fail(),
            ),
            None => None,
        }
    }

    async fn close(&mut self) {
        *locked(&self.closed) = true;
    }
}

// --- collaborator ---

struct ApiState {
    user: UserId,
    message_pages: VecDeque<Result<Vec<Message>, ApiError>>,
    conversation_pages: VecDeque<Result<Vec<Conversation>, ApiError>>,
    notifications: Vec<Notification>,
    message_requests: Vec<(ConversationId, Option<MessageId>, usize)>,
    conversation_requests: Vec<(u32, usize)>,
    read_calls: Vec<(ConversationId, Vec<MessageId>)>,
    notification_read_calls: Vec<Vec<NotificationId>>,
    sent: Vec<OutgoingMessage>,
    mark_read_failure: Option<ApiError>,
    send_failure: Option<ApiError>,
    message_gate: Option<oneshot::Receiver<()>>,
    read_gate: Option<oneshot::Receiver<()>>,
    next_id: u64,
}

/// Scripted collaborator. Pages are answered in the order they were queued;
/// an empty queue answers with an empty page.
pub struct FakeApi {
    state: Mutex<ApiState>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            state: Mutex::new(ApiState {
                user: "host".into(),
                message_pages: VecDeque::new(),
                conversation_pages: VecDeque::new(),
                notifications: Vec::new(),
                message_requests: Vec::new(),
                conversation_requests: Vec::new(),
                read_calls: Vec::new(),
                notification_read_calls: Vec::new(),
                sent: Vec::new(),
                mark_read_failure: None,
                send_failure: None,
                message_gate: None,
                read_gate: None,
                next_id: 1,
            }),
        }
    }
}

impl FakeApi {
    pub fn push_messages(&self, page: Result<Vec<Message>, ApiError>) {
        locked(&self.state).message_pages.push_back(page);
    }

    pub fn push_conversations(&self, page: Result<Vec<Conversation>, ApiError>) {
        locked(&self.state).conversation_pages.push_back(page);
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        locked(&self.state).notifications = notifications;
    }

    pub fn fail_mark_read(&self, error: ApiError) {
        locked(&self.state).mark_read_failure = Some(error);
    }

    pub fn fail_send(&self, error: ApiError) {
        locked(&self.state).send_failure = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut state = locked(&self.state);
        state.mark_read_failure = None;
        state.send_failure = None;
    }

    /// Hold the next `fetch_messages` answer until the sender fires.
    pub fn gate_messages(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        locked(&self.state).message_gate = Some(rx);
        tx
    }

    /// Hold the next `mark_messages_read` answer until the sender fires.
    pub fn gate_mark_read(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        locked(&self.state).read_gate = Some(rx);
        tx
    }

    pub fn message_requests(&self) -> Vec<(ConversationId, Option<MessageId>, usize)> {
        locked(&self.state).message_requests.clone()
    }

    pub fn conversation_requests(&self) -> Vec<(u32, usize)> {
        locked(&self.state).conversation_requests.clone()
    }

    pub fn read_calls(&self) -> Vec<(ConversationId, Vec<MessageId>)> {
        locked(&self.state).read_calls.clone()
    }

    pub fn notification_read_calls(&self) -> Vec<Vec<NotificationId>> {
        locked(&self.state).notification_read_calls.clone()
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        locked(&self.state).sent.clone()
    }

    fn created(&self, conversation_id: &ConversationId) -> Message {
        let mut state = locked(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        Message {
            id: Some(format!("srv-{}", id).into()),
            local_id: None,
            conversation_id: conversation_id.clone(),
            sender_id: state.user.clone(),
            kind: MessageKind::Text,
            content: String::new(),
            attachment_ref: None,
            sent_at: Utc::now(),
            read_at: None,
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        page_size: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let gate = {
            let mut state = locked(&self.state);
            state
                .message_requests
                .push((conversation_id.clone(), before.cloned(), page_size));
            state.message_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        locked(&self.state)
            .message_pages
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_conversations(
        &self,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<Conversation>, ApiError> {
        let mut state = locked(&self.state);
        state.conversation_requests.push((page, page_size));
        state
            .conversation_pages
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_notifications(&self, limit: usize) -> Result<Vec<Notification>, ApiError> {
        let state = locked(&self.state);
        Ok(state.notifications.iter().take(limit).cloned().collect())
    }

    async fn mark_messages_read(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
    ) -> Result<(), ApiError> {
        let gate = {
            let mut state = locked(&self.state);
            state.read_calls.push((conversation_id.clone(), ids.to_vec()));
            state.read_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        match locked(&self.state).mark_read_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn mark_notifications_read(&self, ids: &[NotificationId]) -> Result<(), ApiError> {
        let mut state = locked(&self.state);
        state.notification_read_calls.push(ids.to_vec());
        match state.mark_read_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        draft: &OutgoingMessage,
    ) -> Result<Message, ApiError> {
        {
            let mut state = locked(&self.state);
            state.sent.push(draft.clone());
            if let Some(error) = state.send_failure.clone() {
                return Err(error);
            }
        }
        let mut message = self.created(conversation_id);
        message.local_id = Some(draft.local_id.clone());
        message.content = draft.content.clone();
        Ok(message)
    }

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        upload: &AttachmentUpload,
    ) -> Result<Message, ApiError> {
        if let Some(error) = locked(&self.state).send_failure.clone() {
            return Err(error);
        }
        let mut message = self.created(conversation_id);
        message.kind = upload.kind();
        message.content = upload.caption.clone().unwrap_or_else(|| upload.file_name.clone());
        message.attachment_ref = Some(format!("blob/{}", upload.file_name));
        Ok(message)
    }
}
