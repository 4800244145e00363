//! Scripted collaborators for driving a session task from tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use roost_session::{
    BackendError, ChannelSessionView, ChatBackend, Collaborators, EmptyRoster, PushTransport,
    SessionConfig, SessionHandle, Subscription,
};
use roost_types::api::{
    DeleteMessageRequest, EditMessageRequest, HistoryPage, SendMessageRequest,
    ToggleReactionRequest, ToggleReactionResponse,
};
use roost_types::events::PushEnvelope;
use roost_types::models::{Message, MessageKind, ReactionRow};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(channel_id: Uuid, secs: i64) -> Message {
    Message {
        id: Uuid::new_v4(),
        channel_id,
        author_id: Uuid::new_v4(),
        author: None,
        kind: MessageKind::Text,
        content: format!("m{}", secs),
        metadata: Default::default(),
        reply_to: None,
        nonce: None,
        created_at: at(secs),
        edited_at: None,
        deleted_at: None,
    }
}

/// Holds calls until opened.
pub struct Gate(watch::Sender<bool>);

impl Gate {
    fn new() -> Self {
        Self(watch::channel(true).0)
    }

    pub fn hold(&self) {
        self.0.send_replace(false);
    }

    pub fn release(&self) {
        self.0.send_replace(true);
    }

    async fn pass(&self) {
        let mut open = self.0.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
struct State {
    /// Oldest first.
    messages: Vec<Message>,
    rows: Vec<ReactionRow>,
    history_failures: u32,
    write_failure: Option<BackendError>,
    stored: Vec<Message>,
}

pub struct FakeBackend {
    pub channel_id: Uuid,
    state: Mutex<State>,
    pub history_gate: Gate,
    pub write_gate: Gate,
    writes: watch::Sender<usize>,
}

impl FakeBackend {
    pub fn new(channel_id: Uuid, messages: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            state: Mutex::new(State {
                messages,
                ..State::default()
            }),
            history_gate: Gate::new(),
            write_gate: Gate::new(),
            writes: watch::channel(0).0,
        })
    }

    pub fn set_rows(&self, rows: Vec<ReactionRow>) {
        self.state.lock().unwrap().rows = rows;
    }

    /// Replace a stored message, e.g. to simulate another user's edit.
    pub fn put_message(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        match state.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => state.messages.push(message),
        }
    }

    pub fn fail_history(&self, times: u32) {
        self.state.lock().unwrap().history_failures = times;
    }

    pub fn fail_next_write(&self, err: BackendError) {
        self.state.lock().unwrap().write_failure = Some(err);
    }

    /// Wait until at least `n` write calls have started.
    pub async fn writes_started(&self, n: usize) {
        let mut writes = self.writes.subscribe();
        let _ = tokio::time::timeout(Duration::from_secs(5), writes.wait_for(|count| *count >= n)).await;
    }

    pub fn last_stored(&self) -> Option<Message> {
        self.state.lock().unwrap().stored.last().cloned()
    }

    async fn write<T>(&self, stored: Option<Message>, ok: T) -> Result<T, BackendError> {
        if let Some(message) = stored {
            self.state.lock().unwrap().stored.push(message);
        }
        self.writes.send_modify(|count| *count += 1);
        self.write_gate.pass().await;
        match self.state.lock().unwrap().write_failure.take() {
            Some(err) => Err(err),
            None => Ok(ok),
        }
    }
}

impl ChatBackend for FakeBackend {
    async fn fetch_history(
        &self,
        _channel_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<HistoryPage, BackendError> {
        self.history_gate.pass().await;
        let mut state = self.state.lock().unwrap();
        if state.history_failures > 0 {
            state.history_failures -= 1;
            return Err(BackendError::Network("history unavailable".into()));
        }
        let skip = (page * page_size) as usize;
        let messages: Vec<Message> = state
            .messages
            .iter()
            .rev()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect();
        Ok(HistoryPage {
            has_more: state.messages.len() > skip + messages.len(),
            messages,
        })
    }

    async fn fetch_reactions(&self, message_ids: Vec<Uuid>) -> Result<Vec<ReactionRow>, BackendError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .iter()
            .filter(|row| message_ids.contains(&row.message_id))
            .cloned()
            .collect())
    }

    async fn send_message(&self, req: SendMessageRequest) -> Result<Message, BackendError> {
        let stored = Message {
            id: Uuid::new_v4(),
            channel_id: req.channel_id,
            author_id: Uuid::nil(),
            author: None,
            kind: req.kind,
            content: req.content,
            metadata: req.metadata,
            reply_to: req.reply_to,
            nonce: Some(req.nonce),
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        };
        self.write(Some(stored.clone()), stored).await
    }

    async fn edit_message(&self, req: EditMessageRequest) -> Result<Message, BackendError> {
        let mut edited = {
            let state = self.state.lock().unwrap();
            state
                .messages
                .iter()
                .find(|m| m.id == req.message_id)
                .cloned()
                .ok_or_else(|| BackendError::Rejected("no such message".into()))?
        };
        edited.content = req.content;
        edited.edited_at = Some(Utc::now());
        self.write(None, edited).await
    }

    async fn delete_message(&self, req: DeleteMessageRequest) -> Result<Message, BackendError> {
        let mut deleted = {
            let state = self.state.lock().unwrap();
            state
                .messages
                .iter()
                .find(|m| m.id == req.message_id)
                .cloned()
                .ok_or_else(|| BackendError::Rejected("no such message".into()))?
        };
        deleted.deleted_at = Some(Utc::now());
        self.write(None, deleted).await
    }

    async fn toggle_reaction(&self, _req: ToggleReactionRequest) -> Result<ToggleReactionResponse, BackendError> {
        self.write(None, ToggleReactionResponse { added: true }).await
    }
}

/// Push transport whose deliveries are driven by the test.
#[derive(Default)]
pub struct FakeTransport {
    senders: Mutex<HashMap<Uuid, mpsc::UnboundedSender<PushEnvelope>>>,
    live: Arc<AtomicUsize>,
    refuse: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Deliver to whoever subscribed to `channel_id`, whatever the envelope says.
    pub fn deliver(&self, channel_id: Uuid, envelope: PushEnvelope) -> bool {
        let senders = self.senders.lock().unwrap();
        senders
            .get(&channel_id)
            .is_some_and(|tx| tx.send(envelope).is_ok())
    }

    /// End the stream for `channel_id` as if the transport gave up.
    pub fn drop_stream(&self, channel_id: Uuid) {
        self.senders.lock().unwrap().remove(&channel_id);
    }
}

impl PushTransport for FakeTransport {
    fn subscribe(&self, channel_id: Uuid) -> Result<Subscription, BackendError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("push refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(channel_id, tx);
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = self.live.clone();
        Ok(Subscription::new(channel_id, rx, move || {
            live.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

pub fn deps(backend: &Arc<FakeBackend>, transport: &Arc<FakeTransport>) -> Collaborators<FakeBackend> {
    Collaborators {
        backend: backend.clone(),
        transport: transport.clone(),
        roster: Arc::new(EmptyRoster),
    }
}

pub fn open(backend: &Arc<FakeBackend>, transport: &Arc<FakeTransport>, viewer: Uuid) -> SessionHandle {
    SessionHandle::open(backend.channel_id, viewer, SessionConfig::default(), deps(backend, transport))
}

/// Wait for the view to satisfy `pred`, failing after five seconds.
pub async fn until<F>(handle: &SessionHandle, pred: F) -> ChannelSessionView
where
    F: FnMut(&ChannelSessionView) -> bool,
{
    let mut view = handle.watch();
    let seen = tokio::time::timeout(Duration::from_secs(5), view.wait_for(pred))
        .await
        .expect("view condition not reached in time")
        .expect("session task ended");
    seen.clone()
}
