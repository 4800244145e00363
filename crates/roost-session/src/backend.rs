//! Collaborators the session talks to. Everything behind these traits
//! (HTTP, sockets, storage) lives outside this crate.

use std::fmt;
use std::future::Future;

use roost_types::api::{
    DeleteMessageRequest, EditMessageRequest, HistoryPage, SendMessageRequest,
    ToggleReactionRequest, ToggleReactionResponse,
};
use roost_types::events::PushEnvelope;
use roost_types::models::{Message, Profile, ReactionRow};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BackendError;

/// Pull-based reads and request/response writes.
pub trait ChatBackend: Send + Sync + 'static {
    /// One page of history, page 0 being the newest.
    fn fetch_history(
        &self,
        channel_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<HistoryPage, BackendError>> + Send;

    /// Every reaction row for the given messages.
    fn fetch_reactions(
        &self,
        message_ids: Vec<Uuid>,
    ) -> impl Future<Output = Result<Vec<ReactionRow>, BackendError>> + Send;

    fn send_message(
        &self,
        req: SendMessageRequest,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;

    fn edit_message(
        &self,
        req: EditMessageRequest,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;

    /// Returns the tombstoned message.
    fn delete_message(
        &self,
        req: DeleteMessageRequest,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;

    fn toggle_reaction(
        &self,
        req: ToggleReactionRequest,
    ) -> impl Future<Output = Result<ToggleReactionResponse, BackendError>> + Send;
}

/// Push delivery for one channel at a time. Delivery is at-least-once and
/// unordered.
pub trait PushTransport: Send + Sync {
    fn subscribe(&self, channel_id: Uuid) -> Result<Subscription, BackendError>;
}

/// Local, non-blocking profile lookup for channel members.
pub trait MemberRoster: Send + Sync {
    fn profile(&self, channel_id: Uuid, user_id: Uuid) -> Option<Profile>;
}

/// A roster that knows nobody. Authors then come from event payloads only.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRoster;

impl MemberRoster for EmptyRoster {
    fn profile(&self, _channel_id: Uuid, _user_id: Uuid) -> Option<Profile> {
        None
    }
}

/// A live push subscription. Dropping it unsubscribes.
pub struct Subscription {
    channel_id: Uuid,
    events: mpsc::UnboundedReceiver<PushEnvelope>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// `release` runs exactly once, when the subscription is dropped.
    pub fn new<F>(channel_id: Uuid, events: mpsc::UnboundedReceiver<PushEnvelope>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            channel_id,
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    /// Next event, or `None` once the transport dropped the stream.
    pub async fn recv(&mut self) -> Option<PushEnvelope> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}
