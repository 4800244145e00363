//! Render-ready projection of a channel session.

use roost_types::api::ReactionSummary;
use roost_types::models::Message;
use serde::Serialize;
use uuid::Uuid;

use crate::controller::{ChannelController, Pagination, SessionState};
use crate::error::SessionError;
use crate::overlay::ActionKind;

/// Longest reply snippet, in chars.
const SNIPPET_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSessionView {
    pub channel_id: Uuid,
    pub state: SessionState,
    pub messages: Vec<MessageView>,
    pub pagination: Pagination,
    pub pending_actions: usize,
    pub fetch_error: Option<ErrorView>,
    pub subscription_error: Option<ErrorView>,
    /// Last failure per entity, cleared when the entity is acted on again.
    pub errors: Vec<EntityErrorView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub reactions: Vec<ReactionSummary>,
    /// Some action on the message or one of its reactions is in flight.
    pub pending: bool,
    /// Not yet stored by the server.
    pub provisional: bool,
    pub reply_preview: Option<ReplyPreview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyPreview {
    pub message_id: Uuid,
    pub author: Option<String>,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorView {
    pub message: String,
    pub retryable: bool,
}

impl From<&SessionError> for ErrorView {
    fn from(err: &SessionError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityErrorView {
    pub entity_id: Uuid,
    #[serde(flatten)]
    pub error: ErrorView,
}

impl ChannelSessionView {
    /// What a session shows before it opens and after it closes.
    pub fn closed(channel_id: Uuid) -> Self {
        Self {
            channel_id,
            state: SessionState::Closed,
            messages: Vec::new(),
            pagination: Pagination {
                page: 0,
                has_more: false,
            },
            pending_actions: 0,
            fetch_error: None,
            subscription_error: None,
            errors: Vec::new(),
        }
    }

    pub fn message(&self, id: Uuid) -> Option<&MessageView> {
        self.messages.iter().find(|m| m.message.id == id)
    }

    pub fn contents(&self) -> Vec<&str> {
        self.messages
            .iter()
            .map(|m| m.message.content.as_str())
            .collect()
    }

    pub fn error_for(&self, entity_id: Uuid) -> Option<&ErrorView> {
        self.errors
            .iter()
            .find(|e| e.entity_id == entity_id)
            .map(|e| &e.error)
    }
}

pub(crate) fn build(controller: &ChannelController) -> ChannelSessionView {
    let sequence = controller.messages();
    let overlay = controller.overlay();

    let messages = sequence
        .messages()
        .iter()
        .map(|message| {
            let reply_preview = message
                .reply_to
                .and_then(|id| sequence.get(id))
                .map(preview);
            MessageView {
                reactions: controller.reactions().summaries(message.id),
                pending: overlay.touches_message(message.id),
                provisional: overlay
                    .get(message.id)
                    .is_some_and(|action| action.kind() == ActionKind::Send),
                reply_preview,
                message: message.clone(),
            }
        })
        .collect();

    ChannelSessionView {
        channel_id: controller.channel_id(),
        state: controller.state(),
        messages,
        pagination: controller.pagination(),
        pending_actions: overlay.len(),
        fetch_error: controller.fetch_error().map(ErrorView::from),
        subscription_error: controller.subscription_error().map(ErrorView::from),
        errors: controller
            .errors()
            .iter()
            .map(|(entity_id, err)| EntityErrorView {
                entity_id: *entity_id,
                error: err.into(),
            })
            .collect(),
    }
}

fn preview(target: &Message) -> ReplyPreview {
    let mut snippet: String = target.content.chars().take(SNIPPET_CHARS).collect();
    if target.content.chars().count() > SNIPPET_CHARS {
        snippet.push('…');
    }
    ReplyPreview {
        message_id: target.id,
        author: target.author.as_ref().map(|p| p.label().to_string()),
        snippet,
    }
}
