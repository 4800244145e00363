use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, ReactionRow};

/// Events pushed by the backend to subscribers of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    /// A new message was stored. Author data may be embedded.
    MessageInserted { message: Message },

    /// A stored message changed: edited, or soft-deleted via `deleted_at`.
    MessageUpdated { message: Message },

    /// A user added a reaction
    ReactionInserted {
        channel_id: Uuid,
        reaction: ReactionRow,
    },

    /// A user removed a reaction
    ReactionDeleted {
        channel_id: Uuid,
        reaction: ReactionRow,
    },
}

impl PushEvent {
    /// Channel this event belongs to.
    pub fn channel_id(&self) -> Uuid {
        match self {
            Self::MessageInserted { message } | Self::MessageUpdated { message } => {
                message.channel_id
            }
            Self::ReactionInserted { channel_id, .. } | Self::ReactionDeleted { channel_id, .. } => {
                *channel_id
            }
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageInserted { .. } => "message_inserted",
            Self::MessageUpdated { .. } => "message_updated",
            Self::ReactionInserted { .. } => "reaction_inserted",
            Self::ReactionDeleted { .. } => "reaction_deleted",
        }
    }
}

/// A push event as delivered by the transport. Delivery is at-least-once,
/// so the same `event_id` may show up more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub event_id: Uuid,
    pub event: PushEvent,
}

impl PushEnvelope {
    pub fn new(event: PushEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event,
        }
    }
}
