use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a message carries. Rendering is up to the UI; the core only needs
/// the tag to round-trip it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
    Location,
    Seeds,
    Poll,
    System,
}

/// Public profile of a channel member, as known from the member roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            display_name: None,
            avatar_url: None,
        }
    }

    /// Name to show in the UI.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// A chat message as stored by the server and held by a channel session.
///
/// `id` is the only dedup key. Messages in a channel are ordered by
/// `(created_at, id)`; see [`Message::sort_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    /// Author profile, filled from the roster or from the event payload.
    #[serde(default)]
    pub author: Option<Profile>,
    #[serde(default)]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Weak reference to the message being replied to. Lookup only.
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    /// Client-chosen id echoed back by the server so the sender can match
    /// the stored message against its provisional copy.
    #[serde(default)]
    pub nonce: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    /// Tombstone. Once set the message is never shown again.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One stored reaction: a single user's emoji on a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReactionRow {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
}

impl ReactionRow {
    pub fn new(message_id: Uuid, user_id: Uuid, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
        }
    }
}
