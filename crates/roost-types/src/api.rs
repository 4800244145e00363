use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageKind};

// -- History --

/// One page of channel history. Page 0 is the newest page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub channel_id: Uuid,
    /// Provisional id of the optimistic copy, echoed back on the stored message.
    pub nonce: Uuid,
    #[serde(default)]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
}

/// Edit request. The server rejects it with a conflict when the stored
/// `edited_at` no longer matches `expected_edited_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub channel_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub expected_edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteMessageRequest {
    pub channel_id: Uuid,
    pub message_id: Uuid,
    #[serde(default)]
    pub expected_edited_at: Option<DateTime<Utc>>,
}

// -- Reactions --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub channel_id: Uuid,
    pub message_id: Uuid,
    pub emoji: String,
}

/// `added` is the server's word on whether the caller now holds the reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleReactionResponse {
    pub added: bool,
}

/// Per-emoji aggregate shown next to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
    pub viewer_reacted: bool,
}
