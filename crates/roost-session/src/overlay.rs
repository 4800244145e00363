//! Optimistic local mutations and their exact inverses.
//!
//! Every action is applied to the session before the network call and
//! registered together with the snapshot needed to undo it. At most one
//! action may be pending per entity; different entities may be pending at
//! the same time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use roost_types::api::{
    DeleteMessageRequest, EditMessageRequest, SendMessageRequest, ToggleReactionRequest,
};
use roost_types::models::Message;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::ReactionAggregator;
use crate::error::SessionError;
use crate::merger::MessageSequence;

/// What a pending action is about. Used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// The history pager (one page load at a time).
    History,
    Message(Uuid),
    Reaction { message_id: Uuid, emoji: String },
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History => write!(f, "history"),
            Self::Message(id) => write!(f, "message {}", id),
            Self::Reaction { message_id, emoji } => write!(f, "{} on message {}", emoji, message_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Send,
    Edit,
    Delete,
    ReactToggle,
}

/// The request that goes to the backend once the action is applied locally.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Send(SendMessageRequest),
    Edit(EditMessageRequest),
    Delete(DeleteMessageRequest),
    ReactToggle(ToggleReactionRequest),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Send(_) => ActionKind::Send,
            Self::Edit(_) => ActionKind::Edit,
            Self::Delete(_) => ActionKind::Delete,
            Self::ReactToggle(_) => ActionKind::ReactToggle,
        }
    }

    /// Message the action targets. For a send this is the provisional id.
    pub fn message_id(&self) -> Uuid {
        match self {
            Self::Send(req) => req.nonce,
            Self::Edit(req) => req.message_id,
            Self::Delete(req) => req.message_id,
            Self::ReactToggle(req) => req.message_id,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Self::ReactToggle(req) => EntityKey::Reaction {
                message_id: req.message_id,
                emoji: req.emoji.clone(),
            },
            other => EntityKey::Message(other.message_id()),
        }
    }
}

/// State captured before an action, enough to invert it.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Nothing to keep: undoing a send removes the provisional message.
    Send,
    Edit {
        prior_content: String,
        prior_edited_at: Option<DateTime<Utc>>,
        applied_content: String,
    },
    Delete { message: Message, index: usize },
    ReactToggle { was_reacted: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub local_id: Uuid,
    pub payload: ActionPayload,
    pub snapshot: Snapshot,
    /// Newest server copy of the target seen while the action was in
    /// flight. A rollback restores this instead of the snapshot.
    pub server_copy: Option<Message>,
}

impl PendingAction {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn key(&self) -> EntityKey {
        self.payload.key()
    }
}

// -- Overrides --

#[derive(Debug, Clone)]
struct Override<V> {
    value: V,
    expires_at: Instant,
}

/// Local values that beat refetched server values until they expire.
///
/// Expiry is checked lazily against the caller's `now`; there are no timers.
/// An entry set at `t` is visible for `now < t + ttl` and gone from `t + ttl`.
#[derive(Debug, Clone)]
pub struct OverrideMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, Override<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> OverrideMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            Override {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = now >= self.entries.get(key)?.expires_at;
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|o| o.value.clone())
    }

    pub fn clear(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|o| o.value)
    }

    /// All unexpired entries. Expired ones are dropped on the way.
    pub fn active(&mut self, now: Instant) -> Vec<(K, V)> {
        self.entries.retain(|_, o| now < o.expires_at);
        self.entries
            .iter()
            .map(|(k, o)| (k.clone(), o.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Locally edited content that a refetch must not undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentOverride {
    pub content: String,
    pub edited_at: Option<DateTime<Utc>>,
}

// -- Overlay --

#[derive(Debug, Clone)]
pub struct Overlay {
    pending: BTreeMap<EntityKey, PendingAction>,
    by_local_id: HashMap<Uuid, EntityKey>,
    content: OverrideMap<Uuid, ContentOverride>,
    reactions: OverrideMap<(Uuid, String), bool>,
}

impl Overlay {
    pub fn new(override_ttl: Duration) -> Self {
        Self {
            pending: BTreeMap::new(),
            by_local_id: HashMap::new(),
            content: OverrideMap::new(override_ttl),
            reactions: OverrideMap::new(override_ttl),
        }
    }

    pub fn is_busy(&self, key: &EntityKey) -> bool {
        self.pending.contains_key(key)
    }

    fn ensure_free(&self, key: &EntityKey) -> Result<(), SessionError> {
        if self.is_busy(key) {
            return Err(SessionError::Busy(key.clone()));
        }
        Ok(())
    }

    fn register(&mut self, action: PendingAction) -> &PendingAction {
        let key = action.key();
        self.by_local_id.insert(action.local_id, key.clone());
        self.pending.entry(key).or_insert(action)
    }

    /// Show `provisional` right away. Its id doubles as the local id and the
    /// nonce the server echoes back.
    pub fn begin_send(
        &mut self,
        messages: &mut MessageSequence,
        provisional: Message,
    ) -> Result<&PendingAction, SessionError> {
        let payload = ActionPayload::Send(SendMessageRequest {
            channel_id: provisional.channel_id,
            nonce: provisional.id,
            kind: provisional.kind,
            content: provisional.content.clone(),
            metadata: provisional.metadata.clone(),
            reply_to: provisional.reply_to,
        });
        self.ensure_free(&payload.key())?;

        let local_id = provisional.id;
        messages.insert_sorted(provisional);
        Ok(self.register(PendingAction {
            local_id,
            payload,
            snapshot: Snapshot::Send,
            server_copy: None,
        }))
    }

    pub fn begin_edit(
        &mut self,
        messages: &mut MessageSequence,
        message_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
        now: Instant,
    ) -> Result<&PendingAction, SessionError> {
        self.ensure_free(&EntityKey::Message(message_id))?;
        let message = messages
            .get_mut(message_id)
            .ok_or(SessionError::UnknownMessage(message_id))?;

        let prior_edited_at = message.edited_at.replace(edited_at);
        let prior_content = std::mem::replace(&mut message.content, content.clone());
        let payload = ActionPayload::Edit(EditMessageRequest {
            channel_id: message.channel_id,
            message_id,
            content: content.clone(),
            expected_edited_at: prior_edited_at,
        });
        let snapshot = Snapshot::Edit {
            prior_content,
            prior_edited_at,
            applied_content: content.clone(),
        };

        self.content.set(
            message_id,
            ContentOverride {
                content,
                edited_at: Some(edited_at),
            },
            now,
        );
        Ok(self.register(PendingAction {
            local_id: Uuid::new_v4(),
            payload,
            snapshot,
            server_copy: None,
        }))
    }

    pub fn begin_delete(
        &mut self,
        messages: &mut MessageSequence,
        message_id: Uuid,
    ) -> Result<&PendingAction, SessionError> {
        self.ensure_free(&EntityKey::Message(message_id))?;
        let (index, message) = messages
            .remove(message_id)
            .ok_or(SessionError::UnknownMessage(message_id))?;

        let payload = ActionPayload::Delete(DeleteMessageRequest {
            channel_id: message.channel_id,
            message_id,
            expected_edited_at: message.edited_at,
        });
        Ok(self.register(PendingAction {
            local_id: Uuid::new_v4(),
            payload,
            snapshot: Snapshot::Delete { message, index },
            server_copy: None,
        }))
    }

    pub fn begin_toggle(
        &mut self,
        reactions: &mut ReactionAggregator,
        channel_id: Uuid,
        message_id: Uuid,
        emoji: String,
        now: Instant,
    ) -> Result<&PendingAction, SessionError> {
        let payload = ActionPayload::ReactToggle(ToggleReactionRequest {
            channel_id,
            message_id,
            emoji: emoji.clone(),
        });
        self.ensure_free(&payload.key())?;

        let was_reacted = reactions.viewer_reacted(message_id, &emoji);
        reactions.set_viewer_reacted(message_id, &emoji, !was_reacted);
        self.reactions.set((message_id, emoji), !was_reacted, now);

        Ok(self.register(PendingAction {
            local_id: Uuid::new_v4(),
            payload,
            snapshot: Snapshot::ReactToggle { was_reacted },
            server_copy: None,
        }))
    }

    /// Remove a pending action from the registry, e.g. once it is settled.
    pub fn take(&mut self, local_id: Uuid) -> Option<PendingAction> {
        let key = self.by_local_id.remove(&local_id)?;
        self.pending.remove(&key)
    }

    pub fn get(&self, local_id: Uuid) -> Option<&PendingAction> {
        self.pending.get(self.by_local_id.get(&local_id)?)
    }

    /// Swap `stored` in for the provisional entry of the pending send it
    /// echoes and settle that send. Hands `stored` back when no pending
    /// send carries its nonce.
    pub fn reconcile_send(
        &mut self,
        messages: &mut MessageSequence,
        mut stored: Message,
    ) -> Result<Uuid, Message> {
        let Some(nonce) = stored.nonce.filter(|nonce| *nonce != stored.id) else {
            return Err(stored);
        };
        if !self.get(nonce).is_some_and(|action| action.kind() == ActionKind::Send) {
            return Err(stored);
        }

        self.take(nonce);
        if stored.author.is_none() {
            stored.author = messages.get(nonce).and_then(|m| m.author.clone());
        }
        messages.replace(nonce, stored);
        Ok(nonce)
    }

    /// Remember `message` as the server's copy for a pending edit or delete
    /// of it. Copies older than what the action already knows are ignored.
    pub fn record_server_copy(&mut self, message: &Message) {
        if message.deleted_at.is_some() {
            return;
        }
        let Some(action) = self.pending.get_mut(&EntityKey::Message(message.id)) else {
            return;
        };
        let baseline = match (&action.server_copy, &action.snapshot) {
            (Some(held), _) => held.edited_at,
            (None, Snapshot::Edit { prior_edited_at, .. }) => *prior_edited_at,
            (None, Snapshot::Delete { message: removed, .. }) => removed.edited_at,
            _ => return,
        };
        if message.edited_at >= baseline {
            action.server_copy = Some(message.clone());
        }
    }

    /// Undo `action`. Each branch is the inverse of the matching `begin_*`.
    pub fn rollback(
        &mut self,
        action: &PendingAction,
        messages: &mut MessageSequence,
        reactions: &mut ReactionAggregator,
    ) {
        let message_id = action.payload.message_id();
        match (&action.snapshot, &action.payload) {
            (Snapshot::Send, _) => {
                messages.remove(action.local_id);
            }
            (
                Snapshot::Edit {
                    prior_content,
                    prior_edited_at,
                    applied_content,
                },
                _,
            ) => {
                self.content.clear(&message_id);
                if let Some(server) = &action.server_copy {
                    if messages.position(message_id).is_some() {
                        messages.overwrite(server.clone());
                    }
                } else if let Some(message) = messages.get_mut(message_id) {
                    // a newer remote edit landed meanwhile; keep it
                    if message.content == *applied_content {
                        message.content = prior_content.clone();
                        message.edited_at = *prior_edited_at;
                    }
                }
            }
            (Snapshot::Delete { message, index }, _) => {
                if messages.is_tombstoned(message_id) || messages.position(message_id).is_some() {
                    return;
                }
                let restored = action.server_copy.clone().unwrap_or_else(|| message.clone());
                let restored_at = messages.insert_sorted(restored);
                if restored_at != *index {
                    debug!("Restored message {} at {} (was {})", message_id, restored_at, index);
                }
            }
            (Snapshot::ReactToggle { was_reacted }, ActionPayload::ReactToggle(req)) => {
                self.reactions.clear(&(req.message_id, req.emoji.clone()));
                reactions.set_viewer_reacted(req.message_id, &req.emoji, *was_reacted);
            }
            (Snapshot::ReactToggle { .. }, _) => {}
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.values()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True while any action targets the message or one of its reactions.
    pub fn touches_message(&self, message_id: Uuid) -> bool {
        self.pending.keys().any(|key| match key {
            EntityKey::Message(id) => *id == message_id,
            EntityKey::Reaction { message_id: id, .. } => *id == message_id,
            EntityKey::History => false,
        })
    }

    // -- Override access --

    pub fn content_override(&mut self, message_id: Uuid, now: Instant) -> Option<ContentOverride> {
        self.content.get(&message_id, now)
    }

    pub fn clear_content_override(&mut self, message_id: Uuid) {
        self.content.clear(&message_id);
    }

    pub fn active_content_overrides(&mut self, now: Instant) -> Vec<(Uuid, ContentOverride)> {
        self.content.active(now)
    }

    pub fn set_reaction_override(&mut self, message_id: Uuid, emoji: &str, reacted: bool, now: Instant) {
        self.reactions.set((message_id, emoji.to_string()), reacted, now);
    }

    pub fn reaction_override(&mut self, message_id: Uuid, emoji: &str, now: Instant) -> Option<bool> {
        self.reactions.get(&(message_id, emoji.to_string()), now)
    }

    pub fn clear_reaction_override(&mut self, message_id: Uuid, emoji: &str) {
        self.reactions.clear(&(message_id, emoji.to_string()));
    }

    pub fn active_reaction_overrides(&mut self, now: Instant) -> Vec<((Uuid, String), bool)> {
        self.reactions.active(now)
    }

    /// Forget all pending actions and overrides.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.by_local_id.clear();
        self.content = OverrideMap::new(self.content.ttl);
        self.reactions = OverrideMap::new(self.reactions.ttl);
    }
}
