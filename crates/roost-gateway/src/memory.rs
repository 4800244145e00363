//! In-memory chat server: message and reaction storage, a member roster,
//! push publication through a [`Dispatcher`] and scripted faults.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use roost_session::config::MAX_PAGE_SIZE;
use roost_session::{
    BackendError, ChatBackend, Collaborators, MemberRoster, PushTransport, Subscription,
};
use roost_types::api::{
    DeleteMessageRequest, EditMessageRequest, HistoryPage, SendMessageRequest,
    ToggleReactionRequest, ToggleReactionResponse,
};
use roost_types::events::PushEvent;
use roost_types::models::{Message, MessageKind, Profile, ReactionRow};

use crate::dispatcher::Dispatcher;

/// Backend operations that faults can be scripted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchHistory,
    FetchReactions,
    Send,
    Edit,
    Delete,
    ToggleReaction,
}

#[derive(Default)]
struct Store {
    /// channel_id -> messages, oldest first, tombstones included
    messages: HashMap<Uuid, Vec<Message>>,
    reactions: BTreeSet<(Uuid, Uuid, String)>,
    members: HashMap<Uuid, HashMap<Uuid, Profile>>,
    faults: HashMap<Operation, VecDeque<BackendError>>,
    /// Last timestamp handed out, kept strictly increasing.
    clock: Option<DateTime<Utc>>,
}

impl Store {
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.clock {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.clock = Some(now);
        now
    }

    fn take_fault(&mut self, op: Operation) -> Result<(), BackendError> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!("Injected fault for {:?}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn find_mut(&mut self, channel_id: Uuid, message_id: Uuid) -> Option<&mut Message> {
        self.messages
            .get_mut(&channel_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    fn find_by_id(&self, message_id: Uuid) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|messages| messages.iter())
            .find(|m| m.id == message_id)
    }

    fn profile(&self, channel_id: Uuid, user_id: Uuid) -> Option<Profile> {
        self.members.get(&channel_id)?.get(&user_id).cloned()
    }
}

/// Shared server state. Cheap to clone; every clone sees the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    dispatcher: Dispatcher,
}

impl MemoryBackend {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// A connection acting as `user_id`.
    pub fn client(&self, user_id: Uuid) -> MemoryClient {
        MemoryClient {
            user_id,
            backend: self.clone(),
        }
    }

    pub fn add_member(&self, channel_id: Uuid, profile: Profile) {
        let mut store = self.store.lock();
        store.messages.entry(channel_id).or_default();
        store
            .members
            .entry(channel_id)
            .or_default()
            .insert(profile.user_id, profile);
    }

    /// Store a message as history without publishing it.
    pub fn seed_message(&self, message: Message) {
        let mut store = self.store.lock();
        let messages = store.messages.entry(message.channel_id).or_default();
        let key = message.sort_key();
        let idx = messages.partition_point(|m| m.sort_key() < key);
        messages.insert(idx, message);
    }

    /// Store a reaction without publishing it.
    pub fn seed_reaction(&self, row: ReactionRow) {
        self.store
            .lock()
            .reactions
            .insert((row.message_id, row.user_id, row.emoji));
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per
    /// operation.
    pub fn fail_next(&self, op: Operation, err: BackendError) {
        self.store
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn message(&self, message_id: Uuid) -> Option<Message> {
        self.store.lock().find_by_id(message_id).cloned()
    }

    // -- Reads --

    /// Page `page` of a channel, newest first. Tombstones are included so
    /// readers learn about deletions.
    pub fn history(&self, channel_id: Uuid, page: u32, page_size: u32) -> Result<HistoryPage, BackendError> {
        let mut store = self.store.lock();
        store.take_fault(Operation::FetchHistory)?;

        let page_size = page_size.clamp(1, MAX_PAGE_SIZE) as usize;
        let skip = page as usize * page_size;
        let all = store.messages.get(&channel_id).map(Vec::as_slice).unwrap_or_default();
        let messages: Vec<Message> = all.iter().rev().skip(skip).take(page_size).cloned().collect();

        Ok(HistoryPage {
            has_more: all.len() > skip + messages.len(),
            messages,
        })
    }

    pub fn reactions(&self, message_ids: &[Uuid]) -> Result<Vec<ReactionRow>, BackendError> {
        let mut store = self.store.lock();
        store.take_fault(Operation::FetchReactions)?;

        Ok(store
            .reactions
            .iter()
            .filter(|(message_id, _, _)| message_ids.contains(message_id))
            .map(|(message_id, user_id, emoji)| ReactionRow::new(*message_id, *user_id, emoji.clone()))
            .collect())
    }

    // -- Writes, each followed by a push --

    pub fn send_as(&self, user_id: Uuid, req: SendMessageRequest) -> Result<Message, BackendError> {
        let message = {
            let mut store = self.store.lock();
            store.take_fault(Operation::Send)?;

            if req.kind == MessageKind::Text && req.content.trim().is_empty() {
                return Err(BackendError::Rejected("Message content cannot be empty".into()));
            }
            let messages = store.messages.get(&req.channel_id);
            if messages.is_none() {
                return Err(BackendError::Rejected("Unknown channel".into()));
            }
            // a retried send with the same nonce returns the stored copy
            if let Some(existing) = messages
                .into_iter()
                .flatten()
                .find(|m| m.author_id == user_id && m.nonce == Some(req.nonce))
            {
                return Ok(existing.clone());
            }

            let message = Message {
                id: Uuid::new_v4(),
                channel_id: req.channel_id,
                author_id: user_id,
                author: store.profile(req.channel_id, user_id),
                kind: req.kind,
                content: req.content,
                metadata: req.metadata,
                reply_to: req.reply_to,
                nonce: Some(req.nonce),
                created_at: store.now(),
                edited_at: None,
                deleted_at: None,
            };
            store
                .messages
                .entry(req.channel_id)
                .or_default()
                .push(message.clone());
            message
        };

        self.dispatcher.publish(PushEvent::MessageInserted {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Post as another member, the way a remote user would.
    pub fn post(&self, user_id: Uuid, channel_id: Uuid, content: &str) -> Result<Message, BackendError> {
        self.send_as(
            user_id,
            SendMessageRequest {
                channel_id,
                nonce: Uuid::new_v4(),
                kind: MessageKind::Text,
                content: content.to_string(),
                metadata: Default::default(),
                reply_to: None,
            },
        )
    }

    pub fn edit_as(&self, user_id: Uuid, req: EditMessageRequest) -> Result<Message, BackendError> {
        let updated = {
            let mut store = self.store.lock();
            store.take_fault(Operation::Edit)?;
            let now = store.now();

            let message = store
                .find_mut(req.channel_id, req.message_id)
                .ok_or_else(|| BackendError::Rejected("Message not found".into()))?;
            check_writable(message, user_id, req.expected_edited_at)?;
            message.content = req.content;
            message.edited_at = Some(now);
            message.clone()
        };

        self.dispatcher.publish(PushEvent::MessageUpdated {
            message: updated.clone(),
        });
        Ok(updated)
    }

    pub fn delete_as(&self, user_id: Uuid, req: DeleteMessageRequest) -> Result<Message, BackendError> {
        let deleted = {
            let mut store = self.store.lock();
            store.take_fault(Operation::Delete)?;
            let now = store.now();

            let message = store
                .find_mut(req.channel_id, req.message_id)
                .ok_or_else(|| BackendError::Rejected("Message not found".into()))?;
            check_writable(message, user_id, req.expected_edited_at)?;
            message.deleted_at = Some(now);
            let deleted = message.clone();
            store
                .reactions
                .retain(|(message_id, _, _)| *message_id != req.message_id);
            deleted
        };

        self.dispatcher.publish(PushEvent::MessageUpdated {
            message: deleted.clone(),
        });
        Ok(deleted)
    }

    /// Toggle `user_id`'s reaction. One reaction per (message, user, emoji).
    pub fn toggle_as(&self, user_id: Uuid, req: ToggleReactionRequest) -> Result<ToggleReactionResponse, BackendError> {
        let added = {
            let mut store = self.store.lock();
            store.take_fault(Operation::ToggleReaction)?;

            match store.find_mut(req.channel_id, req.message_id) {
                Some(message) if !message.is_deleted() => {}
                Some(message) => {
                    return Err(BackendError::Conflict {
                        current: Some(Box::new(message.clone())),
                    });
                }
                None => return Err(BackendError::Rejected("Message not found".into())),
            }

            let key = (req.message_id, user_id, req.emoji.clone());
            if store.reactions.remove(&key) {
                false
            } else {
                store.reactions.insert(key);
                true
            }
        };

        let reaction = ReactionRow::new(req.message_id, user_id, req.emoji);
        let channel_id = req.channel_id;
        self.dispatcher.publish(if added {
            PushEvent::ReactionInserted { channel_id, reaction }
        } else {
            PushEvent::ReactionDeleted { channel_id, reaction }
        });
        Ok(ToggleReactionResponse { added })
    }
}

/// Edits and deletes need the author and an unchanged `edited_at`.
fn check_writable(
    message: &Message,
    user_id: Uuid,
    expected_edited_at: Option<DateTime<Utc>>,
) -> Result<(), BackendError> {
    if message.author_id != user_id {
        return Err(BackendError::Rejected("You can only change your own messages".into()));
    }
    if message.is_deleted() || message.edited_at != expected_edited_at {
        return Err(BackendError::Conflict {
            current: Some(Box::new(message.clone())),
        });
    }
    Ok(())
}

/// One user's connection to a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryClient {
    user_id: Uuid,
    backend: MemoryBackend,
}

impl MemoryClient {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// This connection as backend, push transport and roster of a session.
    pub fn collaborators(&self) -> Collaborators<MemoryClient> {
        Collaborators {
            backend: Arc::new(self.clone()),
            transport: Arc::new(self.clone()),
            roster: Arc::new(self.clone()),
        }
    }
}

impl ChatBackend for MemoryClient {
    async fn fetch_history(&self, channel_id: Uuid, page: u32, page_size: u32) -> Result<HistoryPage, BackendError> {
        self.backend.history(channel_id, page, page_size)
    }

    async fn fetch_reactions(&self, message_ids: Vec<Uuid>) -> Result<Vec<ReactionRow>, BackendError> {
        self.backend.reactions(&message_ids)
    }

    async fn send_message(&self, req: SendMessageRequest) -> Result<Message, BackendError> {
        self.backend.send_as(self.user_id, req)
    }

    async fn edit_message(&self, req: EditMessageRequest) -> Result<Message, BackendError> {
        self.backend.edit_as(self.user_id, req)
    }

    async fn delete_message(&self, req: DeleteMessageRequest) -> Result<Message, BackendError> {
        self.backend.delete_as(self.user_id, req)
    }

    async fn toggle_reaction(&self, req: ToggleReactionRequest) -> Result<ToggleReactionResponse, BackendError> {
        self.backend.toggle_as(self.user_id, req)
    }
}

impl PushTransport for MemoryClient {
    fn subscribe(&self, channel_id: Uuid) -> Result<Subscription, BackendError> {
        let store = self.backend.store.lock();
        let is_member = store
            .members
            .get(&channel_id)
            .is_some_and(|members| members.contains_key(&self.user_id));
        if !is_member {
            return Err(BackendError::Rejected(format!("Not a member of channel {}", channel_id)));
        }
        drop(store);

        info!("{} subscribing to channel {}", self.user_id, channel_id);
        Ok(self.backend.dispatcher.subscribe(self.user_id, channel_id))
    }
}

impl MemberRoster for MemoryClient {
    fn profile(&self, channel_id: Uuid, user_id: Uuid) -> Option<Profile> {
        self.backend.store.lock().profile(channel_id, user_id)
    }
}
