//! JSON-lines replay scripts.
//!
//! Each line is one step, tagged by `op`. Users, channels and messages are
//! referred to by name; names are bound to fresh ids on first use.
//!
//! ```text
//! {"op":"join","user":"alice","channel":"general"}
//! {"op":"open","user":"alice","channel":"general"}
//! {"op":"send","user":"alice","text":"hi","label":"m1"}
//! {"op":"post","user":"bob","channel":"general","text":"hey","reply_to":"m1"}
//! {"op":"react","user":"alice","message":"m1","emoji":"👍"}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roost_gateway::{MemoryBackend, MemoryClient, Operation};
use roost_session::{
    BackendError, ChannelSessionView, ChannelSwitcher, Draft, SessionConfig, SessionError,
    SessionHandle,
};
use roost_types::api::{DeleteMessageRequest, EditMessageRequest, SendMessageRequest, ToggleReactionRequest};
use roost_types::models::{MessageKind, Profile};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Make `user` a member of `channel`.
    Join { user: String, channel: String },
    /// Switch `user`'s open channel.
    Open { user: String, channel: String },
    Send {
        user: String,
        text: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        reply_to: Option<String>,
    },
    Edit { user: String, message: String, text: String },
    Delete { user: String, message: String },
    React { user: String, message: String, emoji: String },
    LoadOlder { user: String },
    Refresh { user: String },
    /// Write straight to the server, as a client without a session would.
    Post {
        user: String,
        channel: String,
        text: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        reply_to: Option<String>,
    },
    RemoteEdit { user: String, message: String, text: String },
    RemoteDelete { user: String, message: String },
    RemoteReact { user: String, message: String, emoji: String },
    /// Fail the next server call of `call` with a network error.
    Fail { call: Call },
    /// Let pushes propagate.
    Wait { ms: u64 },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    FetchHistory,
    FetchReactions,
    Send,
    Edit,
    Delete,
    ToggleReaction,
}

impl From<Call> for Operation {
    fn from(call: Call) -> Self {
        match call {
            Call::FetchHistory => Operation::FetchHistory,
            Call::FetchReactions => Operation::FetchReactions,
            Call::Send => Operation::Send,
            Call::Edit => Operation::Edit,
            Call::Delete => Operation::Delete,
            Call::ToggleReaction => Operation::ToggleReaction,
        }
    }
}

/// Parse a whole script. Blank lines and lines starting with `#` are skipped.
pub fn parse(source: &str) -> anyhow::Result<Vec<Step>> {
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("script line {}", n + 1))
        })
        .collect()
}

/// Replays steps against one in-memory server.
pub struct Replay {
    backend: MemoryBackend,
    config: SessionConfig,
    users: HashMap<String, Uuid>,
    channels: HashMap<String, Uuid>,
    /// label -> (channel_id, message_id)
    messages: HashMap<String, (Uuid, Uuid)>,
    switchers: BTreeMap<String, ChannelSwitcher<MemoryClient>>,
}

impl Replay {
    pub fn new(backend: MemoryBackend, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            users: HashMap::new(),
            channels: HashMap::new(),
            messages: HashMap::new(),
            switchers: BTreeMap::new(),
        }
    }

    pub async fn run(&mut self, steps: Vec<Step>) -> anyhow::Result<()> {
        for (n, step) in steps.into_iter().enumerate() {
            debug!("Step {}: {:?}", n + 1, step);
            self.step(step)
                .await
                .with_context(|| format!("step {}", n + 1))?;
        }
        Ok(())
    }

    /// Current view of every user's open session.
    pub fn views(&self) -> BTreeMap<String, ChannelSessionView> {
        self.switchers
            .iter()
            .filter_map(|(user, switcher)| Some((user.clone(), switcher.current()?.view())))
            .collect()
    }

    pub async fn close(&mut self) {
        for switcher in self.switchers.values_mut() {
            switcher.close().await;
        }
    }

    async fn step(&mut self, step: Step) -> anyhow::Result<()> {
        match step {
            Step::Join { user, channel } => {
                let user_id = self.user(&user);
                let channel_id = self.channel(&channel);
                self.backend.add_member(channel_id, Profile::new(user_id, user));
            }
            Step::Open { user, channel } => {
                let user_id = self.user(&user);
                let channel_id = self.channel(&channel);
                let switcher = self.switchers.entry(user).or_insert_with(|| {
                    ChannelSwitcher::new(user_id, self.config.clone(), self.backend.client(user_id).collaborators())
                });
                let handle = switcher.switch_to(channel_id).await;
                let view = handle.wait_loaded().await?;
                info!("Channel {} is {}", channel, view.state);
            }
            Step::Send {
                user,
                text,
                label,
                reply_to,
            } => {
                let handle = self.session(&user)?;
                let mut draft = Draft::text(text);
                if let Some(reply_to) = reply_to {
                    draft = draft.replying_to(self.message(&reply_to)?.1);
                }
                if let Some(message_id) = report(handle.send_message(draft).await) {
                    if let Some(label) = label {
                        self.messages.insert(label, (handle.channel_id(), message_id));
                    }
                }
            }
            Step::Edit { user, message, text } => {
                let handle = self.session(&user)?;
                let (_, message_id) = self.message(&message)?;
                report(handle.edit_message(message_id, text).await);
            }
            Step::Delete { user, message } => {
                let handle = self.session(&user)?;
                let (_, message_id) = self.message(&message)?;
                report(handle.delete_message(message_id).await);
            }
            Step::React { user, message, emoji } => {
                let handle = self.session(&user)?;
                let (_, message_id) = self.message(&message)?;
                report(handle.toggle_reaction(message_id, emoji).await);
            }
            Step::LoadOlder { user } => {
                report(self.session(&user)?.load_older_page().await);
            }
            Step::Refresh { user } => {
                report(self.session(&user)?.refresh().await);
            }
            Step::Post {
                user,
                channel,
                text,
                label,
                reply_to,
            } => {
                let user_id = self.user(&user);
                let channel_id = self.channel(&channel);
                let reply_to = reply_to.map(|label| self.message(&label)).transpose()?;
                let stored = self.backend.send_as(
                    user_id,
                    SendMessageRequest {
                        channel_id,
                        nonce: Uuid::new_v4(),
                        kind: MessageKind::Text,
                        content: text,
                        metadata: Default::default(),
                        reply_to: reply_to.map(|(_, id)| id),
                    },
                );
                if let Some(message) = report_backend(stored) {
                    if let Some(label) = label {
                        self.messages.insert(label, (channel_id, message.id));
                    }
                }
            }
            Step::RemoteEdit { user, message, text } => {
                let user_id = self.user(&user);
                let (channel_id, message_id) = self.message(&message)?;
                let expected_edited_at = self
                    .backend
                    .message(message_id)
                    .and_then(|m| m.edited_at);
                report_backend(self.backend.edit_as(
                    user_id,
                    EditMessageRequest {
                        channel_id,
                        message_id,
                        content: text,
                        expected_edited_at,
                    },
                ));
            }
            Step::RemoteDelete { user, message } => {
                let user_id = self.user(&user);
                let (channel_id, message_id) = self.message(&message)?;
                let expected_edited_at = self
                    .backend
                    .message(message_id)
                    .and_then(|m| m.edited_at);
                report_backend(self.backend.delete_as(
                    user_id,
                    DeleteMessageRequest {
                        channel_id,
                        message_id,
                        expected_edited_at,
                    },
                ));
            }
            Step::RemoteReact { user, message, emoji } => {
                let user_id = self.user(&user);
                let (channel_id, message_id) = self.message(&message)?;
                report_backend(self.backend.toggle_as(
                    user_id,
                    ToggleReactionRequest {
                        channel_id,
                        message_id,
                        emoji,
                    },
                ));
            }
            Step::Fail { call } => {
                self.backend
                    .fail_next(call.into(), BackendError::Network("injected by script".into()));
            }
            Step::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Ok(())
    }

    fn user(&mut self, name: &str) -> Uuid {
        *self.users.entry(name.to_string()).or_insert_with(Uuid::new_v4)
    }

    fn channel(&mut self, name: &str) -> Uuid {
        *self.channels.entry(name.to_string()).or_insert_with(Uuid::new_v4)
    }

    fn message(&self, label: &str) -> anyhow::Result<(Uuid, Uuid)> {
        self.messages
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("no message labelled {:?}", label))
    }

    fn session(&self, user: &str) -> anyhow::Result<SessionHandle> {
        self.switchers
            .get(user)
            .and_then(ChannelSwitcher::current)
            .cloned()
            .ok_or_else(|| anyhow!("{} has no open channel", user))
    }
}

/// Session failures are part of what a script exercises; log and go on.
fn report<T>(result: Result<T, SessionError>) -> Option<T> {
    result.map_err(|err| warn!("Action failed: {}", err)).ok()
}

fn report_backend<T>(result: Result<T, BackendError>) -> Option<T> {
    result.map_err(|err| warn!("Server call failed: {}", err)).ok()
}
