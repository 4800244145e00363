//! The per-channel state machine. Owns the merger, aggregator, overlay and
//! router for one open channel and is the only thing callers mutate.
//!
//! Every entry point is synchronous. Network calls happen elsewhere: an entry
//! point hands back a request ([`PageRequest`] or [`Ticket`]) and the caller
//! reports the result through [`ChannelController::finish_page`],
//! [`ChannelController::fail_page`] or [`ChannelController::settle`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::Utc;
use roost_types::api::{HistoryPage, ToggleReactionResponse};
use roost_types::events::{PushEnvelope, PushEvent};
use roost_types::models::{Message, MessageKind, Profile, ReactionRow};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{ReactionAggregator, ReactionTally};
use crate::backend::MemberRoster;
use crate::config::SessionConfig;
use crate::error::{BackendError, SessionError};
use crate::merger::{Direction, MessageSequence};
use crate::overlay::{ActionKind, ActionPayload, EntityKey, Overlay, PendingAction, Snapshot};
use crate::router::{PushRouter, RouteTarget, Routed};
use crate::view::{self, ChannelSessionView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    /// History fetch and reaction seed in flight, or failed and awaiting retry.
    Loading,
    /// Subscription live; actions and push events accepted.
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Loading => "loading",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// Highest page loaded so far, 0 being the newest.
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFetch {
    Initial,
    Older,
    Refresh,
}

/// A history read the caller should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub channel_id: Uuid,
    pub page: u32,
    pub page_size: u32,
    pub fetch: PageFetch,
}

/// A locally applied action whose payload still has to reach the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub local_id: Uuid,
    pub payload: ActionPayload,
}

impl From<&PendingAction> for Ticket {
    fn from(action: &PendingAction) -> Self {
        Self {
            local_id: action.local_id,
            payload: action.payload.clone(),
        }
    }
}

/// What the backend returned for a settled action.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Message(Message),
    Reaction(ToggleReactionResponse),
}

/// A message the viewer wants to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub kind: MessageKind,
    pub content: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub reply_to: Option<Uuid>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn replying_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Plain snapshot of the session state, comparable for equality.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSession {
    pub channel_id: Uuid,
    pub messages: Vec<Message>,
    pub tallies: HashMap<Uuid, ReactionTally>,
    pub pagination: Pagination,
    pub pending: BTreeSet<Uuid>,
}

pub struct ChannelController {
    channel_id: Uuid,
    viewer: Uuid,
    viewer_profile: Option<Profile>,
    config: SessionConfig,
    state: SessionState,
    messages: MessageSequence,
    reactions: ReactionAggregator,
    overlay: Overlay,
    router: PushRouter,
    pagination: Pagination,
    in_flight: Option<PageRequest>,
    fetch_error: Option<SessionError>,
    subscription_error: Option<SessionError>,
    errors: BTreeMap<Uuid, SessionError>,
    /// Sends already reconciled by their echo: local id -> stored id.
    echoed: HashMap<Uuid, Uuid>,
    /// Reaction changes routed while the newest page was being fetched,
    /// replayed over its rows. `true` for an insert.
    reactions_since_fetch: Vec<(ReactionRow, bool)>,
}

impl ChannelController {
    pub fn new(channel_id: Uuid, viewer: Uuid, config: SessionConfig) -> Self {
        let config = config.normalized();
        Self {
            channel_id,
            viewer,
            viewer_profile: None,
            state: SessionState::Closed,
            messages: MessageSequence::new(),
            reactions: ReactionAggregator::new(viewer),
            overlay: Overlay::new(config.override_ttl()),
            router: PushRouter::new(channel_id, config.seen_event_capacity),
            pagination: Pagination {
                page: 0,
                has_more: false,
            },
            in_flight: None,
            fetch_error: None,
            subscription_error: None,
            errors: BTreeMap::new(),
            echoed: HashMap::new(),
            reactions_since_fetch: Vec::new(),
            config,
        }
    }

    /// Profile stamped on provisional messages.
    pub fn set_viewer_profile(&mut self, profile: Option<Profile>) {
        self.viewer_profile = profile;
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn messages(&self) -> &MessageSequence {
        &self.messages
    }

    pub fn reactions(&self) -> &ReactionAggregator {
        &self.reactions
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn errors(&self) -> &BTreeMap<Uuid, SessionError> {
        &self.errors
    }

    pub fn fetch_error(&self) -> Option<&SessionError> {
        self.fetch_error.as_ref()
    }

    pub fn subscription_error(&self) -> Option<&SessionError> {
        self.subscription_error.as_ref()
    }

    pub fn is_loading_page(&self) -> bool {
        self.in_flight.is_some()
    }

    // -- Lifecycle --

    /// Closed -> Loading. Returns the first history read.
    pub fn open(&mut self) -> Result<PageRequest, SessionError> {
        if self.state != SessionState::Closed {
            return Err(SessionError::Busy(EntityKey::History));
        }
        self.reset();
        self.state = SessionState::Loading;
        info!("Opening channel {}", self.channel_id);
        Ok(self.start_fetch(0, PageFetch::Initial))
    }

    /// Reissue the initial read after it failed.
    pub fn retry_load(&mut self) -> Result<PageRequest, SessionError> {
        if self.state != SessionState::Loading {
            return Err(SessionError::NotReady(self.state));
        }
        if self.in_flight.is_some() {
            return Err(SessionError::Busy(EntityKey::History));
        }
        info!("Retrying load of channel {}", self.channel_id);
        Ok(self.start_fetch(0, PageFetch::Initial))
    }

    /// Ready -> next older page. `Ok(None)` when history is exhausted.
    pub fn begin_older_page(&mut self) -> Result<Option<PageRequest>, SessionError> {
        self.ensure_ready()?;
        if self.in_flight.is_some() {
            return Err(SessionError::Busy(EntityKey::History));
        }
        if !self.pagination.has_more {
            return Ok(None);
        }
        Ok(Some(self.start_fetch(self.pagination.page + 1, PageFetch::Older)))
    }

    /// Refetch the newest page, e.g. after navigation or a reconnect.
    pub fn begin_refresh(&mut self) -> Result<PageRequest, SessionError> {
        self.ensure_ready()?;
        if self.in_flight.is_some() {
            return Err(SessionError::Busy(EntityKey::History));
        }
        Ok(self.start_fetch(0, PageFetch::Refresh))
    }

    fn start_fetch(&mut self, page: u32, fetch: PageFetch) -> PageRequest {
        let request = PageRequest {
            channel_id: self.channel_id,
            page,
            page_size: self.config.page_size,
            fetch,
        };
        self.in_flight = Some(request);
        self.fetch_error = None;
        self.reactions_since_fetch.clear();
        request
    }

    /// Merge a fetched page and its reaction rows. An initial page moves the
    /// session to Ready, so call it only once the subscription is live.
    pub fn finish_page(
        &mut self,
        request: PageRequest,
        page: HistoryPage,
        rows: Vec<ReactionRow>,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.in_flight != Some(request) {
            debug!("Discarding stale page {} for {}", request.page, self.channel_id);
            return Ok(());
        }
        self.in_flight = None;

        let direction = match request.fetch {
            PageFetch::Older => Direction::Older,
            PageFetch::Initial | PageFetch::Refresh => Direction::Newer,
        };
        let listed: Vec<Uuid> = page
            .messages
            .iter()
            .filter(|m| !m.is_deleted())
            .map(|m| m.id)
            .collect();
        // the stored copy of a pending send takes over its provisional entry
        let mut fetched = Vec::with_capacity(page.messages.len());
        for message in page.messages {
            self.overlay.record_server_copy(&message);
            let id = message.id;
            match self.overlay.reconcile_send(&mut self.messages, message) {
                Ok(local_id) => self.note_echo(local_id, id),
                Err(message) => fetched.push(message),
            }
        }
        let outcome = self.messages.merge(fetched, direction);
        for id in &outcome.tombstoned {
            self.reactions.remove_message(*id);
        }
        self.reapply_local_state(now);

        // older pages only seed what they brought in; tallies of messages
        // already held are kept current by push events
        let seed_ids: Vec<Uuid> = match request.fetch {
            PageFetch::Older => outcome.inserted,
            PageFetch::Initial | PageFetch::Refresh => listed
                .into_iter()
                .filter(|id| self.messages.position(*id).is_some())
                .collect(),
        };
        let rows = match request.fetch {
            PageFetch::Older => rows,
            PageFetch::Initial | PageFetch::Refresh => {
                replay_reactions(rows, std::mem::take(&mut self.reactions_since_fetch))
            }
        };
        self.reactions.seed(&seed_ids, &rows);
        for ((message_id, emoji), reacted) in self.overlay.active_reaction_overrides(now) {
            if seed_ids.contains(&message_id) {
                self.reactions.set_viewer_reacted(message_id, &emoji, reacted);
            }
        }

        match request.fetch {
            PageFetch::Initial => {
                self.pagination = Pagination {
                    page: 0,
                    has_more: page.has_more,
                };
                self.state = SessionState::Ready;
                self.subscription_error = None;
                info!(
                    "Channel {} ready with {} messages",
                    self.channel_id,
                    self.messages.len()
                );
            }
            PageFetch::Older => {
                self.pagination = Pagination {
                    page: request.page,
                    has_more: page.has_more,
                };
            }
            PageFetch::Refresh => {
                if self.pagination.page == 0 {
                    self.pagination.has_more = page.has_more;
                }
            }
        }
        debug!(
            "Merged page {} of {}: {} new, {} updated, {} tombstoned",
            request.page,
            self.channel_id,
            seed_ids.len(),
            outcome.updated,
            outcome.tombstoned.len()
        );
        Ok(())
    }

    /// Record a failed history read. The initial read leaves the session in
    /// Loading until [`ChannelController::retry_load`].
    pub fn fail_page(&mut self, request: PageRequest, err: SessionError) -> SessionError {
        if self.in_flight == Some(request) {
            self.in_flight = None;
            warn!("Loading page {} of {} failed: {}", request.page, self.channel_id, err);
            self.fetch_error = Some(err.clone());
            self.reactions_since_fetch.clear();
        }
        err
    }

    /// The push stream ended while Ready. Recovery is the transport's job.
    pub fn subscription_lost(&mut self, reason: impl Into<String>) {
        let err = SessionError::Subscription(reason.into());
        warn!("Channel {}: {}", self.channel_id, err);
        self.subscription_error = Some(err);
    }

    /// Ready/Loading -> Closed. Drops all state; late results are refused.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(
            "Closing channel {} ({} actions still pending)",
            self.channel_id,
            self.overlay.len()
        );
        self.reset();
    }

    fn reset(&mut self) {
        self.state = SessionState::Closed;
        self.messages = MessageSequence::new();
        self.reactions = ReactionAggregator::new(self.viewer);
        self.overlay.clear();
        self.router = PushRouter::new(self.channel_id, self.config.seen_event_capacity);
        self.pagination = Pagination {
            page: 0,
            has_more: false,
        };
        self.in_flight = None;
        self.fetch_error = None;
        self.subscription_error = None;
        self.errors.clear();
        self.echoed.clear();
        self.reactions_since_fetch.clear();
    }

    /// Stored id of a send whose echo arrived before its own reply.
    pub fn take_echo(&mut self, local_id: Uuid) -> Option<Uuid> {
        self.echoed.remove(&local_id)
    }

    fn note_echo(&mut self, local_id: Uuid, message_id: Uuid) {
        self.errors.remove(&local_id);
        self.echoed.insert(local_id, message_id);
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready => Ok(()),
            other => Err(SessionError::NotReady(other)),
        }
    }

    /// Put unexpired local values back on top of freshly merged server data.
    fn reapply_local_state(&mut self, now: Instant) {
        for (id, local) in self.overlay.active_content_overrides(now) {
            if let Some(message) = self.messages.get_mut(id) {
                message.content = local.content;
                message.edited_at = local.edited_at;
            }
        }
        let held_back: Vec<Uuid> = self
            .overlay
            .pending()
            .filter(|action| action.kind() == ActionKind::Delete)
            .map(|action| action.payload.message_id())
            .collect();
        for id in held_back {
            self.messages.remove(id);
        }
    }

    // -- Push --

    pub fn apply_push(
        &mut self,
        envelope: PushEnvelope,
        roster: &dyn MemberRoster,
        now: Instant,
    ) -> Result<Routed, SessionError> {
        self.ensure_ready()?;
        let newest_in_flight = self
            .in_flight
            .is_some_and(|request| request.fetch != PageFetch::Older);
        let reaction = match &envelope.event {
            PushEvent::ReactionInserted { reaction, .. } if newest_in_flight => {
                Some((reaction.clone(), true))
            }
            PushEvent::ReactionDeleted { reaction, .. } if newest_in_flight => {
                Some((reaction.clone(), false))
            }
            _ => None,
        };
        let routed = self.router.route(
            envelope,
            RouteTarget {
                messages: &mut self.messages,
                reactions: &mut self.reactions,
                overlay: &mut self.overlay,
                roster,
                now,
            },
        );
        match routed {
            Routed::SendEchoed { local_id, message_id } => self.note_echo(local_id, message_id),
            Routed::ReactionApplied | Routed::ViewerEcho => {
                self.reactions_since_fetch.extend(reaction);
            }
            _ => {}
        }
        Ok(routed)
    }

    // -- Actions --

    pub fn send_message(&mut self, draft: Draft) -> Result<Ticket, SessionError> {
        self.ensure_ready()?;
        self.validate_content(draft.kind, &draft.content, !draft.metadata.is_empty())?;

        let id = Uuid::new_v4();
        let provisional = Message {
            id,
            channel_id: self.channel_id,
            author_id: self.viewer,
            author: self.viewer_profile.clone(),
            kind: draft.kind,
            content: draft.content,
            metadata: draft.metadata,
            reply_to: draft.reply_to,
            nonce: Some(id),
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        };
        let ticket = Ticket::from(self.overlay.begin_send(&mut self.messages, provisional)?);
        debug!("Sending {} in {}", ticket.local_id, self.channel_id);
        Ok(ticket)
    }

    pub fn edit_message(
        &mut self,
        message_id: Uuid,
        content: String,
        now: Instant,
    ) -> Result<Ticket, SessionError> {
        self.ensure_ready()?;
        let kind = self
            .messages
            .get(message_id)
            .map(|m| m.kind)
            .ok_or(SessionError::UnknownMessage(message_id))?;
        self.validate_content(kind, &content, false)?;

        let ticket = Ticket::from(self.overlay.begin_edit(
            &mut self.messages,
            message_id,
            content,
            Utc::now(),
            now,
        )?);
        self.errors.remove(&message_id);
        Ok(ticket)
    }

    pub fn delete_message(&mut self, message_id: Uuid) -> Result<Ticket, SessionError> {
        self.ensure_ready()?;
        let ticket = Ticket::from(self.overlay.begin_delete(&mut self.messages, message_id)?);
        self.errors.remove(&message_id);
        Ok(ticket)
    }

    pub fn toggle_reaction(
        &mut self,
        message_id: Uuid,
        emoji: &str,
        now: Instant,
    ) -> Result<Ticket, SessionError> {
        self.ensure_ready()?;
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(SessionError::Validation("emoji is empty".into()));
        }
        if self.messages.get(message_id).is_none() {
            return Err(SessionError::UnknownMessage(message_id));
        }
        // the server does not know a provisional id yet
        if self
            .overlay
            .get(message_id)
            .is_some_and(|action| action.kind() == ActionKind::Send)
        {
            return Err(SessionError::Busy(EntityKey::Message(message_id)));
        }

        let ticket = Ticket::from(self.overlay.begin_toggle(
            &mut self.reactions,
            self.channel_id,
            message_id,
            emoji.to_string(),
            now,
        )?);
        self.errors.remove(&message_id);
        Ok(ticket)
    }

    fn validate_content(
        &self,
        kind: MessageKind,
        content: &str,
        has_metadata: bool,
    ) -> Result<(), SessionError> {
        let blank = content.trim().is_empty();
        if blank && (kind == MessageKind::Text || !has_metadata) {
            return Err(SessionError::Validation("message content is empty".into()));
        }
        if content.chars().count() > self.config.max_content_len {
            return Err(SessionError::Validation(format!(
                "message content exceeds {} characters",
                self.config.max_content_len
            )));
        }
        Ok(())
    }

    /// Confirm or roll back the action registered under `local_id`.
    ///
    /// Failures roll back to the pre-action snapshot and are returned as
    /// well as recorded against the entity for the view.
    pub fn settle(
        &mut self,
        local_id: Uuid,
        outcome: Result<Confirmation, BackendError>,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let Some(action) = self.overlay.take(local_id) else {
            // already reconciled through a push echo
            match outcome {
                Ok(Confirmation::Message(message)) => {
                    self.messages.upsert(message);
                }
                Ok(Confirmation::Reaction(_)) => {}
                Err(err) => debug!("Ignoring late failure for {}: {}", local_id, err),
            }
            return Ok(());
        };

        let entity = action.payload.message_id();
        let result = match outcome {
            Ok(confirmation) => self.confirm(&action, confirmation, now),
            Err(BackendError::Conflict { current }) => {
                self.overlay
                    .rollback(&action, &mut self.messages, &mut self.reactions);
                if matches!(action.kind(), ActionKind::Edit | ActionKind::Delete) {
                    self.accept_server_copy(entity, current.map(|m| *m));
                }
                Err(SessionError::Conflict(entity))
            }
            Err(err) => {
                self.overlay
                    .rollback(&action, &mut self.messages, &mut self.reactions);
                Err(SessionError::from_backend(err, entity))
            }
        };

        match &result {
            Ok(()) => {
                debug!("Settled {:?} {} on {}", action.kind(), local_id, entity);
                self.errors.remove(&entity);
            }
            Err(err) => {
                warn!("Rolled back {:?} on {}: {}", action.kind(), entity, err);
                self.errors.insert(entity, err.clone());
            }
        }
        result
    }

    fn confirm(
        &mut self,
        action: &PendingAction,
        confirmation: Confirmation,
        now: Instant,
    ) -> Result<(), SessionError> {
        let entity = action.payload.message_id();
        match (&action.snapshot, &action.payload, confirmation) {
            (Snapshot::Send, _, Confirmation::Message(mut stored)) => {
                if stored.author.is_none() {
                    stored.author = self
                        .messages
                        .get(action.local_id)
                        .and_then(|m| m.author.clone());
                }
                self.messages.replace(action.local_id, stored);
                Ok(())
            }
            (Snapshot::Edit { .. }, _, Confirmation::Message(stored)) => {
                self.messages.overwrite(stored);
                Ok(())
            }
            (Snapshot::Delete { .. }, _, _) => {
                self.messages.tombstone(entity);
                self.reactions.remove_message(entity);
                self.overlay.clear_content_override(entity);
                Ok(())
            }
            (
                Snapshot::ReactToggle { was_reacted },
                ActionPayload::ReactToggle(req),
                Confirmation::Reaction(response),
            ) => {
                self.reactions
                    .set_viewer_reacted(req.message_id, &req.emoji, response.added);
                if response.added == !*was_reacted {
                    return Ok(());
                }
                // someone else's toggle won the race; show what the server holds
                self.overlay
                    .set_reaction_override(req.message_id, &req.emoji, response.added, now);
                Err(SessionError::Conflict(entity))
            }
            (_, _, other) => {
                self.overlay
                    .rollback(action, &mut self.messages, &mut self.reactions);
                Err(SessionError::Validation(format!(
                    "unexpected confirmation {:?} for {:?}",
                    other,
                    action.kind()
                )))
            }
        }
    }

    fn accept_server_copy(&mut self, entity: Uuid, current: Option<Message>) {
        match current {
            Some(message) if !message.is_deleted() => {
                self.messages.overwrite(message);
            }
            _ => {
                self.messages.tombstone(entity);
                self.reactions.remove_message(entity);
            }
        }
    }

    // -- Views --

    pub fn snapshot(&self) -> ChannelSession {
        ChannelSession {
            channel_id: self.channel_id,
            messages: self.messages.messages().to_vec(),
            tallies: self.reactions.tallies().clone(),
            pagination: self.pagination,
            pending: self.overlay.pending().map(|a| a.local_id).collect(),
        }
    }

    pub fn view(&self) -> ChannelSessionView {
        view::build(self)
    }
}

/// Apply reaction changes seen during a fetch to the rows it returned. Each
/// row is a set member, so replaying one the page already has is harmless.
fn replay_reactions(mut rows: Vec<ReactionRow>, changes: Vec<(ReactionRow, bool)>) -> Vec<ReactionRow> {
    for (row, inserted) in changes {
        rows.retain(|held| *held != row);
        if inserted {
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::backend::EmptyRoster;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(channel_id: Uuid, secs: i64) -> Message {
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

    /// A Ready controller holding `n` messages and the given reaction rows.
    fn ready(n: i64, has_more: bool) -> (ChannelController, Vec<Message>) {
        let channel = Uuid::new_v4();
        let mut ctl = ChannelController::new(channel, Uuid::new_v4(), SessionConfig::default());
        let request = ctl.open().unwrap();
        let messages: Vec<Message> = (0..n).map(|i| msg(channel, i)).collect();
        ctl.finish_page(
            request,
            HistoryPage {
                messages: messages.iter().rev().cloned().collect(),
                has_more,
            },
            Vec::new(),
            Instant::now(),
        )
        .unwrap();
        (ctl, messages)
    }

    fn stored_copy(ctl: &ChannelController, ticket: &Ticket) -> Message {
        let mut stored = ctl.messages().get(ticket.local_id).unwrap().clone();
        stored.id = Uuid::new_v4();
        stored.nonce = Some(ticket.local_id);
        stored
    }

    #[test]
    fn test_actions_rejected_before_ready() {
        let channel = Uuid::new_v4();
        let mut ctl = ChannelController::new(channel, Uuid::new_v4(), SessionConfig::default());
        assert_eq!(
            ctl.send_message(Draft::text("hi")).unwrap_err(),
            SessionError::NotReady(SessionState::Closed)
        );

        ctl.open().unwrap();
        assert_eq!(
            ctl.delete_message(Uuid::new_v4()).unwrap_err(),
            SessionError::NotReady(SessionState::Loading)
        );
        let push = PushEnvelope::new(PushEvent::MessageInserted {
            message: msg(channel, 1),
        });
        assert!(ctl.apply_push(push, &EmptyRoster, Instant::now()).is_err());
        assert!(ctl.messages().is_empty());
    }

    #[test]
    fn test_failed_load_stays_loading_until_retry() {
        let channel = Uuid::new_v4();
        let mut ctl = ChannelController::new(channel, Uuid::new_v4(), SessionConfig::default());
        let first = ctl.open().unwrap();
        assert_eq!(first.page, 0);
        assert_eq!(first.page_size, 50);

        let err = ctl.fail_page(first, SessionError::Network("timeout".into()));
        assert!(err.is_retryable());
        assert_eq!(ctl.state(), SessionState::Loading);
        assert!(ctl.fetch_error().is_some());

        let retry = ctl.retry_load().unwrap();
        assert_eq!(ctl.retry_load().unwrap_err(), SessionError::Busy(EntityKey::History));
        ctl.finish_page(
            retry,
            HistoryPage {
                messages: vec![msg(channel, 1)],
                has_more: false,
            },
            Vec::new(),
            Instant::now(),
        )
        .unwrap();
        assert_eq!(ctl.state(), SessionState::Ready);
        assert!(ctl.fetch_error().is_none());
    }

    #[test]
    fn test_scenario_c_confirmation_then_echo() {
        let (mut ctl, _) = ready(3, false);
        let now = Instant::now();
        let ticket = ctl.send_message(Draft::text("hello")).unwrap();
        assert_eq!(ctl.messages().len(), 4);

        let stored = stored_copy(&ctl, &ticket);
        let stored_id = stored.id;
        ctl.settle(ticket.local_id, Ok(Confirmation::Message(stored.clone())), now)
            .unwrap();
        ctl.apply_push(
            PushEnvelope::new(PushEvent::MessageInserted { message: stored }),
            &EmptyRoster,
            now,
        )
        .unwrap();

        let ids: Vec<Uuid> = ctl.messages().messages().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&stored_id));
        assert!(!ids.contains(&ticket.local_id));
    }

    #[test]
    fn test_scenario_c_echo_then_confirmation() {
        let (mut ctl, _) = ready(3, false);
        let now = Instant::now();
        let ticket = ctl.send_message(Draft::text("hello")).unwrap();
        let stored = stored_copy(&ctl, &ticket);

        let routed = ctl
            .apply_push(
                PushEnvelope::new(PushEvent::MessageInserted {
                    message: stored.clone(),
                }),
                &EmptyRoster,
                now,
            )
            .unwrap();
        assert!(matches!(routed, Routed::SendEchoed { .. }));
        ctl.settle(ticket.local_id, Ok(Confirmation::Message(stored.clone())), now)
            .unwrap();

        assert_eq!(ctl.messages().len(), 4);
        assert!(ctl.messages().get(stored.id).is_some());
        assert!(ctl.messages().get(ticket.local_id).is_none());
        assert!(ctl.overlay().is_empty());
    }

    #[test]
    fn test_scenario_e_failed_delete_restores_session() {
        let (mut ctl, messages) = ready(6, false);
        let before = ctl.snapshot();
        let m3 = messages[3].id;

        let ticket = ctl.delete_message(m3).unwrap();
        assert!(ctl.messages().get(m3).is_none());

        let err = ctl
            .settle(
                ticket.local_id,
                Err(BackendError::Network("reset".into())),
                Instant::now(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ctl.messages().position(m3), Some(3));
        assert_eq!(ctl.snapshot(), before);
        assert!(ctl.errors().contains_key(&m3));
    }

    #[test]
    fn test_failed_actions_restore_snapshot() {
        let (mut ctl, messages) = ready(3, false);
        let now = Instant::now();
        let target = messages[1].id;
        let before = ctl.snapshot();

        let send = ctl.send_message(Draft::text("draft")).unwrap();
        ctl.settle(send.local_id, Err(BackendError::Network("x".into())), now)
            .unwrap_err();
        assert_eq!(ctl.snapshot(), before);

        let edit = ctl.edit_message(target, "changed".into(), now).unwrap();
        ctl.settle(edit.local_id, Err(BackendError::Unavailable("x".into())), now)
            .unwrap_err();
        assert_eq!(ctl.snapshot(), before);

        let toggle = ctl.toggle_reaction(target, "👍", now).unwrap();
        assert_eq!(ctl.reactions().emoji(target, "👍").map(|t| t.count), Some(1));
        ctl.settle(toggle.local_id, Err(BackendError::Network("x".into())), now)
            .unwrap_err();
        assert_eq!(ctl.snapshot(), before);
    }

    #[test]
    fn test_validation_happens_before_mutation() {
        let (mut ctl, messages) = ready(2, false);
        let before = ctl.snapshot();
        let now = Instant::now();

        assert!(matches!(
            ctl.send_message(Draft::text("   ")),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            ctl.send_message(Draft::text("x".repeat(4_001))),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            ctl.edit_message(messages[0].id, String::new(), now),
            Err(SessionError::Validation(_))
        ));
        assert_eq!(ctl.snapshot(), before);
        assert!(ctl.overlay().is_empty());
    }

    #[test]
    fn test_one_pending_action_per_message() {
        let (mut ctl, messages) = ready(2, false);
        let now = Instant::now();
        let target = messages[0].id;

        ctl.edit_message(target, "one".into(), now).unwrap();
        assert_eq!(
            ctl.delete_message(target).unwrap_err(),
            SessionError::Busy(EntityKey::Message(target))
        );
        // a reaction is its own entity
        ctl.toggle_reaction(target, "👍", now).unwrap();
        ctl.delete_message(messages[1].id).unwrap();
        assert_eq!(ctl.overlay().len(), 3);
    }

    #[test]
    fn test_edit_conflict_keeps_server_copy() {
        let (mut ctl, messages) = ready(2, false);
        let now = Instant::now();
        let target = messages[0].id;

        let ticket = ctl.edit_message(target, "mine".into(), now).unwrap();
        let mut server = messages[0].clone();
        server.content = "theirs".into();
        server.edited_at = Some(at(100));

        let err = ctl
            .settle(
                ticket.local_id,
                Err(BackendError::Conflict {
                    current: Some(Box::new(server)),
                }),
                now,
            )
            .unwrap_err();
        assert_eq!(err, SessionError::Conflict(target));
        assert!(!err.is_retryable());
        assert_eq!(ctl.messages().get(target).unwrap().content, "theirs");
    }

    #[test]
    fn test_delete_conflict_with_missing_entity_tombstones() {
        let (mut ctl, messages) = ready(2, false);
        let target = messages[1].id;
        let ticket = ctl.delete_message(target).unwrap();

        ctl.settle(
            ticket.local_id,
            Err(BackendError::Conflict { current: None }),
            Instant::now(),
        )
        .unwrap_err();
        assert!(ctl.messages().get(target).is_none());
        assert!(ctl.messages().is_tombstoned(target));
    }

    #[test]
    fn test_toggle_disagreement_takes_server_state() {
        let (mut ctl, messages) = ready(1, false);
        let now = Instant::now();
        let target = messages[0].id;

        let ticket = ctl.toggle_reaction(target, "🔥", now).unwrap();
        let err = ctl
            .settle(
                ticket.local_id,
                Ok(Confirmation::Reaction(ToggleReactionResponse { added: false })),
                now,
            )
            .unwrap_err();
        assert_eq!(err, SessionError::Conflict(target));
        assert_eq!(ctl.reactions().emoji(target, "🔥"), None);
    }

    #[test]
    fn test_refresh_prefers_unexpired_override() {
        let (mut ctl, messages) = ready(2, false);
        let t0 = Instant::now();
        let target = messages[1].id;
        ctl.edit_message(target, "local".into(), t0).unwrap();

        let mut server_page = HistoryPage {
            messages: messages.iter().rev().cloned().collect(),
            has_more: false,
        };
        server_page.messages[0].content = "server".into();
        server_page.messages[0].edited_at = Some(Utc::now() + chrono::Duration::seconds(30));

        let refresh = ctl.begin_refresh().unwrap();
        ctl.finish_page(refresh, server_page.clone(), Vec::new(), t0 + Duration::from_secs(4))
            .unwrap();
        assert_eq!(ctl.messages().get(target).unwrap().content, "local");

        let refresh = ctl.begin_refresh().unwrap();
        ctl.finish_page(refresh, server_page, Vec::new(), t0 + Duration::from_secs(5))
            .unwrap();
        assert_eq!(ctl.messages().get(target).unwrap().content, "server");
    }

    #[test]
    fn test_refresh_reconciles_pending_send() {
        let (mut ctl, messages) = ready(3, false);
        let now = Instant::now();
        let ticket = ctl.send_message(Draft::text("hello")).unwrap();
        let stored = stored_copy(&ctl, &ticket);

        let mut page: Vec<Message> = messages.iter().rev().cloned().collect();
        page.insert(0, stored.clone());
        let refresh = ctl.begin_refresh().unwrap();
        ctl.finish_page(
            refresh,
            HistoryPage {
                messages: page,
                has_more: false,
            },
            Vec::new(),
            now,
        )
        .unwrap();

        assert_eq!(ctl.messages().len(), 4);
        assert!(ctl.messages().get(ticket.local_id).is_none());
        assert!(ctl.messages().get(stored.id).is_some());
        assert!(ctl.overlay().is_empty());

        ctl.settle(ticket.local_id, Ok(Confirmation::Message(stored.clone())), now)
            .unwrap();
        assert_eq!(ctl.messages().len(), 4);
        assert_eq!(ctl.take_echo(ticket.local_id), Some(stored.id));
    }

    #[test]
    fn test_late_failure_after_echo_keeps_stored_id() {
        let (mut ctl, _) = ready(2, false);
        let now = Instant::now();
        let ticket = ctl.send_message(Draft::text("hello")).unwrap();
        let stored = stored_copy(&ctl, &ticket);
        ctl.apply_push(
            PushEnvelope::new(PushEvent::MessageInserted {
                message: stored.clone(),
            }),
            &EmptyRoster,
            now,
        )
        .unwrap();

        ctl.settle(ticket.local_id, Err(BackendError::Network("reset".into())), now)
            .unwrap();
        assert!(ctl.messages().get(stored.id).is_some());
        assert!(ctl.errors().is_empty());
        assert_eq!(ctl.take_echo(ticket.local_id), Some(stored.id));
        assert_eq!(ctl.take_echo(ticket.local_id), None);
    }

    #[test]
    fn test_failed_edit_keeps_newer_remote_edit() {
        let (mut ctl, messages) = ready(2, false);
        let now = Instant::now();
        let target = messages[1].id;
        let edit = ctl.edit_message(target, "mine".into(), now).unwrap();

        let mut remote = messages[1].clone();
        remote.content = "theirs".into();
        remote.edited_at = Some(at(100));
        ctl.apply_push(
            PushEnvelope::new(PushEvent::MessageUpdated { message: remote }),
            &EmptyRoster,
            now,
        )
        .unwrap();
        assert_eq!(ctl.messages().get(target).unwrap().content, "mine");

        ctl.settle(edit.local_id, Err(BackendError::Network("reset".into())), now)
            .unwrap_err();
        let restored = ctl.messages().get(target).unwrap();
        assert_eq!(restored.content, "theirs");
        assert_eq!(restored.edited_at, Some(at(100)));
    }

    #[test]
    fn test_failed_delete_restores_copy_seen_on_refresh() {
        let (mut ctl, messages) = ready(3, false);
        let now = Instant::now();
        let target = messages[1].id;
        let delete = ctl.delete_message(target).unwrap();

        let mut page: Vec<Message> = messages.iter().rev().cloned().collect();
        page[1].content = "theirs".into();
        page[1].edited_at = Some(at(100));
        let refresh = ctl.begin_refresh().unwrap();
        ctl.finish_page(
            refresh,
            HistoryPage {
                messages: page,
                has_more: false,
            },
            Vec::new(),
            now,
        )
        .unwrap();
        assert!(ctl.messages().get(target).is_none());

        ctl.settle(delete.local_id, Err(BackendError::Network("reset".into())), now)
            .unwrap_err();
        assert_eq!(ctl.messages().position(target), Some(1));
        assert_eq!(ctl.messages().get(target).unwrap().content, "theirs");
    }

    #[test]
    fn test_refresh_keeps_reactions_pushed_during_fetch() {
        let (mut ctl, messages) = ready(2, false);
        let now = Instant::now();
        let (m0, m1) = (messages[0].id, messages[1].id);
        let channel_id = ctl.channel_id();
        let (ann, ben) = (Uuid::new_v4(), Uuid::new_v4());

        let refresh = ctl.begin_refresh().unwrap();
        // the page was read before either of these landed
        let stale_rows = vec![ReactionRow::new(m1, ben, "👍")];
        for event in [
            PushEvent::ReactionInserted {
                channel_id,
                reaction: ReactionRow::new(m0, ann, "🎉"),
            },
            PushEvent::ReactionDeleted {
                channel_id,
                reaction: ReactionRow::new(m1, ben, "👍"),
            },
        ] {
            ctl.apply_push(PushEnvelope::new(event), &EmptyRoster, now).unwrap();
        }

        ctl.finish_page(
            refresh,
            HistoryPage {
                messages: messages.iter().rev().cloned().collect(),
                has_more: false,
            },
            stale_rows,
            now,
        )
        .unwrap();
        assert_eq!(ctl.reactions().emoji(m0, "🎉").map(|t| t.count), Some(1));
        assert_eq!(ctl.reactions().emoji(m1, "👍"), None);
    }

    #[test]
    fn test_refresh_keeps_pending_delete_hidden() {
        let (mut ctl, messages) = ready(3, false);
        let target = messages[1].id;
        ctl.delete_message(target).unwrap();

        let refresh = ctl.begin_refresh().unwrap();
        ctl.finish_page(
            refresh,
            HistoryPage {
                messages: messages.clone(),
                has_more: false,
            },
            vec![ReactionRow::new(target, Uuid::new_v4(), "👍")],
            Instant::now(),
        )
        .unwrap();
        assert!(ctl.messages().get(target).is_none());
        assert_eq!(ctl.messages().len(), 2);
    }

    #[test]
    fn test_older_pages_until_exhausted() {
        let (mut ctl, _) = ready(2, true);
        let request = ctl.begin_older_page().unwrap().unwrap();
        assert_eq!(request.page, 1);
        assert_eq!(ctl.begin_older_page().unwrap_err(), SessionError::Busy(EntityKey::History));

        let oldest = msg(ctl.channel_id(), -10);
        let oldest_id = oldest.id;
        ctl.finish_page(
            request,
            HistoryPage {
                messages: vec![oldest],
                has_more: false,
            },
            vec![ReactionRow::new(oldest_id, Uuid::new_v4(), "👀")],
            Instant::now(),
        )
        .unwrap();

        assert_eq!(ctl.messages().messages()[0].id, oldest_id);
        assert_eq!(ctl.reactions().emoji(oldest_id, "👀").map(|t| t.count), Some(1));
        assert_eq!(ctl.pagination(), Pagination { page: 1, has_more: false });
        assert_eq!(ctl.begin_older_page().unwrap(), None);
    }

    #[test]
    fn test_close_refuses_late_results() {
        let (mut ctl, messages) = ready(2, false);
        let now = Instant::now();
        let ticket = ctl.delete_message(messages[0].id).unwrap();

        ctl.close();
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(ctl.messages().is_empty());
        assert_eq!(
            ctl.settle(ticket.local_id, Err(BackendError::Network("late".into())), now),
            Err(SessionError::Closed)
        );
        assert!(ctl.messages().is_empty());
    }
}
