//! Classifies inbound push events and hands them to the merger or the
//! aggregator.

use hashlink::LruCache;
use roost_types::events::{PushEnvelope, PushEvent};
use roost_types::models::Message;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::{RawReactionEvent, ReactionAggregator, ReactionEventKind};
use crate::backend::MemberRoster;
use crate::merger::{MessageSequence, Upsert};
use crate::overlay::Overlay;

/// What routing one envelope did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    ForeignChannel,
    Redelivered,
    Inserted(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
    Tombstoned(Uuid),
    /// The server copy of a pending send replaced its provisional entry.
    SendEchoed { local_id: Uuid, message_id: Uuid },
    /// Event for a tombstoned or not-loaded message.
    Dropped(Uuid),
    ReactionApplied,
    /// The viewer's own reaction, already reflected locally.
    ViewerEcho,
}

/// Session state the router writes into.
pub struct RouteTarget<'a> {
    pub messages: &'a mut MessageSequence,
    pub reactions: &'a mut ReactionAggregator,
    pub overlay: &'a mut Overlay,
    pub roster: &'a dyn MemberRoster,
    pub now: Instant,
}

pub struct PushRouter {
    channel_id: Uuid,
    seen: LruCache<Uuid, ()>,
}

impl PushRouter {
    pub fn new(channel_id: Uuid, seen_capacity: usize) -> Self {
        Self {
            channel_id,
            seen: LruCache::new(seen_capacity.max(1)),
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn route(&mut self, envelope: PushEnvelope, target: RouteTarget<'_>) -> Routed {
        let PushEnvelope { event_id, event } = envelope;

        if event.channel_id() != self.channel_id {
            warn!(
                "Ignoring {} for channel {} (open: {})",
                event.kind(),
                event.channel_id(),
                self.channel_id
            );
            return Routed::ForeignChannel;
        }
        if self.seen.contains_key(&event_id) {
            debug!("Dropping redelivered {} {}", event.kind(), event_id);
            return Routed::Redelivered;
        }
        self.seen.insert(event_id, ());

        let routed = match event {
            PushEvent::MessageInserted { message } => self.message_inserted(message, target),
            PushEvent::MessageUpdated { message } => message_updated(message, target),
            PushEvent::ReactionInserted { reaction, .. } => {
                reaction_changed(RawReactionEvent::inserted(reaction), target)
            }
            PushEvent::ReactionDeleted { reaction, .. } => {
                reaction_changed(RawReactionEvent::deleted(reaction), target)
            }
        };
        debug!("Routed {} -> {:?}", event_id, routed);
        routed
    }

    fn message_inserted(&self, mut message: Message, target: RouteTarget<'_>) -> Routed {
        // roster first, then whatever the payload carried
        if let Some(profile) = target.roster.profile(self.channel_id, message.author_id) {
            message.author = Some(profile);
        }

        let id = message.id;
        match target.overlay.reconcile_send(&mut *target.messages, message) {
            Ok(local_id) => Routed::SendEchoed {
                local_id,
                message_id: id,
            },
            Err(message) => upserted(id, target.messages.upsert(message), target.reactions),
        }
    }
}

fn message_updated(mut message: Message, target: RouteTarget<'_>) -> Routed {
    let id = message.id;
    // a rollback of a pending edit or delete restores this copy
    target.overlay.record_server_copy(&message);

    if !message.is_deleted() {
        if let Some(local) = target.overlay.content_override(id, target.now) {
            if local.content == message.content {
                target.overlay.clear_content_override(id);
            } else {
                message.content = local.content;
                message.edited_at = local.edited_at;
            }
        }
    }

    let outcome = target.messages.patch(message);
    if outcome == Upsert::Tombstoned {
        target.overlay.clear_content_override(id);
    }
    upserted(id, outcome, target.reactions)
}

fn reaction_changed(event: RawReactionEvent, target: RouteTarget<'_>) -> Routed {
    if target.messages.is_tombstoned(event.message_id) {
        return Routed::Dropped(event.message_id);
    }

    if event.user_id == target.reactions.viewer() {
        let held = event.kind == ReactionEventKind::Inserted;
        match target.overlay.reaction_override(event.message_id, &event.emoji, target.now) {
            Some(local) if local == held => {
                target.overlay.clear_reaction_override(event.message_id, &event.emoji);
            }
            // an echo of an earlier toggle; the local state wins until expiry
            Some(_) => return Routed::ViewerEcho,
            None => {}
        }
        // one reaction per (user, message, emoji)
        if target.reactions.viewer_reacted(event.message_id, &event.emoji) == held {
            return Routed::ViewerEcho;
        }
    }

    target.reactions.apply(&event);
    Routed::ReactionApplied
}

fn upserted(id: Uuid, outcome: Upsert, reactions: &mut ReactionAggregator) -> Routed {
    match outcome {
        Upsert::Inserted(_) => Routed::Inserted(id),
        Upsert::Updated(_) => Routed::Updated(id),
        Upsert::Unchanged(_) => Routed::Unchanged(id),
        Upsert::Tombstoned => {
            reactions.remove_message(id);
            Routed::Tombstoned(id)
        }
        Upsert::Ignored => Routed::Dropped(id),
    }
}
