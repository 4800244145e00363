//! Per-message emoji tallies built from raw reaction rows and events.
//!
//! An emoji key exists only while its count is at least 1, and a message key
//! exists only while it has at least one emoji. Counts never go negative.

use std::collections::{BTreeMap, HashMap};

use roost_types::api::ReactionSummary;
use roost_types::models::ReactionRow;
use serde::Serialize;
use uuid::Uuid;

/// Aggregate for one emoji on one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmojiTally {
    pub count: u32,
    pub viewer_reacted: bool,
}

/// emoji -> tally for one message. Ordered so views render stably.
pub type ReactionTally = BTreeMap<String, EmojiTally>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionEventKind {
    Inserted,
    Deleted,
}

/// One reaction change, consumed immediately by [`ReactionAggregator::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReactionEvent {
    pub message_id: Uuid,
    pub emoji: String,
    pub user_id: Uuid,
    pub kind: ReactionEventKind,
}

impl RawReactionEvent {
    pub fn inserted(row: ReactionRow) -> Self {
        Self::from_row(row, ReactionEventKind::Inserted)
    }

    pub fn deleted(row: ReactionRow) -> Self {
        Self::from_row(row, ReactionEventKind::Deleted)
    }

    fn from_row(row: ReactionRow, kind: ReactionEventKind) -> Self {
        Self {
            message_id: row.message_id,
            emoji: row.emoji,
            user_id: row.user_id,
            kind,
        }
    }
}

/// Reaction tallies for every loaded message, from one viewer's perspective.
///
/// Does not deduplicate events: a redelivered insert counts twice. Callers
/// filter redeliveries before they get here.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionAggregator {
    viewer: Uuid,
    tallies: HashMap<Uuid, ReactionTally>,
}

impl ReactionAggregator {
    pub fn new(viewer: Uuid) -> Self {
        Self {
            viewer,
            tallies: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    /// Rebuild the tallies of `message_ids` from a batch read.
    ///
    /// Each listed message is replaced wholesale; rows for messages outside
    /// the list are ignored and other messages are left alone.
    pub fn seed(&mut self, message_ids: &[Uuid], rows: &[ReactionRow]) {
        for id in message_ids {
            self.tallies.remove(id);
        }

        for row in rows {
            if !message_ids.contains(&row.message_id) {
                continue;
            }
            let entry = self
                .tallies
                .entry(row.message_id)
                .or_default()
                .entry(row.emoji.clone())
                .or_insert(EmojiTally {
                    count: 0,
                    viewer_reacted: false,
                });
            entry.count += 1;
            if row.user_id == self.viewer {
                entry.viewer_reacted = true;
            }
        }
    }

    /// Apply one reaction change to exactly one (message, emoji) tally.
    pub fn apply(&mut self, event: &RawReactionEvent) {
        let by_viewer = event.user_id == self.viewer;

        match event.kind {
            ReactionEventKind::Inserted => {
                let entry = self
                    .tallies
                    .entry(event.message_id)
                    .or_default()
                    .entry(event.emoji.clone())
                    .or_insert(EmojiTally {
                        count: 0,
                        viewer_reacted: false,
                    });
                entry.count += 1;
                if by_viewer {
                    entry.viewer_reacted = true;
                }
            }
            ReactionEventKind::Deleted => {
                let Some(tally) = self.tallies.get_mut(&event.message_id) else {
                    return;
                };
                let Some(entry) = tally.get_mut(&event.emoji) else {
                    return;
                };
                entry.count = entry.count.saturating_sub(1);
                if by_viewer {
                    entry.viewer_reacted = false;
                }
                if entry.count == 0 {
                    tally.remove(&event.emoji);
                }
                if tally.is_empty() {
                    self.tallies.remove(&event.message_id);
                }
            }
        }
    }

    /// Move the viewer's own reaction to `reacted`, adjusting the count by one
    /// when it changes. Returns whether anything changed.
    pub fn set_viewer_reacted(&mut self, message_id: Uuid, emoji: &str, reacted: bool) -> bool {
        if self.viewer_reacted(message_id, emoji) == reacted {
            return false;
        }
        let kind = if reacted {
            ReactionEventKind::Inserted
        } else {
            ReactionEventKind::Deleted
        };
        self.apply(&RawReactionEvent {
            message_id,
            emoji: emoji.to_string(),
            user_id: self.viewer,
            kind,
        });
        true
    }

    pub fn viewer_reacted(&self, message_id: Uuid, emoji: &str) -> bool {
        self.emoji(message_id, emoji)
            .is_some_and(|tally| tally.viewer_reacted)
    }

    pub fn emoji(&self, message_id: Uuid, emoji: &str) -> Option<EmojiTally> {
        self.tallies.get(&message_id)?.get(emoji).copied()
    }

    pub fn tally(&self, message_id: Uuid) -> Option<&ReactionTally> {
        self.tallies.get(&message_id)
    }

    pub fn tallies(&self) -> &HashMap<Uuid, ReactionTally> {
        &self.tallies
    }

    /// Drop everything known about a message (it was tombstoned).
    pub fn remove_message(&mut self, message_id: Uuid) {
        self.tallies.remove(&message_id);
    }

    pub fn summaries(&self, message_id: Uuid) -> Vec<ReactionSummary> {
        self.tallies
            .get(&message_id)
            .map(|tally| {
                tally
                    .iter()
                    .map(|(emoji, t)| ReactionSummary {
                        emoji: emoji.clone(),
                        count: t.count,
                        viewer_reacted: t.viewer_reacted,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
