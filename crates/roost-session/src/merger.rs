//! Ordered, deduplicated message sequence fed by history pages and live
//! pushes.
//!
//! Order is `(created_at, id)` ascending. `id` is the dedup key. Tombstones
//! are sticky: once a message is seen deleted, no later page brings it back.

use std::collections::{HashMap, HashSet};

use roost_types::models::Message;

use uuid::Uuid;

/// Which end of the sequence a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Older,
    Newer,
}

/// What a single upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    Updated(usize),
    Unchanged(usize),
    Tombstoned,
    /// Already tombstoned, or a patch for a message that is not loaded.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: Vec<Uuid>,
    pub updated: usize,
    pub tombstoned: Vec<Uuid>,
    pub suppressed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSequence {
    messages: Vec<Message>,
    tombstones: HashSet<Uuid>,
}

/// Merge `page` into a copy of `existing`.
pub fn merge(existing: &MessageSequence, page: Vec<Message>, direction: Direction) -> MessageSequence {
    let mut next = existing.clone();
    next.merge(page, direction);
    next
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn is_tombstoned(&self, id: Uuid) -> bool {
        self.tombstones.contains(&id)
    }

    /// Merge a history page. Older pages normally land in front in one splice;
    /// anything that overlaps existing entries is placed by binary search.
    pub fn merge(&mut self, page: Vec<Message>, direction: Direction) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut fresh: Vec<Message> = Vec::with_capacity(page.len());
        let mut fresh_index: HashMap<Uuid, usize> = HashMap::new();

        for message in page {
            if self.tombstones.contains(&message.id) {
                outcome.suppressed += 1;
                continue;
            }
            if message.is_deleted() {
                fresh_index.remove(&message.id);
                fresh.retain(|m| m.id != message.id);
                self.tombstone(message.id);
                outcome.tombstoned.push(message.id);
                continue;
            }
            if let Some(idx) = self.position(message.id) {
                if apply_newer_fields(&mut self.messages[idx], message) {
                    outcome.updated += 1;
                }
                continue;
            }
            match fresh_index.get(&message.id) {
                Some(&idx) => {
                    apply_newer_fields(&mut fresh[idx], message);
                }
                None => {
                    fresh_index.insert(message.id, fresh.len());
                    fresh.push(message);
                }
            }
        }

        fresh.sort_by_key(Message::sort_key);
        outcome.inserted = fresh.iter().map(|m| m.id).collect();

        let fits_front = match (fresh.last(), self.messages.first()) {
            (Some(last), Some(first)) => last.sort_key() < first.sort_key(),
            _ => true,
        };
        let fits_back = match (fresh.first(), self.messages.last()) {
            (Some(first), Some(last)) => first.sort_key() > last.sort_key(),
            _ => true,
        };

        match direction {
            Direction::Older if fits_front => {
                self.messages.splice(0..0, fresh);
            }
            Direction::Newer if fits_back => {
                self.messages.extend(fresh);
            }
            _ => {
                for message in fresh {
                    self.insert_sorted(message);
                }
            }
        }

        outcome
    }

    /// Place a live message. Out-of-order pushes land at their sorted
    /// position; a known id is patched last-write-wins instead of duplicated.
    pub fn upsert(&mut self, message: Message) -> Upsert {
        if self.tombstones.contains(&message.id) {
            return Upsert::Ignored;
        }
        if message.is_deleted() {
            self.tombstone(message.id);
            return Upsert::Tombstoned;
        }
        match self.position(message.id) {
            Some(idx) => {
                if apply_newer_fields(&mut self.messages[idx], message) {
                    Upsert::Updated(idx)
                } else {
                    Upsert::Unchanged(idx)
                }
            }
            None => Upsert::Inserted(self.insert_sorted(message)),
        }
    }

    /// Apply an update to a message. Unknown ids are only remembered when the
    /// update is a tombstone, so a later page cannot resurrect them.
    pub fn patch(&mut self, message: Message) -> Upsert {
        if message.is_deleted() {
            if self.tombstones.contains(&message.id) {
                return Upsert::Ignored;
            }
            self.tombstone(message.id);
            return Upsert::Tombstoned;
        }
        if self.position(message.id).is_none() {
            return Upsert::Ignored;
        }
        self.upsert(message)
    }

    /// Insert at the sorted position and return the index used.
    pub fn insert_sorted(&mut self, message: Message) -> usize {
        let key = message.sort_key();
        let idx = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(idx, message);
        idx
    }

    /// Take a message out of the visible sequence without tombstoning it.
    pub fn remove(&mut self, id: Uuid) -> Option<(usize, Message)> {
        let idx = self.position(id)?;
        Some((idx, self.messages.remove(idx)))
    }

    /// Remember `id` as deleted and drop it from the visible sequence.
    pub fn tombstone(&mut self, id: Uuid) -> Option<(usize, Message)> {
        self.tombstones.insert(id);
        self.remove(id)
    }

    /// Swap entry `old_id` for `message`. Stays in place when the new sort key
    /// still fits between the neighbours, otherwise moves to its sorted slot.
    /// If `message.id` is already present the old entry is simply dropped.
    pub fn replace(&mut self, old_id: Uuid, message: Message) -> Upsert {
        if message.id != old_id && self.position(message.id).is_some() {
            self.remove(old_id);
            return self.upsert(message);
        }
        let Some(idx) = self.position(old_id) else {
            return self.upsert(message);
        };
        if message.is_deleted() || self.tombstones.contains(&message.id) {
            self.remove(old_id);
            return self.upsert(message);
        }

        let key = message.sort_key();
        let after_prev = idx == 0 || self.messages[idx - 1].sort_key() < key;
        let before_next = idx + 1 >= self.messages.len() || key < self.messages[idx + 1].sort_key();
        if after_prev && before_next {
            self.messages[idx] = message;
            Upsert::Updated(idx)
        } else {
            self.messages.remove(idx);
            Upsert::Updated(self.insert_sorted(message))
        }
    }

    /// Overwrite the mutable fields of `message.id` with the server's copy,
    /// ignoring timestamps. Used when the server settles a conflict.
    pub fn overwrite(&mut self, message: Message) -> Upsert {
        if message.is_deleted() {
            self.tombstone(message.id);
            return Upsert::Tombstoned;
        }
        match self.position(message.id) {
            Some(idx) => {
                copy_mutable_fields(&mut self.messages[idx], message);
                Upsert::Updated(idx)
            }
            None => self.upsert(message),
        }
    }
}

/// Last-write-wins on the mutable fields, judged by `edited_at` (never
/// edited sorts first). Ties go to the incoming copy. Returns whether any
/// field changed.
fn apply_newer_fields(existing: &mut Message, incoming: Message) -> bool {
    if incoming.edited_at < existing.edited_at {
        if existing.author.is_none() && incoming.author.is_some() {
            existing.author = incoming.author;
            return true;
        }
        return false;
    }
    let before = existing.clone();
    copy_mutable_fields(existing, incoming);
    *existing != before
}

fn copy_mutable_fields(existing: &mut Message, incoming: Message) {
    existing.content = incoming.content;
    existing.edited_at = incoming.edited_at;
    existing.metadata = incoming.metadata;
    existing.kind = incoming.kind;
    if incoming.author.is_some() {
        existing.author = incoming.author;
    }
}
