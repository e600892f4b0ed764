//! Per-conversation message log
//!
//! Holds server-confirmed and optimistic messages side by side, keyed by
//! the customer's participant id. Entries are kept in `sent_at` order at
//! insertion time; ids are unique within a conversation.

use std::collections::{HashMap, HashSet};

use crate::models::{ChatMessage, MessageId, ParticipantId};

/// Outcome of routing an inbound message into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// New message, inserted in order.
    Appended,
    /// Replaced a pending optimistic entry in place.
    Confirmed,
    /// Id already known; nothing changed.
    Duplicate,
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn insert_ordered(&mut self, message: ChatMessage) {
        // After every entry sent at or before it, so ties keep arrival order.
        let pos = self
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(pos, message);
    }
}

/// Ordered message logs for every open conversation.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ParticipantId, Conversation>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message in chronological order.
    ///
    /// Returns `false` (and changes nothing) if the id is already present.
    pub fn append(&mut self, key: &ParticipantId, message: ChatMessage) -> bool {
        let conv = self.conversations.entry(key.clone()).or_default();
        if conv.position(&message.id).is_some() {
            return false;
        }
        conv.insert_ordered(message);
        true
    }

    /// Swap an optimistic entry for its confirmed counterpart at the same
    /// position.
    ///
    /// If the confirmed id is already stored (the echo won the race), the
    /// temporary entry is dropped instead. Returns `false` if `temp_id` is
    /// unknown.
    pub fn replace_temporary(
        &mut self,
        key: &ParticipantId,
        temp_id: &MessageId,
        confirmed: ChatMessage,
    ) -> bool {
        let Some(conv) = self.conversations.get_mut(key) else {
            return false;
        };
        let Some(pos) = conv.position(temp_id) else {
            return false;
        };

        if conv.position(&confirmed.id).is_some() {
            conv.messages.remove(pos);
        } else {
            conv.messages[pos] = confirmed;
        }
        true
    }

    /// Remove an optimistic entry that will never be confirmed.
    pub fn discard_temporary(
        &mut self,
        key: &ParticipantId,
        temp_id: &MessageId,
    ) -> Option<ChatMessage> {
        let conv = self.conversations.get_mut(key)?;
        let pos = conv.position(temp_id)?;
        Some(conv.messages.remove(pos))
    }

    /// Route a server-confirmed message into its conversation.
    ///
    /// An echo of our own optimistic send replaces the oldest pending local
    /// entry with the same sender and body.
    pub fn reconcile(&mut self, key: &ParticipantId, confirmed: ChatMessage) -> Merge {
        let conv = self.conversations.entry(key.clone()).or_default();
        if conv.position(&confirmed.id).is_some() {
            return Merge::Duplicate;
        }

        if !confirmed.id.is_local() {
            let pending = conv.messages.iter().position(|m| {
                m.id.is_local() && m.sender == confirmed.sender && m.body == confirmed.body
            });
            if let Some(pos) = pending {
                conv.messages[pos] = confirmed;
                return Merge::Confirmed;
            }
        }

        conv.insert_ordered(confirmed);
        Merge::Appended
    }

    /// Ordered view of one conversation. Cloning the iterator restarts it.
    pub fn list<'a>(
        &'a self,
        key: &ParticipantId,
    ) -> impl Iterator<Item = &'a ChatMessage> + Clone + 'a {
        self.conversations
            .get(key)
            .map(|c| c.messages.as_slice())
            .unwrap_or_default()
            .iter()
    }

    /// Merge a fetched history page into a conversation.
    ///
    /// History is authoritative; entries it does not know about (pending
    /// optimistic sends, inbound messages that raced the fetch) are kept.
    pub fn load_history(&mut self, key: &ParticipantId, messages: Vec<ChatMessage>) {
        let conv = self.conversations.entry(key.clone()).or_default();
        let existing = std::mem::take(&mut conv.messages);

        let mut seen: HashSet<MessageId> = HashSet::with_capacity(messages.len());
        let mut history: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        history.sort_by_key(|m| m.sent_at);
        conv.messages = history;

        for msg in existing {
            if !seen.contains(&msg.id) {
                conv.insert_ordered(msg);
            }
        }
    }

    /// Number of messages in one conversation.
    #[cfg(test)]
    pub fn len(&self, key: &ParticipantId) -> usize {
        self.conversations
            .get(key)
            .map_or(0, |c| c.messages.len())
    }

    /// Keys of every conversation seen so far, sorted.
    pub fn conversations(&self) -> Vec<&ParticipantId> {
        let mut keys: Vec<_> = self.conversations.keys().collect();
        keys.sort();
        keys
    }
}
