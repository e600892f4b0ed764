//! Admin side of the support chat: a roster of customers, one active
//! conversation at a time.
//!
//! History loads run as background tasks and report back through the
//! update channel tagged with a `HistoryTicket`; a result whose ticket no
//! longer matches the active selection is discarded, so a slow fetch for a
//! previous customer can never overwrite the conversation on screen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use super::Delivered;
use crate::api::ChatBackend;
use crate::config::ChatSettings;
use crate::error::ChatError;
use crate::models::{ChatMessage, ParticipantId, Role, RosterEntry, Sender};
use crate::socket::{ConnectionManager, InboundEvent, Subscription};
use crate::store::{Merge, MessageStore};

/// Identifies one history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    participant: ParticipantId,
    generation: u64,
}

impl HistoryTicket {
    #[cfg(test)]
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }
}

/// What the console did with one update.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    Message(Delivered),
    HistoryLoaded(ParticipantId),
    HistoryFailed(ParticipantId),
    StaleHistory(ParticipantId),
    /// Inbound event that no longer concerns the console.
    Ignored,
}

enum Update {
    /// From the active-conversation subscription of `generation`, or from
    /// the buffer subscription when `None`.
    Inbound {
        message: ChatMessage,
        generation: Option<u64>,
    },
    History {
        ticket: HistoryTicket,
        result: Result<Vec<ChatMessage>, ChatError>,
    },
}

pub struct AdminConsole<B: ChatBackend> {
    conn: ConnectionManager,
    backend: Arc<B>,
    history_timeout: Duration,
    buffer_inactive: bool,
    roster: Vec<RosterEntry>,
    active: Option<ParticipantId>,
    generation: u64,
    loading: bool,
    store: MessageStore,
    unread: HashMap<ParticipantId, usize>,
    updates_tx: mpsc::UnboundedSender<Update>,
    updates_rx: mpsc::UnboundedReceiver<Update>,
    active_subscription: Option<Subscription>,
    buffer_subscription: Option<Subscription>,
    notice: Option<ChatError>,
}

impl<B: ChatBackend> AdminConsole<B> {
    pub fn new(conn: ConnectionManager, backend: Arc<B>, settings: &ChatSettings) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            backend,
            history_timeout: settings.history_timeout(),
            buffer_inactive: settings.buffer_inactive,
            roster: Vec::new(),
            active: None,
            generation: 0,
            loading: false,
            store: MessageStore::new(),
            unread: HashMap::new(),
            updates_tx,
            updates_rx,
            active_subscription: None,
            buffer_subscription: None,
            notice: None,
        }
    }

    /// Join the admin channel and load the roster.
    pub async fn open(&mut self) {
        self.conn.register_identity(&Role::Admin);

        if self.buffer_inactive && self.buffer_subscription.is_none() {
            let tx = self.updates_tx.clone();
            self.buffer_subscription = Some(self.conn.on_message(move |event| {
                if let InboundEvent::NewMessageForAdmin(msg) = event {
                    let _ = tx.send(Update::Inbound {
                        message: msg.clone(),
                        generation: None,
                    });
                }
            }));
        }

        self.refresh_roster().await;
    }

    /// Reload the customer roster. Failure keeps the old roster.
    pub async fn refresh_roster(&mut self) {
        match time::timeout(self.history_timeout, self.backend.roster()).await {
            Ok(Ok(roster)) => {
                tracing::info!("Loaded {} roster entries", roster.len());
                self.roster = roster;
            }
            Ok(Err(e)) => {
                tracing::warn!("Roster fetch failed: {:#}", e);
                self.notice = Some(ChatError::RosterFetchFailed(format!("{:#}", e)));
            }
            Err(_) => {
                tracing::warn!("Roster fetch timed out");
                self.notice = Some(ChatError::RosterFetchFailed("timed out".into()));
            }
        }
    }

    /// Make `participant` the active conversation.
    ///
    /// Drops interest in the previous customer, subscribes to the new one
    /// and starts loading its history in the background.
    pub fn select(&mut self, participant: ParticipantId) -> HistoryTicket {
        self.generation += 1;
        let generation = self.generation;

        self.active_subscription = None;
        self.active = Some(participant.clone());
        self.unread.remove(&participant);
        self.loading = true;
        self.notice = None;

        let tx = self.updates_tx.clone();
        let watched = participant.clone();
        self.active_subscription = Some(self.conn.on_message(move |event| {
            if let InboundEvent::NewMessageForAdmin(msg) = event {
                if msg.participant_id == watched {
                    let _ = tx.send(Update::Inbound {
                        message: msg.clone(),
                        generation: Some(generation),
                    });
                }
            }
        }));

        let ticket = HistoryTicket {
            participant,
            generation,
        };
        tracing::debug!("Selected {} (generation {})", ticket.participant, generation);

        let backend = Arc::clone(&self.backend);
        let tx = self.updates_tx.clone();
        let timeout = self.history_timeout;
        let request = ticket.clone();
        tokio::spawn(async move {
            let result = match time::timeout(timeout, backend.history(&request.participant)).await
            {
                Ok(Ok(history)) => Ok(history),
                Ok(Err(e)) => Err(ChatError::HistoryFetchFailed(format!("{:#}", e))),
                Err(_) => Err(ChatError::HistoryFetchFailed("timed out".into())),
            };
            let _ = tx.send(Update::History {
                ticket: request,
                result,
            });
        });

        ticket
    }

    /// Apply a history result if it still belongs to the active selection.
    ///
    /// Returns `false` for stale tickets, which leave the store untouched.
    pub fn apply_history(
        &mut self,
        ticket: &HistoryTicket,
        result: Result<Vec<ChatMessage>, ChatError>,
    ) -> bool {
        let current = ticket.generation == self.generation
            && self.active.as_ref() == Some(&ticket.participant);
        if !current {
            tracing::debug!(
                "Discarding stale history for {} (generation {})",
                ticket.participant,
                ticket.generation
            );
            return false;
        }

        self.loading = false;
        match result {
            Ok(history) => {
                self.store.load_history(&ticket.participant, history);
                self.notice = None;
            }
            Err(e) => {
                tracing::warn!("History for {} unavailable: {}", ticket.participant, e);
                self.notice = Some(e);
            }
        }
        true
    }

    /// Reply in the active conversation.
    ///
    /// The reply is shown immediately, saved through the backend, and only
    /// then published, carrying the saved id. A failed save removes the
    /// pending entry and publishes nothing.
    pub async fn send(&mut self, body: &str) -> Result<ChatMessage, ChatError> {
        let active = self.active.clone().ok_or(ChatError::NoActiveConversation)?;
        let draft = ChatMessage::draft(active.clone(), Sender::Support, body)?;
        let temp_id = draft.id.clone();

        self.store.append(&active, draft.clone());

        match self.backend.persist_message(&draft).await {
            Ok(saved) => {
                self.store.replace_temporary(&active, &temp_id, saved.clone());
                self.conn.send(&saved);
                Ok(saved)
            }
            Err(e) => {
                tracing::warn!("Saving reply to {} failed: {:#}", active, e);
                self.store.discard_temporary(&active, &temp_id);
                Err(ChatError::PersistFailed(format!("{:#}", e)))
            }
        }
    }

    /// Apply every pending update without waiting.
    pub fn pump(&mut self) -> Vec<ConsoleEvent> {
        let mut events = Vec::new();
        while let Ok(update) = self.updates_rx.try_recv() {
            events.push(self.apply(update));
        }
        events
    }

    /// Wait for the next update and apply it.
    pub async fn next_update(&mut self) -> Option<ConsoleEvent> {
        let update = self.updates_rx.recv().await?;
        Some(self.apply(update))
    }

    fn apply(&mut self, update: Update) -> ConsoleEvent {
        match update {
            Update::Inbound {
                message,
                generation: Some(generation),
            } => {
                let key = message.participant_id.clone();
                if generation != self.generation || self.active.as_ref() != Some(&key) {
                    return ConsoleEvent::Ignored;
                }
                let merge = self.store.reconcile(&key, message.clone());
                ConsoleEvent::Message(Delivered { merge, message })
            }
            Update::Inbound {
                message,
                generation: None,
            } => {
                let key = message.participant_id.clone();
                let merge = self.store.reconcile(&key, message.clone());
                if merge == Merge::Appended && self.active.as_ref() != Some(&key) {
                    *self.unread.entry(key).or_default() += 1;
                }
                ConsoleEvent::Message(Delivered { merge, message })
            }
            Update::History { ticket, result } => {
                let ok = result.is_ok();
                let participant = ticket.participant.clone();
                if !self.apply_history(&ticket, result) {
                    ConsoleEvent::StaleHistory(participant)
                } else if ok {
                    ConsoleEvent::HistoryLoaded(participant)
                } else {
                    ConsoleEvent::HistoryFailed(participant)
                }
            }
        }
    }

    /// Messages of the active conversation.
    pub fn view(&self) -> Vec<&ChatMessage> {
        match self.active {
            Some(ref key) => self.store.list(key).collect(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn messages<'a>(
        &'a self,
        participant: &ParticipantId,
    ) -> impl Iterator<Item = &'a ChatMessage> + Clone + 'a {
        self.store.list(participant)
    }

    /// Every conversation holding messages, sorted by participant.
    pub fn conversations(&self) -> Vec<&ParticipantId> {
        self.store.conversations()
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn active(&self) -> Option<&ParticipantId> {
        self.active.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn unread(&self, participant: &ParticipantId) -> usize {
        self.unread.get(participant).copied().unwrap_or(0)
    }

    pub fn notice(&self) -> Option<&ChatError> {
        self.notice.as_ref()
    }

    /// Release both subscriptions.
    pub fn close(&mut self) {
        self.active_subscription = None;
        self.buffer_subscription = None;
        self.active = None;
    }
}
