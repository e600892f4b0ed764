//! Customer side of the support chat: one conversation, keyed by the
//! customer's own participant id.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use super::Delivered;
use crate::api::ChatBackend;
use crate::config::ChatSettings;
use crate::error::ChatError;
use crate::models::{ChatMessage, MessageId, ParticipantId, Role, Sender};
use crate::socket::{ConnectionManager, InboundEvent, Subscription};
use crate::store::MessageStore;

/// Lifecycle of a customer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registering,
    Active,
}

pub struct CustomerSession<B: ChatBackend> {
    participant: ParticipantId,
    conn: ConnectionManager,
    backend: Arc<B>,
    history_timeout: Duration,
    state: SessionState,
    store: MessageStore,
    inbound_tx: mpsc::UnboundedSender<ChatMessage>,
    inbound_rx: mpsc::UnboundedReceiver<ChatMessage>,
    subscription: Option<Subscription>,
    notice: Option<ChatError>,
}

impl<B: ChatBackend> CustomerSession<B> {
    pub fn new(
        conn: ConnectionManager,
        backend: Arc<B>,
        participant: ParticipantId,
        settings: &ChatSettings,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            participant,
            conn,
            backend,
            history_timeout: settings.history_timeout(),
            state: SessionState::Idle,
            store: MessageStore::new(),
            inbound_tx,
            inbound_rx,
            subscription: None,
            notice: None,
        }
    }

    #[cfg(test)]
    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.history_timeout = timeout;
        self
    }

    /// Register, subscribe and load history.
    ///
    /// Always ends Active: a failed or slow history fetch opens the
    /// conversation empty and leaves a notice.
    pub async fn open(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }

        self.conn
            .register_identity(&Role::Customer(self.participant.clone()));
        self.state = SessionState::Registering;

        // Subscribe before fetching so nothing slips between history and live.
        let tx = self.inbound_tx.clone();
        let me = self.participant.clone();
        self.subscription = Some(self.conn.on_message(move |event| {
            if let InboundEvent::NewMessageForCustomer(msg) = event {
                if msg.participant_id == me {
                    let _ = tx.send(msg.clone());
                }
            }
        }));

        let fetch = self.backend.history(&self.participant);
        match time::timeout(self.history_timeout, fetch).await {
            Ok(Ok(history)) => {
                tracing::info!(
                    "Loaded {} messages for {}",
                    history.len(),
                    self.participant
                );
                self.store.load_history(&self.participant, history);
                self.notice = None;
            }
            Ok(Err(e)) => {
                tracing::warn!("History fetch failed: {:#}", e);
                self.notice = Some(ChatError::HistoryFetchFailed(format!("{:#}", e)));
            }
            Err(_) => {
                tracing::warn!("History fetch timed out after {:?}", self.history_timeout);
                self.notice = Some(ChatError::HistoryFetchFailed("timed out".into()));
            }
        }

        self.state = SessionState::Active;
        self.pump();
    }

    /// Append optimistically and publish. Blank input never leaves the
    /// session.
    pub fn send(&mut self, body: &str) -> Result<MessageId, ChatError> {
        if self.state != SessionState::Active {
            return Err(ChatError::NotActive);
        }
        let msg = ChatMessage::draft(self.participant.clone(), Sender::Customer, body)?;
        let id = msg.id.clone();

        self.store.append(&self.participant, msg.clone());
        if !self.conn.is_connected() {
            // Queued by the connection until the link comes up.
            self.notice = Some(ChatError::TransportUnavailable);
        }
        self.conn.send(&msg);
        Ok(id)
    }

    /// Apply every inbound message received so far without waiting.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(msg) = self.inbound_rx.try_recv() {
            self.apply(msg);
            applied += 1;
        }
        applied
    }

    /// Wait for the next inbound message and apply it.
    pub async fn next_update(&mut self) -> Option<Delivered> {
        let msg = self.inbound_rx.recv().await?;
        Some(self.apply(msg))
    }

    fn apply(&mut self, msg: ChatMessage) -> Delivered {
        let merge = self.store.reconcile(&self.participant, msg.clone());
        tracing::debug!("Inbound {} -> {:?}", msg.id, merge);
        Delivered {
            merge,
            message: msg,
        }
    }

    /// Tear down: release the subscription and drop back to Idle.
    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
            tracing::debug!("Customer session for {} closed", self.participant);
        }
        self.state = SessionState::Idle;
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn notice(&self) -> Option<&ChatError> {
        self.notice.as_ref()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> + Clone + '_ {
        self.store.list(&self.participant)
    }
}
