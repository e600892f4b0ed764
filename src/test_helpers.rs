//! In-memory stand-ins for the chat server and REST backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

use crate::api::ChatBackend;
use crate::models::{ChatMessage, MessageId, ParticipantId, Role, RosterEntry, Sender};
use crate::socket::{ConnectionManager, Dispatcher, InboundEvent, Link, OutboundEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Peer {
    role: Option<Role>,
    inbound: Dispatcher,
}

#[derive(Default)]
struct ServerState {
    peers: Vec<Peer>,
    log: Vec<OutboundEvent>,
    next_id: u64,
}

/// Chat server that routes events between connections in-process.
///
/// Customer sends are confirmed with a fresh server id, echoed to the
/// sending customer and forwarded to every admin; admin replies go to the
/// customer they name.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

struct LoopbackLink {
    server: LoopbackServer,
    peer: usize,
}

impl Link for LoopbackLink {
    fn emit(&self, event: OutboundEvent) -> bool {
        self.server.route(self.peer, event);
        true
    }

    fn is_live(&self) -> bool {
        true
    }

    fn close(&self) {}
}

impl LoopbackServer {
    pub fn attach(&self, conn: &ConnectionManager) {
        let server = self.clone();
        conn.connect(move |inbound| {
            let peer = {
                let mut state = lock(&server.state);
                state.peers.push(Peer {
                    role: None,
                    inbound,
                });
                state.peers.len() - 1
            };
            Arc::new(LoopbackLink { server, peer })
        });
    }

    /// Every event any connection emitted, in order.
    pub fn sent(&self) -> Vec<OutboundEvent> {
        lock(&self.state).log.clone()
    }

    pub fn customer_sends(&self) -> usize {
        self.count(|e| matches!(e, OutboundEvent::CustomerSend(_)))
    }

    pub fn admin_replies(&self) -> usize {
        self.count(|e| matches!(e, OutboundEvent::AdminReply(_)))
    }

    fn count(&self, pred: impl Fn(&OutboundEvent) -> bool) -> usize {
        lock(&self.state).log.iter().filter(|e| pred(e)).count()
    }

    /// Push a support message to every customer connection, leaving the
    /// filtering to the sessions.
    pub fn deliver_to_customer(&self, participant: &ParticipantId, body: &str) {
        let (seq, targets) = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let targets: Vec<Dispatcher> = state
                .peers
                .iter()
                .filter(|p| matches!(p.role, Some(Role::Customer(_))))
                .map(|p| p.inbound.clone())
                .collect();
            (state.next_id, targets)
        };
        let msg = ChatMessage {
            id: MessageId::Server(format!("push-{}", seq)),
            participant_id: participant.clone(),
            sender: Sender::Support,
            body: body.to_string(),
            sent_at: Utc::now(),
        };
        let event = InboundEvent::NewMessageForCustomer(msg);
        for target in targets {
            target.dispatch(&event);
        }
    }

    fn route(&self, from: usize, event: OutboundEvent) {
        // Collect under the lock, dispatch after releasing it.
        let mut deliveries: Vec<(Dispatcher, InboundEvent)> = Vec::new();
        {
            let mut state = lock(&self.state);
            state.log.push(event.clone());

            match event {
                OutboundEvent::RegisterCustomer(id) => {
                    state.peers[from].role = Some(Role::Customer(id));
                }
                OutboundEvent::RegisterAdmin => {
                    state.peers[from].role = Some(Role::Admin);
                }
                OutboundEvent::CustomerSend(msg) => {
                    state.next_id += 1;
                    let confirmed = ChatMessage {
                        id: MessageId::Server(format!("srv-{}", state.next_id)),
                        sent_at: Utc::now(),
                        ..msg
                    };
                    for peer in &state.peers {
                        match peer.role {
                            Some(Role::Customer(ref id)) if *id == confirmed.participant_id => {
                                deliveries.push((
                                    peer.inbound.clone(),
                                    InboundEvent::NewMessageForCustomer(confirmed.clone()),
                                ));
                            }
                            Some(Role::Admin) => {
                                deliveries.push((
                                    peer.inbound.clone(),
                                    InboundEvent::NewMessageForAdmin(confirmed.clone()),
                                ));
                            }
                            _ => {}
                        }
                    }
                }
                OutboundEvent::AdminReply(msg) => {
                    for peer in &state.peers {
                        if let Some(Role::Customer(ref id)) = peer.role {
                            if *id == msg.participant_id {
                                deliveries.push((
                                    peer.inbound.clone(),
                                    InboundEvent::NewMessageForCustomer(msg.clone()),
                                ));
                            }
                        }
                    }
                }
            }
        }

        for (target, event) in deliveries {
            target.dispatch(&event);
        }
    }
}

#[derive(Default)]
struct BackendState {
    history: HashMap<ParticipantId, Vec<ChatMessage>>,
    roster: Vec<RosterEntry>,
    fail_history: bool,
    fail_roster: bool,
    fail_persist: bool,
    history_delay: Option<Duration>,
    persisted: usize,
}

/// REST backend kept in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    /// Store customer messages with bodies in order, one second apart.
    pub fn seed_history(&self, participant: &ParticipantId, bodies: &[&str]) {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let messages = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| ChatMessage {
                id: MessageId::Server(format!("h-{}-{}", participant, i)),
                participant_id: participant.clone(),
                sender: Sender::Customer,
                body: body.to_string(),
                sent_at: base + chrono::Duration::seconds(i as i64),
            })
            .collect();
        lock(&self.state).history.insert(participant.clone(), messages);
    }

    pub fn seed_roster(&self, ids: &[&str]) {
        lock(&self.state).roster = ids
            .iter()
            .map(|id| RosterEntry {
                id: ParticipantId::new(*id),
                name: None,
                email: None,
            })
            .collect();
    }

    pub fn history_now(&self, participant: &ParticipantId) -> Vec<ChatMessage> {
        lock(&self.state)
            .history
            .get(participant)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_history(&self, fail: bool) {
        lock(&self.state).fail_history = fail;
    }

    pub fn fail_roster(&self, fail: bool) {
        lock(&self.state).fail_roster = fail;
    }

    pub fn fail_persist(&self, fail: bool) {
        lock(&self.state).fail_persist = fail;
    }

    pub fn delay_history(&self, delay: Duration) {
        lock(&self.state).history_delay = Some(delay);
    }

    pub fn persisted(&self) -> usize {
        lock(&self.state).persisted
    }
}

impl ChatBackend for MemoryBackend {
    async fn history(&self, participant: &ParticipantId) -> Result<Vec<ChatMessage>> {
        let (fail, delay) = {
            let state = lock(&self.state);
            (state.fail_history, state.history_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            bail!("history endpoint unavailable");
        }
        Ok(self.history_now(participant))
    }

    async fn roster(&self) -> Result<Vec<RosterEntry>> {
        let state = lock(&self.state);
        if state.fail_roster {
            bail!("roster endpoint unavailable");
        }
        Ok(state.roster.clone())
    }

    async fn persist_message(&self, draft: &ChatMessage) -> Result<ChatMessage> {
        let mut state = lock(&self.state);
        if state.fail_persist {
            bail!("500 Internal Server Error");
        }
        state.persisted += 1;
        let saved = ChatMessage {
            id: MessageId::Server(format!("db-{}", state.persisted)),
            ..draft.clone()
        };
        state
            .history
            .entry(saved.participant_id.clone())
            .or_default()
            .push(saved.clone());
        Ok(saved)
    }
}
