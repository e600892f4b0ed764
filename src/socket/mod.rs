//! Chat socket connection
//!
//! One `ConnectionManager` per session owns the persistent socket.io link,
//! registers the local identity and fans inbound chat events out to
//! subscribers.

pub mod protocol;
pub mod websocket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::models::{ChatMessage, Role, Sender};
pub use protocol::{InboundEvent, OutboundEvent};
use protocol::{OpenInfo, Packet, CONNECT_FRAME};
use websocket::ChatSocket;

/// Lock that survives a poisoned mutex; registry bookkeeping must keep
/// working even if a handler panicked elsewhere.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type Handler = Box<dyn Fn(&InboundEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    active: AtomicBool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

/// Hands inbound events to every live subscriber.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Deliver one event.
    ///
    /// Handlers run on a snapshot taken without holding the lock, so a
    /// handler may subscribe or unsubscribe freely. A subscriber cancelled
    /// mid-dispatch is skipped if it has not been reached yet.
    pub fn dispatch(&self, event: &InboundEvent) {
        let snapshot: Vec<Arc<Subscriber>> = lock(&self.registry.subscribers).clone();
        for sub in snapshot {
            if sub.active.load(Ordering::Acquire) {
                (sub.handler)(event);
            }
        }
    }

    fn subscribe(&self, handler: Handler) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            handler,
        });
        lock(&self.registry.subscribers).push(Arc::clone(&sub));
        Subscription {
            subscriber: sub,
            registry: Arc::downgrade(&self.registry),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.registry.subscribers).len()
    }
}

/// Deregistration handle returned by [`ConnectionManager::on_message`].
///
/// Dropping it removes the handler.
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriber.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            let id = self.subscriber.id;
            lock(&registry.subscribers).retain(|s| s.id != id);
        }
    }
}

/// Outbound half of a live connection.
pub trait Link: Send + Sync {
    /// Queue an event for the peer. Returns `false` if the link is gone.
    fn emit(&self, event: OutboundEvent) -> bool;
    fn is_live(&self) -> bool;
    /// Whether events currently reach the peer, not just the link's queue.
    fn is_connected(&self) -> bool {
        self.is_live()
    }
    fn close(&self);
}

struct Inner {
    dispatcher: Dispatcher,
    link: Mutex<Option<Arc<dyn Link>>>,
    pending: Mutex<VecDeque<OutboundEvent>>,
    queue_limit: usize,
}

/// Shared handle to the session's single chat connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// `queue_limit` bounds the events held while no link is live.
    pub fn new(queue_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::default(),
                link: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                queue_limit: queue_limit.max(1),
            }),
        }
    }

    /// Establish the connection if none is live.
    ///
    /// `open` receives the dispatcher for inbound events and returns the
    /// link; it is only called when needed. Events queued while
    /// disconnected are flushed in order. Returns `false` if a live link
    /// already existed.
    pub fn connect<F>(&self, open: F) -> bool
    where
        F: FnOnce(Dispatcher) -> Arc<dyn Link>,
    {
        let link = {
            let mut slot = lock(&self.inner.link);
            if slot.as_ref().is_some_and(|l| l.is_live()) {
                tracing::debug!("Chat connection already live");
                return false;
            }
            let link = open(self.inner.dispatcher.clone());
            *slot = Some(Arc::clone(&link));
            link
        };

        let queued: Vec<OutboundEvent> = lock(&self.inner.pending).drain(..).collect();
        if !queued.is_empty() {
            tracing::info!("Flushing {} queued chat events", queued.len());
        }
        for event in queued {
            if !link.emit(event.clone()) {
                self.enqueue(event);
            }
        }
        true
    }

    /// Connect over socket.io to `ws_url`. Must run inside a tokio runtime.
    pub fn connect_websocket(&self, ws_url: &str) -> bool {
        let url = ws_url.to_string();
        self.connect(move |inbound| WebSocketLink::spawn(url, inbound))
    }

    /// A link exists and its transport has completed the handshake.
    pub fn is_connected(&self) -> bool {
        self.live_link().is_some_and(|l| l.is_connected())
    }

    /// Announce who this connection represents.
    pub fn register_identity(&self, role: &Role) {
        let event = match role {
            Role::Customer(id) => OutboundEvent::RegisterCustomer(id.clone()),
            Role::Admin => OutboundEvent::RegisterAdmin,
        };
        tracing::info!("Registering chat identity ({})", event.name());
        self.emit(event);
    }

    /// Register a handler for every inbound chat event.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(Box::new(handler))
    }

    /// Publish a message to the other side. Fire-and-forget.
    pub fn send(&self, message: &ChatMessage) {
        let event = match message.sender {
            Sender::Customer => OutboundEvent::CustomerSend(message.clone()),
            Sender::Support => OutboundEvent::AdminReply(message.clone()),
        };
        self.emit(event);
    }

    /// Tear down the link. Subscribers stay registered.
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.inner.link).take() {
            tracing::info!("Closing chat connection");
            link.close();
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.inner.dispatcher.subscriber_count()
    }

    fn live_link(&self) -> Option<Arc<dyn Link>> {
        lock(&self.inner.link)
            .as_ref()
            .filter(|l| l.is_live())
            .cloned()
    }

    fn emit(&self, event: OutboundEvent) {
        match self.live_link() {
            Some(link) => {
                if !link.emit(event.clone()) {
                    tracing::debug!("Chat link refused {}, queueing", event.name());
                    self.enqueue(event);
                }
            }
            None => {
                tracing::debug!("Chat connection unavailable, queueing {}", event.name());
                self.enqueue(event);
            }
        }
    }

    fn enqueue(&self, event: OutboundEvent) {
        let mut pending = lock(&self.inner.pending);
        if pending.len() >= self.inner.queue_limit {
            if let Some(dropped) = pending.pop_front() {
                tracing::warn!("Outbound chat queue full, dropping {}", dropped.name());
            }
        }
        pending.push_back(event);
    }
}

/// Link backed by a socket.io WebSocket driver task.
pub struct WebSocketLink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
    shutdown: Arc<Notify>,
    connected: Arc<AtomicBool>,
}

impl WebSocketLink {
    pub fn spawn(ws_url: String, inbound: Dispatcher) -> Arc<dyn Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(false));
        let driver = Driver {
            ws_url,
            outbound: rx,
            inbound,
            shutdown: Arc::clone(&shutdown),
            connected: Arc::clone(&connected),
            registration: None,
            unsent: None,
        };
        tokio::spawn(run_driver(driver));
        Arc::new(Self {
            tx,
            shutdown,
            connected,
        })
    }
}

impl Link for WebSocketLink {
    fn emit(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    fn is_connected(&self) -> bool {
        self.is_live() && self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.shutdown.notify_one();
    }
}

/// Reason one connection attempt ended.
enum DisconnectReason {
    /// Link closed locally. Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

/// Driver state carried across reconnects.
struct Driver {
    ws_url: String,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    inbound: Dispatcher,
    shutdown: Arc<Notify>,
    /// Set while the namespace is joined.
    connected: Arc<AtomicBool>,
    /// Replayed after every reconnect so the server keeps routing to us.
    registration: Option<OutboundEvent>,
    /// Event that could not be written before the socket dropped.
    unsent: Option<OutboundEvent>,
}

/// A session that stayed up this long resets the backoff.
const STABLE_SESSION: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 64;

/// Reconnect delay: 1s, 2s, 4s, ... capped at 64s.
struct Backoff {
    next_secs: u64,
}

impl Backoff {
    fn new() -> Self {
        Self { next_secs: 1 }
    }

    /// Delay before the next attempt, given how long the last session lasted.
    fn delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= STABLE_SESSION {
            self.next_secs = 1;
        }
        let secs = self.next_secs;
        self.next_secs = (secs * 2).min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

/// Keep the connection up until the link is closed.
async fn run_driver(mut driver: Driver) {
    let mut backoff = Backoff::new();

    loop {
        let started = Instant::now();
        let reason = match driver.run_once().await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::Error(e),
        };
        driver.connected.store(false, Ordering::Release);

        match reason {
            DisconnectReason::Shutdown => {
                tracing::info!("Chat socket shut down");
                break;
            }
            DisconnectReason::Error(e) => {
                let delay = backoff.delay(started.elapsed());
                tracing::warn!(
                    "Chat socket disconnected: {:#}. Reconnecting in {}s...",
                    e,
                    delay.as_secs()
                );
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = driver.shutdown.notified() => break,
                }
            }
        }
    }

    driver.outbound.close();
}

impl Driver {
    /// One full session: connect, handshake, register, event loop.
    async fn run_once(&mut self) -> Result<DisconnectReason> {
        let mut ws = ChatSocket::connect(&self.ws_url).await?;

        // 1. Engine.io open packet carries the heartbeat parameters.
        let open = match ws.recv_packet().await? {
            Some(Packet::Open(json)) => serde_json::from_str::<OpenInfo>(&json)
                .context("Failed to parse engine.io open packet")?,
            Some(other) => anyhow::bail!("Expected engine.io open packet, got {:?}", other),
            None => anyhow::bail!("Connection closed before handshake"),
        };
        tracing::debug!("Engine.io session {}", open.sid);

        // Server pings every ping_interval; give up after interval + timeout.
        let liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);

        // 2. Join the default namespace. Events sent before the ack would
        // make the server drop the connection.
        ws.send_text(CONNECT_FRAME).await?;
        time::timeout(liveness, Self::await_namespace(&mut ws))
            .await
            .context("Timed out waiting for namespace connect")??;
        self.connected.store(true, Ordering::Release);
        tracing::info!("Chat namespace connected");

        // 3. Replay identity and anything left over from the last socket.
        if let Some(reg) = self.registration.clone() {
            ws.send_text(&reg.to_frame()).await?;
        }
        if let Some(event) = self.unsent.take() {
            if Some(&event) != self.registration.as_ref() {
                self.write(&mut ws, event).await?;
            }
        }

        let mut deadline = Box::pin(time::sleep(liveness));

        let reason = loop {
            tokio::select! {
                packet = ws.recv_packet() => {
                    match packet {
                        Ok(Some(packet)) => {
                            deadline.as_mut().reset(time::Instant::now() + liveness);
                            if let Some(reason) = self.handle_packet(packet) {
                                break reason;
                            }
                        }
                        Ok(None) => {
                            break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server"));
                        }
                        Err(e) => {
                            break DisconnectReason::Error(e.context("WebSocket recv error"));
                        }
                    }
                }
                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        break DisconnectReason::Shutdown;
                    };
                    if let Err(e) = self.write(&mut ws, event).await {
                        break DisconnectReason::Error(e);
                    }
                }
                _ = &mut deadline => {
                    break DisconnectReason::Error(anyhow::anyhow!("Heartbeat timed out"));
                }
                _ = self.shutdown.notified() => {
                    break DisconnectReason::Shutdown;
                }
            }
        };

        if matches!(reason, DisconnectReason::Shutdown) {
            ws.close().await;
        }
        Ok(reason)
    }

    /// Read until the server acknowledges the namespace connect. Pings are
    /// answered by the socket while waiting.
    async fn await_namespace(ws: &mut ChatSocket) -> Result<()> {
        loop {
            match ws.recv_packet().await? {
                Some(Packet::Connected) => return Ok(()),
                Some(Packet::ConnectError(reason)) => {
                    anyhow::bail!("Namespace connect refused: {}", reason)
                }
                Some(Packet::Close) => anyhow::bail!("Server closed the session during connect"),
                Some(other) => tracing::debug!("Before namespace ack: {:?}", other),
                None => anyhow::bail!("Connection closed before namespace ack"),
            }
        }
    }

    async fn write(&mut self, ws: &mut ChatSocket, event: OutboundEvent) -> Result<()> {
        if event.is_registration() {
            self.registration = Some(event.clone());
        }
        if let Err(e) = ws.send_text(&event.to_frame()).await {
            self.unsent = Some(event);
            return Err(e);
        }
        Ok(())
    }

    fn handle_packet(&self, packet: Packet) -> Option<DisconnectReason> {
        match packet {
            Packet::Event { name, args } => {
                if let Some(event) = InboundEvent::from_event(&name, args) {
                    tracing::debug!("{} for {}", name, event.message().participant_id);
                    self.inbound.dispatch(&event);
                }
                None
            }
            Packet::Connected => None,
            Packet::ConnectError(reason) => Some(DisconnectReason::Error(anyhow::anyhow!(
                "Namespace connect refused: {}",
                reason
            ))),
            Packet::Disconnected | Packet::Close => Some(DisconnectReason::Error(
                anyhow::anyhow!("Server closed the chat session"),
            )),
            Packet::Ping | Packet::Pong | Packet::Open(_) => None,
            Packet::Unknown(frame) => {
                tracing::debug!("Ignoring frame: {}", frame);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParticipantId;
    use std::sync::atomic::AtomicUsize;

    /// Link that records what it was asked to emit.
    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<OutboundEvent>>,
        closed: AtomicBool,
    }

    impl Link for RecordingLink {
        fn emit(&self, event: OutboundEvent) -> bool {
            lock(&self.sent).push(event);
            true
        }

        fn is_live(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn message(body: &str) -> ChatMessage {
        ChatMessage::draft(ParticipantId::new("u1"), Sender::Customer, body).unwrap()
    }

    fn event(body: &str) -> InboundEvent {
        InboundEvent::NewMessageForCustomer(message(body))
    }

    #[test]
    fn test_connect_is_idempotent() {
        let conn = ConnectionManager::new(8);
        let opened = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let opened = Arc::clone(&opened);
            conn.connect(move |_| {
                opened.fetch_add(1, Ordering::SeqCst);
                Arc::new(RecordingLink::default())
            });
        }

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let conn = ConnectionManager::new(8);
        assert!(conn.connect(|_| Arc::new(RecordingLink::default())));
        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(conn.connect(|_| Arc::new(RecordingLink::default())));
    }

    #[test]
    fn test_queue_while_unavailable_then_flush() {
        let conn = ConnectionManager::new(8);
        conn.register_identity(&Role::Customer("u1".into()));
        conn.send(&message("hello"));

        let link = Arc::new(RecordingLink::default());
        let handle = Arc::clone(&link);
        conn.connect(move |_| handle);

        let sent = lock(&link.sent).clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], OutboundEvent::RegisterCustomer("u1".into()));
        assert!(matches!(sent[1], OutboundEvent::CustomerSend(_)));
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let conn = ConnectionManager::new(2);
        conn.send(&message("one"));
        conn.send(&message("two"));
        conn.send(&message("three"));

        let link = Arc::new(RecordingLink::default());
        let handle = Arc::clone(&link);
        conn.connect(move |_| handle);

        let bodies: Vec<String> = lock(&link.sent)
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::CustomerSend(m) => Some(m.body.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[test]
    fn test_send_picks_event_by_sender() {
        let conn = ConnectionManager::new(8);
        let link = Arc::new(RecordingLink::default());
        let handle = Arc::clone(&link);
        conn.connect(move |_| handle);

        conn.register_identity(&Role::Admin);
        let reply = ChatMessage {
            sender: Sender::Support,
            ..message("on it")
        };
        conn.send(&reply);

        let sent = lock(&link.sent).clone();
        assert_eq!(sent[0], OutboundEvent::RegisterAdmin);
        assert!(matches!(sent[1], OutboundEvent::AdminReply(_)));
    }

    #[test]
    fn test_multiple_subscribers_and_drop() {
        let conn = ConnectionManager::new(8);
        let dispatcher = conn.inner.dispatcher.clone();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&hits);
        let first = conn.on_message(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        let _second = conn.on_message(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        dispatcher.dispatch(&event("a"));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        drop(first);
        assert_eq!(conn.subscriber_count(), 1);
        dispatcher.dispatch(&event("b"));
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let conn = ConnectionManager::new(8);
        let dispatcher = conn.inner.dispatcher.clone();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        // First handler cancels the second one mid-dispatch.
        let victim_slot = Arc::clone(&slot);
        let _killer = conn.on_message(move |_| {
            lock(&victim_slot).take();
        });
        let h = Arc::clone(&hits);
        let victim = conn.on_message(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        *lock(&slot) = Some(victim);

        dispatcher.dispatch(&event("x"));
        dispatcher.dispatch(&event("y"));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(conn.subscriber_count(), 1);
    }

    #[test]
    fn test_backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new();
        let brief = Duration::from_secs(1);
        let delays: Vec<u64> = (0..8).map(|_| backoff.delay(brief).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 64]);

        assert_eq!(backoff.delay(STABLE_SESSION).as_secs(), 1);
        assert_eq!(backoff.delay(brief).as_secs(), 2);
    }

    #[test]
    fn test_handler_can_cancel_itself() {
        let conn = ConnectionManager::new(8);
        let dispatcher = conn.inner.dispatcher.clone();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let own = Arc::clone(&slot);
        let sub = conn.on_message(move |_| {
            lock(&own).take();
        });
        *lock(&slot) = Some(sub);

        dispatcher.dispatch(&event("bye"));
        assert_eq!(conn.subscriber_count(), 0);
    }

    mod websocket_driver {
        use super::*;
        use futures::{SinkExt, StreamExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio_tungstenite::tungstenite::Message;
        use tokio_tungstenite::{accept_async, WebSocketStream};

        type ServerSocket = WebSocketStream<TcpStream>;

        const OPEN: &str = r#"{"sid":"s1","pingInterval":25000,"pingTimeout":20000}"#;
        const WAIT: Duration = Duration::from_secs(5);

        async fn listen() -> (TcpListener, String) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!(
                "ws://{}/socket.io/?EIO=4&transport=websocket",
                listener.local_addr().unwrap()
            );
            (listener, url)
        }

        /// Accept one client and send it the engine.io open packet.
        async fn accept(listener: &TcpListener, open: &str) -> ServerSocket {
            let (stream, _) = time::timeout(WAIT, listener.accept())
                .await
                .expect("client did not connect")
                .unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(format!("0{}", open))).await.unwrap();
            ws
        }

        /// Next text frame from the client, or `None` if none arrives in time.
        async fn next_text(ws: &mut ServerSocket, wait: Duration) -> Option<String> {
            loop {
                match time::timeout(wait, ws.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => return Some(text),
                    Ok(Some(Ok(_))) => continue,
                    _ => return None,
                }
            }
        }

        async fn send_text(ws: &mut ServerSocket, text: &str) {
            ws.send(Message::Text(text.to_string())).await.unwrap();
        }

        /// Expect the namespace connect and acknowledge it.
        async fn join_namespace(ws: &mut ServerSocket) {
            assert_eq!(next_text(ws, WAIT).await.as_deref(), Some("40"));
            send_text(ws, r#"40{"sid":"n1"}"#).await;
        }

        #[tokio::test]
        async fn test_events_wait_for_namespace_ack() {
            let (listener, url) = listen().await;
            let conn = ConnectionManager::new(8);
            conn.register_identity(&Role::Customer("u1".into()));
            conn.send(&message("queued"));
            conn.connect_websocket(&url);

            let mut server = accept(&listener, OPEN).await;
            assert_eq!(next_text(&mut server, WAIT).await.as_deref(), Some("40"));
            assert_eq!(next_text(&mut server, Duration::from_millis(200)).await, None);
            assert!(!conn.is_connected());

            send_text(&mut server, r#"40{"sid":"n1"}"#).await;
            assert_eq!(
                next_text(&mut server, WAIT).await.as_deref(),
                Some(r#"42["register","u1"]"#)
            );
            let send = next_text(&mut server, WAIT).await.unwrap();
            assert!(send.starts_with(r#"42["sendMessage","#), "got {}", send);
            assert!(conn.is_connected());

            conn.disconnect();
        }

        #[tokio::test]
        async fn test_ping_answered_and_events_dispatched() {
            let (listener, url) = listen().await;
            let conn = ConnectionManager::new(8);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let _sub = conn.on_message(move |event| {
                let _ = tx.send(event.clone());
            });
            conn.connect_websocket(&url);

            let mut server = accept(&listener, OPEN).await;
            join_namespace(&mut server).await;

            send_text(&mut server, "2").await;
            assert_eq!(next_text(&mut server, WAIT).await.as_deref(), Some("3"));

            send_text(
                &mut server,
                r#"42["receiveMessage",{"_id":"m1","userId":"u1","sender":"support","message":"hello"}]"#,
            )
            .await;
            let event = time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert!(matches!(event, InboundEvent::NewMessageForCustomer(_)));
            assert_eq!(event.message().id, crate::models::MessageId::Server("m1".into()));

            conn.disconnect();
        }

        #[tokio::test]
        async fn test_registration_replayed_after_reconnect() {
            let (listener, url) = listen().await;
            let conn = ConnectionManager::new(8);
            conn.connect_websocket(&url);

            let mut first = accept(&listener, OPEN).await;
            join_namespace(&mut first).await;
            conn.register_identity(&Role::Admin);
            assert_eq!(
                next_text(&mut first, WAIT).await.as_deref(),
                Some(r#"42["admin_join"]"#)
            );

            first.close(None).await.unwrap();
            drop(first);

            let mut second = accept(&listener, OPEN).await;
            join_namespace(&mut second).await;
            assert_eq!(
                next_text(&mut second, WAIT).await.as_deref(),
                Some(r#"42["admin_join"]"#)
            );

            conn.disconnect();
        }

        #[tokio::test]
        async fn test_missed_heartbeat_reconnects() {
            let (listener, url) = listen().await;
            let conn = ConnectionManager::new(8);
            conn.connect_websocket(&url);

            let quick = r#"{"sid":"s1","pingInterval":50,"pingTimeout":50}"#;
            let mut first = accept(&listener, quick).await;
            join_namespace(&mut first).await;

            // No pings from the server: the client gives up and comes back.
            let mut second = accept(&listener, OPEN).await;
            assert!(!conn.is_connected());
            join_namespace(&mut second).await;

            drop(first);
            conn.disconnect();
        }

        #[tokio::test]
        async fn test_refused_namespace_retries() {
            let (listener, url) = listen().await;
            let conn = ConnectionManager::new(8);
            conn.register_identity(&Role::Customer("u1".into()));
            conn.connect_websocket(&url);

            let mut first = accept(&listener, OPEN).await;
            assert_eq!(next_text(&mut first, WAIT).await.as_deref(), Some("40"));
            send_text(&mut first, r#"44{"message":"not allowed"}"#).await;
            assert_eq!(next_text(&mut first, Duration::from_millis(200)).await, None);

            let mut second = accept(&listener, OPEN).await;
            join_namespace(&mut second).await;
            assert_eq!(
                next_text(&mut second, WAIT).await.as_deref(),
                Some(r#"42["register","u1"]"#)
            );

            conn.disconnect();
        }
    }
}
