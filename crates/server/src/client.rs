//! Connected-client registry and per-connection handling
//!
//! Each WebSocket connection gets a reader task and a writer task; the
//! writer owns the socket sink and drains a bounded per-client queue.
//! All shared state lives in the registry, keyed by client id. A client
//! whose queue fills up is disconnected rather than silently lagging
//! behind the stream (backpressure policy documented in DESIGN.md).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use pulsegrid_common::metrics::{record_client_dropped, set_connected_clients};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::new_v4().simple()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued for a client's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// A connected WebSocket client.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<Outbound>,
    subscriptions: RwLock<HashSet<String>>,
    connected: AtomicBool,
    /// Reset by each pong; cleared by the liveness sweep
    alive: AtomicBool,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<Outbound>, subscriptions: HashSet<String>) -> Self {
        Self {
            id,
            tx,
            subscriptions: RwLock::new(subscriptions),
            connected: AtomicBool::new(true),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    fn is_subscribed(&self, stream: &str) -> bool {
        self.subscriptions
            .read()
            .map(|subs| subs.contains(stream))
            .unwrap_or(false)
    }

    fn subscription_list(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .subscriptions
            .read()
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();
        streams.sort();
        streams
    }
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
    default_streams: Vec<String>,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, default_streams: &[&str]) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            default_streams: default_streams.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Register a new client, subscribed to every known stream by
    /// default. Returns the client and the receiver its writer drains.
    pub fn register(&self) -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscriptions: HashSet<String> = self.default_streams.iter().cloned().collect();
        let client = Arc::new(Client::new(id.clone(), tx, subscriptions));
        self.clients.insert(id, client.clone());
        set_connected_clients(self.clients.len());
        (client, rx)
    }

    /// Remove a client by ID.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
        set_connected_clients(self.clients.len());
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn default_streams(&self) -> &[String] {
        &self.default_streams
    }

    /// Add streams to a client's subscription set; returns the
    /// resulting set. Unmapped stream names are stored as-is.
    pub fn subscribe(&self, id: &ClientId, streams: Vec<String>) -> Option<Vec<String>> {
        let client = self.clients.get(id)?;
        if let Ok(mut subs) = client.subscriptions.write() {
            subs.extend(streams);
        }
        Some(client.subscription_list())
    }

    /// Remove streams from a client's subscription set; returns the
    /// resulting set.
    pub fn unsubscribe(&self, id: &ClientId, streams: Vec<String>) -> Option<Vec<String>> {
        let client = self.clients.get(id)?;
        if let Ok(mut subs) = client.subscriptions.write() {
            for stream in &streams {
                subs.remove(stream);
            }
        }
        Some(client.subscription_list())
    }

    /// Queue a frame for one client. A full queue disconnects the
    /// client (see backpressure policy).
    pub fn send_to(&self, id: &ClientId, text: String) -> bool {
        let Some(client) = self.clients.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        self.try_deliver(&client, text)
    }

    /// Send to every registered client regardless of subscription.
    pub fn broadcast_all(&self, text: &str) -> usize {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut delivered = 0;
        for client in clients {
            if client.is_connected() && self.try_deliver(&client, text.to_string()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to every client subscribed to a stream.
    pub fn broadcast_to_subscribers(&self, stream: &str, text: &str) -> usize {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut delivered = 0;
        for client in clients {
            if client.is_connected()
                && client.is_subscribed(stream)
                && self.try_deliver(&client, text.to_string())
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Disconnect clients that did not answer the previous ping, then
    /// clear the flag on the survivors for the next round. Returns the
    /// number removed.
    pub fn sweep_liveness(&self) -> usize {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut removed = 0;
        for client in clients {
            if !client.alive.swap(false, Ordering::Relaxed) {
                tracing::info!(client_id = %client.id, "Client failed liveness check");
                record_client_dropped("liveness");
                self.drop_client(&client);
                removed += 1;
            }
        }
        removed
    }

    /// Queue a normal-closure frame for every client (shutdown path).
    pub fn close_all(&self) {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        for client in clients {
            let _ = client.tx.try_send(Outbound::Close);
            self.unregister(&client.id);
        }
    }

    fn try_deliver(&self, client: &Arc<Client>, text: String) -> bool {
        match client.tx.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    client_id = %client.id,
                    "Send queue full, disconnecting slow client"
                );
                record_client_dropped("backpressure");
                self.drop_client(client);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn drop_client(&self, client: &Arc<Client>) {
        let _ = client.tx.try_send(Outbound::Close);
        self.unregister(&client.id);
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage
/// lifecycle with protocol-level heartbeat pings.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client: Arc<Client>,
    mut rx: mpsc::Receiver<Outbound>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client_id = client.id.clone();

    // Writer task: drain the queue into the socket + periodic ping
    let writer_client = client.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            // A client unregistered with a full queue never sees its
            // Close frame; the flag covers that path
            if !writer_client.is_connected() {
                let _ = ws_tx
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "closed".into(),
                    })))
                    .await;
                break;
            }

            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(Outbound::Text(text)) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_tx
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: close_code::NORMAL,
                                    reason: "closed".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_client.id, "Sent ping");
                }
            }
        }

        writer_client.connected.store(false, Ordering::Relaxed);
    });

    // Reader task: forward text frames to the dispatcher, track pongs
    let reader_client = client.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_client.id.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    reader_client.record_pong();
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum replies automatically
                _ => {}
            }
        }
    });

    // Wait for either side to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "Client disconnected");
}

/// Periodic liveness sweep over the whole registry. Cancelled via the
/// supplied token on shutdown.
pub fn start_liveness_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep_liveness();
                    if removed > 0 {
                        tracing::info!(removed, "Dead client sweep");
                    }
                }
            }
        }
    })
}
