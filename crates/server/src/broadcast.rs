//! Stream-to-client broadcast service
//!
//! Reads the event log as a named consumer in a shared group, turns
//! entries into typed envelopes, fans them out to subscribed clients,
//! and acknowledges each entry after the broadcast attempt. Client
//! commands arrive through a dispatcher channel and may republish
//! actions onto the requests stream for downstream workers.

use crate::client::{ClientId, ClientRegistry};
use crate::protocol::{
    action_verb, message_type_for_stream, ClientCommand, ControlMessage, StreamEnvelope,
};
use crate::resources::ResourceStore;
use chrono::Utc;
use pulsegrid_common::config::BridgeConfig;
use pulsegrid_common::metrics::{record_broadcast, record_client_command, record_stream_entry};
use pulsegrid_common::stream::{EventLog, StreamEntry};
use pulsegrid_common::errors::Result;
use pulsegrid_common::REQUESTS_STREAM;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct StreamBroadcastService {
    log: Arc<dyn EventLog>,
    resources: Arc<dyn ResourceStore>,
    registry: Arc<ClientRegistry>,
    config: BridgeConfig,
    streams: Vec<String>,
    consumer: String,
    shutdown: CancellationToken,
}

impl StreamBroadcastService {
    pub fn new(
        log: Arc<dyn EventLog>,
        resources: Arc<dyn ResourceStore>,
        registry: Arc<ClientRegistry>,
        config: BridgeConfig,
        streams: Vec<String>,
    ) -> Arc<Self> {
        let consumer = config.consumer_name();
        Arc::new(Self {
            log,
            resources,
            registry,
            config,
            streams,
            consumer,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Register the consumer group on every configured stream, then
    /// spawn the read loop. Group registration is idempotent; any error
    /// other than "already exists" is logged and surfaced.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        for stream in &self.streams {
            self.log
                .ensure_group(stream, &self.config.consumer_group)
                .await
                .inspect_err(|e| {
                    error!(stream = %stream, error = %e, "Consumer group registration failed");
                })?;
        }

        info!(
            group = %self.config.consumer_group,
            consumer = %self.consumer,
            streams = self.streams.len(),
            "Broadcast service started"
        );

        let service = self.clone();
        Ok(tokio::spawn(service.read_loop()))
    }

    /// Cancel the read loop and close every client with a normal-closure
    /// frame.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all();
        info!("Broadcast service shut down");
    }

    /// Send an envelope to every registered client regardless of
    /// subscription (system-wide events).
    pub fn broadcast_message(&self, envelope: &StreamEnvelope) -> usize {
        self.registry.broadcast_all(&envelope.to_json())
    }

    /// Send an envelope to every client subscribed to a stream.
    pub fn broadcast_to_subscribers(&self, stream: &str, envelope: &StreamEnvelope) -> usize {
        self.registry
            .broadcast_to_subscribers(stream, &envelope.to_json())
    }

    async fn read_loop(self: Arc<Self>) {
        let group = self.config.consumer_group.clone();
        let block = self.config.read_block();
        let backoff = self.config.read_backoff();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.log.read_group(
                    &self.streams,
                    &group,
                    &self.consumer,
                    self.config.read_batch_size,
                    block,
                ) => {
                    match result {
                        Ok(entries) => {
                            for entry in entries {
                                self.dispatch_entry(entry).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Stream read failed, backing off");
                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("Broadcast read loop stopped");
    }

    /// Decode, broadcast, acknowledge. A failed delivery to one client
    /// never blocks the others or the ack.
    async fn dispatch_entry(&self, entry: StreamEntry) {
        record_stream_entry(&entry.stream);

        let envelope = envelope_for_entry(&entry);
        let delivered = self
            .registry
            .broadcast_to_subscribers(&entry.stream, &envelope.to_json());
        record_broadcast(&entry.stream, delivered);
        debug!(
            stream = %entry.stream,
            entry_id = %entry.id,
            delivered,
            "Entry broadcast"
        );

        if let Err(e) = self
            .log
            .ack(&entry.stream, &self.config.consumer_group, &entry.id)
            .await
        {
            // The entry was delivered; the group will redeliver it and
            // clients may see it twice (at-least-once)
            error!(stream = %entry.stream, entry_id = %entry.id, error = %e, "Ack failed");
        }
    }

    /// Handle one raw client frame. Malformed frames get a scoped error
    /// reply; they never affect other clients.
    pub async fn handle_client_message(&self, client_id: &ClientId, raw: &str) {
        let command: ClientCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Malformed client message");
                record_client_command("malformed");
                self.send_control(client_id, &ControlMessage::error("Malformed message"));
                return;
            }
        };

        match command {
            ClientCommand::Ping => {
                record_client_command("ping");
                self.send_control(client_id, &ControlMessage::Pong);
            }
            ClientCommand::Subscribe { streams } => {
                record_client_command("subscribe");
                if let Some(streams) = self.registry.subscribe(client_id, streams) {
                    self.send_control(client_id, &ControlMessage::Subscribed { streams });
                }
            }
            ClientCommand::Unsubscribe { streams } => {
                record_client_command("unsubscribe");
                if let Some(streams) = self.registry.unsubscribe(client_id, streams) {
                    self.send_control(client_id, &ControlMessage::Unsubscribed { streams });
                }
            }
            ClientCommand::Request { resource } => {
                record_client_command("request");
                self.handle_request(client_id, &resource).await;
            }
            ClientCommand::Action {
                action,
                recommendation_id,
            } => {
                record_client_command("action");
                self.handle_action(client_id, &action, &recommendation_id)
                    .await;
            }
        }
    }

    /// Synchronous fetch-and-reply from the durable store.
    async fn handle_request(&self, client_id: &ClientId, resource: &str) {
        let fetched = match resource {
            "metrics" => self.resources.metrics().await,
            "recommendations" => self.resources.recommendations().await,
            "competitors" => self.resources.competitors().await,
            other => {
                self.send_control(
                    client_id,
                    &ControlMessage::error(format!("Unknown resource: {}", other)),
                );
                return;
            }
        };

        match fetched {
            Ok(data) => {
                let reply = StreamEnvelope {
                    message_type: resource.to_string(),
                    data,
                    timestamp: Utc::now(),
                    stream_id: None,
                };
                self.registry.send_to(client_id, reply.to_json());
            }
            Err(e) => {
                error!(client_id = %client_id, resource, error = %e, "Resource fetch failed");
                self.send_control(
                    client_id,
                    &ControlMessage::error(format!("Failed to fetch {}", resource)),
                );
            }
        }
    }

    /// Republish a client action onto the requests stream. Fire and
    /// forget: processing belongs to a downstream worker.
    async fn handle_action(&self, client_id: &ClientId, action: &str, recommendation_id: &str) {
        let Some(verb) = action_verb(action) else {
            self.send_control(
                client_id,
                &ControlMessage::error(format!("Unknown action: {}", action)),
            );
            return;
        };

        let fields = vec![
            ("action".to_string(), verb.to_string()),
            ("recommendation_id".to_string(), recommendation_id.to_string()),
            ("client_id".to_string(), client_id.to_string()),
            ("requested_at".to_string(), Utc::now().to_rfc3339()),
        ];

        match self.log.append(REQUESTS_STREAM, &fields).await {
            Ok(entry_id) => {
                debug!(
                    client_id = %client_id,
                    action = verb,
                    recommendation_id,
                    entry_id = %entry_id,
                    "Action republished"
                );
            }
            Err(e) => {
                error!(client_id = %client_id, action = verb, error = %e, "Action append failed");
                self.send_control(client_id, &ControlMessage::error("Action could not be queued"));
            }
        }
    }

    fn send_control(&self, client_id: &ClientId, message: &ControlMessage) {
        self.registry.send_to(client_id, message.to_json());
    }
}

/// Build the envelope for one log entry via the fixed mapping table.
pub fn envelope_for_entry(entry: &StreamEntry) -> StreamEnvelope {
    StreamEnvelope {
        message_type: message_type_for_stream(&entry.stream).to_string(),
        data: serde_json::Value::Object(entry.decoded_fields()),
        timestamp: Utc::now(),
        stream_id: Some(entry.id.clone()),
    }
}

/// Drain client frames from the connection handlers into the service.
/// Each frame is handled on its own task so one client's slow store
/// lookup cannot delay the rest.
pub fn run_dispatcher(
    service: Arc<StreamBroadcastService>,
    mut rx: mpsc::Receiver<(ClientId, String)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((client_id, raw)) = rx.recv().await {
            let service = service.clone();
            tokio::spawn(async move {
                service.handle_client_message(&client_id, &raw).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use async_trait::async_trait;
    use pulsegrid_common::errors::{AppError, Result};
    use pulsegrid_common::stream::MemoryEventLog;
    use pulsegrid_common::KNOWN_STREAMS;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    struct StaticResources;

    #[async_trait]
    impl ResourceStore for StaticResources {
        async fn metrics(&self) -> Result<Value> {
            Ok(json!({"followers": 1200, "engagement": 0.042}))
        }

        async fn recommendations(&self) -> Result<Value> {
            Ok(json!([{"id": "r1", "title": "Post at 9am"}]))
        }

        async fn competitors(&self) -> Result<Value> {
            Err(AppError::DatabaseConnection {
                message: "replica offline".into(),
            })
        }
    }

    struct Harness {
        service: Arc<StreamBroadcastService>,
        log: Arc<MemoryEventLog>,
        loop_handle: JoinHandle<()>,
    }

    impl Harness {
        async fn start(streams: &[&str]) -> Self {
            let log = Arc::new(MemoryEventLog::new());
            let registry = Arc::new(ClientRegistry::new(32, KNOWN_STREAMS));
            let config = BridgeConfig {
                consumer_group: "pulsegrid-bridge".into(),
                consumer_name: Some("bridge-test".into()),
                read_batch_size: 16,
                read_block_ms: 20,
                read_backoff_secs: 1,
                heartbeat_interval_secs: 30,
                max_send_queue: 32,
            };
            let service = StreamBroadcastService::new(
                log.clone(),
                Arc::new(StaticResources),
                registry,
                config,
                streams.iter().map(|s| s.to_string()).collect(),
            );
            let loop_handle = service.clone().start().await.unwrap();
            Self {
                service,
                log,
                loop_handle,
            }
        }

        fn connect(&self) -> (ClientId, Receiver<Outbound>) {
            let (client, rx) = self.service.registry().register();
            (client.id.clone(), rx)
        }

        async fn stop(self) {
            self.service.shutdown();
            let _ = self.loop_handle.await;
        }
    }

    async fn next_json(rx: &mut Receiver<Outbound>) -> Value {
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("unexpected close frame"),
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn metrics_entry_reaches_subscribed_client_and_is_acked() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (_, mut rx) = harness.connect();

        let entry_id = harness
            .log
            .append(
                "metrics.calculated",
                &fields(&[("engagement", r#"{"likes": 10}"#)]),
            )
            .await
            .unwrap();

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "metrics");
        assert_eq!(frame["data"]["engagement"]["likes"], 10);
        assert_eq!(frame["streamId"], entry_id.as_str());
        assert!(frame["timestamp"].is_string());

        // Acked exactly once after the broadcast attempt
        let mut acked = Vec::new();
        for _ in 0..50 {
            acked = harness.log.acked("metrics.calculated", "pulsegrid-bridge").await;
            if !acked.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acked, vec![entry_id]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn unmapped_stream_broadcasts_as_unknown() {
        let harness = Harness::start(&["billing.invoiced"]).await;
        let (client_id, mut rx) = harness.connect();

        // Subscription to an unmapped stream name is stored like any other
        harness
            .service
            .handle_client_message(
                &client_id,
                r#"{"type":"subscribe","streams":["billing.invoiced"]}"#,
            )
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "subscribed");
        assert!(reply["streams"]
            .as_array()
            .unwrap()
            .contains(&json!("billing.invoiced")));

        harness
            .log
            .append("billing.invoiced", &fields(&[("amount", "99")]))
            .await
            .unwrap();

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "unknown");
        assert_eq!(frame["data"]["amount"], 99);

        harness.stop().await;
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(&client_id, r#"{"type":"ping"}"#)
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "pong");
        harness.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_gets_scoped_error_and_connection_survives() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(&client_id, "this is not json")
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(harness.service.registry().count(), 1);

        // The client still works afterwards
        harness
            .service
            .handle_client_message(&client_id, r#"{"type":"ping"}"#)
            .await;
        assert_eq!(next_json(&mut rx).await["type"], "pong");

        harness.stop().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(
                &client_id,
                r#"{"type":"unsubscribe","streams":["metrics.calculated"]}"#,
            )
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "unsubscribed");
        assert!(!reply["streams"]
            .as_array()
            .unwrap()
            .contains(&json!("metrics.calculated")));

        harness
            .log
            .append("metrics.calculated", &fields(&[("n", "1")]))
            .await
            .unwrap();
        harness
            .log
            .append("system.health", &fields(&[("ok", "true")]))
            .await
            .unwrap();

        // Only the system.health entry arrives
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "system");

        harness.stop().await;
    }

    #[tokio::test]
    async fn request_replies_from_the_store_without_stream_id() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(&client_id, r#"{"type":"request","resource":"metrics"}"#)
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "metrics");
        assert_eq!(reply["data"]["followers"], 1200);
        assert!(reply.get("streamId").is_none());

        harness.stop().await;
    }

    #[tokio::test]
    async fn failed_resource_fetch_is_a_scoped_error() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(&client_id, r#"{"type":"request","resource":"competitors"}"#)
            .await;
        assert_eq!(next_json(&mut rx).await["type"], "error");

        harness
            .service
            .handle_client_message(&client_id, r#"{"type":"request","resource":"forecast"}"#)
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().contains("forecast"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn action_lands_on_the_requests_stream() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, _rx) = harness.connect();

        harness
            .service
            .handle_client_message(
                &client_id,
                r#"{"type":"action","action":"approve-recommendation","recommendationId":"42"}"#,
            )
            .await;

        let entries = harness.log.entries(REQUESTS_STREAM).await;
        assert_eq!(entries.len(), 1);
        let decoded = entries[0].decoded_fields();
        assert_eq!(decoded["action"], "approve");
        assert_eq!(decoded["recommendation_id"], 42);
        assert_eq!(decoded["client_id"], json!(client_id.to_string()));
        assert!(decoded["requested_at"].is_string());

        harness.stop().await;
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (client_id, mut rx) = harness.connect();

        harness
            .service
            .handle_client_message(
                &client_id,
                r#"{"type":"action","action":"delete-recommendation","recommendationId":"42"}"#,
            )
            .await;

        assert_eq!(next_json(&mut rx).await["type"], "error");
        assert!(harness.log.entries(REQUESTS_STREAM).await.is_empty());

        harness.stop().await;
    }

    #[tokio::test]
    async fn broadcast_message_reaches_every_client() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (trimmed_id, mut rx) = harness.connect();
        harness
            .service
            .registry()
            .unsubscribe(
                &trimmed_id,
                KNOWN_STREAMS.iter().map(|s| s.to_string()).collect(),
            )
            .unwrap();

        let envelope = StreamEnvelope {
            message_type: "system".into(),
            data: json!({"notice": "maintenance"}),
            timestamp: Utc::now(),
            stream_id: None,
        };
        let delivered = harness.service.broadcast_message(&envelope);
        assert_eq!(delivered, 1);
        assert_eq!(next_json(&mut rx).await["type"], "system");

        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_stops_the_loop() {
        let harness = Harness::start(KNOWN_STREAMS).await;
        let (_, mut rx) = harness.connect();

        harness.service.shutdown();
        let _ = timeout(Duration::from_secs(2), harness.loop_handle)
            .await
            .expect("read loop did not stop");

        // Drain until the close frame; queued broadcasts may precede it
        let mut saw_close = false;
        while let Ok(Some(frame)) = timeout(Duration::from_millis(100), rx.recv()).await {
            if frame == Outbound::Close {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
        assert_eq!(harness.service.registry().count(), 0);
    }
}
