//! PulseGrid Server
//!
//! Hosts the two long-running subsystems in one process:
//! - the session lifecycle manager (rotation + expiry timers)
//! - the stream-to-WebSocket broadcast bridge
//!
//! Producers elsewhere append domain events to Redis Streams; this
//! process consumes them as a named consumer group member and fans them
//! out to connected dashboard clients.

mod broadcast;
mod client;
mod health;
mod protocol;
mod resources;

use axum::{
    extract::ws::WebSocket,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use backoff::{future::retry, ExponentialBackoff};
use metrics_exporter_prometheus::PrometheusBuilder;
use pulsegrid_common::{
    cache::{Cache, CacheConfig},
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, Repository},
    metrics,
    stream::{EventLog, RedisEventLog},
    KNOWN_STREAMS, VERSION,
};
use pulsegrid_sessions::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::broadcast::{run_dispatcher, StreamBroadcastService};
use crate::client::{ClientId, ClientRegistry};
use crate::protocol::ControlMessage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub started_at: Instant,
    pub heartbeat: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    init_tracing(&config.observability);

    info!("Starting PulseGrid server v{}", VERSION);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(port = config.observability.metrics_port, "Metrics exporter listening");
    }

    // Backends come up in their own time; retry the initial connects
    info!("Connecting to database...");
    let db = retry(ExponentialBackoff::default(), || async {
        DbPool::new(&config.database)
            .await
            .map_err(backoff::Error::transient)
    })
    .await?;
    let repository = Repository::new(db);

    info!("Connecting to Redis cache...");
    let cache = retry(ExponentialBackoff::default(), || async {
        Cache::new(CacheConfig::from(&config.redis))
            .await
            .map_err(backoff::Error::transient)
    })
    .await?;
    let cache = Arc::new(cache);

    info!("Connecting to Redis streams...");
    let event_log: Arc<dyn EventLog> = Arc::new(
        retry(ExponentialBackoff::default(), || async {
            RedisEventLog::new(&config.redis.url)
                .await
                .map_err(backoff::Error::transient)
        })
        .await?,
    );

    // Session subsystem: warm caches, start rotation + expiry timers
    let manager = SessionManager::new(
        Arc::new(repository.clone()),
        cache,
        config.session.clone(),
    );
    manager.initialize().await?;

    // Broadcast bridge
    let registry = Arc::new(ClientRegistry::new(
        config.bridge.max_send_queue,
        KNOWN_STREAMS,
    ));
    let service = StreamBroadcastService::new(
        event_log,
        Arc::new(repository.clone()),
        registry.clone(),
        config.bridge.clone(),
        KNOWN_STREAMS.iter().map(|s| s.to_string()).collect(),
    );
    let read_loop = service.clone().start().await?;

    let (message_tx, message_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let dispatcher = run_dispatcher(service.clone(), message_rx);

    let liveness_token = CancellationToken::new();
    let liveness = client::start_liveness_task(
        registry.clone(),
        config.bridge.heartbeat_interval(),
        liveness_token.clone(),
    );

    // HTTP surface
    let state = AppState {
        registry,
        message_tx,
        started_at: Instant::now(),
        heartbeat: config.bridge.heartbeat_interval(),
    };
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: stop the loop, close clients, cancel timers
    service.shutdown();
    liveness_token.cancel();
    manager.shutdown().await;
    let _ = read_loop.await;
    let _ = liveness.await;
    dispatcher.abort();

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection: register it, greet it with the
/// default subscription set, then hand it to the connection tasks.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connected_client, rx) = state.registry.register();
    info!(client_id = %connected_client.id, "WebSocket client connected");

    let greeting = ControlMessage::Connected {
        client_id: connected_client.id.to_string(),
        streams: state.registry.default_streams().to_vec(),
    };
    state
        .registry
        .send_to(&connected_client.id, greeting.to_json());

    client::handle_ws_connection(
        socket,
        connected_client,
        rx,
        state.registry.clone(),
        state.message_tx.clone(),
        state.heartbeat,
    )
    .await;
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
