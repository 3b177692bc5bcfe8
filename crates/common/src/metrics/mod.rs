//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

/// Metrics prefix for all PulseGrid metrics
pub const METRICS_PREFIX: &str = "pulsegrid";

/// Register all metric descriptions
pub fn register_metrics() {
    // Session lifecycle metrics
    describe_counter!(
        format!("{}_sessions_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions created"
    );

    describe_counter!(
        format!("{}_sessions_rotated_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions rotated"
    );

    describe_counter!(
        format!("{}_sessions_invalidated_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions invalidated"
    );

    describe_counter!(
        format!("{}_sessions_expired_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions retired by the expiry sweep"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    // Bridge metrics
    describe_gauge!(
        format!("{}_clients_connected", METRICS_PREFIX),
        Unit::Count,
        "Currently connected WebSocket clients"
    );

    describe_counter!(
        format!("{}_stream_entries_total", METRICS_PREFIX),
        Unit::Count,
        "Total stream entries consumed"
    );

    describe_counter!(
        format!("{}_broadcasts_total", METRICS_PREFIX),
        Unit::Count,
        "Total envelopes delivered to clients"
    );

    describe_counter!(
        format!("{}_client_commands_total", METRICS_PREFIX),
        Unit::Count,
        "Total client commands handled"
    );

    describe_counter!(
        format!("{}_clients_dropped_total", METRICS_PREFIX),
        Unit::Count,
        "Clients disconnected by liveness or backpressure"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record session lifecycle events
pub fn record_session_event(event: &'static str, platform: &str) {
    counter!(
        format!("{}_sessions_{}_total", METRICS_PREFIX, event),
        "platform" => platform.to_string()
    )
    .increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &'static str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    }
}

/// Helper to record a consumed stream entry
pub fn record_stream_entry(stream: &str) {
    counter!(
        format!("{}_stream_entries_total", METRICS_PREFIX),
        "stream" => stream.to_string()
    )
    .increment(1);
}

/// Helper to record envelope deliveries
pub fn record_broadcast(stream: &str, delivered: usize) {
    counter!(
        format!("{}_broadcasts_total", METRICS_PREFIX),
        "stream" => stream.to_string()
    )
    .increment(delivered as u64);
}

/// Helper to record a handled client command
pub fn record_client_command(command: &'static str) {
    counter!(
        format!("{}_client_commands_total", METRICS_PREFIX),
        "command" => command
    )
    .increment(1);
}

/// Helper to track the connected-client gauge
pub fn set_connected_clients(count: usize) {
    gauge!(format!("{}_clients_connected", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record a dropped client
pub fn record_client_dropped(reason: &'static str) {
    counter!(
        format!("{}_clients_dropped_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_helpers_run() {
        record_session_event("created", "instagram");
        record_cache(true, "session");
        record_cache(false, "session");
        record_stream_entry("metrics.calculated");
        record_broadcast("metrics.calculated", 3);
        record_client_command("subscribe");
        set_connected_clients(2);
        record_client_dropped("backpressure");
        // Just verify the helpers run without panic
    }
}
