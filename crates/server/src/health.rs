//! Process health endpoint
//!
//! Reports connected-client count, uptime, and resident memory for
//! operational monitoring. Prometheus metrics live on their own port.

use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub clients: usize,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Liveness + operational snapshot
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        clients: state.registry.count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        memory_bytes: resident_memory_bytes(),
    })
}

/// Resident set size from procfs; absent on non-Linux hosts.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
