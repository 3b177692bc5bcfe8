//! PulseGrid Common Library
//!
//! Shared code for the PulseGrid services including:
//! - Database models and repository pattern
//! - Redis cache adapter
//! - Event-log (stream) adapter with consumer-group semantics
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod stream;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use errors::{AppError, Result};
pub use stream::{EventLog, StreamEntry};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Streams the bridge consumes, in the order they were registered.
pub const KNOWN_STREAMS: &[&str] = &[
    "metrics.calculated",
    "recommendations.ready",
    "automation.status",
    "system.health",
    "gaps.identified",
];

/// Stream that client-issued actions are republished onto for
/// downstream automation workers.
pub const REQUESTS_STREAM: &str = "automation.requests";
