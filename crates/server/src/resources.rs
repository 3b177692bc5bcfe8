//! Resource fetch seam for the `request` command
//!
//! Request replies come from the durable store, not the stream. The
//! trait keeps command handling testable without Postgres.

use async_trait::async_trait;
use pulsegrid_common::db::Repository;
use pulsegrid_common::errors::Result;
use serde_json::Value;

/// Named dashboard resources a client can request synchronously.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Latest aggregated metrics pass
    async fn metrics(&self) -> Result<Value>;

    /// Recommendations awaiting a decision
    async fn recommendations(&self) -> Result<Value>;

    /// All tracked competitors
    async fn competitors(&self) -> Result<Value>;
}

/// Recommendations returned per request; older ones page in elsewhere.
const RECOMMENDATION_LIMIT: u64 = 50;

#[async_trait]
impl ResourceStore for Repository {
    async fn metrics(&self) -> Result<Value> {
        let snapshot = self.latest_metric_snapshot().await?;
        Ok(snapshot
            .map(|s| s.payload)
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    async fn recommendations(&self) -> Result<Value> {
        let rows = self.pending_recommendations(RECOMMENDATION_LIMIT).await?;
        Ok(serde_json::to_value(rows)?)
    }

    async fn competitors(&self) -> Result<Value> {
        let rows = self.list_competitors().await?;
        Ok(serde_json::to_value(rows)?)
    }
}
