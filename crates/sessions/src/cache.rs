//! Two-tier session cache
//!
//! An in-process map in front of the fast cache, in front of the store.
//! Both tiers are rebuildable accelerators: a tier write that fails is
//! logged and the durable record stays authoritative.

use async_trait::async_trait;
use pulsegrid_common::cache::{keys, Cache};
use pulsegrid_common::db::models::Session;
use pulsegrid_common::errors::Result;
use pulsegrid_common::metrics::record_cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Get/set-with-TTL against the low-latency tier, one entry per
/// platform holding the serialized current session.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get_session(&self, platform: &str) -> Result<Option<Session>>;

    async fn put_session(&self, platform: &str, session: &Session, ttl: Duration) -> Result<()>;

    async fn remove_session(&self, platform: &str) -> Result<()>;
}

#[async_trait]
impl FastCache for Cache {
    async fn get_session(&self, platform: &str) -> Result<Option<Session>> {
        self.get(&keys::session(platform)).await
    }

    async fn put_session(&self, platform: &str, session: &Session, ttl: Duration) -> Result<()> {
        self.set_with_ttl(&keys::session(platform), session, ttl.as_secs())
            .await
    }

    async fn remove_session(&self, platform: &str) -> Result<()> {
        self.delete(&keys::session(platform)).await.map(|_| ())
    }
}

/// In-memory fast-cache tier for tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Session, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get_session(&self, platform: &str) -> Result<Option<Session>> {
        let entries = self.entries.read().await;
        Ok(entries.get(platform).and_then(|(session, deadline)| {
            (*deadline > Instant::now()).then(|| session.clone())
        }))
    }

    async fn put_session(&self, platform: &str, session: &Session, ttl: Duration) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(platform.to_string(), (session.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn remove_session(&self, platform: &str) -> Result<()> {
        self.entries.write().await.remove(platform);
        Ok(())
    }
}

/// Cache-aside front for current sessions, keyed by platform.
///
/// Lookup order is local map, then fast tier; writes go through both.
/// Fast-tier failures degrade to the slower path instead of failing the
/// call.
pub struct SessionCache {
    local: RwLock<HashMap<String, Session>>,
    fast: Arc<dyn FastCache>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(fast: Arc<dyn FastCache>, ttl: Duration) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            fast,
            ttl,
        }
    }

    /// Current session for a platform, if either tier has one.
    pub async fn get(&self, platform: &str) -> Option<Session> {
        if let Some(session) = self.local.read().await.get(platform) {
            record_cache(true, "session_local");
            return Some(session.clone());
        }
        record_cache(false, "session_local");

        match self.fast.get_session(platform).await {
            Ok(Some(session)) => {
                record_cache(true, "session_fast");
                self.local
                    .write()
                    .await
                    .insert(platform.to_string(), session.clone());
                Some(session)
            }
            Ok(None) => {
                record_cache(false, "session_fast");
                None
            }
            Err(e) => {
                warn!(platform, error = %e, "Fast-cache read failed, treating as miss");
                None
            }
        }
    }

    /// Session matching an id, wherever it is cached in-process.
    pub async fn get_by_id(&self, id: Uuid) -> Option<Session> {
        self.local
            .read()
            .await
            .values()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Write a session through both tiers.
    pub async fn put(&self, session: &Session) {
        self.local
            .write()
            .await
            .insert(session.platform_id.clone(), session.clone());

        if let Err(e) = self
            .fast
            .put_session(&session.platform_id, session, self.ttl)
            .await
        {
            warn!(
                platform = %session.platform_id,
                error = %e,
                "Fast-cache write failed, store remains source of truth"
            );
        }
    }

    /// Drop a platform's entry from both tiers.
    pub async fn invalidate(&self, platform: &str) {
        self.local.write().await.remove(platform);

        if let Err(e) = self.fast.remove_session(platform).await {
            warn!(platform, error = %e, "Fast-cache delete failed");
        }
    }

    /// Remove local entries that no longer pass the validity check.
    /// Returns how many were purged.
    pub async fn purge_invalid(&self) -> usize {
        let mut local = self.local.write().await;
        let before = local.len();
        local.retain(|_, session| session.is_valid());
        before - local.len()
    }

    /// Currently-valid cached sessions, without mutating state.
    pub async fn valid_sessions(&self) -> Vec<Session> {
        self.local
            .read()
            .await
            .values()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }

    /// Drop the in-process tier entirely (shutdown). The fast tier is
    /// left to expire via TTL.
    pub async fn clear_local(&self) {
        self.local.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.local.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(platform: &str, valid: bool) -> Session {
        Session {
            id: Uuid::new_v4(),
            platform_id: platform.to_string(),
            session_token: "tok".into(),
            cookies_json: serde_json::json!([]),
            user_agent: "Mozilla/5.0".into(),
            proxy_url: None,
            is_active: valid,
            created_at: Utc::now().into(),
            last_used: None,
            expires_at: None,
        }
    }

    fn cache() -> SessionCache {
        SessionCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn put_then_get_hits_local_tier() {
        let cache = cache();
        let s = session("instagram", true);
        cache.put(&s).await;
        assert_eq!(cache.get("instagram").await.map(|s| s.id), Some(s.id));
    }

    #[tokio::test]
    async fn fast_tier_backfills_local_tier() {
        let fast = Arc::new(MemoryCache::new());
        let cache = SessionCache::new(fast.clone(), Duration::from_secs(60));
        let s = session("tiktok", true);
        fast.put_session("tiktok", &s, Duration::from_secs(60))
            .await
            .unwrap();

        // Local tier is cold; the fast tier must serve and backfill
        assert_eq!(cache.get("tiktok").await.map(|s| s.id), Some(s.id));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let fast = Arc::new(MemoryCache::new());
        let cache = SessionCache::new(fast.clone(), Duration::from_secs(60));
        cache.put(&session("instagram", true)).await;

        cache.invalidate("instagram").await;
        assert!(cache.get("instagram").await.is_none());
        assert!(fast.is_empty().await);
    }

    #[tokio::test]
    async fn purge_drops_only_invalid_entries() {
        let cache = cache();
        cache.put(&session("instagram", true)).await;
        cache.put(&session("tiktok", false)).await;

        let purged = cache.purge_invalid().await;
        assert_eq!(purged, 1);
        assert!(cache.get("instagram").await.is_some());
        assert_eq!(cache.valid_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn get_by_id_finds_cached_session() {
        let cache = cache();
        let s = session("instagram", true);
        cache.put(&s).await;
        assert!(cache.get_by_id(s.id).await.is_some());
        assert!(cache.get_by_id(Uuid::new_v4()).await.is_none());
    }
}
