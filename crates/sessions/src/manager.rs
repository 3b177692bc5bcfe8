//! Session lifecycle manager
//!
//! Owns session identity, validity rules, rotation, and the two-tier
//! cache in front of the durable store. One instance per process;
//! constructed explicitly, started with `initialize`, stopped with
//! `shutdown`.

use crate::cache::{FastCache, SessionCache};
use crate::identity;
use crate::rotation::RotationScheduler;
use crate::store::SessionStore;
use chrono::Utc;
use pulsegrid_common::config::SessionConfig;
use pulsegrid_common::db::models::{CookieRecord, Session};
use pulsegrid_common::db::SessionMetrics;
use pulsegrid_common::errors::{AppError, Result};
use pulsegrid_common::metrics::record_session_event;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cache: SessionCache,
    config: SessionConfig,
    scheduler: RotationScheduler,
    /// Handed to timer tasks so they never keep the manager alive
    self_ref: std::sync::Weak<Self>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        fast_cache: Arc<dyn FastCache>,
        mut config: SessionConfig,
    ) -> Arc<Self> {
        config.clamp_rotation_interval();
        let cache = SessionCache::new(fast_cache, config.max_session_age());
        Arc::new_cyclic(|self_ref| Self {
            store,
            cache,
            config,
            scheduler: RotationScheduler::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Warm both cache tiers from the store, then start the expiry sweep
    /// and one rotation timer per active registry platform. An empty
    /// registry is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let sessions = self.store.find_active_sessions().await?;
        let warmed = sessions.len();
        for session in sessions {
            self.cache.put(&session).await;
        }

        self.scheduler.start_sweep(
            self.self_ref.clone(),
            self.config.expiry_sweep_interval(),
        );

        let platforms = self.store.list_active_platforms().await?;
        for platform in &platforms {
            self.scheduler.start_rotation(
                self.self_ref.clone(),
                platform.id.clone(),
                self.config.rotation_interval(),
            );
        }

        info!(
            warmed_sessions = warmed,
            platforms = platforms.len(),
            "Session manager initialized"
        );
        Ok(())
    }

    /// Current session for a platform, creating one when no tier holds a
    /// valid entry. A cached hit is touched before it is returned, so
    /// `last_used` always reflects this call.
    pub async fn get_or_create_session(&self, platform: &str) -> Result<Session> {
        if let Some(session) = self.cache.get(platform).await {
            if session.is_valid() {
                return self.touch(session).await;
            }
            // Stale entry; drop it before creating the replacement
            self.cache.invalidate(platform).await;
        }

        self.create_session(platform).await
    }

    /// Invalidate the platform's current session (if any) and create a
    /// replacement. Called by the rotation timers and on demand.
    pub async fn rotate_session(&self, platform: &str) -> Result<Session> {
        if let Some(current) = self.cache.get(platform).await {
            self.invalidate_session(&current).await?;
        }

        let session = self.create_session(platform).await?;
        record_session_event("rotated", platform);
        debug!(platform, session_id = %session.id, "Session rotated");
        Ok(session)
    }

    /// Soft-retire a session in the store and drop it from both cache
    /// tiers. Invalidating an already-inactive session is a no-op.
    pub async fn invalidate_session(&self, session: &Session) -> Result<()> {
        self.store.deactivate_session(session.id).await?;
        self.cache.invalidate(&session.platform_id).await;
        record_session_event("invalidated", &session.platform_id);
        Ok(())
    }

    /// Replace the cookie list on a session known to the in-process
    /// cache. There is deliberately no cold store fallback: callers hold
    /// leases that came through this manager.
    pub async fn update_session_cookies(
        &self,
        session_id: Uuid,
        cookies: Vec<CookieRecord>,
    ) -> Result<()> {
        let mut session = self
            .cache
            .get_by_id(session_id)
            .await
            .ok_or_else(|| AppError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let cookies_json = serde_json::to_value(&cookies)?;
        self.store
            .update_session_cookies(session_id, cookies_json.clone())
            .await?;

        session.cookies_json = cookies_json;
        self.cache.put(&session).await;
        Ok(())
    }

    /// Cached sessions that currently pass the validity check.
    pub async fn get_active_sessions(&self) -> Vec<Session> {
        self.cache.valid_sessions().await
    }

    /// Aggregate counts from the durable store (ground truth, not the
    /// cache).
    pub async fn get_session_metrics(&self) -> Result<SessionMetrics> {
        self.store.session_metrics().await
    }

    /// Retire expired store rows, then purge cache entries that fail the
    /// validity check. Runs on the sweep timer; public for tests and
    /// operational tooling.
    pub async fn run_expiry_sweep(&self) -> Result<u64> {
        let retired = self.store.expire_due_sessions().await?;
        let purged = self.cache.purge_invalid().await;
        if retired > 0 || purged > 0 {
            info!(retired, purged, "Expiry sweep completed");
        }
        Ok(retired)
    }

    /// Cancel all timers and drop the in-process cache. Persisted state
    /// is untouched.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.cache.clear_local().await;
        info!("Session manager shut down");
    }

    async fn create_session(&self, platform: &str) -> Result<Session> {
        let registered = self
            .store
            .find_platform(platform)
            .await?
            .ok_or_else(|| AppError::UnknownPlatform {
                platform: platform.to_string(),
            })?;

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            platform_id: registered.id,
            session_token: identity::generate_token(),
            cookies_json: serde_json::json!([]),
            user_agent: identity::random_user_agent().to_string(),
            proxy_url: None,
            is_active: true,
            created_at: now.into(),
            last_used: Some(now.into()),
            expires_at: Some((now + self.config.max_session_age()).into()),
        };

        let session = self.store.insert_session(session).await?;
        self.cache.put(&session).await;
        record_session_event("created", platform);
        debug!(platform, session_id = %session.id, "Session created");
        Ok(session)
    }

    async fn touch(&self, mut session: Session) -> Result<Session> {
        let now = Utc::now();
        if let Err(e) = self.store.touch_session(session.id, now).await {
            // The lease is still valid; a failed recency write should
            // not take the lookup down with it.
            warn!(session_id = %session.id, error = %e, "Failed to touch session in store");
        }
        session.last_used = Some(now.into());
        self.cache.put(&session).await;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    const PLATFORMS: &[&str] = &["instagram", "tiktok"];

    fn config() -> SessionConfig {
        SessionConfig {
            max_session_age_secs: 3600,
            rotation_interval_secs: 3600,
            expiry_sweep_secs: 300,
        }
    }

    fn manager_with(store: Arc<MemoryStore>, fast: Arc<MemoryCache>) -> Arc<SessionManager> {
        SessionManager::new(store, fast, config())
    }

    fn manager() -> (Arc<SessionManager>, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::with_platforms(PLATFORMS));
        let fast = Arc::new(MemoryCache::new());
        (manager_with(store.clone(), fast.clone()), store, fast)
    }

    fn expired_session(platform: &str) -> Session {
        let past = Utc::now() - ChronoDuration::hours(2);
        Session {
            id: Uuid::new_v4(),
            platform_id: platform.to_string(),
            session_token: "stale-token".into(),
            cookies_json: serde_json::json!([]),
            user_agent: "Mozilla/5.0".into(),
            proxy_url: None,
            is_active: true,
            created_at: past.into(),
            last_used: None,
            expires_at: Some((past + ChronoDuration::hours(1)).into()),
        }
    }

    #[tokio::test]
    async fn repeated_lookup_returns_same_session() {
        let (manager, _, _) = manager();
        let first = manager.get_or_create_session("instagram").await.unwrap();
        let second = manager.get_or_create_session("instagram").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn lookup_touches_last_used() {
        let (manager, store, _) = manager();
        let first = manager.get_or_create_session("instagram").await.unwrap();
        let second = manager.get_or_create_session("instagram").await.unwrap();

        assert!(second.last_used.is_some());
        assert!(second.last_used >= first.last_used);
        // The refresh is persisted, not just cached
        let row = store.session_row(first.id).await.unwrap();
        assert_eq!(row.last_used, second.last_used);
    }

    #[tokio::test]
    async fn expired_fast_cache_entry_is_replaced() {
        let store = Arc::new(MemoryStore::with_platforms(PLATFORMS));
        let fast = Arc::new(MemoryCache::new());
        let stale = expired_session("instagram");
        fast.put_session("instagram", &stale, std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let manager = manager_with(store, fast);
        let fresh = manager.get_or_create_session("instagram").await.unwrap();

        assert_ne!(fresh.id, stale.id);
        assert!(fresh.is_valid());
    }

    #[tokio::test]
    async fn active_sessions_never_include_expired() {
        let (manager, store, _) = manager();
        store.insert_session(expired_session("tiktok")).await.unwrap();
        let live = manager.get_or_create_session("instagram").await.unwrap();

        let active = manager.get_active_sessions().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let (manager, store, _) = manager();
        let session = manager.get_or_create_session("instagram").await.unwrap();

        manager.invalidate_session(&session).await.unwrap();
        manager.invalidate_session(&session).await.unwrap();

        let row = store.session_row(session.id).await.unwrap();
        assert!(!row.is_active);
    }

    #[tokio::test]
    async fn rotation_replaces_the_current_session() {
        let (manager, store, _) = manager();
        let before = manager.get_or_create_session("instagram").await.unwrap();

        let rotated = manager.rotate_session("instagram").await.unwrap();
        assert_ne!(rotated.id, before.id);

        // Old row is soft-retired, not deleted
        let old_row = store.session_row(before.id).await.unwrap();
        assert!(!old_row.is_active);

        let after = manager.get_or_create_session("instagram").await.unwrap();
        assert_eq!(after.id, rotated.id);
    }

    #[tokio::test]
    async fn unknown_platform_is_rejected() {
        let (manager, _, _) = manager();
        let err = manager.get_or_create_session("myspace").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownPlatform { .. }));
    }

    #[tokio::test]
    async fn cookie_update_flows_through_store_and_cache() {
        let (manager, store, _) = manager();
        let session = manager.get_or_create_session("instagram").await.unwrap();

        let cookies = vec![CookieRecord {
            name: "sid".into(),
            value: "abc123".into(),
            domain: Some(".instagram.com".into()),
            path: Some("/".into()),
            expires_at: None,
            secure: true,
            http_only: true,
        }];
        manager
            .update_session_cookies(session.id, cookies.clone())
            .await
            .unwrap();

        let row = store.session_row(session.id).await.unwrap();
        assert_eq!(row.cookies(), cookies);

        let cached = manager.get_or_create_session("instagram").await.unwrap();
        assert_eq!(cached.cookies(), cookies);
    }

    #[tokio::test]
    async fn cookie_update_requires_a_cached_session() {
        let (manager, _, _) = manager();
        let err = manager
            .update_session_cookies(Uuid::new_v4(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn metrics_come_from_the_store() {
        let (manager, _, _) = manager();
        let a = manager.get_or_create_session("instagram").await.unwrap();
        manager.get_or_create_session("tiktok").await.unwrap();
        manager.invalidate_session(&a).await.unwrap();

        let metrics = manager.get_session_metrics().await.unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.by_platform.get("instagram"), Some(&1));
        assert_eq!(metrics.by_platform.get("tiktok"), Some(&1));
    }

    #[tokio::test]
    async fn expiry_sweep_retires_due_rows() {
        let (manager, store, _) = manager();
        store.insert_session(expired_session("instagram")).await.unwrap();
        manager.get_or_create_session("tiktok").await.unwrap();

        let retired = manager.run_expiry_sweep().await.unwrap();
        assert_eq!(retired, 1);
        assert_eq!(manager.get_active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn initialize_tolerates_an_empty_registry() {
        let store = Arc::new(MemoryStore::new());
        let fast = Arc::new(MemoryCache::new());
        let manager = manager_with(store, fast);

        manager.initialize().await.unwrap();
        assert!(manager.get_active_sessions().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_warms_the_cache_from_the_store() {
        let store = Arc::new(MemoryStore::with_platforms(PLATFORMS));
        let fast = Arc::new(MemoryCache::new());
        let mut seeded = expired_session("instagram");
        seeded.created_at = Utc::now().into();
        seeded.expires_at = Some((Utc::now() + ChronoDuration::hours(1)).into());
        let seeded = store.insert_session(seeded).await.unwrap();

        let manager = manager_with(store, fast);
        manager.initialize().await.unwrap();

        let session = manager.get_or_create_session("instagram").await.unwrap();
        assert_eq!(session.id, seeded.id);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drops_the_local_cache_but_not_rows() {
        let (manager, store, _) = manager();
        manager.get_or_create_session("instagram").await.unwrap();

        manager.shutdown().await;
        assert!(manager.get_active_sessions().await.is_empty());
        assert_eq!(store.session_count().await, 1);
    }
}
