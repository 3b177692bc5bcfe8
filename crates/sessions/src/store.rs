//! Durable-store seam for the session subsystem
//!
//! `SessionStore` is the narrow surface the manager needs from the
//! relational store. Production uses the shared `Repository`; tests use
//! `MemoryStore`, so every lifecycle property can run without Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsegrid_common::db::models::{Platform, Session};
use pulsegrid_common::db::{Repository, SessionMetrics};
use pulsegrid_common::errors::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// CRUD against the durable store for session rows and the platform
/// registry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_platform(&self, id: &str) -> Result<Option<Platform>>;

    async fn list_active_platforms(&self) -> Result<Vec<Platform>>;

    async fn insert_session(&self, session: Session) -> Result<Session>;

    /// Soft-retire a row; a no-op when the row is already inactive.
    async fn deactivate_session(&self, id: Uuid) -> Result<()>;

    async fn touch_session(&self, id: Uuid, last_used: DateTime<Utc>) -> Result<()>;

    async fn update_session_cookies(&self, id: Uuid, cookies_json: serde_json::Value)
        -> Result<()>;

    /// Active, non-expired rows for cache warm-up.
    async fn find_active_sessions(&self) -> Result<Vec<Session>>;

    /// Retire every row whose expiry has passed; returns rows flipped.
    async fn expire_due_sessions(&self) -> Result<u64>;

    async fn session_metrics(&self) -> Result<SessionMetrics>;
}

#[async_trait]
impl SessionStore for Repository {
    async fn find_platform(&self, id: &str) -> Result<Option<Platform>> {
        Repository::find_platform(self, id).await
    }

    async fn list_active_platforms(&self) -> Result<Vec<Platform>> {
        Repository::list_active_platforms(self).await
    }

    async fn insert_session(&self, session: Session) -> Result<Session> {
        Repository::insert_session(self, session).await
    }

    async fn deactivate_session(&self, id: Uuid) -> Result<()> {
        Repository::deactivate_session(self, id).await
    }

    async fn touch_session(&self, id: Uuid, last_used: DateTime<Utc>) -> Result<()> {
        Repository::touch_session(self, id, last_used).await
    }

    async fn update_session_cookies(
        &self,
        id: Uuid,
        cookies_json: serde_json::Value,
    ) -> Result<()> {
        Repository::update_session_cookies(self, id, cookies_json).await
    }

    async fn find_active_sessions(&self) -> Result<Vec<Session>> {
        Repository::find_active_sessions(self).await
    }

    async fn expire_due_sessions(&self) -> Result<u64> {
        Repository::expire_due_sessions(self).await
    }

    async fn session_metrics(&self) -> Result<SessionMetrics> {
        Repository::session_metrics(self).await
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    platforms: RwLock<Vec<Platform>>,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with active registry platforms.
    pub fn with_platforms(ids: &[&str]) -> Self {
        let platforms = ids
            .iter()
            .map(|id| Platform {
                id: id.to_string(),
                name: id.to_string(),
                is_active: true,
            })
            .collect();
        Self {
            platforms: RwLock::new(platforms),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Raw row access for assertions.
    pub async fn session_row(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_platform(&self, id: &str) -> Result<Option<Platform>> {
        Ok(self
            .platforms
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn list_active_platforms(&self) -> Result<Vec<Platform>> {
        Ok(self
            .platforms
            .read()
            .await
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, mut session: Session) -> Result<Session> {
        // Same clamp the repository applies on insert
        session.expires_at = session.expires_at.map(|e| e.max(session.created_at));
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn deactivate_session(&self, id: Uuid) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.is_active = false;
        }
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, last_used: DateTime<Utc>) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.last_used = Some(last_used.into());
        }
        Ok(())
    }

    async fn update_session_cookies(
        &self,
        id: Uuid,
        cookies_json: serde_json::Value,
    ) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.cookies_json = cookies_json;
        }
        Ok(())
    }

    async fn find_active_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_valid())
            .cloned()
            .collect())
    }

    async fn expire_due_sessions(&self) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let mut flipped = 0;
        for session in sessions.values_mut() {
            if session.is_active && session.is_expired() {
                session.is_active = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn session_metrics(&self) -> Result<SessionMetrics> {
        let sessions = self.sessions.read().await;
        let mut metrics = SessionMetrics {
            total: sessions.len() as u64,
            ..Default::default()
        };
        for session in sessions.values() {
            if session.is_valid() {
                metrics.active += 1;
            }
            if session.is_expired() {
                metrics.expired += 1;
            }
            *metrics
                .by_platform
                .entry(session.platform_id.clone())
                .or_insert(0) += 1;
        }
        Ok(metrics)
    }
}
