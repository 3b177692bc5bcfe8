//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations
//! with proper error handling.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Aggregate session counts sourced from the durable store.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionMetrics {
    pub total: u64,
    pub active: u64,
    pub expired: u64,
    pub by_platform: HashMap<String, u64>,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Platform Registry (read-only)
    // ========================================================================

    /// Find a platform by slug
    pub async fn find_platform(&self, id: &str) -> Result<Option<Platform>> {
        PlatformEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// All active registry platforms
    pub async fn list_active_platforms(&self) -> Result<Vec<Platform>> {
        PlatformEntity::find()
            .filter(PlatformColumn::IsActive.eq(true))
            .order_by_asc(PlatformColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    /// Insert a freshly created session row.
    ///
    /// `expires_at` is clamped so it never lands before `created_at`.
    pub async fn insert_session(&self, session: Session) -> Result<Session> {
        let expires_at = session
            .expires_at
            .map(|e| e.max(session.created_at));

        let row = SessionActiveModel {
            id: Set(session.id),
            platform_id: Set(session.platform_id),
            session_token: Set(session.session_token),
            cookies_json: Set(session.cookies_json),
            user_agent: Set(session.user_agent),
            proxy_url: Set(session.proxy_url),
            is_active: Set(session.is_active),
            created_at: Set(session.created_at),
            last_used: Set(session.last_used),
            expires_at: Set(expires_at),
        };

        row.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find a session row by id
    pub async fn find_session(&self, id: Uuid) -> Result<Option<Session>> {
        SessionEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// All currently active, non-expired sessions (cache warm-up)
    pub async fn find_active_sessions(&self) -> Result<Vec<Session>> {
        let now: DateTime<Utc> = Utc::now();
        SessionEntity::find()
            .filter(SessionColumn::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(SessionColumn::ExpiresAt.is_null())
                    .add(SessionColumn::ExpiresAt.gt(now)),
            )
            .order_by_asc(SessionColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Soft-retire a session row. A second call on an already-inactive
    /// row is a no-op, which keeps invalidation idempotent.
    pub async fn deactivate_session(&self, id: Uuid) -> Result<()> {
        SessionEntity::update_many()
            .col_expr(SessionColumn::IsActive, Expr::value(false))
            .filter(SessionColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Refresh `last_used` on a session row
    pub async fn touch_session(&self, id: Uuid, last_used: DateTime<Utc>) -> Result<()> {
        SessionEntity::update_many()
            .col_expr(SessionColumn::LastUsed, Expr::value(last_used))
            .filter(SessionColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Replace the cookie list on a session row
    pub async fn update_session_cookies(
        &self,
        id: Uuid,
        cookies_json: serde_json::Value,
    ) -> Result<()> {
        SessionEntity::update_many()
            .col_expr(SessionColumn::CookiesJson, Expr::value(cookies_json))
            .filter(SessionColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Soft-retire every session whose expiry has passed.
    /// Returns the number of rows flipped.
    pub async fn expire_due_sessions(&self) -> Result<u64> {
        let now: DateTime<Utc> = Utc::now();
        let result = SessionEntity::update_many()
            .col_expr(SessionColumn::IsActive, Expr::value(false))
            .filter(SessionColumn::IsActive.eq(true))
            .filter(SessionColumn::ExpiresAt.lt(now))
            .exec(self.write_conn())
            .await?;
        Ok(result.rows_affected)
    }

    /// Aggregate counts from the store, not the cache, so the numbers
    /// reflect ground truth.
    pub async fn session_metrics(&self) -> Result<SessionMetrics> {
        use sea_orm::ConnectionTrait;

        let now: DateTime<Utc> = Utc::now();
        let conn = self.read_conn();

        let total = SessionEntity::find().count(conn).await?;

        let active = SessionEntity::find()
            .filter(SessionColumn::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(SessionColumn::ExpiresAt.is_null())
                    .add(SessionColumn::ExpiresAt.gt(now)),
            )
            .count(conn)
            .await?;

        let expired = SessionEntity::find()
            .filter(SessionColumn::ExpiresAt.is_not_null())
            .filter(SessionColumn::ExpiresAt.lt(now))
            .count(conn)
            .await?;

        let stmt = Statement::from_string(
            DbBackend::Postgres,
            r#"
            SELECT platform_id, COUNT(*) AS session_count
            FROM sessions
            GROUP BY platform_id
            "#,
        );

        let by_platform: HashMap<String, u64> = conn
            .query_all(stmt)
            .await?
            .into_iter()
            .filter_map(|row| {
                let platform = row.try_get_by_index::<String>(0).ok()?;
                let count = row.try_get_by_index::<i64>(1).ok()?;
                Some((platform, count as u64))
            })
            .collect();

        Ok(SessionMetrics {
            total,
            active,
            expired,
            by_platform,
        })
    }

    // ========================================================================
    // Dashboard Resources (read-only)
    // ========================================================================

    /// Most recent aggregated metrics pass
    pub async fn latest_metric_snapshot(&self) -> Result<Option<MetricSnapshot>> {
        MetricSnapshotEntity::find()
            .order_by_desc(MetricSnapshotColumn::CapturedAt)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Recommendations still awaiting a decision
    pub async fn pending_recommendations(&self, limit: u64) -> Result<Vec<Recommendation>> {
        RecommendationEntity::find()
            .filter(RecommendationColumn::Status.eq("pending"))
            .order_by_desc(RecommendationColumn::CreatedAt)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// All tracked competitors
    pub async fn list_competitors(&self) -> Result<Vec<Competitor>> {
        CompetitorEntity::find()
            .order_by_asc(CompetitorColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }
}
