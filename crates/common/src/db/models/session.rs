//! Automation session entity
//!
//! One row per leased automation identity. Rows are soft-retired
//! (`is_active = false`) rather than deleted so the history stays
//! auditable.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Slug key into the platform registry
    #[sea_orm(column_type = "Text")]
    pub platform_id: String,

    /// Opaque generated secret; never logged in plaintext
    #[sea_orm(column_type = "Text")]
    pub session_token: String,

    /// Ordered list of cookie records as JSONB
    #[sea_orm(column_type = "JsonBinary")]
    pub cookies_json: Json,

    #[sea_orm(column_type = "Text")]
    pub user_agent: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub proxy_url: Option<String>,

    pub is_active: bool,

    pub created_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub last_used: Option<DateTimeWithTimeZone>,

    #[sea_orm(nullable)]
    pub expires_at: Option<DateTimeWithTimeZone>,
}

/// A single cookie carried by a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Model {
    /// A session is valid iff it is active and not past its expiry.
    /// Recency of `last_used` never invalidates a session on its own.
    pub fn is_valid(&self) -> bool {
        self.is_active && !self.is_expired()
    }

    /// Check if session is expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < Utc::now(),
            None => false,
        }
    }

    /// Decode the cookie list from the JSONB column.
    pub fn cookies(&self) -> Vec<CookieRecord> {
        serde_json::from_value(self.cookies_json.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::platform::Entity",
        from = "Column::PlatformId",
        to = "super::platform::Column::Id"
    )]
    Platform,
}

impl Related<super::platform::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Platform.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(expires_at: Option<chrono::DateTime<Utc>>, is_active: bool) -> Model {
        Model {
            id: Uuid::new_v4(),
            platform_id: "instagram".into(),
            session_token: "tok".into(),
            cookies_json: serde_json::json!([]),
            user_agent: "Mozilla/5.0".into(),
            proxy_url: None,
            is_active,
            created_at: Utc::now().into(),
            last_used: None,
            expires_at: expires_at.map(Into::into),
        }
    }

    #[test]
    fn valid_when_active_and_unexpired() {
        let s = session(Some(Utc::now() + Duration::hours(1)), true);
        assert!(s.is_valid());
    }

    #[test]
    fn valid_when_no_expiry() {
        let s = session(None, true);
        assert!(s.is_valid());
        assert!(!s.is_expired());
    }

    #[test]
    fn invalid_when_expired() {
        let s = session(Some(Utc::now() - Duration::minutes(1)), true);
        assert!(s.is_expired());
        assert!(!s.is_valid());
    }

    #[test]
    fn invalid_when_inactive() {
        let s = session(Some(Utc::now() + Duration::hours(1)), false);
        assert!(!s.is_valid());
    }

    #[test]
    fn cookie_round_trip() {
        let cookies = vec![CookieRecord {
            name: "sid".into(),
            value: "abc".into(),
            domain: Some(".example.com".into()),
            path: Some("/".into()),
            expires_at: None,
            secure: true,
            http_only: true,
        }];
        let mut s = session(None, true);
        s.cookies_json = serde_json::to_value(&cookies).unwrap();
        assert_eq!(s.cookies(), cookies);
    }
}
