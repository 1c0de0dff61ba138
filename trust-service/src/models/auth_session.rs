use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per device/session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub org_id: Uuid,
    #[sqlx(rename = "ip_address")]
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[sqlx(rename = "created_utc")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "last_seen_utc")]
    pub last_seen_at: DateTime<Utc>,
}

/// Session as listed back to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_current: bool,
}

impl SessionInfo {
    pub fn from_session(session: AuthSession, current: Option<&str>) -> Self {
        let is_current = current == Some(session.session_id.as_str());
        Self {
            session_id: session.session_id,
            ip: session.ip,
            user_agent: session.user_agent,
            created_at: session.created_at,
            last_seen_at: session.last_seen_at,
            is_current,
        }
    }
}
