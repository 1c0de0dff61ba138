use chrono::{DateTime, Utc};
use serde::Serialize;

/// Most recent strong-factor ceremony completed on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ReauthState {
    pub session_id: String,
    #[sqlx(rename = "last_strong_auth_utc")]
    pub last_strong_auth_at: DateTime<Utc>,
    #[sqlx(rename = "factor_code")]
    pub factor: String,
}
