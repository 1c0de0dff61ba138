use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpersonationStatus {
    Active,
    Completed,
    Expired,
}

impl ImpersonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpersonationStatus::Active => "active",
            ImpersonationStatus::Completed => "completed",
            ImpersonationStatus::Expired => "expired",
        }
    }
}

impl TryFrom<String> for ImpersonationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(ImpersonationStatus::Active),
            "completed" => Ok(ImpersonationStatus::Completed),
            "expired" => Ok(ImpersonationStatus::Expired),
            other => Err(format!("Invalid impersonation status: {}", other)),
        }
    }
}

/// A time-boxed grant for `actor_id` to act as `target_id`. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImpersonationSession {
    #[sqlx(rename = "session_id")]
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub business_reason: String,
    #[sqlx(try_from = "String")]
    pub status: ImpersonationStatus,
    #[sqlx(rename = "created_utc")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "expires_utc")]
    pub expires_at: DateTime<Utc>,
    #[sqlx(rename = "ended_utc")]
    pub ended_at: Option<DateTime<Utc>>,
    #[sqlx(rename = "ip_address")]
    pub ip: Option<String>,
    #[sqlx(rename = "deny_operations")]
    pub deny: Vec<String>,
}

impl ImpersonationSession {
    pub fn is_active(&self) -> bool {
        self.status == ImpersonationStatus::Active
    }

    /// Active by status but past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now > self.expires_at
    }
}
