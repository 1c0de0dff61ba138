use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-organization step-up policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrgSecuritySettings {
    pub org_id: Uuid,
    pub require_mfa_for_downloads: bool,
    pub require_mfa_for_shares: bool,
    #[sqlx(rename = "updated_utc")]
    pub updated_at: DateTime<Utc>,
}
