use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::config::{IMPERSONATION_HARD_CAP_MINUTES, IMPERSONATION_MIN_MINUTES};
use crate::models::{ImpersonationSession, ImpersonationStatus};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartImpersonationRequest {
    pub target_user_id: Uuid,

    #[validate(length(min = 20, max = 1000, message = "Business reason must be at least 20 characters"))]
    pub business_reason: String,

    #[validate(range(
        min = IMPERSONATION_MIN_MINUTES,
        max = IMPERSONATION_HARD_CAP_MINUTES,
        message = "Duration must be between 5 and 30 minutes"
    ))]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartImpersonationResponse {
    pub session_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct EndImpersonationRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndImpersonationResponse {
    pub session_id: Uuid,
    pub status: ImpersonationStatus,
    /// False when the session had already left the active state.
    pub ended: bool,
}

/// Session as shown to administrators. The token is never included.
#[derive(Debug, Clone, Serialize)]
pub struct ImpersonationSessionView {
    pub session_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub business_reason: String,
    pub status: ImpersonationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub deny: Vec<String>,
}

impl From<ImpersonationSession> for ImpersonationSessionView {
    fn from(s: ImpersonationSession) -> Self {
        Self {
            session_id: s.id,
            actor_id: s.actor_id,
            target_id: s.target_id,
            business_reason: s.business_reason,
            status: s.status,
            created_at: s.created_at,
            expires_at: s.expires_at,
            ended_at: s.ended_at,
            deny: s.deny,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpersonationStatusResponse {
    pub active: bool,
    /// Set when the caller is currently acting through a grant.
    pub impersonating_as: Option<Uuid>,
    pub session: Option<ImpersonationSessionView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}
