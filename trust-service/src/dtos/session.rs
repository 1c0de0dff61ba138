use serde::Serialize;

use crate::models::SessionInfo;

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct RevokeSessionResponse {
    pub session_id: String,
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct RevokeOthersResponse {
    pub revoked: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReauthStatusResponse {
    pub recent: bool,
    pub age_ms: Option<i64>,
    pub window_minutes: i64,
}
