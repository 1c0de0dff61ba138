//! Device session endpoints for the signed-in user.

use service_core::axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;

use crate::dtos::{RevokeOthersResponse, RevokeSessionResponse, SessionListResponse};
use crate::middleware::AuthUser;
use crate::models::TenantContext;
use crate::services::TrustError;
use crate::utils::ClientIp;
use crate::AppState;

/// GET /sessions
pub async fn list(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    tenant: TenantContext,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state
        .sessions
        .list_sessions(&tenant, principal.session_id.as_deref())
        .await?;
    Ok(Json(SessionListResponse { sessions }))
}

/// DELETE /sessions/:session_id
#[tracing::instrument(skip(state, principal, tenant, ip), fields(user_id = %principal.id))]
pub async fn revoke(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    tenant: TenantContext,
    ip: ClientIp,
    Path(session_id): Path<String>,
) -> Result<Json<RevokeSessionResponse>, AppError> {
    state
        .sessions
        .revoke_session(&principal, &tenant, &session_id, ip.0)
        .await?;
    Ok(Json(RevokeSessionResponse {
        session_id,
        revoked: true,
    }))
}

/// POST /sessions/revoke-others
#[tracing::instrument(skip(state, principal, tenant, ip), fields(user_id = %principal.id))]
pub async fn revoke_others(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    tenant: TenantContext,
    ip: ClientIp,
) -> Result<Json<RevokeOthersResponse>, AppError> {
    let current = principal
        .session_id
        .clone()
        .ok_or_else(|| TrustError::Unauthorized("No current session".to_string()))?;
    let revoked = state
        .sessions
        .revoke_all_other_sessions(&principal, &tenant, &current, ip.0)
        .await?;
    Ok(Json(RevokeOthersResponse { revoked }))
}
