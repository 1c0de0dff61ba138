//! Impersonation endpoints.

use service_core::axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    EndImpersonationRequest, EndImpersonationResponse, ImpersonationSessionView,
    ImpersonationStatusResponse, LimitQuery, StartImpersonationRequest,
    StartImpersonationResponse,
};
use crate::middleware::{AuthUser, Impersonation};
use crate::services::TrustError;
use crate::utils::ClientIp;
use crate::AppState;

/// POST /impersonation/start
#[tracing::instrument(skip(state, principal, ip, body), fields(actor_id = %principal.id, target_id = %body.target_user_id))]
pub async fn start(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    ip: ClientIp,
    Json(body): Json<StartImpersonationRequest>,
) -> Result<(StatusCode, Json<StartImpersonationResponse>), AppError> {
    let response = state.impersonation.start(&principal, body, ip.0).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /impersonation/:session_id/end
#[tracing::instrument(skip(state, principal, ip, body), fields(actor_id = %principal.id))]
pub async fn end(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    ip: ClientIp,
    Path(session_id): Path<Uuid>,
    body: Option<Json<EndImpersonationRequest>>,
) -> Result<Json<EndImpersonationResponse>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate().map_err(TrustError::from)?;

    let response = state
        .impersonation
        .end(&principal, session_id, body.reason, ip.0)
        .await?;
    Ok(Json(response))
}

/// GET /impersonation/status
pub async fn status(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Impersonation(grant): Impersonation,
) -> Result<Json<ImpersonationStatusResponse>, AppError> {
    // Acting through a grant: report the grant rather than the target's own state.
    if let Some(grant) = grant {
        return Ok(Json(ImpersonationStatusResponse {
            active: true,
            impersonating_as: Some(grant.target_id),
            session: None,
        }));
    }

    let session = state.impersonation.status(&principal).await?;
    Ok(Json(ImpersonationStatusResponse {
        active: session.is_some(),
        impersonating_as: None,
        session: session.map(ImpersonationSessionView::from),
    }))
}

/// GET /impersonation/sessions?limit=
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ImpersonationSessionView>>, AppError> {
    let sessions = state
        .impersonation
        .list_recent(&principal, query.limit)
        .await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}
