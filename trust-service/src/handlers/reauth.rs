use service_core::axum::{extract::State, Json};
use service_core::error::AppError;

use crate::dtos::ReauthStatusResponse;
use crate::middleware::AuthUser;
use crate::AppState;

/// GET /reauth/status
pub async fn status(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> Result<Json<ReauthStatusResponse>, AppError> {
    let age = match principal.session_id.as_deref() {
        Some(sid) => state.reauth.get_auth_age(sid).await?,
        None => None,
    };
    let window = state.reauth.window();

    Ok(Json(ReauthStatusResponse {
        recent: matches!(age, Some(a) if a < window),
        age_ms: age.map(|a| a.num_milliseconds()),
        window_minutes: window.num_minutes(),
    }))
}
