//! Step-up gate for routes that need a fresh strong authentication.

use service_core::{
    axum::{
        extract::{Request, State},
        middleware::Next,
        response::Response,
    },
    error::AppError,
};

use crate::models::Principal;
use crate::AppState;

pub async fn require_recent_reauth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = req.extensions().get::<Principal>().ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("Principal missing from request extensions"))
    })?;

    if let Err(e) = state
        .reauth
        .require_recent_reauth(principal.session_id.as_deref())
        .await
    {
        tracing::info!(user_id = %principal.id, path = %req.uri().path(), "Step-up required");
        return Err(e.into());
    }

    Ok(next.run(req).await)
}
