use service_core::{
    axum::{extract::Request, middleware::Next, response::Response},
    error::AppError,
};

use crate::models::Principal;
use crate::services::TrustError;

/// Allows ADMIN and PRESIDENT principals. Impersonated principals never pass.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let principal = req.extensions().get::<Principal>().ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("Principal missing from request extensions"))
    })?;

    if !principal.is_privileged() {
        tracing::warn!(
            user_id = %principal.id,
            role = %principal.role,
            impersonated = principal.impersonated,
            path = %req.uri().path(),
            "Admin route denied"
        );
        return Err(TrustError::InsufficientPermissions.into());
    }

    Ok(next.run(req).await)
}
