use service_core::error::AppError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Forbidden")]
    Forbidden,

    #[error("Self-impersonation is forbidden")]
    SelfImpersonationForbidden,

    #[error("Target may not be impersonated")]
    ForbiddenTarget,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An impersonation session is already active")]
    Conflict { existing_session_id: Option<Uuid> },

    #[error("Re-authentication required")]
    ReauthRequired { age_ms: Option<i64> },

    #[error("Operation {operation} is blocked while impersonating")]
    ImpersonationBlocked { operation: String },

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Impersonation session is not active")]
    SessionInactive,

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Storage failure: {0}")]
    Storage(anyhow::Error),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl From<TrustError> for AppError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            TrustError::Validation(e) => AppError::ValidationError(e),
            TrustError::Unauthorized(_)
            | TrustError::InvalidToken
            | TrustError::TokenRevoked
            | TrustError::SessionInactive
            | TrustError::Jwt(_) => AppError::Unauthorized(anyhow::anyhow!("Unauthorized")),
            TrustError::InsufficientPermissions
            | TrustError::Forbidden
            | TrustError::SelfImpersonationForbidden
            | TrustError::ForbiddenTarget => {
                AppError::Forbidden(anyhow::anyhow!("Insufficient permissions"))
            }
            TrustError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            TrustError::Conflict {
                existing_session_id,
            } => AppError::Conflict {
                message: "An impersonation session is already active".to_string(),
                details: Some(serde_json::json!({ "existing_session_id": existing_session_id })),
            },
            TrustError::ReauthRequired { age_ms } => AppError::ReauthRequired { age_ms },
            TrustError::ImpersonationBlocked { operation } => AppError::PolicyBlocked(operation),
            TrustError::IntegrityViolation(msg) => AppError::IntegrityViolation(msg),
            TrustError::Storage(e) => AppError::InternalError(e),
            TrustError::Timeout(op) => AppError::Timeout(op.to_string()),
            TrustError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            TrustError::Redis(e) => AppError::RedisError(e),
        }
    }
}

/// Runs a storage round-trip under `limit`. Elapsing is a hard failure.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, TrustError>
where
    F: Future<Output = Result<T, TrustError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(operation, timeout_ms = limit.as_millis() as u64, "Storage operation timed out");
            Err(TrustError::Timeout(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::{http::StatusCode, response::IntoResponse};

    #[test]
    fn denials_do_not_disclose_the_reason() {
        for err in [
            TrustError::ForbiddenTarget,
            TrustError::SelfImpersonationForbidden,
            TrustError::InsufficientPermissions,
        ] {
            let app: AppError = err.into();
            assert_eq!(app.to_string(), "Forbidden: Insufficient permissions");
            assert_eq!(app.into_response().status(), StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn reauth_and_block_keep_distinct_codes() {
        let reauth: AppError = TrustError::ReauthRequired { age_ms: Some(5) }.into();
        assert_eq!(reauth.code(), "reauth_required");

        let blocked: AppError = TrustError::ImpersonationBlocked {
            operation: "user.delete".to_string(),
        }
        .into();
        assert_eq!(blocked.code(), "impersonation_blocked");
    }

    #[tokio::test]
    async fn bounded_turns_elapsed_deadline_into_timeout() {
        let result: Result<(), TrustError> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(TrustError::Timeout("slow"))));
    }
}
