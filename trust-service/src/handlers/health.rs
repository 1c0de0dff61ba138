use serde_json::{json, Value};
use service_core::axum::{extract::State, http::StatusCode, Json};

use crate::AppState;

/// GET /health
///
/// Reports 503 when the store or the revocation list is unreachable.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = state.health.ping().await;
    let revocations = state.revocations.health_check().await;

    if let Err(e) = &database {
        tracing::error!(error = %e, "Health check: store unreachable");
    }
    if let Err(e) = &revocations {
        tracing::error!(error = %e, "Health check: revocation list unreachable");
    }

    let healthy = database.is_ok() && revocations.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "checks": {
                "database": if database.is_ok() { "up" } else { "down" },
                "revocation_list": if revocations.is_ok() { "up" } else { "down" },
            }
        })),
    )
}
