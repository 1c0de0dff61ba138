//! Audit chain queries. Mounted behind the admin gate.

use service_core::axum::{
    extract::{Query, State},
    Json,
};
use service_core::error::AppError;

use crate::dtos::{AuditEntriesResponse, EntriesQuery, SearchQuery};
use crate::services::ChainReport;
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;

/// GET /audit/entries?resource_type=&resource_id=&limit=
pub async fn entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<AuditEntriesResponse>, AppError> {
    let entries = state
        .audit
        .search(
            &query.resource_type,
            &query.resource_id,
            query.limit.unwrap_or(DEFAULT_LIMIT),
        )
        .await?;
    Ok(Json(AuditEntriesResponse { entries }))
}

/// GET /audit/search?q=&limit=
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<AuditEntriesResponse>, AppError> {
    let entries = state
        .audit
        .search_by_query(&query.q, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(AuditEntriesResponse { entries }))
}

/// GET /audit/verify
#[tracing::instrument(skip(state))]
pub async fn verify(State(state): State<AppState>) -> Result<Json<ChainReport>, AppError> {
    let report = state.audit.verify_chain().await?;
    Ok(Json(report))
}
