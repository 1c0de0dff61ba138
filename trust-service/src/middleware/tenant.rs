//! Per-request tenant binding.
//!
//! The binding lives in a tokio task-local slot opened by
//! [`tenant_scope_middleware`], so concurrent requests never observe each
//! other's context, and nothing is stored on pooled database connections.
//! Data-access calls still receive the [`TenantContext`] as an explicit
//! argument; the slot is what lets code deep in a request ask "who is this for".

use service_core::{
    axum::{
        async_trait,
        extract::{FromRequestParts, Request},
        http::request::Parts,
        middleware::Next,
        response::Response,
    },
    error::AppError,
};
use std::cell::RefCell;
use std::future::Future;
use thiserror::Error;

use crate::models::TenantContext;

tokio::task_local! {
    static TENANT: RefCell<Option<TenantContext>>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantError {
    #[error("No tenant scope is open on this task")]
    NoScope,
    #[error("Tenant context not found")]
    Missing,
}

impl From<TenantError> for AppError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::NoScope => AppError::InternalError(anyhow::anyhow!(err)),
            TenantError::Missing => AppError::Unauthorized(anyhow::anyhow!("Unauthorized")),
        }
    }
}

/// Runs `fut` with an empty tenant slot.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    TENANT.scope(RefCell::new(None), fut).await
}

/// Binds `ctx` for the rest of the current scope.
pub fn bind(ctx: TenantContext) -> Result<(), TenantError> {
    TENANT
        .try_with(|slot| *slot.borrow_mut() = Some(ctx))
        .map_err(|_| TenantError::NoScope)
}

/// Empties the slot. A no-op outside a scope.
pub fn clear() {
    let _ = TENANT.try_with(|slot| slot.borrow_mut().take());
}

/// The context bound on this task, if a scope is open and bound.
pub fn current() -> Option<TenantContext> {
    TENANT.try_with(|slot| *slot.borrow()).ok().flatten()
}

/// Runs `fut` as `ctx`, for work that happens outside a request.
pub async fn with_context<F: Future>(ctx: TenantContext, fut: F) -> F::Output {
    TENANT.scope(RefCell::new(Some(ctx)), fut).await
}

/// Opens the tenant scope for a request and clears it when the response is ready.
pub async fn tenant_scope_middleware(request: Request, next: Next) -> Response {
    scope(async move {
        let response = next.run(request).await;
        clear();
        response
    })
    .await
}

/// Extractor for the TenantContext bound by the auth middleware. The task
/// slot wins; the request extension covers handlers run outside the scope.
#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current()
            .or_else(|| parts.extensions.get::<TenantContext>().copied())
            .ok_or_else(|| TenantError::Missing.into())
    }
}
