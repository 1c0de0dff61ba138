//! Request authentication.
//!
//! Resolves the bearer token to an effective [`Principal`], substitutes the
//! target for impersonation tokens, binds the tenant, enforces the
//! impersonation denylist and records the device sighting.

use service_core::{
    axum::{
        async_trait,
        extract::{ConnectInfo, FromRequestParts, Request, State},
        http::{header, request::Parts, HeaderMap},
        middleware::Next,
        response::Response,
    },
    error::AppError,
};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::middleware::tenant;
use crate::models::{Principal, Role, TenantContext};
use crate::services::{AccessTokenClaims, DeviceSighting, ImpersonationGrant, TokenKind, TrustError};
use crate::utils::{user_agent, ClientIp};
use crate::AppState;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn principal_from_claims(claims: &AccessTokenClaims) -> Result<Principal, TrustError> {
    let id = Uuid::parse_str(&claims.sub).map_err(|_| TrustError::InvalidToken)?;
    let org_id = Uuid::parse_str(&claims.org_id).map_err(|_| TrustError::InvalidToken)?;
    let role: Role = claims.role.parse().map_err(|_| TrustError::InvalidToken)?;
    Ok(Principal::new(id, claims.email.clone(), role, org_id).with_session(claims.sid.clone()))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer(req.headers())
        .ok_or_else(|| TrustError::Unauthorized("Missing or invalid Authorization header".into()))?
        .to_string();
    let client_ip = ClientIp::from_parts(
        req.headers(),
        req.extensions().get::<ConnectInfo<SocketAddr>>(),
        &state.config.trusted_proxies,
    );
    let ip = client_ip.0.clone();

    let (principal, grant) = match state.tokens.kind_of(&token)? {
        TokenKind::Access => {
            let claims = state
                .tokens
                .validate_access_token(&token, state.clock.now())?;
            if state.sessions.is_revoked(&claims.sid).await? {
                tracing::warn!(session_id = %claims.sid, "Rejected token for revoked session");
                return Err(TrustError::TokenRevoked.into());
            }
            (principal_from_claims(&claims)?, None)
        }
        TokenKind::Impersonation => {
            let (grant, principal) = state.impersonation.validate_token(&token).await?;
            (principal, Some(grant))
        }
    };

    let context = TenantContext::new(principal.org_id, principal.id);
    tenant::bind(context)?;

    if let Some(grant) = &grant {
        state
            .impersonation
            .enforce(grant, req.method(), req.uri().path(), ip.clone())
            .await?;
    }

    if let Some(session_id) = &principal.session_id {
        state.sessions.spawn_touch(DeviceSighting {
            session_id: session_id.clone(),
            user_id: principal.id,
            org_id: principal.org_id,
            ip,
            user_agent: user_agent(req.headers()),
        });
    }

    let extensions = req.extensions_mut();
    extensions.insert(context);
    extensions.insert(client_ip);
    if let Some(grant) = grant {
        extensions.insert(grant);
    }
    extensions.insert(principal);

    Ok(next.run(req).await)
}

/// Extractor for the effective principal of an authenticated request.
pub struct AuthUser(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts.extensions.get::<Principal>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Principal missing from request extensions"
            ))
        })?;

        Ok(AuthUser(principal.clone()))
    }
}

/// The impersonation grant, present only on impersonated requests.
pub struct Impersonation(pub Option<ImpersonationGrant>);

#[async_trait]
impl<S> FromRequestParts<S> for Impersonation
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Impersonation(parts.extensions.get::<ImpersonationGrant>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::HeaderValue;

    #[test]
    fn bearer_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer(&headers), Some("abc.def"));
    }

    #[test]
    fn claims_map_to_session_bound_principal() {
        let id = Uuid::new_v4();
        let org = Uuid::new_v4();
        let claims = AccessTokenClaims {
            sub: id.to_string(),
            email: "a@example.com".into(),
            role: "admin".into(),
            org_id: org.to_string(),
            sid: "sess-1".into(),
            iat: 0,
            exp: 0,
        };

        let principal = principal_from_claims(&claims).unwrap();
        assert_eq!(principal.id, id);
        assert_eq!(principal.org_id, org);
        assert_eq!(principal.role, Role::Admin);
        assert_eq!(principal.session_id.as_deref(), Some("sess-1"));
        assert!(!principal.impersonated);
    }

    #[test]
    fn malformed_claims_are_invalid_tokens() {
        let claims = AccessTokenClaims {
            sub: "not-a-uuid".into(),
            email: "a@example.com".into(),
            role: "ADMIN".into(),
            org_id: Uuid::new_v4().to_string(),
            sid: "s".into(),
            iat: 0,
            exp: 0,
        };
        assert!(matches!(principal_from_claims(&claims), Err(TrustError::InvalidToken)));
    }
}
