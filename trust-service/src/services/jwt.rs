use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TrustConfig;
use crate::services::TrustError;

/// `kid` header carried by impersonation tokens.
pub const IMPERSONATION_KID: &str = "imp";

/// Claims of an access token issued by the upstream authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    pub email: String,
    pub role: String,
    pub org_id: String,
    /// Auth session the token belongs to
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of an impersonation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonationClaims {
    /// Target user ID
    pub sub: String,
    pub imp: bool,
    /// Acting administrator ID
    pub act: String,
    /// Impersonation session ID
    pub sid: String,
    pub deny: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl ImpersonationClaims {
    /// Usable through the `exp` instant itself, like the session deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        DateTime::<Utc>::from_timestamp(self.exp, 0).map_or(true, |exp| now > exp)
    }
}

/// `exp` never precedes the session deadline, so the session row decides.
fn ceil_seconds(at: DateTime<Utc>) -> i64 {
    if at.timestamp_subsec_nanos() == 0 {
        at.timestamp()
    } else {
        at.timestamp() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Impersonation,
}

/// HS256 signing and verification for both token kinds, with separate keys.
#[derive(Clone)]
pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    impersonation_encoding: EncodingKey,
    impersonation_decoding: DecodingKey,
}

impl TokenService {
    pub fn new(config: &TrustConfig) -> Self {
        let access = config.access_token.secret.expose_secret().as_bytes();
        let impersonation = config.impersonation.token_secret.expose_secret().as_bytes();

        Self {
            access_encoding: EncodingKey::from_secret(access),
            access_decoding: DecodingKey::from_secret(access),
            impersonation_encoding: EncodingKey::from_secret(impersonation),
            impersonation_decoding: DecodingKey::from_secret(impersonation),
        }
    }

    /// Determines which key a bearer token must be verified with.
    pub fn kind_of(&self, token: &str) -> Result<TokenKind, TrustError> {
        let header = decode_header(token).map_err(|_| TrustError::InvalidToken)?;
        match header.kid.as_deref() {
            Some(IMPERSONATION_KID) => Ok(TokenKind::Impersonation),
            _ => Ok(TokenKind::Access),
        }
    }

    /// Expiry is checked against `now` rather than the library's wall clock.
    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation
    }

    pub fn issue_access_token(&self, claims: &AccessTokenClaims) -> Result<String, TrustError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.access_encoding)?)
    }

    pub fn validate_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims, TrustError> {
        let data = decode::<AccessTokenClaims>(token, &self.access_decoding, &Self::validation())
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                TrustError::InvalidToken
            })?;

        if now.timestamp() >= data.claims.exp || data.claims.sid.is_empty() {
            return Err(TrustError::InvalidToken);
        }
        Ok(data.claims)
    }

    pub fn mint_impersonation_token(
        &self,
        session_id: Uuid,
        actor_id: Uuid,
        target_id: Uuid,
        deny: &[String],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, TrustError> {
        let claims = ImpersonationClaims {
            sub: target_id.to_string(),
            imp: true,
            act: actor_id.to_string(),
            sid: session_id.to_string(),
            deny: deny.to_vec(),
            iat: issued_at.timestamp(),
            exp: ceil_seconds(expires_at),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(IMPERSONATION_KID.to_string());

        Ok(encode(&header, &claims, &self.impersonation_encoding)?)
    }

    /// Verifies signature and shape. Expiry and session state are left to the
    /// caller so that an expired session can be transitioned before rejecting.
    pub fn decode_impersonation_token(&self, token: &str) -> Result<ImpersonationClaims, TrustError> {
        if self.kind_of(token)? != TokenKind::Impersonation {
            return Err(TrustError::InvalidToken);
        }

        let data = decode::<ImpersonationClaims>(
            token,
            &self.impersonation_decoding,
            &Self::validation(),
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Impersonation token rejected");
            TrustError::InvalidToken
        })?;

        let claims = data.claims;
        if !claims.imp || claims.sid.is_empty() || claims.sub.is_empty() || claims.act.is_empty() {
            return Err(TrustError::InvalidToken);
        }
        Ok(claims)
    }
}
