//! Step-up re-authentication gate.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TrustConfig;
use crate::models::{AuditAction, AuditActor, Principal};
use crate::services::metrics::REAUTH_CHECKS_TOTAL;
use crate::services::store::{ReauthStore, SecurityPolicyStore};
use crate::services::{AuditChain, Clock, TrustError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrongFactor {
    Password,
    Passkey,
    Totp,
}

impl StrongFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrongFactor::Password => "password",
            StrongFactor::Passkey => "passkey",
            StrongFactor::Totp => "totp",
        }
    }
}

/// Action classes an organization may put behind step-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveAction {
    Download,
    Share,
}

#[derive(Clone)]
pub struct ReauthGate {
    store: Arc<dyn ReauthStore>,
    policies: Arc<dyn SecurityPolicyStore>,
    audit: AuditChain,
    clock: Arc<dyn Clock>,
    window: Duration,
    require_without_policy: bool,
}

impl ReauthGate {
    pub fn new(
        store: Arc<dyn ReauthStore>,
        policies: Arc<dyn SecurityPolicyStore>,
        audit: AuditChain,
        clock: Arc<dyn Clock>,
        config: &TrustConfig,
    ) -> Self {
        Self {
            store,
            policies,
            audit,
            clock,
            window: Duration::minutes(config.reauth.window_minutes),
            require_without_policy: config.reauth.require_without_policy,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a completed strong-factor ceremony on the principal's session.
    pub async fn mark_strong_auth(
        &self,
        principal: &Principal,
        factor: StrongFactor,
        ip: Option<String>,
    ) -> Result<(), TrustError> {
        let session_id = principal
            .session_id
            .as_deref()
            .ok_or_else(|| TrustError::Unauthorized("No session".to_string()))?;

        self.store
            .mark(session_id, self.clock.now(), factor.as_str())
            .await?;

        let draft = self
            .audit
            .draft(
                AuditActor::from_principal(principal, ip),
                AuditAction::StrongAuth.as_str(),
                "auth_session",
                session_id,
            )
            .after(json!({ "factor": factor.as_str() }));
        self.audit.append(draft).await?;

        tracing::info!(user_id = %principal.id, factor = factor.as_str(), "Strong authentication recorded");
        Ok(())
    }

    /// Time since the last strong authentication, if there was one.
    pub async fn get_auth_age(&self, session_id: &str) -> Result<Option<Duration>, TrustError> {
        let state = self.store.last(session_id).await?;
        Ok(state.map(|s| (self.clock.now() - s.last_strong_auth_at).max(Duration::zero())))
    }

    pub async fn has_recent_auth(&self, session_id: &str) -> Result<bool, TrustError> {
        Ok(matches!(self.get_auth_age(session_id).await?, Some(age) if age < self.window))
    }

    /// Allows only if the session authenticated strongly within the window.
    /// Requests without a session (impersonated ones) never pass.
    pub async fn require_recent_reauth(&self, session_id: Option<&str>) -> Result<(), TrustError> {
        let age = match session_id {
            Some(sid) => self.get_auth_age(sid).await?,
            None => None,
        };

        match age {
            Some(age) if age < self.window => {
                REAUTH_CHECKS_TOTAL.with_label_values(&["allowed"]).inc();
                Ok(())
            }
            _ => {
                REAUTH_CHECKS_TOTAL.with_label_values(&["challenged"]).inc();
                Err(TrustError::ReauthRequired {
                    age_ms: age.map(|a| a.num_milliseconds()),
                })
            }
        }
    }

    /// Whether the organization's policy puts `action` behind step-up.
    pub async fn requires_step_up(&self, org_id: Uuid, action: SensitiveAction) -> Result<bool, TrustError> {
        match self.policies.find(org_id).await? {
            Some(policy) => Ok(match action {
                SensitiveAction::Download => policy.require_mfa_for_downloads,
                SensitiveAction::Share => policy.require_mfa_for_shares,
            }),
            None => Ok(self.require_without_policy),
        }
    }

    pub async fn require_for_action(
        &self,
        principal: &Principal,
        action: SensitiveAction,
    ) -> Result<(), TrustError> {
        if self.requires_step_up(principal.org_id, action).await? {
            self.require_recent_reauth(principal.session_id.as_deref()).await
        } else {
            Ok(())
        }
    }
}
