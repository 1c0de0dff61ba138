//! Device / session tracking and revocation.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TrustConfig;
use crate::models::{AuditAction, AuditActor, AuthSession, Principal, SessionInfo, TenantContext};
use crate::services::redis::{session_key, RevocationList};
use crate::services::store::SessionStore;
use crate::services::{AuditChain, Clock, TrustError};

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    revocations: Arc<dyn RevocationList>,
    audit: AuditChain,
    clock: Arc<dyn Clock>,
    lookback: Duration,
    revoked_ttl_secs: i64,
}

/// Connection facts recorded on every authenticated request.
#[derive(Debug, Clone)]
pub struct DeviceSighting {
    pub session_id: String,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        revocations: Arc<dyn RevocationList>,
        audit: AuditChain,
        clock: Arc<dyn Clock>,
        config: &TrustConfig,
    ) -> Self {
        Self {
            store,
            revocations,
            audit,
            clock,
            lookback: Duration::days(config.sessions.new_device_lookback_days),
            revoked_ttl_secs: config.sessions.revoked_ttl_secs,
        }
    }

    /// Upserts the session row. Never fails: errors are logged and dropped.
    pub async fn touch(&self, sighting: DeviceSighting) {
        if let Err(e) = self.try_touch(&sighting).await {
            tracing::warn!(session_id = %sighting.session_id, error = %e, "Session touch failed");
        }
    }

    /// Runs [`touch`](Self::touch) off the request path.
    pub fn spawn_touch(&self, sighting: DeviceSighting) {
        let registry = self.clone();
        tokio::spawn(async move { registry.touch(sighting).await });
    }

    async fn try_touch(&self, sighting: &DeviceSighting) -> Result<(), TrustError> {
        let now = self.clock.now();
        let inserted = self
            .store
            .upsert(&AuthSession {
                session_id: sighting.session_id.clone(),
                user_id: sighting.user_id,
                org_id: sighting.org_id,
                ip: sighting.ip.clone(),
                user_agent: sighting.user_agent.clone(),
                created_at: now,
                last_seen_at: now,
            })
            .await?;

        if inserted {
            let tenant = TenantContext::new(sighting.org_id, sighting.user_id);
            let new_device = self
                .device_is_new(
                    &tenant,
                    sighting.user_agent.as_deref(),
                    sighting.ip.as_deref(),
                    Some(&sighting.session_id),
                )
                .await?;
            if new_device {
                tracing::info!(
                    user_id = %sighting.user_id,
                    session_id = %sighting.session_id,
                    "Sign-in from a new device"
                );
            }
        }
        Ok(())
    }

    /// True unless a session of the bound user shares the user agent or ip and
    /// was seen within the lookback window. Advisory only.
    pub async fn is_new_device(
        &self,
        tenant: &TenantContext,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<bool, TrustError> {
        self.device_is_new(tenant, user_agent, ip, None).await
    }

    async fn device_is_new(
        &self,
        tenant: &TenantContext,
        user_agent: Option<&str>,
        ip: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<bool, TrustError> {
        let since = self.clock.now() - self.lookback;
        let known = self
            .store
            .has_recent_match(tenant, user_agent, ip, since, exclude)
            .await?;
        Ok(!known)
    }

    pub async fn list_sessions(
        &self,
        tenant: &TenantContext,
        current: Option<&str>,
    ) -> Result<Vec<SessionInfo>, TrustError> {
        let sessions = self.store.list(tenant).await?;
        Ok(sessions
            .into_iter()
            .map(|s| SessionInfo::from_session(s, current))
            .collect())
    }

    /// Rejects further use of `session_id` wherever it is presented.
    ///
    /// The revocation cache answers first. A miss falls through to the store,
    /// whose tombstones outlive any cache TTL.
    pub async fn is_revoked(&self, session_id: &str) -> Result<bool, TrustError> {
        let key = session_key(session_id);
        match self.revocations.is_revoked(&key).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Revocation cache unavailable, asking store");
            }
        }

        if !self.store.is_revoked(session_id).await? {
            return Ok(false);
        }
        if let Err(e) = self.revocations.revoke(&key, self.revoked_ttl_secs).await {
            tracing::warn!(session_id, error = %e, "Failed to re-warm revocation cache");
        }
        Ok(true)
    }

    async fn revoke_key(&self, session_id: &str) -> Result<(), TrustError> {
        self.revocations
            .revoke(&session_key(session_id), self.revoked_ttl_secs)
            .await
            .map_err(|e| {
                tracing::error!(session_id, error = %e, "Failed to revoke session");
                TrustError::Storage(e)
            })
    }

    pub async fn revoke_session(
        &self,
        principal: &Principal,
        tenant: &TenantContext,
        session_id: &str,
        ip: Option<String>,
    ) -> Result<(), TrustError> {
        if !self.store.delete(tenant, session_id).await? {
            return Err(TrustError::NotFound("Session".to_string()));
        }
        self.revoke_key(session_id).await?;

        let draft = self
            .audit
            .draft(
                AuditActor::from_principal(principal, ip),
                AuditAction::SessionRevoked.as_str(),
                "auth_session",
                session_id,
            )
            .after(json!({ "user_id": principal.id }));
        self.audit.append(draft).await?;

        tracing::info!(user_id = %principal.id, session_id, "Session revoked");
        Ok(())
    }

    /// Revokes every session of the bound user except `current`.
    pub async fn revoke_all_other_sessions(
        &self,
        principal: &Principal,
        tenant: &TenantContext,
        current: &str,
        ip: Option<String>,
    ) -> Result<Vec<String>, TrustError> {
        let removed = self.store.delete_all_except(tenant, current).await?;
        for session_id in &removed {
            self.revoke_key(session_id).await?;
        }

        let draft = self
            .audit
            .draft(
                AuditActor::from_principal(principal, ip),
                AuditAction::SessionRevokedOthers.as_str(),
                "auth_session",
                current,
            )
            .after(json!({ "revoked": removed }));
        self.audit.append(draft).await?;

        tracing::info!(user_id = %principal.id, count = removed.len(), "Other sessions revoked");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::models::Role;
    use crate::services::{InMemoryStore, ManualClock, MemoryRevocationList};

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: SessionRegistry,
        user: Principal,
        tenant: TenantContext,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let audit = AuditChain::new(store.clone(), clock.clone(), std::time::Duration::from_secs(3));
        let registry = SessionRegistry::new(
            store.clone(),
            Arc::new(MemoryRevocationList::new()),
            audit,
            clock.clone(),
            &sample_config(),
        );
        let user = Principal::new(Uuid::new_v4(), "u@example.com", Role::Member, Uuid::new_v4())
            .with_session("s1");
        let tenant = TenantContext::new(user.org_id, user.id);
        Fixture {
            clock,
            registry,
            user,
            tenant,
        }
    }

    fn sighting(f: &Fixture, sid: &str, ua: &str, ip: &str) -> DeviceSighting {
        DeviceSighting {
            session_id: sid.to_string(),
            user_id: f.user.id,
            org_id: f.user.org_id,
            ip: Some(ip.to_string()),
            user_agent: Some(ua.to_string()),
        }
    }

    #[tokio::test]
    async fn device_recognition_uses_agent_or_ip_within_lookback() {
        let f = fixture();
        assert!(f.registry.is_new_device(&f.tenant, Some("Firefox"), Some("1.1.1.1")).await.unwrap());

        f.registry.touch(sighting(&f, "s1", "Firefox", "1.1.1.1")).await;
        assert!(!f.registry.is_new_device(&f.tenant, Some("Firefox"), Some("9.9.9.9")).await.unwrap());
        assert!(!f.registry.is_new_device(&f.tenant, Some("Safari"), Some("1.1.1.1")).await.unwrap());
        assert!(f.registry.is_new_device(&f.tenant, Some("Safari"), Some("9.9.9.9")).await.unwrap());

        f.clock.advance(Duration::days(31));
        assert!(f.registry.is_new_device(&f.tenant, Some("Firefox"), Some("1.1.1.1")).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_one_and_others() {
        let f = fixture();
        for (sid, ua) in [("s1", "Firefox"), ("s2", "Safari"), ("s3", "Chrome")] {
            f.registry.touch(sighting(&f, sid, ua, "1.1.1.1")).await;
        }

        let listed = f.registry.list_sessions(&f.tenant, Some("s1")).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed.iter().filter(|s| s.is_current).count(), 1);

        f.registry.revoke_session(&f.user, &f.tenant, "s2", None).await.unwrap();
        assert!(f.registry.is_revoked("s2").await.unwrap());
        assert!(matches!(
            f.registry.revoke_session(&f.user, &f.tenant, "s2", None).await,
            Err(TrustError::NotFound(_))
        ));

        let removed = f
            .registry
            .revoke_all_other_sessions(&f.user, &f.tenant, "s1", None)
            .await
            .unwrap();
        assert_eq!(removed, vec!["s3".to_string()]);
        assert!(f.registry.is_revoked("s3").await.unwrap());
        assert!(!f.registry.is_revoked("s1").await.unwrap());
        assert_eq!(f.registry.list_sessions(&f.tenant, None).await.unwrap().len(), 1);
    }

    /// A revocation cache that has already expired every key.
    struct ForgetfulCache;

    #[async_trait::async_trait]
    impl RevocationList for ForgetfulCache {
        async fn revoke(&self, _key: &str, _ttl_seconds: i64) -> Result<(), anyhow::Error> {
            Ok(())
        }
        async fn is_revoked(&self, _key: &str) -> Result<bool, anyhow::Error> {
            Ok(false)
        }
        async fn health_check(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn revocation_survives_cache_expiry_and_later_touches() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let audit = AuditChain::new(store.clone(), clock.clone(), std::time::Duration::from_secs(3));
        let registry = SessionRegistry::new(
            store.clone(),
            Arc::new(ForgetfulCache),
            audit,
            clock,
            &sample_config(),
        );
        let user = Principal::new(Uuid::new_v4(), "u@example.com", Role::Member, Uuid::new_v4())
            .with_session("laptop");
        let tenant = TenantContext::new(user.org_id, user.id);
        let seen = |sid: &str| DeviceSighting {
            session_id: sid.to_string(),
            user_id: user.id,
            org_id: user.org_id,
            ip: Some("1.1.1.1".to_string()),
            user_agent: Some("Firefox".to_string()),
        };

        registry.touch(seen("laptop")).await;
        registry.touch(seen("phone")).await;
        registry.revoke_session(&user, &tenant, "phone", None).await.unwrap();

        assert!(registry.is_revoked("phone").await.unwrap());
        assert!(!registry.is_revoked("laptop").await.unwrap());

        // A touch already in flight when the revoke landed.
        registry.touch(seen("phone")).await;
        let listed = registry.list_sessions(&tenant, Some("laptop")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "laptop");
        assert!(registry.is_revoked("phone").await.unwrap());
    }
}
