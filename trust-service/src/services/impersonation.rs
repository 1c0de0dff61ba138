//! Time-boxed admin-as-user grants.
//!
//! A session moves `active -> completed` when its actor ends it and
//! `active -> expired` when it is found past its deadline, either lazily during
//! token validation or by the periodic sweep. Transitions are conditional on
//! the row still being active, so at most one of them wins.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use rand::Rng;
use serde_json::json;
use service_core::axum::http::Method;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::config::{ClassificationMode, TrustConfig, IMPERSONATION_MIN_MINUTES};
use crate::dtos::{
    EndImpersonationResponse, StartImpersonationRequest, StartImpersonationResponse,
};
use crate::models::{
    AuditAction, AuditActor, ImpersonationSession, ImpersonationStatus, Principal,
};
use crate::services::classifier::{classify, default_deny_list, Operation};
use crate::services::error::bounded;
use crate::services::metrics::{IMPERSONATION_BLOCKED_TOTAL, IMPERSONATION_SESSIONS_TOTAL};
use crate::services::redis::{impersonation_key, RevocationList};
use crate::services::store::{ImpersonationStore, UserDirectory};
use crate::services::{AuditChain, Clock, TokenService, TrustError};

pub const AUDIT_OBJECT_TYPE: &str = "impersonation_session";
pub const MAX_LIST_LIMIT: i64 = 100;
const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct ImpersonationSettings {
    pub default_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub audit_sample_rate: f64,
    pub classification: ClassificationMode,
    pub query_timeout: Duration,
}

impl ImpersonationSettings {
    pub fn from_config(config: &TrustConfig) -> Self {
        Self {
            default_duration_minutes: config.impersonation.default_duration_minutes,
            max_duration_minutes: config.impersonation.max_duration_minutes,
            audit_sample_rate: config.impersonation.audit_sample_rate,
            classification: config.impersonation.classification,
            query_timeout: Duration::from_secs(config.database.query_timeout_secs),
        }
    }
}

/// A validated impersonation credential, attached to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationGrant {
    pub session_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub deny: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl ImpersonationGrant {
    pub fn denies(&self, operation: &str) -> bool {
        self.deny.iter().any(|op| op == operation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpiryTrigger {
    Lazy,
    Sweep,
}

impl ExpiryTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            ExpiryTrigger::Lazy => "lazy",
            ExpiryTrigger::Sweep => "sweep",
        }
    }
}

#[derive(Clone)]
pub struct ImpersonationManager {
    store: Arc<dyn ImpersonationStore>,
    users: Arc<dyn UserDirectory>,
    audit: AuditChain,
    tokens: TokenService,
    revocations: Arc<dyn RevocationList>,
    clock: Arc<dyn Clock>,
    settings: ImpersonationSettings,
}

impl ImpersonationManager {
    pub fn new(
        store: Arc<dyn ImpersonationStore>,
        users: Arc<dyn UserDirectory>,
        audit: AuditChain,
        tokens: TokenService,
        revocations: Arc<dyn RevocationList>,
        clock: Arc<dyn Clock>,
        settings: ImpersonationSettings,
    ) -> Self {
        Self {
            store,
            users,
            audit,
            tokens,
            revocations,
            clock,
            settings,
        }
    }

    /// Grants `actor` a time-boxed session as the requested target.
    ///
    /// Preconditions are checked in a fixed order and the first failure wins:
    /// role, request shape, self-target, target existence, target role, and
    /// finally the one-active-session rule (enforced again by storage).
    pub async fn start(
        &self,
        actor: &Principal,
        request: StartImpersonationRequest,
        ip: Option<String>,
    ) -> Result<StartImpersonationResponse, TrustError> {
        if !actor.is_privileged() {
            return Err(TrustError::InsufficientPermissions);
        }

        let request = StartImpersonationRequest {
            business_reason: request.business_reason.trim().to_string(),
            ..request
        };
        request.validate()?;
        let duration_minutes = request
            .duration_minutes
            .unwrap_or(self.settings.default_duration_minutes);
        if !(IMPERSONATION_MIN_MINUTES..=self.settings.max_duration_minutes).contains(&duration_minutes) {
            return Err(TrustError::InvalidRequest(format!(
                "Duration must be between {} and {} minutes",
                IMPERSONATION_MIN_MINUTES, self.settings.max_duration_minutes
            )));
        }

        if request.target_user_id == actor.id {
            return Err(TrustError::SelfImpersonationForbidden);
        }

        let target = bounded(
            self.settings.query_timeout,
            "impersonation.find_target",
            self.users.find_user(actor.org_id, request.target_user_id),
        )
        .await?
        .ok_or_else(|| TrustError::NotFound("User".to_string()))?;

        if target.role.is_privileged() {
            tracing::warn!(actor_id = %actor.id, target_id = %target.user_id, "Impersonation of privileged user refused");
            return Err(TrustError::ForbiddenTarget);
        }

        let now = self.clock.now();
        if let Some(existing) = bounded(
            self.settings.query_timeout,
            "impersonation.find_active",
            self.store.find_active_for_actor(actor.id),
        )
        .await?
        {
            if existing.is_overdue(now) {
                self.expire(&existing, ExpiryTrigger::Lazy, now).await?;
            } else {
                return Err(TrustError::Conflict {
                    existing_session_id: Some(existing.id),
                });
            }
        }

        // Microseconds, the precision the store keeps.
        let created_at = now.trunc_subsecs(6);
        let expires_at = (now + ChronoDuration::minutes(duration_minutes)).trunc_subsecs(6);
        let session = ImpersonationSession {
            id: Uuid::new_v4(),
            org_id: actor.org_id,
            actor_id: actor.id,
            target_id: target.user_id,
            business_reason: request.business_reason,
            status: ImpersonationStatus::Active,
            created_at,
            expires_at,
            ended_at: None,
            ip: ip.clone(),
            deny: default_deny_list(),
        };

        let token = self.tokens.mint_impersonation_token(
            session.id,
            session.actor_id,
            session.target_id,
            &session.deny,
            now,
            expires_at,
        )?;

        let draft = self
            .audit
            .draft(
                AuditActor::from_principal(actor, ip),
                AuditAction::ImpersonationStarted.as_str(),
                AUDIT_OBJECT_TYPE,
                session.id.to_string(),
            )
            .after(json!({
                "status": ImpersonationStatus::Active.as_str(),
                "target_id": session.target_id,
                "duration_minutes": duration_minutes,
                "expires_at": session.expires_at,
                "deny": session.deny,
            }))
            .reason(session.business_reason.clone());

        // The grant and its audit entry are stored together or not at all.
        self.audit
            .append_with(draft, |started| self.store.insert_active(&session, started))
            .await?;

        IMPERSONATION_SESSIONS_TOTAL.with_label_values(&["started"]).inc();
        tracing::info!(
            session_id = %session.id,
            actor_id = %session.actor_id,
            target_id = %session.target_id,
            duration_minutes,
            "Impersonation session started"
        );

        Ok(StartImpersonationResponse {
            session_id: session.id,
            token,
            expires_at: session.expires_at,
            deny: session.deny,
        })
    }

    /// Ends an active session. Only its actor may end it; once ownership is
    /// established, ending a session that is no longer active is a no-op.
    pub async fn end(
        &self,
        actor: &Principal,
        session_id: Uuid,
        reason: Option<String>,
        ip: Option<String>,
    ) -> Result<EndImpersonationResponse, TrustError> {
        let session = bounded(
            self.settings.query_timeout,
            "impersonation.find",
            self.store.find(session_id),
        )
        .await?
        .ok_or_else(|| TrustError::NotFound("Impersonation session".to_string()))?;

        if session.org_id != actor.org_id {
            return Err(TrustError::NotFound("Impersonation session".to_string()));
        }
        if actor.impersonated || session.actor_id != actor.id {
            return Err(TrustError::Forbidden);
        }

        if !session.is_active() {
            return Ok(EndImpersonationResponse {
                session_id,
                status: session.status,
                ended: false,
            });
        }

        let now = self.clock.now();
        let won = bounded(
            self.settings.query_timeout,
            "impersonation.transition",
            self.store
                .transition(session_id, ImpersonationStatus::Completed, now),
        )
        .await?;

        if !won {
            let status = bounded(
                self.settings.query_timeout,
                "impersonation.find",
                self.store.find(session_id),
            )
            .await?
            .map(|s| s.status)
            .unwrap_or(ImpersonationStatus::Completed);
            return Ok(EndImpersonationResponse {
                session_id,
                status,
                ended: false,
            });
        }

        let revoked = self.revoke(&session, now).await;

        let mut draft = self
            .audit
            .draft(
                AuditActor::from_principal(actor, ip),
                AuditAction::ImpersonationEnded.as_str(),
                AUDIT_OBJECT_TYPE,
                session_id.to_string(),
            )
            .before(json!({ "status": ImpersonationStatus::Active.as_str() }))
            .after(json!({
                "status": ImpersonationStatus::Completed.as_str(),
                "target_id": session.target_id,
            }));
        if let Some(reason) = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) {
            draft = draft.reason(reason);
        }
        self.audit.append(draft).await?;
        revoked?;

        IMPERSONATION_SESSIONS_TOTAL.with_label_values(&["ended"]).inc();
        tracing::info!(session_id = %session_id, actor_id = %actor.id, "Impersonation session ended");

        Ok(EndImpersonationResponse {
            session_id,
            status: ImpersonationStatus::Completed,
            ended: true,
        })
    }

    /// Validates a bearer impersonation token and resolves the effective principal.
    ///
    /// The session row is authoritative: a token whose signature and `exp` are
    /// still valid is rejected once its session is revoked, completed or expired.
    pub async fn validate_token(
        &self,
        token: &str,
    ) -> Result<(ImpersonationGrant, Principal), TrustError> {
        let claims = self.tokens.decode_impersonation_token(token)?;
        let parse = |v: &str| Uuid::parse_str(v).map_err(|_| TrustError::InvalidToken);
        let session_id = parse(&claims.sid)?;
        let target_id = parse(&claims.sub)?;
        let actor_id = parse(&claims.act)?;

        let revoked = self
            .revocations
            .is_revoked(&impersonation_key(&session_id))
            .await
            .map_err(TrustError::Storage)?;
        if revoked {
            return Err(TrustError::TokenRevoked);
        }

        let session = bounded(
            self.settings.query_timeout,
            "impersonation.find",
            self.store.find(session_id),
        )
        .await?
        .ok_or(TrustError::InvalidToken)?;

        if session.actor_id != actor_id || session.target_id != target_id {
            return Err(TrustError::InvalidToken);
        }
        if !session.is_active() {
            return Err(TrustError::SessionInactive);
        }

        let now = self.clock.now();
        if session.is_overdue(now) || claims.is_expired(now) {
            self.expire(&session, ExpiryTrigger::Lazy, now).await?;
            return Err(TrustError::SessionInactive);
        }

        let target = bounded(
            self.settings.query_timeout,
            "impersonation.find_target",
            self.users.find_user(session.org_id, target_id),
        )
        .await?
        .ok_or(TrustError::InvalidToken)?;

        let principal = Principal::new(target.user_id, target.email, target.role, target.org_id)
            .impersonating(actor_id);

        Ok((
            ImpersonationGrant {
                session_id,
                actor_id,
                target_id,
                deny: session.deny,
                expires_at: session.expires_at,
            },
            principal,
        ))
    }

    /// Classifies the request and rejects it if the grant denies the operation.
    pub async fn enforce(
        &self,
        grant: &ImpersonationGrant,
        method: &Method,
        path: &str,
        ip: Option<String>,
    ) -> Result<Operation, TrustError> {
        let operation = classify(method, path);
        let denied = grant.denies(operation.as_str())
            || (operation == Operation::OtherMutation
                && self.settings.classification == ClassificationMode::Strict);

        let actor = AuditActor {
            id: grant.actor_id.to_string(),
            email: None,
            role: None,
            ip,
        };
        let details = json!({
            "operation": operation.as_str(),
            "method": method.as_str(),
            "path": path,
            "target_id": grant.target_id,
        });

        if denied {
            IMPERSONATION_BLOCKED_TOTAL
                .with_label_values(&[operation.as_str()])
                .inc();
            tracing::warn!(
                session_id = %grant.session_id,
                actor_id = %grant.actor_id,
                operation = %operation,
                "Impersonated request blocked"
            );

            let draft = self
                .audit
                .draft(
                    actor,
                    AuditAction::ImpersonationRequestBlocked.as_str(),
                    AUDIT_OBJECT_TYPE,
                    grant.session_id.to_string(),
                )
                .after(details);
            self.audit.append(draft).await?;

            return Err(TrustError::ImpersonationBlocked {
                operation: operation.as_str().to_string(),
            });
        }

        let rate = self.settings.audit_sample_rate.clamp(0.0, 1.0);
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            let draft = self
                .audit
                .draft(
                    actor,
                    AuditAction::ImpersonationRequest.as_str(),
                    AUDIT_OBJECT_TYPE,
                    grant.session_id.to_string(),
                )
                .after(details);
            self.audit.append(draft).await?;
        }

        Ok(operation)
    }

    /// The actor's active session, if any. An overdue session is expired first.
    pub async fn status(&self, actor: &Principal) -> Result<Option<ImpersonationSession>, TrustError> {
        let session = bounded(
            self.settings.query_timeout,
            "impersonation.find_active",
            self.store.find_active_for_actor(actor.id),
        )
        .await?;

        match session {
            Some(s) => {
                let now = self.clock.now();
                if s.is_overdue(now) {
                    self.expire(&s, ExpiryTrigger::Lazy, now).await?;
                    Ok(None)
                } else {
                    Ok(Some(s))
                }
            }
            None => Ok(None),
        }
    }

    /// Most recent sessions in the caller's organization, newest first.
    pub async fn list_recent(
        &self,
        actor: &Principal,
        limit: Option<i64>,
    ) -> Result<Vec<ImpersonationSession>, TrustError> {
        if !actor.is_privileged() {
            return Err(TrustError::InsufficientPermissions);
        }
        let limit = limit.unwrap_or(20).clamp(1, MAX_LIST_LIMIT);
        bounded(
            self.settings.query_timeout,
            "impersonation.list_recent",
            self.store.list_recent(actor.org_id, limit),
        )
        .await
    }

    /// Expires every overdue active session. Returns how many this call expired.
    pub async fn expire_due(&self) -> Result<usize, TrustError> {
        let now = self.clock.now();
        let mut expired = 0;

        loop {
            let due = bounded(
                self.settings.query_timeout,
                "impersonation.list_due",
                self.store.list_due_for_expiry(now, SWEEP_BATCH),
            )
            .await?;
            let batch_len = due.len();
            let mut progressed = false;

            for session in &due {
                match self.expire(session, ExpiryTrigger::Sweep, now).await {
                    Ok(won) => {
                        progressed = true;
                        if won {
                            expired += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(session_id = %session.id, error = %e, "Failed to expire impersonation session");
                    }
                }
            }

            if (batch_len as i64) < SWEEP_BATCH || !progressed {
                break;
            }
        }

        Ok(expired)
    }

    /// Moves `session` to expired, revokes it, and audits the transition if this
    /// call won it. Returns whether it did.
    async fn expire(
        &self,
        session: &ImpersonationSession,
        trigger: ExpiryTrigger,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustError> {
        let won = bounded(
            self.settings.query_timeout,
            "impersonation.transition",
            self.store
                .transition(session.id, ImpersonationStatus::Expired, now),
        )
        .await?;

        let revoked = self.revoke(session, now).await;

        if won {
            let draft = self
                .audit
                .draft(
                    AuditActor::system(),
                    AuditAction::ImpersonationAutoExpired.as_str(),
                    AUDIT_OBJECT_TYPE,
                    session.id.to_string(),
                )
                .before(json!({ "status": ImpersonationStatus::Active.as_str() }))
                .after(json!({
                    "status": ImpersonationStatus::Expired.as_str(),
                    "expires_at": session.expires_at,
                    "trigger": trigger.as_str(),
                }));
            self.audit.append(draft).await?;

            IMPERSONATION_SESSIONS_TOTAL.with_label_values(&["expired"]).inc();
            tracing::info!(
                session_id = %session.id,
                actor_id = %session.actor_id,
                trigger = trigger.as_str(),
                "Impersonation session expired"
            );
        }

        revoked?;
        Ok(won)
    }

    async fn revoke(&self, session: &ImpersonationSession, now: DateTime<Utc>) -> Result<(), TrustError> {
        let ttl = (session.expires_at - now).num_seconds().max(1);
        self.revocations
            .revoke(&impersonation_key(&session.id), ttl)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session.id, error = %e, "Failed to revoke impersonation session");
                TrustError::Storage(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::models::{AuditDraft, AuditEntry, Role, UserRecord};
    use crate::services::{InMemoryStore, ManualClock, MemoryRevocationList};

    const REASON: &str = "Investigating billing dispute for user";

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        manager: ImpersonationManager,
        admin: Principal,
        member: UserRecord,
        other_admin: UserRecord,
    }

    fn fixture() -> Fixture {
        let config = sample_config();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let org = Uuid::new_v4();

        let admin = Principal::new(Uuid::new_v4(), "admin@example.com", Role::Admin, org)
            .with_session("admin-sid");
        let member = UserRecord {
            user_id: Uuid::new_v4(),
            org_id: org,
            email: "member@example.com".to_string(),
            role: Role::Member,
        };
        let other_admin = UserRecord {
            user_id: Uuid::new_v4(),
            org_id: org,
            email: "president@example.com".to_string(),
            role: Role::President,
        };
        store.insert_user(member.clone());
        store.insert_user(other_admin.clone());

        let mut settings = ImpersonationSettings::from_config(&config);
        settings.audit_sample_rate = 0.0;

        let audit = AuditChain::new(store.clone(), clock.clone(), settings.query_timeout);
        let manager = ImpersonationManager::new(
            store.clone(),
            store.clone(),
            audit,
            TokenService::new(&config),
            Arc::new(MemoryRevocationList::new()),
            clock.clone(),
            settings,
        );

        Fixture {
            store,
            clock,
            manager,
            admin,
            member,
            other_admin,
        }
    }

    fn request(target: Uuid, minutes: Option<i64>) -> StartImpersonationRequest {
        StartImpersonationRequest {
            target_user_id: target,
            business_reason: REASON.to_string(),
            duration_minutes: minutes,
        }
    }

    #[tokio::test]
    async fn start_checks_preconditions_in_order() {
        let f = fixture();

        let member = Principal::new(f.member.user_id, "m@example.com", Role::Member, f.admin.org_id);
        // Role is checked before the request shape.
        let mut bad = request(f.member.user_id, Some(2));
        bad.business_reason = "short".to_string();
        assert!(matches!(
            f.manager.start(&member, bad.clone(), None).await,
            Err(TrustError::InsufficientPermissions)
        ));
        assert!(f.manager.start(&f.admin, bad, None).await.unwrap_err().to_string().contains("Validation"));

        assert!(matches!(
            f.manager.start(&f.admin, request(f.admin.id, Some(10)), None).await,
            Err(TrustError::SelfImpersonationForbidden)
        ));
        assert!(matches!(
            f.manager.start(&f.admin, request(Uuid::new_v4(), Some(10)), None).await,
            Err(TrustError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.start(&f.admin, request(f.other_admin.user_id, Some(10)), None).await,
            Err(TrustError::ForbiddenTarget)
        ));
    }

    #[tokio::test]
    async fn reason_is_measured_after_trimming() {
        let f = fixture();
        let mut padded = request(f.member.user_id, Some(10));
        padded.business_reason = format!("   {}   ", "x".repeat(19));
        assert!(matches!(
            f.manager.start(&f.admin, padded, None).await,
            Err(TrustError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn duration_defaults_and_token_matches_session() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, None), Some("10.0.0.9".to_string()))
            .await
            .unwrap();

        let expected = (f.clock.now() + ChronoDuration::minutes(10)).trunc_subsecs(6);
        assert_eq!(started.expires_at, expected);
        assert_eq!(started.deny, default_deny_list());

        let (grant, principal) = f.manager.validate_token(&started.token).await.unwrap();
        assert_eq!(grant.session_id, started.session_id);
        assert_eq!(principal.id, f.member.user_id);
        assert!(principal.impersonated);
        assert_eq!(principal.impersonator_id, Some(f.admin.id));
    }

    #[tokio::test]
    async fn second_start_conflicts_with_existing_session_id() {
        let f = fixture();
        let first = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(10)), None)
            .await
            .unwrap();

        match f.manager.start(&f.admin, request(f.member.user_id, Some(10)), None).await {
            Err(TrustError::Conflict { existing_session_id }) => {
                assert_eq!(existing_session_id, Some(first.session_id))
            }
            other => panic!("expected conflict, got {:?}", other.map(|r| r.session_id)),
        }
    }

    #[tokio::test]
    async fn overdue_session_does_not_block_a_new_start() {
        let f = fixture();
        let first = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(5)), None)
            .await
            .unwrap();
        f.clock.advance(ChronoDuration::minutes(6));

        let second = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(5)), None)
            .await
            .unwrap();
        assert_ne!(first.session_id, second.session_id);

        let old = f.store.find(first.session_id).await.unwrap().unwrap();
        assert_eq!(old.status, ImpersonationStatus::Expired);
    }

    #[tokio::test]
    async fn end_is_owner_only_and_idempotent() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(10)), None)
            .await
            .unwrap();

        let stranger = Principal::new(Uuid::new_v4(), "x@example.com", Role::Admin, f.admin.org_id);
        let outsider = Principal::new(Uuid::new_v4(), "y@example.com", Role::Admin, Uuid::new_v4());
        assert!(matches!(
            f.manager.end(&stranger, started.session_id, None, None).await,
            Err(TrustError::Forbidden)
        ));
        assert!(matches!(
            f.manager.end(&outsider, started.session_id, None, None).await,
            Err(TrustError::NotFound(_))
        ));

        let ended = f
            .manager
            .end(&f.admin, started.session_id, Some("done".to_string()), None)
            .await
            .unwrap();
        assert!(ended.ended);

        let again = f
            .manager
            .end(&f.admin, started.session_id, None, None)
            .await
            .unwrap();
        assert!(!again.ended);
        assert_eq!(again.status, ImpersonationStatus::Completed);

        // Ownership is checked before the idempotent answer, so a finished
        // session's status does not leak to other callers.
        assert!(matches!(
            f.manager.end(&stranger, started.session_id, None, None).await,
            Err(TrustError::Forbidden)
        ));
        assert!(matches!(
            f.manager.end(&outsider, started.session_id, None, None).await,
            Err(TrustError::NotFound(_))
        ));

        assert!(matches!(
            f.manager.validate_token(&started.token).await,
            Err(TrustError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn natural_expiry_rejects_and_audits_once() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(5)), None)
            .await
            .unwrap();
        f.clock.advance(ChronoDuration::minutes(5) + ChronoDuration::seconds(1));

        assert!(matches!(
            f.manager.validate_token(&started.token).await,
            Err(TrustError::SessionInactive)
        ));
        assert!(f.manager.validate_token(&started.token).await.is_err());

        let expiries = f
            .store
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == AuditAction::ImpersonationAutoExpired.as_str())
            .count();
        assert_eq!(expiries, 1);
    }

    #[tokio::test]
    async fn token_is_valid_through_the_deadline_instant() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(5)), None)
            .await
            .unwrap();

        f.clock.set(started.expires_at);
        assert!(f.manager.validate_token(&started.token).await.is_ok());

        f.clock.advance(ChronoDuration::microseconds(1));
        assert!(matches!(
            f.manager.validate_token(&started.token).await,
            Err(TrustError::SessionInactive)
        ));
    }

    #[tokio::test]
    async fn sweep_expires_due_sessions_and_invalidates_tokens() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(5)), None)
            .await
            .unwrap();

        assert_eq!(f.manager.expire_due().await.unwrap(), 0);
        f.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(f.manager.expire_due().await.unwrap(), 1);
        assert_eq!(f.manager.expire_due().await.unwrap(), 0);

        assert!(f.manager.validate_token(&started.token).await.is_err());
        assert!(f.manager.status(&f.admin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn denylisted_operation_is_blocked_and_audited() {
        let f = fixture();
        let started = f
            .manager
            .start(&f.admin, request(f.member.user_id, Some(10)), None)
            .await
            .unwrap();
        let (grant, _) = f.manager.validate_token(&started.token).await.unwrap();
        assert!(grant.denies("user.delete"));
        assert!(!grant.denies("read"));

        let path = format!("/users/{}", f.member.user_id);
        match f.manager.enforce(&grant, &Method::DELETE, &path, None).await {
            Err(TrustError::ImpersonationBlocked { operation }) => assert_eq!(operation, "user.delete"),
            other => panic!("expected block, got {:?}", other),
        }

        assert_eq!(
            f.manager.enforce(&grant, &Method::GET, &path, None).await.unwrap(),
            Operation::Read
        );
        // Unclassified mutations are refused in strict mode.
        assert!(f.manager.enforce(&grant, &Method::POST, "/recipes", None).await.is_err());

        let blocked = f
            .store
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == AuditAction::ImpersonationRequestBlocked.as_str())
            .count();
        assert_eq!(blocked, 2);
    }

    /// Delegates to the in-memory store but refuses to record new grants.
    struct RefusingStore(Arc<InMemoryStore>);

    #[async_trait::async_trait]
    impl ImpersonationStore for RefusingStore {
        async fn insert_active(
            &self,
            _session: &ImpersonationSession,
            _started: AuditDraft,
        ) -> Result<AuditEntry, TrustError> {
            Err(TrustError::Storage(anyhow::anyhow!("audit log unavailable")))
        }
        async fn find(&self, session_id: Uuid) -> Result<Option<ImpersonationSession>, TrustError> {
            self.0.find(session_id).await
        }
        async fn find_active_for_actor(
            &self,
            actor_id: Uuid,
        ) -> Result<Option<ImpersonationSession>, TrustError> {
            self.0.find_active_for_actor(actor_id).await
        }
        async fn transition(
            &self,
            session_id: Uuid,
            to: ImpersonationStatus,
            at: DateTime<Utc>,
        ) -> Result<bool, TrustError> {
            self.0.transition(session_id, to, at).await
        }
        async fn list_due_for_expiry(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<ImpersonationSession>, TrustError> {
            self.0.list_due_for_expiry(now, limit).await
        }
        async fn list_recent(
            &self,
            org_id: Uuid,
            limit: i64,
        ) -> Result<Vec<ImpersonationSession>, TrustError> {
            self.0.list_recent(org_id, limit).await
        }
    }

    #[tokio::test]
    async fn failed_audit_leaves_no_grant_behind() {
        let f = fixture();
        let config = sample_config();
        let settings = ImpersonationSettings::from_config(&config);
        let audit = AuditChain::new(f.store.clone(), f.clock.clone(), settings.query_timeout);
        let manager = ImpersonationManager::new(
            Arc::new(RefusingStore(f.store.clone())),
            f.store.clone(),
            audit,
            TokenService::new(&config),
            Arc::new(MemoryRevocationList::new()),
            f.clock.clone(),
            settings,
        );

        assert!(matches!(
            manager.start(&f.admin, request(f.member.user_id, Some(10)), None).await,
            Err(TrustError::Storage(_))
        ));
        assert!(f.store.find_active_for_actor(f.admin.id).await.unwrap().is_none());
        assert!(f.store.list_recent(f.admin.org_id, 10).await.unwrap().is_empty());
        assert!(f.store.audit_entries().is_empty());

        // Nothing half-written blocks a later attempt.
        assert!(f.manager.start(&f.admin, request(f.member.user_id, Some(10)), None).await.is_ok());
    }

    #[tokio::test]
    async fn list_recent_is_admin_only_and_clamped() {
        let f = fixture();
        f.manager
            .start(&f.admin, request(f.member.user_id, Some(10)), None)
            .await
            .unwrap();

        assert_eq!(f.manager.list_recent(&f.admin, Some(0)).await.unwrap().len(), 1);
        let member = Principal::new(f.member.user_id, "m@example.com", Role::Member, f.admin.org_id);
        assert!(matches!(
            f.manager.list_recent(&member, None).await,
            Err(TrustError::InsufficientPermissions)
        ));
    }
}
