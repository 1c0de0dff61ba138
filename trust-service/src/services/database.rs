//! PostgreSQL storage for the trust core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{
    AuditDraft, AuditEntry, AuthSession, ImpersonationSession, ImpersonationStatus,
    OrgSecuritySettings, ReauthState, TenantContext, UserRecord,
};
use crate::services::store::{
    AuditStore, HealthProbe, ImpersonationStore, ReauthStore, SecurityPolicyStore, SessionStore,
    UserDirectory,
};
use crate::services::TrustError;

/// Advisory lock key serializing audit appends across every process.
const AUDIT_APPEND_LOCK: i64 = 0x7472_7573_7461_7564;

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Escapes LIKE metacharacters so user text matches literally.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Seals `draft` onto the chain tail inside `tx`. The caller commits.
///
/// The advisory lock is transaction-scoped, so it is held until the caller's
/// commit or rollback and no other append can read the same tail meanwhile.
async fn append_in(
    tx: &mut Transaction<'_, Postgres>,
    draft: AuditDraft,
) -> Result<AuditEntry, TrustError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(AUDIT_APPEND_LOCK)
        .execute(&mut **tx)
        .await?;

    let prev_hash: Option<String> =
        sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await?;

    let entry = draft.seal(prev_hash);

    let result = sqlx::query(
        r#"
        INSERT INTO audit_log (entry_id, entry_utc, actor_id, actor_email, actor_role, actor_ip,
                               action, object_type, object_id, before_state, after_state, reason,
                               prev_hash, hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(entry.id)
    .bind(entry.timestamp)
    .bind(&entry.actor_id)
    .bind(&entry.actor_email)
    .bind(&entry.actor_role)
    .bind(&entry.actor_ip)
    .bind(&entry.action)
    .bind(&entry.object_type)
    .bind(&entry.object_id)
    .bind(&entry.before_state)
    .bind(&entry.after_state)
    .bind(&entry.reason)
    .bind(&entry.prev_hash)
    .bind(&entry.hash)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(entry),
        Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
            // Another writer bypassed the advisory lock and claimed this tail.
            tracing::error!(prev_hash = ?entry.prev_hash, "Audit chain fork rejected");
            Err(TrustError::IntegrityViolation(
                "audit chain tail changed during append".to_string(),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl AuditStore for Database {
    #[instrument(skip(self, draft), fields(action = %draft.action))]
    async fn append(&self, draft: AuditDraft) -> Result<AuditEntry, TrustError> {
        let mut tx = self.pool.begin().await?;
        let entry = append_in(&mut tx, draft).await?;
        tx.commit().await?;
        Ok(entry)
    }

    fn stream_in_order(&self) -> BoxStream<'_, Result<AuditEntry, TrustError>> {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT entry_id, entry_utc, actor_id, actor_email, actor_role, actor_ip, action,
                   object_type, object_id, before_state, after_state, reason, prev_hash, hash
            FROM audit_log
            ORDER BY seq ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|row| row.map_err(TrustError::from))
        .boxed()
    }

    async fn find_by_object(
        &self,
        object_type: &str,
        object_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, TrustError> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT entry_id, entry_utc, actor_id, actor_email, actor_role, actor_ip, action,
                   object_type, object_id, before_state, after_state, reason, prev_hash, hash
            FROM audit_log
            WHERE object_type = $1 AND object_id = $2
            ORDER BY seq DESC
            LIMIT $3
            "#,
        )
        .bind(object_type)
        .bind(object_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn search_text(&self, query: &str, limit: i64) -> Result<Vec<AuditEntry>, TrustError> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT entry_id, entry_utc, actor_id, actor_email, actor_role, actor_ip, action,
                   object_type, object_id, before_state, after_state, reason, prev_hash, hash
            FROM audit_log
            WHERE action ILIKE $1 ESCAPE '\'
               OR object_type ILIKE $1 ESCAPE '\'
               OR object_id ILIKE $1 ESCAPE '\'
               OR actor_id ILIKE $1 ESCAPE '\'
               OR actor_email ILIKE $1 ESCAPE '\'
               OR reason ILIKE $1 ESCAPE '\'
               OR before_state::text ILIKE $1 ESCAPE '\'
               OR after_state::text ILIKE $1 ESCAPE '\'
            ORDER BY seq DESC
            LIMIT $2
            "#,
        )
        .bind(like_pattern(query))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl ImpersonationStore for Database {
    #[instrument(skip(self, session, started), fields(session_id = %session.id, actor_id = %session.actor_id))]
    async fn insert_active(
        &self,
        session: &ImpersonationSession,
        started: AuditDraft,
    ) -> Result<AuditEntry, TrustError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO impersonation_sessions (session_id, org_id, actor_id, target_id, business_reason,
                                                status, created_utc, expires_utc, ip_address, deny_operations)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9)
            "#,
        )
        .bind(session.id)
        .bind(session.org_id)
        .bind(session.actor_id)
        .bind(session.target_id)
        .bind(&session.business_reason)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(&session.ip)
        .bind(&session.deny)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await?;
                let existing = self.find_active_for_actor(session.actor_id).await?;
                return Err(TrustError::Conflict {
                    existing_session_id: existing.map(|s| s.id),
                });
            }
            Err(e) => return Err(e.into()),
        }

        // Dropping the transaction on error rolls the session row back too.
        let entry = append_in(&mut tx, started).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<ImpersonationSession>, TrustError> {
        let session = sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_active_for_actor(
        &self,
        actor_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, TrustError> {
        let session = sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE actor_id = $1 AND status = 'active'",
        )
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: ImpersonationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, TrustError> {
        let result = sqlx::query(
            r#"
            UPDATE impersonation_sessions
            SET status = $2, ended_utc = $3
            WHERE session_id = $1 AND status = 'active'
            "#,
        )
        .bind(session_id)
        .bind(to.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError> {
        let sessions = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            SELECT * FROM impersonation_sessions
            WHERE status = 'active' AND expires_utc < $1
            ORDER BY expires_utc ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn list_recent(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError> {
        let sessions = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            SELECT * FROM impersonation_sessions
            WHERE org_id = $1
            ORDER BY created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn upsert(&self, session: &AuthSession) -> Result<bool, TrustError> {
        // xmax is zero only for a freshly inserted row version.
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO auth_sessions (session_id, user_id, org_id, ip_address, user_agent, created_utc, last_seen_utc)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE NOT EXISTS (SELECT 1 FROM revoked_sessions WHERE session_id = $1)
            ON CONFLICT (session_id) DO UPDATE
            SET ip_address = EXCLUDED.ip_address,
                user_agent = EXCLUDED.user_agent,
                last_seen_utc = EXCLUDED.last_seen_utc
            WHERE auth_sessions.user_id = EXCLUDED.user_id
              AND auth_sessions.org_id = EXCLUDED.org_id
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(session.org_id)
        .bind(&session.ip)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.unwrap_or(false))
    }

    async fn has_recent_match(
        &self,
        tenant: &TenantContext,
        user_agent: Option<&str>,
        ip: Option<&str>,
        since: DateTime<Utc>,
        exclude: Option<&str>,
    ) -> Result<bool, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM auth_sessions
                WHERE org_id = $1 AND user_id = $2 AND last_seen_utc >= $3
                  AND ($6::text IS NULL OR session_id <> $6)
                  AND (($4::text IS NOT NULL AND user_agent = $4)
                    OR ($5::text IS NOT NULL AND ip_address = $5))
            )
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(since)
        .bind(user_agent)
        .bind(ip)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn list(&self, tenant: &TenantContext) -> Result<Vec<AuthSession>, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let sessions = sqlx::query_as::<_, AuthSession>(
            r#"
            SELECT * FROM auth_sessions s
            WHERE s.org_id = $1 AND s.user_id = $2
              AND NOT EXISTS (SELECT 1 FROM revoked_sessions r WHERE r.session_id = s.session_id)
            ORDER BY s.last_seen_utc DESC
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn delete(&self, tenant: &TenantContext, session_id: &str) -> Result<bool, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let removed: Option<String> = sqlx::query_scalar(
            r#"
            WITH removed AS (
                DELETE FROM auth_sessions
                WHERE session_id = $1 AND org_id = $2 AND user_id = $3
                RETURNING session_id, user_id, org_id
            ), tombstoned AS (
                INSERT INTO revoked_sessions (session_id, user_id, org_id)
                SELECT session_id, user_id, org_id FROM removed
                ON CONFLICT (session_id) DO NOTHING
            )
            SELECT session_id FROM removed
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(removed.is_some())
    }

    async fn delete_all_except(
        &self,
        tenant: &TenantContext,
        keep: &str,
    ) -> Result<Vec<String>, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let removed = sqlx::query_scalar::<_, String>(
            r#"
            WITH removed AS (
                DELETE FROM auth_sessions
                WHERE org_id = $1 AND user_id = $2 AND session_id <> $3
                RETURNING session_id, user_id, org_id
            ), tombstoned AS (
                INSERT INTO revoked_sessions (session_id, user_id, org_id)
                SELECT session_id, user_id, org_id FROM removed
                ON CONFLICT (session_id) DO NOTHING
            )
            SELECT session_id FROM removed
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(keep)
        .fetch_all(&self.pool)
        .await?;
        Ok(removed)
    }

    async fn is_revoked(&self, session_id: &str) -> Result<bool, TrustError> {
        let revoked: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM revoked_sessions WHERE session_id = $1)",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(revoked)
    }
}

#[async_trait]
impl ReauthStore for Database {
    async fn mark(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        factor: &str,
    ) -> Result<(), TrustError> {
        sqlx::query(
            r#"
            INSERT INTO session_reauth (session_id, last_strong_auth_utc, factor_code)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id) DO UPDATE
            SET last_strong_auth_utc = EXCLUDED.last_strong_auth_utc,
                factor_code = EXCLUDED.factor_code
            "#,
        )
        .bind(session_id)
        .bind(at)
        .bind(factor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last(&self, session_id: &str) -> Result<Option<ReauthState>, TrustError> {
        let state = sqlx::query_as::<_, ReauthState>(
            "SELECT session_id, last_strong_auth_utc, factor_code FROM session_reauth WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }
}

#[async_trait]
impl SecurityPolicyStore for Database {
    async fn find(&self, org_id: Uuid) -> Result<Option<OrgSecuritySettings>, TrustError> {
        let settings = sqlx::query_as::<_, OrgSecuritySettings>(
            "SELECT * FROM org_security_settings WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(settings)
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn find_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserRecord>, TrustError> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, org_id, email, role_code FROM users WHERE org_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

#[async_trait]
impl HealthProbe for Database {
    async fn ping(&self) -> Result<(), TrustError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                TrustError::from(e)
            })?;
        Ok(())
    }
}
