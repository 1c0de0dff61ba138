//! Storage seams. Each trait has a Postgres implementation ([`Database`])
//! and an in-process one ([`InMemoryStore`]).
//!
//! [`Database`]: crate::services::Database
//! [`InMemoryStore`]: crate::services::InMemoryStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::models::{
    AuditDraft, AuditEntry, AuthSession, ImpersonationSession, ImpersonationStatus,
    OrgSecuritySettings, ReauthState, TenantContext, UserRecord,
};
use crate::services::TrustError;

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Links `draft` to the current tail and persists it. Reading the tail and
    /// writing the new entry happen as one serialized step.
    async fn append(&self, draft: AuditDraft) -> Result<AuditEntry, TrustError>;

    /// Every entry, oldest first.
    fn stream_in_order(&self) -> BoxStream<'_, Result<AuditEntry, TrustError>>;

    /// Entries about one object, newest first.
    async fn find_by_object(
        &self,
        object_type: &str,
        object_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, TrustError>;

    /// Case-insensitive substring search over the descriptive fields, newest first.
    async fn search_text(&self, query: &str, limit: i64) -> Result<Vec<AuditEntry>, TrustError>;
}

#[async_trait]
pub trait ImpersonationStore: Send + Sync {
    /// Inserts an active session and its `started` audit entry as one unit:
    /// either both are stored or neither is. Fails with `Conflict` if the
    /// actor already has an active session.
    async fn insert_active(
        &self,
        session: &ImpersonationSession,
        started: AuditDraft,
    ) -> Result<AuditEntry, TrustError>;

    async fn find(&self, session_id: Uuid) -> Result<Option<ImpersonationSession>, TrustError>;

    async fn find_active_for_actor(
        &self,
        actor_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, TrustError>;

    /// Moves an active session to `to`. Returns false if it was no longer active.
    async fn transition(
        &self,
        session_id: Uuid,
        to: ImpersonationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, TrustError>;

    async fn list_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError>;

    async fn list_recent(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts or refreshes a session row, keeping its original `created_at`.
    /// A revoked session id is never written back. Returns true when the row
    /// was inserted.
    async fn upsert(&self, session: &AuthSession) -> Result<bool, TrustError>;

    /// Whether the bound user has a session other than `exclude`, seen since
    /// `since`, matching either the user agent or the ip.
    async fn has_recent_match(
        &self,
        tenant: &TenantContext,
        user_agent: Option<&str>,
        ip: Option<&str>,
        since: DateTime<Utc>,
        exclude: Option<&str>,
    ) -> Result<bool, TrustError>;

    /// The bound user's sessions, most recently seen first.
    async fn list(&self, tenant: &TenantContext) -> Result<Vec<AuthSession>, TrustError>;

    /// Deletes the row and records the id as revoked.
    async fn delete(&self, tenant: &TenantContext, session_id: &str) -> Result<bool, TrustError>;

    /// Deletes every session of the bound user except `keep` and records each
    /// as revoked; returns deleted ids.
    async fn delete_all_except(
        &self,
        tenant: &TenantContext,
        keep: &str,
    ) -> Result<Vec<String>, TrustError>;

    /// Whether `session_id` was ever revoked. Revocations never lapse.
    async fn is_revoked(&self, session_id: &str) -> Result<bool, TrustError>;
}

#[async_trait]
pub trait ReauthStore: Send + Sync {
    async fn mark(&self, session_id: &str, at: DateTime<Utc>, factor: &str)
        -> Result<(), TrustError>;

    async fn last(&self, session_id: &str) -> Result<Option<ReauthState>, TrustError>;
}

#[async_trait]
pub trait SecurityPolicyStore: Send + Sync {
    async fn find(&self, org_id: Uuid) -> Result<Option<OrgSecuritySettings>, TrustError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, org_id: Uuid, user_id: Uuid)
        -> Result<Option<UserRecord>, TrustError>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> Result<(), TrustError>;
}
