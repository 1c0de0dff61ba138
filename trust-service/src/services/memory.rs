//! In-process storage for tests and single-process development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
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

/// All storage concerns behind plain mutexes. Fields are public so tests can
/// seed directories and tamper with stored rows.
#[derive(Default)]
pub struct InMemoryStore {
    pub audit: Mutex<Vec<AuditEntry>>,
    pub impersonation: Mutex<HashMap<Uuid, ImpersonationSession>>,
    pub sessions: Mutex<HashMap<String, AuthSession>>,
    pub revoked_sessions: Mutex<HashSet<String>>,
    pub reauth: Mutex<HashMap<String, ReauthState>>,
    pub policies: Mutex<HashMap<Uuid, OrgSecuritySettings>>,
    pub users: Mutex<HashMap<Uuid, UserRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRecord) {
        lock(&self.users).insert(user.user_id, user);
    }

    pub fn set_policy(&self, settings: OrgSecuritySettings) {
        lock(&self.policies).insert(settings.org_id, settings);
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        lock(&self.audit).clone()
    }

    /// Overwrites a stored audit row in place.
    pub fn tamper_audit<F>(&self, index: usize, edit: F)
    where
        F: FnOnce(&mut AuditEntry),
    {
        if let Some(entry) = lock(&self.audit).get_mut(index) {
            edit(entry);
        }
    }
}

fn owned_by(session: &AuthSession, org_id: Uuid, user_id: Uuid) -> bool {
    session.org_id == org_id && session.user_id == user_id
}

/// Links `draft` to the tail of `log` and pushes it.
fn push_sealed(log: &mut Vec<AuditEntry>, draft: AuditDraft) -> AuditEntry {
    let prev_hash = log.last().map(|tail| tail.hash.clone());
    let entry = draft.seal(prev_hash);
    log.push(entry.clone());
    entry
}

fn newest_first(mut entries: Vec<AuditEntry>, limit: i64) -> Vec<AuditEntry> {
    entries.reverse();
    entries.truncate(limit.max(0) as usize);
    entries
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append(&self, draft: AuditDraft) -> Result<AuditEntry, TrustError> {
        Ok(push_sealed(&mut lock(&self.audit), draft))
    }

    fn stream_in_order(&self) -> BoxStream<'_, Result<AuditEntry, TrustError>> {
        let snapshot = lock(&self.audit).clone();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn find_by_object(
        &self,
        object_type: &str,
        object_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, TrustError> {
        let matching = lock(&self.audit)
            .iter()
            .filter(|e| e.object_type == object_type && e.object_id == object_id)
            .cloned()
            .collect();
        Ok(newest_first(matching, limit))
    }

    async fn search_text(&self, query: &str, limit: i64) -> Result<Vec<AuditEntry>, TrustError> {
        let needle = query.to_lowercase();
        let hit = |field: Option<&str>| {
            field
                .map(|f| f.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };

        let matching = lock(&self.audit)
            .iter()
            .filter(|e| {
                hit(Some(e.action.as_str()))
                    || hit(Some(e.object_type.as_str()))
                    || hit(Some(e.object_id.as_str()))
                    || hit(Some(e.actor_id.as_str()))
                    || hit(e.actor_email.as_deref())
                    || hit(e.reason.as_deref())
                    || hit(e.before_state.as_ref().map(|v| v.to_string()).as_deref())
                    || hit(e.after_state.as_ref().map(|v| v.to_string()).as_deref())
            })
            .cloned()
            .collect();
        Ok(newest_first(matching, limit))
    }
}

#[async_trait]
impl ImpersonationStore for InMemoryStore {
    async fn insert_active(
        &self,
        session: &ImpersonationSession,
        started: AuditDraft,
    ) -> Result<AuditEntry, TrustError> {
        let mut sessions = lock(&self.impersonation);
        if let Some(existing) = sessions
            .values()
            .find(|s| s.actor_id == session.actor_id && s.is_active())
        {
            return Err(TrustError::Conflict {
                existing_session_id: Some(existing.id),
            });
        }
        let entry = push_sealed(&mut lock(&self.audit), started);
        sessions.insert(session.id, session.clone());
        Ok(entry)
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<ImpersonationSession>, TrustError> {
        Ok(lock(&self.impersonation).get(&session_id).cloned())
    }

    async fn find_active_for_actor(
        &self,
        actor_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, TrustError> {
        Ok(lock(&self.impersonation)
            .values()
            .find(|s| s.actor_id == actor_id && s.is_active())
            .cloned())
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: ImpersonationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, TrustError> {
        let mut sessions = lock(&self.impersonation);
        match sessions.get_mut(&session_id) {
            Some(session) if session.is_active() => {
                session.status = to;
                session.ended_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError> {
        let mut due: Vec<_> = lock(&self.impersonation)
            .values()
            .filter(|s| s.is_overdue(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.expires_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn list_recent(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ImpersonationSession>, TrustError> {
        let mut recent: Vec<_> = lock(&self.impersonation)
            .values()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit.max(0) as usize);
        Ok(recent)
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn upsert(&self, session: &AuthSession) -> Result<bool, TrustError> {
        let mut sessions = lock(&self.sessions);
        if lock(&self.revoked_sessions).contains(&session.session_id) {
            return Ok(false);
        }
        match sessions.get_mut(&session.session_id) {
            Some(existing) => {
                if owned_by(existing, session.org_id, session.user_id) {
                    existing.ip = session.ip.clone();
                    existing.user_agent = session.user_agent.clone();
                    existing.last_seen_at = session.last_seen_at;
                }
                Ok(false)
            }
            None => {
                sessions.insert(session.session_id.clone(), session.clone());
                Ok(true)
            }
        }
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
        Ok(lock(&self.sessions).values().any(|s| {
            owned_by(s, org_id, user_id)
                && Some(s.session_id.as_str()) != exclude
                && s.last_seen_at >= since
                && ((user_agent.is_some() && s.user_agent.as_deref() == user_agent)
                    || (ip.is_some() && s.ip.as_deref() == ip))
        }))
    }

    async fn list(&self, tenant: &TenantContext) -> Result<Vec<AuthSession>, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let mut sessions: Vec<_> = lock(&self.sessions)
            .values()
            .filter(|s| owned_by(s, org_id, user_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(sessions)
    }

    async fn delete(&self, tenant: &TenantContext, session_id: &str) -> Result<bool, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let mut sessions = lock(&self.sessions);
        match sessions.get(session_id) {
            Some(s) if owned_by(s, org_id, user_id) => {
                sessions.remove(session_id);
                lock(&self.revoked_sessions).insert(session_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_all_except(
        &self,
        tenant: &TenantContext,
        keep: &str,
    ) -> Result<Vec<String>, TrustError> {
        let (org_id, user_id) = tenant.require_user()?;
        let mut sessions = lock(&self.sessions);
        let doomed: Vec<String> = sessions
            .values()
            .filter(|s| owned_by(s, org_id, user_id) && s.session_id != keep)
            .map(|s| s.session_id.clone())
            .collect();
        let mut revoked = lock(&self.revoked_sessions);
        for id in &doomed {
            sessions.remove(id);
            revoked.insert(id.clone());
        }
        Ok(doomed)
    }

    async fn is_revoked(&self, session_id: &str) -> Result<bool, TrustError> {
        Ok(lock(&self.revoked_sessions).contains(session_id))
    }
}

#[async_trait]
impl ReauthStore for InMemoryStore {
    async fn mark(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        factor: &str,
    ) -> Result<(), TrustError> {
        lock(&self.reauth).insert(
            session_id.to_string(),
            ReauthState {
                session_id: session_id.to_string(),
                last_strong_auth_at: at,
                factor: factor.to_string(),
            },
        );
        Ok(())
    }

    async fn last(&self, session_id: &str) -> Result<Option<ReauthState>, TrustError> {
        Ok(lock(&self.reauth).get(session_id).cloned())
    }
}

#[async_trait]
impl SecurityPolicyStore for InMemoryStore {
    async fn find(&self, org_id: Uuid) -> Result<Option<OrgSecuritySettings>, TrustError> {
        Ok(lock(&self.policies).get(&org_id).cloned())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn find_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserRecord>, TrustError> {
        Ok(lock(&self.users)
            .get(&user_id)
            .filter(|u| u.org_id == org_id)
            .cloned())
    }
}

#[async_trait]
impl HealthProbe for InMemoryStore {
    async fn ping(&self) -> Result<(), TrustError> {
        Ok(())
    }
}
