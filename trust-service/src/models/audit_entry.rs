use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Principal;
use crate::utils::canonical_json;

/// Actor id recorded for entries written by background tasks.
pub const SYSTEM_ACTOR_ID: &str = "system";

/// Immutable, hash-linked audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    #[sqlx(rename = "entry_id")]
    pub id: Uuid,
    #[sqlx(rename = "entry_utc")]
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub actor_role: Option<String>,
    pub actor_ip: Option<String>,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub reason: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    /// Recomputes the hash from the stored fields.
    pub fn compute_hash(&self) -> String {
        hash_material(
            &self.timestamp,
            &self.actor_id,
            self.actor_email.as_deref(),
            self.actor_role.as_deref(),
            self.actor_ip.as_deref(),
            &self.action,
            &self.object_type,
            &self.object_id,
            self.before_state.as_ref(),
            self.after_state.as_ref(),
            self.reason.as_deref(),
            self.prev_hash.as_deref(),
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn hash_material(
    timestamp: &DateTime<Utc>,
    actor_id: &str,
    actor_email: Option<&str>,
    actor_role: Option<&str>,
    actor_ip: Option<&str>,
    action: &str,
    object_type: &str,
    object_id: &str,
    before_state: Option<&Value>,
    after_state: Option<&Value>,
    reason: Option<&str>,
    prev_hash: Option<&str>,
) -> String {
    let material = json!({
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        "actor_id": actor_id,
        "actor_email": actor_email,
        "actor_role": actor_role,
        "actor_ip": actor_ip,
        "action": action,
        "object_type": object_type,
        "object_id": object_id,
        "before_state": before_state,
        "after_state": after_state,
        "reason": reason,
        "prev_hash": prev_hash,
    });

    hex::encode(Sha256::digest(canonical_json(&material).as_bytes()))
}

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditActor {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub ip: Option<String>,
}

impl AuditActor {
    pub fn from_principal(principal: &Principal, ip: Option<String>) -> Self {
        Self {
            id: principal.id.to_string(),
            email: Some(principal.email.clone()),
            role: Some(principal.role.as_str().to_string()),
            ip,
        }
    }

    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR_ID.to_string(),
            email: None,
            role: None,
            ip: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ImpersonationStarted,
    ImpersonationEnded,
    ImpersonationRequestBlocked,
    ImpersonationRequest,
    ImpersonationAutoExpired,
    SessionRevoked,
    SessionRevokedOthers,
    StrongAuth,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ImpersonationStarted => "impersonation.started",
            AuditAction::ImpersonationEnded => "impersonation.ended",
            AuditAction::ImpersonationRequestBlocked => "impersonation.request.blocked",
            AuditAction::ImpersonationRequest => "impersonation.request",
            AuditAction::ImpersonationAutoExpired => "impersonation.auto_expired",
            AuditAction::SessionRevoked => "session.revoked",
            AuditAction::SessionRevokedOthers => "session.revoked_others",
            AuditAction::StrongAuth => "reauth.strong_auth",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry that has not yet been linked into the chain.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub reason: Option<String>,
}

impl AuditDraft {
    pub fn new(
        actor: AuditActor,
        action: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            // Stored precision is microseconds; hashing must survive a round trip.
            timestamp: at.trunc_subsecs(6),
            actor,
            action: action.into(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            before_state: None,
            after_state: None,
            reason: None,
        }
    }

    pub fn before(mut self, state: Value) -> Self {
        self.before_state = Some(state);
        self
    }

    pub fn after(mut self, state: Value) -> Self {
        self.after_state = Some(state);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Links the draft to `prev_hash` and computes its own hash.
    pub fn seal(self, prev_hash: Option<String>) -> AuditEntry {
        let hash = hash_material(
            &self.timestamp,
            &self.actor.id,
            self.actor.email.as_deref(),
            self.actor.role.as_deref(),
            self.actor.ip.as_deref(),
            &self.action,
            &self.object_type,
            &self.object_id,
            self.before_state.as_ref(),
            self.after_state.as_ref(),
            self.reason.as_deref(),
            prev_hash.as_deref(),
        );

        AuditEntry {
            id: self.id,
            timestamp: self.timestamp,
            actor_id: self.actor.id,
            actor_email: self.actor.email,
            actor_role: self.actor.role,
            actor_ip: self.actor.ip,
            action: self.action,
            object_type: self.object_type,
            object_id: self.object_id,
            before_state: self.before_state,
            after_state: self.after_state,
            reason: self.reason,
            prev_hash,
            hash,
        }
    }
}
