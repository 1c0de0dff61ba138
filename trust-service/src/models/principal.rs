//! Request principal, supplied per request by the upstream authentication layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    President,
    Member,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::President => "PRESIDENT",
            Role::Member => "MEMBER",
            Role::Viewer => "VIEWER",
        }
    }

    /// Roles that may impersonate, and that may never be impersonated.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin | Role::President)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "PRESIDENT" => Ok(Role::President),
            "MEMBER" => Ok(Role::Member),
            "VIEWER" => Ok(Role::Viewer),
            other => Err(format!("Invalid role: {}", other)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Effective identity of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub org_id: Uuid,
    /// Auth session the request arrived on. Impersonated principals have none.
    pub session_id: Option<String>,
    pub impersonated: bool,
    /// Administrator acting as this principal, when impersonated.
    pub impersonator_id: Option<Uuid>,
}

impl Principal {
    pub fn new(id: Uuid, email: impl Into<String>, role: Role, org_id: Uuid) -> Self {
        Self {
            id,
            email: email.into(),
            role,
            org_id,
            session_id: None,
            impersonated: false,
            impersonator_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The target user as seen through an impersonation grant held by `actor_id`.
    pub fn impersonating(mut self, actor_id: Uuid) -> Self {
        self.session_id = None;
        self.impersonated = true;
        self.impersonator_id = Some(actor_id);
        self
    }

    pub fn is_privileged(&self) -> bool {
        !self.impersonated && self.role.is_privileged()
    }
}
