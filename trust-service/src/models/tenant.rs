use serde::Serialize;
use uuid::Uuid;

use crate::services::TrustError;

/// Organization and user a unit of work runs on behalf of.
///
/// System work (background sweeps) runs with neither set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    pub org_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

impl TenantContext {
    pub fn new(org_id: Uuid, user_id: Uuid) -> Self {
        Self {
            org_id: Some(org_id),
            user_id: Some(user_id),
        }
    }

    pub fn system() -> Self {
        Self {
            org_id: None,
            user_id: None,
        }
    }

    pub fn require_user(&self) -> Result<(Uuid, Uuid), TrustError> {
        match (self.org_id, self.user_id) {
            (Some(org), Some(user)) => Ok((org, user)),
            _ => Err(TrustError::Unauthorized("No user bound".to_string())),
        }
    }
}
