use serde::Serialize;
use uuid::Uuid;

use crate::models::Role;

/// Directory entry for a principal that may be the target of impersonation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    #[sqlx(rename = "role_code", try_from = "String")]
    pub role: Role,
}
