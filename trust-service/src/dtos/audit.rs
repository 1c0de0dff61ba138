use serde::{Deserialize, Serialize};

use crate::models::AuditEntry;

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    pub resource_type: String,
    pub resource_id: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditEntriesResponse {
    pub entries: Vec<AuditEntry>,
}
