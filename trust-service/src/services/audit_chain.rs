//! Append-only, hash-linked audit trail.

use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::models::{AuditActor, AuditDraft, AuditEntry};
use crate::services::error::bounded;
use crate::services::metrics::{AUDIT_APPENDS_TOTAL, CHAIN_VERIFICATIONS_TOTAL};
use crate::services::store::AuditStore;
use crate::services::{Clock, TrustError};

pub const MAX_SEARCH_LIMIT: i64 = 500;

/// Outcome of walking the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    pub entries_checked: u64,
    pub first_broken_id: Option<Uuid>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

fn hashes_match(stored: Option<&str>, expected: Option<&str>) -> bool {
    match (stored, expected) {
        (None, None) => true,
        (Some(a), Some(b)) => a.as_bytes().ct_eq(b.as_bytes()).into(),
        _ => false,
    }
}

impl AuditChain {
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Starts an entry stamped with the current time.
    pub fn draft(
        &self,
        actor: AuditActor,
        action: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
    ) -> AuditDraft {
        AuditDraft::new(actor, action, object_type, object_id, self.clock.now())
    }

    /// Durably appends `draft`. Any failure, including a timeout, is returned
    /// to the caller; audit writes have no degraded mode.
    pub async fn append(&self, draft: AuditDraft) -> Result<AuditEntry, TrustError> {
        self.append_with(draft, |draft| self.store.append(draft)).await
    }

    /// Appends `draft` through `write`, which stores it together with other
    /// rows in one unit of work. A conflict means nothing was written.
    pub async fn append_with<F, Fut>(&self, draft: AuditDraft, write: F) -> Result<AuditEntry, TrustError>
    where
        F: FnOnce(AuditDraft) -> Fut,
        Fut: Future<Output = Result<AuditEntry, TrustError>>,
    {
        let action = draft.action.clone();
        match bounded(self.timeout, "audit.append", write(draft)).await {
            Ok(entry) => {
                AUDIT_APPENDS_TOTAL.with_label_values(&[action.as_str(), "ok"]).inc();
                tracing::debug!(entry_id = %entry.id, action = %entry.action, "Audit entry appended");
                Ok(entry)
            }
            Err(e @ TrustError::Conflict { .. }) => Err(e),
            Err(e) => {
                AUDIT_APPENDS_TOTAL.with_label_values(&[action.as_str(), "error"]).inc();
                tracing::error!(action = %action, error = %e, "Audit append failed");
                Err(e)
            }
        }
    }

    /// Walks the chain oldest to newest and reports every break.
    ///
    /// An entry is broken when its `prev_hash` differs from its predecessor's
    /// stored hash or its stored hash differs from the recomputed one. Entries
    /// after the first break are reported even when individually consistent.
    pub async fn verify_chain(&self) -> Result<ChainReport, TrustError> {
        let mut entries = self.store.stream_in_order();
        let mut previous_hash: Option<String> = None;
        let mut report = ChainReport {
            valid: true,
            entries_checked: 0,
            first_broken_id: None,
            errors: Vec::new(),
        };

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            report.entries_checked += 1;

            let mut broken = false;
            if !hashes_match(entry.prev_hash.as_deref(), previous_hash.as_deref()) {
                report.errors.push(format!(
                    "entry {}: prev_hash does not match the preceding entry",
                    entry.id
                ));
                broken = true;
            }
            if !hashes_match(Some(&entry.hash), Some(&entry.compute_hash())) {
                report
                    .errors
                    .push(format!("entry {}: stored hash does not match its contents", entry.id));
                broken = true;
            }

            if broken {
                report.first_broken_id.get_or_insert(entry.id);
            } else if report.first_broken_id.is_some() {
                report
                    .errors
                    .push(format!("entry {}: descends from a broken link", entry.id));
            }

            previous_hash = Some(entry.hash);
        }

        report.valid = report.errors.is_empty();
        if report.valid {
            CHAIN_VERIFICATIONS_TOTAL.with_label_values(&["valid"]).inc();
            tracing::info!(entries = report.entries_checked, "Audit chain verified");
        } else {
            CHAIN_VERIFICATIONS_TOTAL.with_label_values(&["broken"]).inc();
            tracing::error!(
                entries = report.entries_checked,
                first_broken_id = ?report.first_broken_id,
                breaks = report.errors.len(),
                "Audit chain integrity violation"
            );
        }

        Ok(report)
    }

    /// Entries about one object, newest first.
    pub async fn search(
        &self,
        resource_type: &str,
        resource_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, TrustError> {
        self.store
            .find_by_object(resource_type, resource_id, limit.clamp(1, MAX_SEARCH_LIMIT))
            .await
    }

    pub async fn search_by_query(&self, text: &str, limit: i64) -> Result<Vec<AuditEntry>, TrustError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TrustError::InvalidRequest("Search text is required".to_string()));
        }
        self.store
            .search_text(text, limit.clamp(1, MAX_SEARCH_LIMIT))
            .await
    }
}
