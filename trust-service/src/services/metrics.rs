//! Prometheus metrics for trust-service.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec, TextEncoder};

/// Audit appends by action and outcome.
pub static AUDIT_APPENDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "trust_audit_appends_total",
        "Total number of audit chain appends",
        &["action", "status"]
    )
    .expect("Failed to register audit_appends_total")
});

/// Chain verifications by result.
pub static CHAIN_VERIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "trust_chain_verifications_total",
        "Total number of audit chain verifications",
        &["result"]
    )
    .expect("Failed to register chain_verifications_total")
});

/// Impersonation lifecycle transitions.
pub static IMPERSONATION_SESSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "trust_impersonation_sessions_total",
        "Impersonation sessions by lifecycle event",
        &["event"] // started, ended, expired
    )
    .expect("Failed to register impersonation_sessions_total")
});

/// Impersonated requests rejected by the denylist, by operation.
pub static IMPERSONATION_BLOCKED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "trust_impersonation_blocked_total",
        "Impersonated requests blocked by policy",
        &["operation"]
    )
    .expect("Failed to register impersonation_blocked_total")
});

/// Step-up decisions by outcome.
pub static REAUTH_CHECKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "trust_reauth_checks_total",
        "Step-up re-authentication checks",
        &["result"]
    )
    .expect("Failed to register reauth_checks_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&AUDIT_APPENDS_TOTAL);
    Lazy::force(&CHAIN_VERIFICATIONS_TOTAL);
    Lazy::force(&IMPERSONATION_SESSIONS_TOTAL);
    Lazy::force(&IMPERSONATION_BLOCKED_TOTAL);
    Lazy::force(&REAUTH_CHECKS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
