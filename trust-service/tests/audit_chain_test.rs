//! Audit chain queries and verification over HTTP.

mod common;

use common::TestApp;
use serde_json::json;
use service_core::axum::http::{Method, StatusCode};

/// Starts and ends one impersonation session so the chain has entries.
async fn seed_chain(app: &TestApp, admin_token: &str) -> String {
    let (_, started) = app.start_impersonation(admin_token, &app.member).await;
    let session_id = started["session_id"].as_str().unwrap().to_string();
    app.request(
        Method::POST,
        &format!("/impersonation/{}/end", session_id),
        Some(admin_token),
        None,
    )
    .await;
    session_id
}

#[tokio::test]
async fn verify_requires_admin_and_recent_reauth() {
    let app = TestApp::new();
    let admin_token = app.access_token(&app.admin, "admin-session");
    let member_token = app.access_token(&app.member, "member-session");
    seed_chain(&app, &admin_token).await;

    let (status, _) = app
        .request(Method::GET, "/audit/verify", Some(&member_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(Method::GET, "/audit/verify", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "reauth_required");
    assert_eq!(body["details"]["age_ms"], json!(null));

    app.mark_strong_auth(&app.admin, "admin-session").await;

    let (status, report) = app
        .request(Method::GET, "/audit/verify", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);
    // started, ended, strong auth
    assert_eq!(report["entries_checked"], 3);
    assert_eq!(report["first_broken_id"], json!(null));
}

#[tokio::test]
async fn tampering_is_reported_at_the_edited_entry() {
    let app = TestApp::new();
    let admin_token = app.access_token(&app.admin, "admin-session");
    seed_chain(&app, &admin_token).await;
    seed_chain(&app, &admin_token).await;
    app.mark_strong_auth(&app.admin, "admin-session").await;

    let victim = app.store.audit_entries()[1].clone();
    app.store.tamper_audit(1, |entry| {
        entry.reason = Some("nothing to see here".to_string());
    });

    let (status, report) = app
        .request(Method::GET, "/audit/verify", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], false);
    assert_eq!(report["entries_checked"], 5);
    assert_eq!(report["first_broken_id"], json!(victim.id));
    assert!(!report["errors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn entries_by_object_and_text_search() {
    let app = TestApp::new();
    let admin_token = app.access_token(&app.admin, "admin-session");
    let session_id = seed_chain(&app, &admin_token).await;

    let (status, body) = app
        .request(
            Method::GET,
            &format!(
                "/audit/entries?resource_type=impersonation_session&resource_id={}",
                session_id
            ),
            Some(&admin_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first.
    assert_eq!(entries[0]["action"], "impersonation.ended");
    assert_eq!(entries[1]["action"], "impersonation.started");

    let (status, body) = app
        .request(Method::GET, "/audit/search?q=INVOICE%20EXPORT", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    let (status, body) = app
        .request(Method::GET, "/audit/search?q=%20", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}
