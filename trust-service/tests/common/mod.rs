//! Shared harness for trust-service integration tests.
//!
//! Every test runs against the real router with in-memory stores, an
//! in-process revocation list and a manual clock.

#![allow(dead_code)]

use chrono::Duration;
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::Value;
use service_core::axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Method, Request, StatusCode},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use trust_service::{
    build_router,
    config::{
        AccessTokenConfig, ClassificationMode, DatabaseConfig, Environment, ImpersonationConfig,
        ReauthConfig, SessionConfig, TrustConfig,
    },
    models::{Role, UserRecord},
    services::{
        AccessTokenClaims, Clock, DeviceSighting, InMemoryStore, ManualClock, MemoryRevocationList,
        StrongFactor,
    },
    AppState, Stores,
};
use uuid::Uuid;

pub const BUSINESS_REASON: &str = "Customer ticket 4821: reproduce broken invoice export";

pub fn test_config() -> TrustConfig {
    TrustConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        environment: Environment::Dev,
        service_name: "trust-service-test".to_string(),
        service_version: "0.1.0".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        allowed_origins: vec!["http://localhost:3000".to_string()],
        trusted_proxies: Vec::new(),
        database: DatabaseConfig {
            url: Secret::new("postgres://localhost/trust_test".to_string()),
            max_connections: 5,
            min_connections: 1,
            query_timeout_secs: 3,
        },
        redis: None,
        access_token: AccessTokenConfig {
            secret: Secret::new("integration-access-secret".to_string()),
        },
        impersonation: ImpersonationConfig {
            token_secret: Secret::new("integration-impersonation-secret".to_string()),
            default_duration_minutes: 10,
            max_duration_minutes: 30,
            sweep_interval_secs: 300,
            audit_sample_rate: 0.0,
            classification: ClassificationMode::Strict,
        },
        reauth: ReauthConfig {
            window_minutes: 30,
            require_without_policy: false,
        },
        sessions: SessionConfig {
            new_device_lookback_days: 30,
            revoked_ttl_secs: 86_400,
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub revocations: Arc<MemoryRevocationList>,
    pub clock: Arc<ManualClock>,
    pub org_id: Uuid,
    pub admin: UserRecord,
    pub member: UserRecord,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TrustConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let revocations = Arc::new(MemoryRevocationList::new());
        let clock = Arc::new(ManualClock::default());
        let org_id = Uuid::new_v4();

        let admin = user(org_id, "admin@example.com", Role::Admin);
        let member = user(org_id, "member@example.com", Role::Member);
        store.insert_user(admin.clone());
        store.insert_user(member.clone());

        let state = AppState::new(
            config,
            Stores::in_memory(store.clone()),
            revocations.clone(),
            clock.clone(),
        );
        let router = build_router(state.clone());

        Self {
            router,
            state,
            store,
            revocations,
            clock,
            org_id,
            admin,
            member,
        }
    }

    pub fn add_user(&self, email: &str, role: Role) -> UserRecord {
        let record = user(self.org_id, email, role);
        self.store.insert_user(record.clone());
        record
    }

    /// Access token as the upstream auth layer would issue it.
    pub fn access_token(&self, user: &UserRecord, session_id: &str) -> String {
        let now = self.clock.now();
        self.state
            .tokens
            .issue_access_token(&AccessTokenClaims {
                sub: user.user_id.to_string(),
                email: user.email.clone(),
                role: user.role.as_str().to_string(),
                org_id: user.org_id.to_string(),
                sid: session_id.to_string(),
                iat: now.timestamp(),
                exp: (now + Duration::hours(1)).timestamp(),
            })
            .expect("Failed to issue access token")
    }

    pub async fn mark_strong_auth(&self, user: &UserRecord, session_id: &str) {
        let principal = trust_service::models::Principal::new(
            user.user_id,
            user.email.clone(),
            user.role,
            user.org_id,
        )
        .with_session(session_id);
        self.state
            .reauth
            .mark_strong_auth(&principal, StrongFactor::Password, None)
            .await
            .expect("Failed to mark strong auth");
    }

    /// Records a session row synchronously (the middleware does it in the background).
    pub async fn seed_session(&self, user: &UserRecord, session_id: &str, user_agent: &str) {
        self.state
            .sessions
            .touch(DeviceSighting {
                session_id: session_id.to_string(),
                user_id: user.user_id,
                org_id: user.org_id,
                ip: Some("198.51.100.4".to_string()),
                user_agent: Some(user_agent.to_string()),
            })
            .await;
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");
        self.send(request).await
    }

    /// Bodyless request arriving from `peer`, optionally through a proxy header.
    pub async fn request_from(
        &self,
        method: Method,
        uri: &str,
        token: &str,
        peer: SocketAddr,
        forwarded_for: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .extension(ConnectInfo(peer));
        if let Some(forwarded_for) = forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded_for);
        }
        let request = builder.body(Body::empty()).expect("Failed to build request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn start_impersonation(&self, actor_token: &str, target: &UserRecord) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            "/impersonation/start",
            Some(actor_token),
            Some(serde_json::json!({
                "target_user_id": target.user_id,
                "business_reason": BUSINESS_REASON,
            })),
        )
        .await
    }
}

pub fn user(org_id: Uuid, email: &str, role: Role) -> UserRecord {
    UserRecord {
        user_id: Uuid::new_v4(),
        org_id,
        email: email.to_string(),
        role,
    }
}

