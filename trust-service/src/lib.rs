pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use service_core::middleware::{request_id_middleware, REQUEST_ID_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::TrustConfig;
use crate::services::{
    AuditChain, AuditStore, Clock, Database, HealthProbe, ImpersonationManager,
    ImpersonationSettings, ImpersonationStore, InMemoryStore, ReauthGate, ReauthStore,
    RevocationList, SecurityPolicyStore, SessionRegistry, SessionStore, TokenService,
    UserDirectory,
};

/// Storage backends, one per seam.
#[derive(Clone)]
pub struct Stores {
    pub audit: Arc<dyn AuditStore>,
    pub impersonation: Arc<dyn ImpersonationStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub reauth: Arc<dyn ReauthStore>,
    pub policies: Arc<dyn SecurityPolicyStore>,
    pub users: Arc<dyn UserDirectory>,
    pub health: Arc<dyn HealthProbe>,
}

impl Stores {
    pub fn postgres(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            audit: db.clone(),
            impersonation: db.clone(),
            sessions: db.clone(),
            reauth: db.clone(),
            policies: db.clone(),
            users: db.clone(),
            health: db,
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            audit: store.clone(),
            impersonation: store.clone(),
            sessions: store.clone(),
            reauth: store.clone(),
            policies: store.clone(),
            users: store.clone(),
            health: store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TrustConfig>,
    pub clock: Arc<dyn Clock>,
    pub tokens: TokenService,
    pub audit: AuditChain,
    pub impersonation: ImpersonationManager,
    pub reauth: ReauthGate,
    pub sessions: SessionRegistry,
    pub revocations: Arc<dyn RevocationList>,
    pub health: Arc<dyn HealthProbe>,
}

impl AppState {
    pub fn new(
        config: TrustConfig,
        stores: Stores,
        revocations: Arc<dyn RevocationList>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let query_timeout = Duration::from_secs(config.database.query_timeout_secs);
        let tokens = TokenService::new(&config);
        let audit = AuditChain::new(stores.audit, clock.clone(), query_timeout);

        let impersonation = ImpersonationManager::new(
            stores.impersonation,
            stores.users,
            audit.clone(),
            tokens.clone(),
            revocations.clone(),
            clock.clone(),
            ImpersonationSettings::from_config(&config),
        );
        let reauth = ReauthGate::new(
            stores.reauth,
            stores.policies,
            audit.clone(),
            clock.clone(),
            &config,
        );
        let sessions = SessionRegistry::new(
            stores.sessions,
            revocations.clone(),
            audit.clone(),
            clock.clone(),
            &config,
        );

        Self {
            config: Arc::new(config),
            clock,
            tokens,
            audit,
            impersonation,
            reauth,
            sessions,
            revocations,
            health: stores.health,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let audit_routes = Router::new()
        .route("/audit/verify", get(handlers::audit::verify))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_recent_reauth,
        ))
        .route("/audit/entries", get(handlers::audit::entries))
        .route("/audit/search", get(handlers::audit::search))
        .route_layer(from_fn(middleware::require_admin));

    let step_up_routes = Router::new()
        .route(
            "/sessions/revoke-others",
            post(handlers::sessions::revoke_others),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_recent_reauth,
        ));

    let protected = Router::new()
        .route("/impersonation/start", post(handlers::impersonation::start))
        .route(
            "/impersonation/:session_id/end",
            post(handlers::impersonation::end),
        )
        .route("/impersonation/status", get(handlers::impersonation::status))
        .route(
            "/impersonation/sessions",
            get(handlers::impersonation::list_sessions),
        )
        .route("/sessions", get(handlers::sessions::list))
        .route("/sessions/:session_id", delete(handlers::sessions::revoke))
        .route("/reauth/status", get(handlers::reauth::status))
        .merge(step_up_routes)
        .merge(audit_routes)
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Invalid CORS origin skipped");
                None
            }
        })
        .collect();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(protected)
        .with_state(state)
        .layer(from_fn(middleware::tenant_scope_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        )
}
