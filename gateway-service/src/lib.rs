//! Request-security gateway for the multi-tenant storefront platform.
//!
//! The gateway is the ordered interceptor chain in front of the business
//! handlers:
//!
//! ```text
//! cors -> security headers -> request id -> trace -> metrics
//!   -> audit (request snapshot .. response DLP + event emission)
//!     -> ip reputation -> rate tiers -> brute force
//!       -> csrf -> token verification -> admin tier
//!         -> permission / store-access checks -> business handler
//! ```
//!
//! Everything stateful is constructed once in `main` and carried in
//! [`AppState`]; the store backend (Redis or in-memory) is an explicit
//! startup decision, never an ambient global.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use gateway_core::middleware::{
    metrics::metrics_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};

use crate::config::GatewayConfig;
use crate::middleware::TierLimiters;
use crate::services::{
    AccessController, AuditPipeline, AuditSink, BruteForceGuard, CsrfProtection, DlpScanner,
    IpReputationService, MembershipProvider, OperatorNotifier, RevocationStore, TokenAuthority,
};

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<dyn RevocationStore>,
    pub tokens: Arc<TokenAuthority>,
    pub access: AccessController,
    pub brute_force: BruteForceGuard,
    pub reputation: IpReputationService,
    pub audit: Arc<AuditPipeline>,
    pub dlp: DlpScanner,
    pub csrf: CsrfProtection,
    pub notifier: OperatorNotifier,
    pub limiters: TierLimiters,
}

impl AppState {
    /// Assemble the full service graph from its three external
    /// collaborators: the TTL store, the membership directory and the
    /// audit sink.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn RevocationStore>,
        directory: Arc<dyn MembershipProvider>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let tokens = Arc::new(TokenAuthority::new(&config.token, store.clone()));
        let access = AccessController::new(directory);
        let brute_force = BruteForceGuard::new(store.clone(), &config.brute_force);
        let reputation = IpReputationService::new(store.clone(), &config.reputation);
        let audit = Arc::new(AuditPipeline::new(sink, config.audit.buffer_capacity));
        let dlp = DlpScanner::new(config.dlp.enabled);
        let csrf = CsrfProtection::new(store.clone(), &config.csrf);
        let notifier = OperatorNotifier::new(
            config.audit.operator_webhook_url.clone(),
            &config.service_name,
        );
        let limiters = TierLimiters::new(&config.rate_limit);

        Self {
            config,
            store,
            tokens,
            access,
            brute_force,
            reputation,
            audit,
            dlp,
            csrf,
            notifier,
            limiters,
        }
    }
}

/// Wrap a business router in the gateway chain. The business router keeps
/// per-route authorization to itself via the exported middleware
/// factories (`require_permission`, `require_store_access`,
/// `require_self_or_admin`); everything coarser lives here.
pub fn build_router(state: AppState, api: Router<AppState>) -> Router {
    let auth_routes = Router::new()
        .route("/auth/csrf", get(handlers::session::csrf_token))
        .route("/auth/refresh", post(handlers::session::refresh))
        .merge(
            Router::new()
                .route("/auth/logout", post(handlers::session::logout))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::auth_middleware,
                )),
        );

    let protected_api = api
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_rate_limit_middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::csrf_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::session::health_check))
        .merge(auth_routes)
        .merge(protected_api)
        .with_state(state.clone())
        // Abuse checks, innermost of the globals; each can deny on its own
        // before any identity work happens.
        .layer(from_fn_with_state(
            state.clone(),
            middleware::brute_force_middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::ip_reputation_middleware,
        ))
        // Audit wraps the whole chain so denials get recorded too.
        .layer(from_fn_with_state(state.clone(), middleware::audit_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state))
}

fn cors_layer(state: &AppState) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .map(|origin| {
                    origin
                        .parse::<axum::http::HeaderValue>()
                        .unwrap_or_else(|e| {
                            tracing::error!(
                                "Invalid CORS origin '{}': {}. Using fallback.",
                                origin,
                                e
                            );
                            axum::http::HeaderValue::from_static("http://localhost:3000")
                        })
                })
                .collect::<Vec<axum::http::HeaderValue>>(),
        )
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::HeaderName::from_static("x-csrf-token"),
            axum::http::header::HeaderName::from_static("x-request-id"),
        ])
}
