pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod room;
pub mod store;
pub mod validation;
pub mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, warn};

use crate::{
    auth::{gate::AuthorizationGate, gate::EnrollmentSource, jwt::JwtIdentityService},
    config::RelayConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::ChatMetrics,
    room::{RoomRegistry, RoomSettings},
    store::MessageStore,
    validation::MAX_REST_BODY_BYTES,
    ws::ChatContext,
};

/// Wires identity, enrollment, and message storage from configuration.
///
/// With a database URL both the store and the enrollment source live in
/// Postgres; without one everything is held in memory.
pub async fn build_context(config: &RelayConfig) -> anyhow::Result<ChatContext> {
    let identity = Arc::new(
        JwtIdentityService::new(&config.jwt_secret).context("invalid chat JWT secret")?,
    );

    let (store, source) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to create chat database pool")?;
            check_pool_health(&pool).await.context("chat database health check failed")?;
            run_migrations(&pool).await.context("failed to run chat migrations")?;
            (MessageStore::Postgres(pool.clone()), EnrollmentSource::Postgres(pool))
        }
        None => {
            warn!("no database configured, messages and enrollments are kept in memory");
            (MessageStore::memory(), EnrollmentSource::memory())
        }
    };

    let gate = AuthorizationGate::new(source, config.chat.authz_cache_ttl);
    let registry = RoomRegistry::new(store, RoomSettings::from(&config.chat));
    Ok(ChatContext::new(identity, gate, registry, config.chat.clone()))
}

pub fn build_router(
    context: ChatContext,
    metrics: Arc<ChatMetrics>,
    cors_origins: Option<&str>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(Router::new().route("/metrics", get(render_metrics)).with_state(metrics))
            .merge(ws::router(context.clone()))
            .merge(api::router(context)),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<ChatMetrics>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
