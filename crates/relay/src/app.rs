use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::{
    api,
    config::{ConnectionSettings, RelayConfig},
    cors::cors_layer,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    metrics,
    rooms::{NotificationDispatcher, RoomRegistry},
    store::ChatStore,
    ws,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared state behind every route and background task.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub dispatcher: NotificationDispatcher,
    pub store: Arc<ChatStore>,
    pub connection_settings: ConnectionSettings,
}

impl AppState {
    pub fn new(connection_settings: ConnectionSettings, send_timeout: Duration) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = NotificationDispatcher::new(Arc::clone(&registry), send_timeout);
        Self { registry, dispatcher, store: Arc::new(ChatStore::new()), connection_settings }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.connection, config.send_timeout)
    }
}

pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let AppState { registry, dispatcher, store, connection_settings } = state;

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .merge(ws::router(registry, connection_settings))
            .merge(api::router(store, dispatcher)),
    )
    .layer(cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::global().render_prometheus(),
    )
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
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
