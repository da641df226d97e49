//! HTTP surface of the proxy.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use http::{HeaderName, StatusCode};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::field::Empty;

use crate::admission::AdmissionRequest;
use crate::config::ServerConfig;
use crate::error::{ConfigError, ProxyError};
use crate::orchestrator::{IncomingRequest, Operation, Proxy, ProxyResponse};

pub const SERVICE_NAME: &str = "azproxy";

const PROXIED_PATHS: [&str; 6] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/chat/completions",
    "/completions",
    "/embeddings",
];

#[derive(Clone)]
struct AppState {
    proxy: Proxy,
    max_body_bytes: usize,
}

/// Build the router with its middleware stack.
///
/// Runtime order, outermost first: `SetRequestId` → `PropagateRequestId` →
/// Trace → `BodyLimit` → CORS → handlers.
///
/// # Errors
/// An unusable CORS configuration.
pub fn router(proxy: Proxy, server: &ServerConfig) -> Result<Router, ConfigError> {
    let state = AppState {
        proxy,
        max_body_bytes: server.max_body_bytes,
    };

    let mut router = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/models", get(models));
    for path in PROXIED_PATHS {
        router = router.route(path, post(forward));
    }
    let mut router = router.with_state(state);

    if server.cors.enabled {
        router = router.layer(crate::cors::build_cors_layer(&server.cors)?);
    }

    router = router
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(DefaultBodyLimit::max(server.max_body_bytes));

    router = apply_trace_layer(router);

    let x_request_id = HeaderName::from_static("x-request-id");
    router = router
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    Ok(router)
}

fn apply_trace_layer(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &http::Request<Body>| {
                let rid = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("n/a");
                tracing::info_span!(
                    "http_request",
                    method = %req.method(),
                    path = %req.uri().path(),
                    request_id = %rid,
                    status = Empty,
                    latency_ms = Empty,
                )
            })
            .on_response(
                |res: &http::Response<Body>, latency: std::time::Duration, span: &tracing::Span| {
                    span.record("status", res.status().as_u16());
                    span.record(
                        "latency_ms",
                        u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    );
                },
            ),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": SERVICE_NAME}))
}

async fn service_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "models": "/v1/models",
            "chat_completions": "/v1/chat/completions",
            "completions": "/v1/completions",
            "embeddings": "/v1/embeddings",
        },
    }))
}

async fn models(State(state): State<AppState>, req: Request) -> Response {
    let peer = peer_ip(&req);
    let empty = Bytes::new();
    let admitted = state.proxy.admit(&AdmissionRequest {
        method: req.method(),
        headers: req.headers(),
        peer,
        body: &empty,
    });
    match admitted {
        Ok(()) => Json(state.proxy.models()).into_response(),
        Err(denied) => ProxyError::from(denied).into_response(),
    }
}

async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let Some(operation) = Operation::from_path(req.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let peer = peer_ip(&req);
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, "request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let incoming = IncomingRequest {
        operation,
        method: parts.method,
        headers: parts.headers,
        peer,
        body,
    };
    match state.proxy.handle(incoming).await {
        Ok(response) => into_http_response(response),
        Err(e) => e.into_response(),
    }
}

fn into_http_response(response: ProxyResponse) -> Response {
    match response {
        ProxyResponse::Buffered {
            status,
            headers,
            body,
        } => {
            let mut out = Response::new(Body::from(body));
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            out
        }
        ProxyResponse::Stream(handle) => {
            // Dropping the body drops the receiver, which stops the relay.
            let events = ReceiverStream::new(handle.rx).map(Ok::<_, Infallible>);
            (
                StatusCode::OK,
                [
                    (CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                    (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                    (
                        HeaderName::from_static("x-accel-buffering"),
                        HeaderValue::from_static("no"),
                    ),
                ],
                Body::from_stream(events),
            )
                .into_response()
        }
    }
}

fn peer_ip(req: &Request) -> Option<std::net::IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}
