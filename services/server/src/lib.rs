pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod grouper;
pub mod http;
pub mod platform_client;
pub mod pushhub;
pub mod retention;
pub mod state;
pub mod store;
pub mod watcher;
pub mod webhook;

pub use state::AppState;

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; style-src 'self'; connect-src 'self'; img-src 'self' data:; font-src 'self'; object-src 'none'; frame-ancestors 'none'; base-uri 'self'; form-action 'self'";

/// spec.md §5 "Cancellation & timeouts": a 30 s hard timeout on every
/// request/response handler, excluding the long-lived SSE stream.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

async fn handle_timeout(_err: tower::BoxError) -> impl IntoResponse {
    (
        StatusCode::REQUEST_TIMEOUT,
        Json(errly_protocol::HttpErrorEnvelope {
            code: "REQUEST_TIMEOUT".to_owned(),
            message: "request exceeded its time budget".to_owned(),
            details: None,
        }),
    )
}

/// Applies spec.md §6's fixed security headers to every response, the way
/// the teacher layers `tower_http::trace::TraceLayer` over the whole router.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(CONTENT_SECURITY_POLICY));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

pub fn build_router(state: AppState) -> Router {
    // The SSE stream is long-lived by design and sits outside the 30 s
    // request timeout; every other route gets it.
    let timed_routes = Router::new()
        .route("/health", get(http::health::health))
        .route("/api/diagnostics", get(http::diagnostics::diagnostics))
        .route("/api/errors", post(http::errors_api::ingest).delete(http::errors_api::delete))
        .route("/api/errors/stats", get(http::errors_api::stats))
        .route("/api/errors/services", get(http::errors_api::services))
        .route("/api/errors/list", get(http::errors_api::list))
        .route("/api/errors/:id", get(http::errors_api::detail))
        .route("/api/errors/:id/related", get(http::errors_api::related))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .layer(TimeoutLayer::new(HTTP_TIMEOUT)),
        );

    let stream_route = Router::new().route("/api/errors/stream", get(http::sse::stream_errors));

    timed_routes
        .merge(stream_route)
        .fallback(fallback_404)
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Html(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>404 – Not Found</title>
  <style>
    * { margin: 0; padding: 0; box-sizing: border-box; }
    body {
      font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif;
      background: #0f1117;
      color: #e1e4e8;
      display: flex;
      align-items: center;
      justify-content: center;
      min-height: 100vh;
    }
    .container { text-align: center; }
    .code {
      font-size: 8rem;
      font-weight: 700;
      letter-spacing: -0.04em;
      line-height: 1;
      background: linear-gradient(135deg, #667eea, #764ba2);
      -webkit-background-clip: text;
      -webkit-text-fill-color: transparent;
    }
    .message {
      margin-top: 0.5rem;
      font-size: 1.25rem;
      color: #8b949e;
    }
  </style>
</head>
<body>
  <div class="container">
    <div class="code">404</div>
    <p class="message">This page doesn't exist.</p>
  </div>
</body>
</html>"#,
        ),
    )
}
