//! Dashboard event stream (spec.md §4.7, §6 `GET /api/errors/stream`).
//!
//! Grounded on the teacher's `Sse<impl Stream<...>>` / `KeepAlive` shape,
//! rewired from one global broadcast subscription to a `PushHub` client:
//! each connection gets its own bounded channel so drops are attributable
//! to that one subscriber instead of racing every other dashboard tab.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures_util::stream::Stream;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::errors::HttpError;
use crate::pushhub::{self, PushHub};
use crate::state::AppState;

const SESSION_COOKIE_NAME: &str = "errly_session";

fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    crate::auth::extract_session_cookie(cookie_header, SESSION_COOKIE_NAME)
}

pub async fn stream_errors(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(raw_token) = session_token(&headers) else {
        return HttpError::Unauthorized("missing session cookie".to_owned()).into_response();
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    if !crate::auth::validate_session(&state.pool, &raw_token, now_ms).await {
        return HttpError::Unauthorized("session expired".to_owned()).into_response();
    }

    let Some(subscriber) = state.hub.subscribe(raw_token).await else {
        pushhub::warn_subscription_rejected("at capacity");
        return HttpError::Unavailable("too many dashboard subscribers".to_owned()).into_response();
    };

    let hub: std::sync::Arc<PushHub> = state.hub.clone();
    let client_id = subscriber.client_id;
    let stream = ReceiverStream::new(subscriber.rx)
        .map(|event| serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned()))
        .map(|json| Ok::<_, Infallible>(Event::default().data(json)));

    // `PushHub::unsubscribe` runs when the stream (and thus the connection)
    // is dropped, since `tokio_stream::wrappers::ReceiverStream` carries no
    // drop hook of its own — axum drops the whole `Sse` body on disconnect,
    // which drops this wrapping stream too.
    let stream = CleanupOnDrop { inner: stream, hub, client_id };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive"))
        .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    response.headers_mut().insert(
        header::HeaderName::from_static("x-accel-buffering"),
        header::HeaderValue::from_static("no"),
    );
    response
}

/// Wraps the event stream so the client is removed from the hub as soon as
/// the subscriber disconnects, rather than lingering until the next publish
/// notices the channel is closed.
struct CleanupOnDrop<S> {
    inner: S,
    hub: std::sync::Arc<PushHub>,
    client_id: uuid::Uuid,
}

impl<S: Stream + Unpin> Stream for CleanupOnDrop<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for CleanupOnDrop<S> {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            hub.unsubscribe(client_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::{HeaderValue, StatusCode};

    async fn test_state(max_sse_clients: usize) -> AppState {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let config = Config {
            password: "at-least-8-chars".to_owned(),
            railway_api_token: None,
            railway_project_id: None,
            railway_environment_name: None,
            railway_service_id: None,
            port: 3000,
            db_path: "./data/errly.db".to_owned(),
            max_subscriptions: 50,
            max_sse_clients,
            node_env: "test".to_owned(),
        };
        AppState::new(pool, config)
    }

    #[tokio::test]
    async fn rejects_missing_session_cookie() {
        let state = test_state(10).await;
        let response = stream_errors(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_unknown_session_token() {
        let state = test_state(10).await;
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("errly_session=bogus"));
        let response = stream_errors(State(state), headers).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_valid_session_and_sets_sse_headers() {
        let state = test_state(10).await;
        crate::store::sessions::create(&state.pool, "good-token", i64::MAX)
            .await
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("errly_session=good-token"));
        let response = stream_errors(State(state), headers).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
    }

    #[tokio::test]
    async fn rejects_when_hub_is_at_capacity() {
        let state = test_state(0).await;
        crate::store::sessions::create(&state.pool, "good-token", i64::MAX)
            .await
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("errly_session=good-token"));
        let response = stream_errors(State(state), headers).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
