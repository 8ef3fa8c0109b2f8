//! Webhook endpoint for push notifications
//!
//! # Routes
//!
//! - `POST /notifications` - Channel delivery; runs the configured pair
//! - `GET /health` - Liveness and watcher state
//! - `GET /metrics` - Prometheus text format
//!
//! The provider sends a `sync` handshake when a channel is created; it is
//! acknowledged without running a sync. Every other delivery answers 200
//! `Finished` on success and 500 with the error text on failure, so the provider
//! sees failed runs.

use super::metrics;
use crate::service::MirrorService;
use crate::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Header carrying the kind of channel delivery
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

/// Header carrying the id of the delivering channel
pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";

pub struct WebhookServer {
    service: Arc<MirrorService>,
}

impl WebhookServer {
    pub fn new(service: Arc<MirrorService>) -> Self {
        Self { service }
    }

    pub fn router(service: Arc<MirrorService>) -> Router {
        Router::new()
            .route("/notifications", post(notification))
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .with_state(service)
    }

    /// Bind `addr` and serve until the task is dropped
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = addr, "Webhook server listening");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, Self::router(self.service)).await?;
        Ok(())
    }
}

async fn notification(
    State(service): State<Arc<MirrorService>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let resource_state = headers
        .get(RESOURCE_STATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let channel_id = headers
        .get(CHANNEL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if resource_state == "sync" {
        tracing::info!(channel_id, "Channel handshake received");
        return (StatusCode::OK, "OK".to_string());
    }

    tracing::debug!(channel_id, resource_state, "Notification received");
    match service.sync_configured().await {
        Ok(_) => (StatusCode::OK, "Finished".to_string()),
        Err(e) => {
            tracing::error!(error = %e, "Notification sync failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health(State(service): State<Arc<MirrorService>>) -> impl IntoResponse {
    let watcher = match service.subscriptions().state() {
        Ok(state) => serde_json::to_value(state).unwrap_or_default(),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Json(serde_json::json!({ "status": "ok", "watcher": watcher }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{Event, InMemoryCalendar};
    use crate::journal::JsonlSink;
    use crate::lock::TriggerLock;
    use crate::scheduler::LocalScheduler;
    use crate::store::MemoryTokenStore;
    use crate::subscription::WatcherSettings;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn create_test_service(dir: &TempDir) -> (Arc<InMemoryCalendar>, Arc<MirrorService>) {
        let calendar = Arc::new(InMemoryCalendar::new());
        let service = Arc::new(MirrorService::new(
            calendar.clone(),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(LocalScheduler::new()),
            Arc::new(JsonlSink::new(dir.path().join("journal.jsonl"))),
            Arc::new(TriggerLock::default()),
        ));
        (calendar, service)
    }

    fn notify(state: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/notifications")
            .header("X-Goog-Resource-State", state)
            .header("X-Goog-Channel-ID", "c1")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_notification_runs_sync() {
        let dir = TempDir::new().unwrap();
        let (calendar, service) = create_test_service(&dir);
        calendar.insert("src", Event::new("e1"));
        service
            .subscriptions()
            .update_settings(&WatcherSettings::new("src", "dst"))
            .unwrap();

        let response = WebhookServer::router(service)
            .oneshot(notify("exists"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Finished");
        assert!(calendar.event("dst", "e1").is_some());
    }

    #[tokio::test]
    async fn test_handshake_does_not_sync() {
        let dir = TempDir::new().unwrap();
        let (calendar, service) = create_test_service(&dir);
        calendar.insert("src", Event::new("e1"));
        service
            .subscriptions()
            .update_settings(&WatcherSettings::new("src", "dst"))
            .unwrap();

        let response = WebhookServer::router(service)
            .oneshot(notify("sync"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(calendar.list_queries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sync_is_server_error() {
        let dir = TempDir::new().unwrap();
        let (_, service) = create_test_service(&dir);

        let response = WebhookServer::router(service)
            .oneshot(notify("exists"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("not configured"));
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let dir = TempDir::new().unwrap();
        let (_, service) = create_test_service(&dir);
        let app = WebhookServer::router(service);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("inactive"));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
