//! Operator control surface: liveness and detail endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use shiplog_core::health::HealthSnapshot;
use shiplog_core::pipeline::QueueSender;
use shiplog_core::upload::{DeadLetterInventory, Uploader};
use shiplog_core::watch::FileCatalog;
use shiplog_core::AgentHealth;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<AgentHealth>,
    pub catalog: Arc<FileCatalog>,
    pub queue: QueueSender,
    pub uploader: Arc<Uploader>,
    pub dead_letter_inventory: DeadLetterInventory,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detail", get(health_detail))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.snapshot().healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

#[derive(Debug, Serialize)]
struct HealthDetail {
    #[serde(flatten)]
    snapshot: HealthSnapshot,
    connection_state: String,
    queue_depth_now: usize,
    file_states: BTreeMap<&'static str, usize>,
    dead_letters_at_startup: DeadLetterInventory,
    uptime_secs: i64,
}

async fn health_detail(State(state): State<AppState>) -> Json<HealthDetail> {
    Json(HealthDetail {
        snapshot: state.health.snapshot(),
        connection_state: format!("{:?}", state.uploader.state()),
        queue_depth_now: state.queue.depth(),
        file_states: state.catalog.state_counts(),
        dead_letters_at_startup: state.dead_letter_inventory,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use shiplog_core::RetryPolicy;
    use shiplog_core::clock::SystemClock;
    use shiplog_core::pipeline::batch_queue;
    use shiplog_core::upload::{DeadLetterInventory, MemoryObjectStore, ObjectStoreClient};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state() -> AppState {
        let health = Arc::new(AgentHealth::new());
        let (queue, _rx) = batch_queue(16);
        let uploader = Arc::new(Uploader::new(
            Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStoreClient>,
            "logs".to_string(),
            "press-07".to_string(),
            RetryPolicy {
                max_attempts: 1,
                initial: Duration::from_millis(1),
                max: Duration::from_millis(1),
                multiplier: 2.0,
            },
            RetryPolicy::reconnect(0.001, 0.01),
            Arc::clone(&health),
            Arc::new(SystemClock),
            CancellationToken::new(),
        ));
        AppState {
            health,
            catalog: Arc::new(FileCatalog::new(16)),
            queue,
            uploader,
            dead_letter_inventory: DeadLetterInventory::default(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn liveness_is_ok_when_no_component_failed() {
        let response = router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn detail_reports_connection_and_counters() {
        let response = router(state())
            .oneshot(
                Request::builder()
                    .uri("/health/detail")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let detail: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(detail["connection_state"], "Disconnected");
        assert_eq!(detail["queue_depth_now"], 0);
        assert_eq!(detail["healthy"], true);
    }
}
