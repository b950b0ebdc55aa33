//! Liveness endpoint for external uptime monitors.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::info;

use crate::metrics::{CycleMetrics, MetricsSnapshot};

/// Shared state for health routes.
#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<CycleMetrics>,
    /// Wakes the scheduler for an out-of-band cycle.
    pub trigger: Arc<Notify>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

/// GET|HEAD / and /health
async fn get_health(State(state): State<HealthState>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        metrics: state.metrics.snapshot(),
    })
}

/// POST /check
async fn post_check(State(state): State<HealthState>) -> impl IntoResponse {
    info!("Manual check requested over HTTP");
    state.trigger.notify_one();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "check scheduled"})),
    )
}

/// Build the health routes. `get` routes also answer HEAD.
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/", get(get_health))
        .route("/health", get(get_health))
        .route("/check", post(post_check))
        .with_state(state)
}

/// Serve the health routes on `port` until `shutdown` turns true.
pub async fn serve(
    port: u16,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health endpoint listening");
    axum::serve(listener, health_routes(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    /// Start the routes on a random port, return the base URL.
    async fn start_server(state: HealthState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, health_routes(state)).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn state() -> HealthState {
        HealthState {
            metrics: Arc::new(CycleMetrics::new()),
            trigger: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn health_reports_metrics() {
        let state = state();
        state.metrics.add_discovered(2);
        state.metrics.record_forwarded();
        let base = start_server(state).await;

        for path in ["/", "/health"] {
            let resp = reqwest::get(format!("{base}{path}")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let json: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(json["status"], "ok");
            assert_eq!(json["discovered"], 2);
            assert_eq!(json["forwarded"], 1);
            assert!(json["uptime_secs"].is_u64());
            assert!(json["last_check"].is_null());
        }
    }

    #[tokio::test]
    async fn head_is_answered_without_body() {
        let base = start_server(state()).await;
        let resp = reqwest::Client::new()
            .head(format!("{base}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn post_check_wakes_scheduler() {
        let state = state();
        let trigger = state.trigger.clone();
        let base = start_server(state).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/check"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        // The stored permit completes immediately.
        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .expect("trigger was not notified");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let base = start_server(state()).await;
        let resp = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        // Port 0: any free port.
        let handle = tokio::spawn(serve(0, state(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
