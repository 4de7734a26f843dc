use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use courier_engine::Coordinator;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::jobs::NodeMetrics;
use crate::logger::LogBuffer;

#[derive(Clone)]
pub struct NodeAppState {
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<NodeMetrics>,
    pub log_buffer: Arc<LogBuffer>,
}

pub fn build_router(state: NodeAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/pacing", get(pacing))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<NodeAppState>) -> impl IntoResponse {
    metrics_body(&state.metrics)
}

fn metrics_body(metrics: &NodeMetrics) -> String {
    format!(
        "courier_dispatched_total {}\ncourier_claims_expired_total {}\ncourier_receipts_expired_total {}\ncourier_pulls_sent_total {}\ncourier_inbound_envelopes_total {}\ncourier_job_errors_total {}\ncourier_spool_send_ok {}\ncourier_spool_send_err {}\n",
        metrics.dispatched.load(Ordering::Relaxed),
        metrics.claims_expired.load(Ordering::Relaxed),
        metrics.receipts_expired.load(Ordering::Relaxed),
        metrics.pulls_sent.load(Ordering::Relaxed),
        metrics.inbound_envelopes.load(Ordering::Relaxed),
        metrics.job_errors.load(Ordering::Relaxed),
        metrics.spool_send_ok.load(Ordering::Relaxed),
        metrics.spool_send_err.load(Ordering::Relaxed),
    )
}

async fn pacing(State(state): State<NodeAppState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "responders": state.coordinator.pacing().snapshot() }))
}

async fn status(State(state): State<NodeAppState>) -> impl IntoResponse {
    let coordinator = Arc::clone(&state.coordinator);
    let counts = tokio::task::spawn_blocking(move || coordinator.store().status_counts()).await;
    match counts {
        Ok(Ok(counts)) => {
            let by_status: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), json!(count)))
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "node_id": state.coordinator.config().node_id.as_str(),
                    "messages": by_status,
                })),
            )
        }
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": err.to_string() })),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": err.to_string() })),
        ),
    }
}

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
    message_id: Option<String>,
}

async fn logs(
    State(state): State<NodeAppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let records = match query.message_id.as_deref() {
        Some(id) => state.log_buffer.for_message(id, limit),
        None => state.log_buffer.recent(limit),
    };
    Json(json!({
        "ok": true,
        "evicted": state.log_buffer.evicted(),
        "logs": records,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::metrics_body;
    use crate::jobs::NodeMetrics;

    #[test]
    fn metrics_body_lists_every_counter() {
        let metrics = NodeMetrics::default();
        metrics.dispatched.store(3, Ordering::Relaxed);
        metrics.job_errors.store(1, Ordering::Relaxed);
        let body = metrics_body(&metrics);
        assert!(body.contains("courier_dispatched_total 3\n"));
        assert!(body.contains("courier_job_errors_total 1\n"));
        assert_eq!(body.lines().count(), 8);
    }
}
