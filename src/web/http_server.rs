//! HTTP server for health checks, live stats and benchmark control
//!
//! Every handler reads or drives the shared [`Controller`].

use crate::controller::Controller;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Routes of the status API
pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/benchmark", get(benchmark_handler))
        .route("/benchmark/start", post(benchmark_start_handler))
        .route("/benchmark/stop", post(benchmark_stop_handler))
        .route("/mode", get(mode_handler).post(set_mode_handler))
        .with_state(controller)
}

/// Serve the status API until the listener fails
pub async fn run_http_server(
    host: &str,
    port: u16,
    controller: Arc<Controller>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Status API listening on http://{}", addr);

    axum::serve(listener, router(controller))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Health check handler
async fn health_handler(State(controller): State<Arc<Controller>>) -> Response {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": controller.uptime().as_secs_f64(),
        "link_state": controller.negotiator().state(),
        "mode": controller.mode(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn stats_handler(State(controller): State<Arc<Controller>>) -> Response {
    Json(controller.status()).into_response()
}

/// Last finished benchmark export
async fn benchmark_handler(State(controller): State<Arc<Controller>>) -> Response {
    match controller.benchmark_report() {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "no benchmark report",
                "benchmarking": controller.is_benchmarking(),
            })),
        )
            .into_response(),
    }
}

async fn benchmark_start_handler(State(controller): State<Arc<Controller>>) -> Response {
    controller.start_benchmark();
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "mode": controller.mode(),
            "window_ms": controller.config().benchmark.window_ms,
        })),
    )
        .into_response()
}

async fn benchmark_stop_handler(State(controller): State<Arc<Controller>>) -> Response {
    match controller.stop_benchmark() {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "no benchmark running" })),
        )
            .into_response(),
    }
}

async fn mode_handler(State(controller): State<Arc<Controller>>) -> Response {
    Json(json!({ "mode": controller.mode() })).into_response()
}

/// Body: `{"mode": "local" | "remote"}`
async fn set_mode_handler(State(controller): State<Arc<Controller>>, body: String) -> Response {
    if !controller.settings().apply_settings_json(&body) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "expected {\"mode\": \"local\" | \"remote\"}" })),
        )
            .into_response();
    }
    Json(json!({ "mode": controller.mode() })).into_response()
}
