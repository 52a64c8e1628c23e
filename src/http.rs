use crate::config::SPEEDTEST_COMMAND;
use crate::jobs::{Jobs, LaunchError};
use crate::metrics::Metrics;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub jobs: Arc<Jobs>,
    pub host: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandStatus {
    pub name: String,
    pub running: bool,
    pub admissible: bool,
    pub cooldown_secs: u64,
    pub secs_since_last_start: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiCommands {
    pub host: String,
    pub commands: Vec<CommandStatus>,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/commands", get(commands_handler))
        .route("/disk-usage/:target", get(disk_usage).post(disk_usage))
        .route("/speed-test", get(speed_test).post(speed_test))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn commands_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let gate = state.jobs.runner().gate();
    let lanes = gate.snapshot().into_iter().collect::<HashMap<_, _>>();
    let commands = state
        .jobs
        .command_names()
        .into_iter()
        .map(|name| {
            let lane = lanes.get(&name).copied().unwrap_or_default();
            CommandStatus {
                running: lane.running,
                admissible: gate.check(&name).is_ok(),
                cooldown_secs: gate.cooldown(&name).as_secs(),
                secs_since_last_start: lane.last_started.map(|at| at.elapsed().as_secs()),
                name,
            }
        })
        .collect();
    Json(ApiCommands {
        host: state.host.clone(),
        commands,
    })
}

async fn disk_usage(State(state): State<HttpAppState>, Path(target): Path<String>) -> Response {
    match state.jobs.disk_target(&target) {
        Some(t) => launch(&state.jobs, &t.command()),
        None => not_found(format!("unknown disk target '{target}'")),
    }
}

async fn speed_test(State(state): State<HttpAppState>) -> Response {
    launch(&state.jobs, SPEEDTEST_COMMAND)
}

fn launch(jobs: &Arc<Jobs>, command: &str) -> Response {
    match jobs.admit(command) {
        Ok(admitted) => {
            info!(command = %command, "command triggered over http");
            admitted.spawn();
            (
                StatusCode::ACCEPTED,
                Json(json!({ "message": format!("{command} started") })),
            )
                .into_response()
        }
        Err(LaunchError::Rejected(rejection)) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": rejection.to_string() })),
        )
            .into_response(),
        Err(err @ LaunchError::Unknown(_)) => not_found(err.to_string()),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
