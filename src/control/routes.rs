use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::supervisor::Supervisor;

/// Application state for the control routes, cheap to clone (one `Arc`).
#[derive(Clone)]
pub struct ControlAppState {
    pub supervisor: Arc<Supervisor>,
}

pub fn control_router(supervisor: Arc<Supervisor>) -> Router {
    let state = ControlAppState { supervisor };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/killswitch", post(killswitch))
        .route("/start_on_boot", post(start_on_boot))
        .route("/payments", post(payments))
        .route("/exit", post(exit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ActionError(String);

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": self.0 })),
        )
            .into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn metrics(State(state): State<ControlAppState>) -> impl IntoResponse {
    let body = state.supervisor.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn status(State(state): State<ControlAppState>) -> Json<Value> {
    let supervisor = &state.supervisor;
    Json(json!({
        "phase": supervisor.phase(),
        "pool_event": supervisor.pool_event(),
        "connection_event": supervisor.connection_event(),
        "desired_connected": supervisor.desired_connected(),
        "killswitch_enabled": supervisor.killswitch_enabled(),
        "start_on_boot": supervisor.start_on_boot_enabled().await,
    }))
}

async fn logs(State(state): State<ControlAppState>) -> Json<Value> {
    Json(json!({ "logs": state.supervisor.snapshot_logs(80) }))
}

async fn start(State(state): State<ControlAppState>) -> Json<Value> {
    state.supervisor.start();
    Json(json!({ "ok": true }))
}

async fn stop(State(state): State<ControlAppState>) -> Json<Value> {
    state.supervisor.stop().await;
    Json(json!({ "ok": true }))
}

async fn restart(State(state): State<ControlAppState>) -> Json<Value> {
    state.supervisor.restart().await;
    Json(json!({ "ok": true }))
}

fn default_killswitch_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct KillswitchRequest {
    #[serde(default = "default_killswitch_enabled")]
    enabled: bool,
}

impl Default for KillswitchRequest {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Parse a JSON object body that may be absent entirely (no
/// `content-type`, empty body, or unparseable) — the bodyless case
/// falls back to `T::default()` the same way a bodyless `/start` or
/// `/stop` just runs with no input. `Json<T>` can't be used directly
/// here since axum rejects a missing `content-type`/empty body at the
/// extractor layer before the handler ever sees it.
fn parse_optional_body<T: serde::de::DeserializeOwned + Default>(bytes: &Bytes) -> T {
    if bytes.is_empty() {
        return T::default();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

async fn killswitch(State(state): State<ControlAppState>, body: Bytes) -> Json<Value> {
    let request: KillswitchRequest = parse_optional_body(&body);
    state.supervisor.set_killswitch(request.enabled);
    Json(json!({ "ok": true, "killswitch_enabled": request.enabled }))
}

#[derive(Debug, Deserialize, Default)]
struct StartOnBootRequest {
    #[serde(default)]
    enabled: bool,
}

async fn start_on_boot(State(state): State<ControlAppState>, body: Bytes) -> Json<Value> {
    let request: StartOnBootRequest = parse_optional_body(&body);
    state.supervisor.set_start_on_boot(request.enabled).await;
    Json(json!({ "ok": true, "start_on_boot": request.enabled }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PaymentsAction {
    SetToken { token: String },
    BeginCheckout { user_id: String },
    PollCheckout { session_id: String },
}

async fn payments(
    State(state): State<ControlAppState>,
    Json(body): Json<PaymentsAction>,
) -> Result<Json<Value>, ActionError> {
    let supervisor = &state.supervisor;
    match body {
        PaymentsAction::SetToken { token } => {
            supervisor.set_token(Some(token));
            Ok(Json(json!({ "ok": true })))
        }
        PaymentsAction::BeginCheckout { user_id } => supervisor
            .payment
            .begin_checkout(&user_id)
            .await
            .map(Json)
            .map_err(|err| {
                warn!(error = %err, "begin_checkout failed");
                ActionError(err.to_string())
            }),
        PaymentsAction::PollCheckout { session_id } => supervisor
            .payment
            .poll_checkout(&session_id)
            .await
            .map(Json)
            .map_err(|err| {
                warn!(error = %err, "poll_checkout failed");
                ActionError(err.to_string())
            }),
    }
}

async fn exit(State(state): State<ControlAppState>) -> Json<Value> {
    state.supervisor.exit().await;
    Json(json!({ "ok": true }))
}
