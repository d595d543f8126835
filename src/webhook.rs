use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::engine::FlowEngine;
use crate::telegram::Update;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FlowEngine>,
}

pub fn router(engine: Arc<FlowEngine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook/:bot_id", post(handle_webhook))
        .layer(Extension(AppState { engine }))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

/// One inbound platform update. Bodies that do not parse as an update are
/// acknowledged and ignored; a missing bot is 404, a processing failure is
/// 500 with the error description, everything else is `{"ok": true}`.
async fn handle_webhook(
    Path(bot_id): Path<String>,
    Extension(state): Extension<AppState>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let update: Update = serde_json::from_str(&body).unwrap_or_default();
    let correlation = update
        .update_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.engine.handle_update(&bot_id, &update).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(err) if err.is_not_found() => {
            warn!(update = %correlation, "{err}");
            (StatusCode::NOT_FOUND, Json(json!({"error": err.to_string()})))
        }
        Err(err) => {
            error!(update = %correlation, "update processing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
        }
    }
}
