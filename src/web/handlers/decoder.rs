use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use tracing::{info, warn};

use crate::schedule::LifecycleHandle;
use crate::workdir::is_safe_filename;

pub fn decoder_router(lifecycle: LifecycleHandle) -> Router {
    Router::new()
        .route("/status", post(status))
        .route("/error", post(error))
        .with_state(lifecycle)
}

#[derive(Debug, Deserialize)]
struct StatusNotification {
    filename: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorNotification {
    status: String,
}

// both endpoints acknowledge at once; the transition happens on the lifecycle task
async fn status(
    State(lifecycle): State<LifecycleHandle>,
    Json(body): Json<StatusNotification>,
) -> (StatusCode, &'static str) {
    if !is_safe_filename(&body.filename) {
        warn!("DECODER: rejected status for file name {:?}", body.filename);
        return (StatusCode::BAD_REQUEST, "Invalid filename");
    }
    lifecycle.decoder_status(body.filename, body.status);
    (StatusCode::OK, "Status received")
}

async fn error(
    State(lifecycle): State<LifecycleHandle>,
    Json(body): Json<ErrorNotification>,
) -> &'static str {
    info!("DECODER: error notification {:?}", body.status);
    lifecycle.decoder_error(body.status);
    "Error received."
}
