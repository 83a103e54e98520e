use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::schedule::LifecycleState;
use crate::utils::http::HttpResponse;
use crate::AppContext;

pub fn control_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/stop", get(stop))
        .route("/retry", get(retry))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct Health {
    worker: String,
    processing: bool,
    state: LifecycleState,
    accepting: bool,
}

async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let state = ctx.lifecycle.state();
    let processing = !state.is_idle();
    let message = if processing {
        "Hello I am alive and currently processing a file."
    } else {
        "Hello I am alive and currently NOT processing a file."
    };

    Json(HttpResponse::ok(
        message,
        Health {
            worker: ctx.worker.clone(),
            processing,
            state,
            accepting: ctx.lifecycle.is_accepting(),
        },
    ))
}

/// Stops polling, then answers once the active task has finished.
async fn stop(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Stop requested, no new tasks will be reserved");
    ctx.lifecycle.stop_accepting();
    ctx.lifecycle.wait_idle().await;
    "Processing has finished and will not get new tasks."
}

async fn retry(State(ctx): State<Arc<AppContext>>) -> &'static str {
    info!("Retry requested, no new tasks will be reserved");
    ctx.lifecycle.stop_accepting();
    ctx.lifecycle.request_retry();
    "Retry requested."
}
