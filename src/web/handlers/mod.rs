use axum::Router;
use std::sync::Arc;
use crate::AppContext;

pub mod control;
pub mod decoder;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .merge(decoder::decoder_router(ctx.lifecycle.clone()))
        .merge(control::control_router(ctx))
}
