use std::sync::Arc;

use axum::{routing::get, Router};

use doctor_cell::router::doctor_routes;
use queue_cell::router::queue_routes;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "MedQ API is running!" }))
        .nest("/doctors", doctor_routes(state.clone()))
        .nest("/queue", queue_routes(state.clone()))
}
