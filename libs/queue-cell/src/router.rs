use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::notify::QueueNotificationService;

pub fn queue_routes(state: Arc<AppConfig>) -> Router {
    // One change-feed hub shared by every handler behind this router.
    let notifier = QueueNotificationService::new();

    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/{doctor_id}/status", get(handlers::get_queue_status))
        .route("/{doctor_id}/events", get(handlers::poll_queue_events));

    // Protected routes (authentication required)
    let protected_routes = Router::new()
        .route("/join", post(handlers::join_queue))
        .route("/me", get(handlers::get_my_status))
        .route("/{doctor_id}/entries/{entry_id}/cancel", post(handlers::cancel_entry))
        .route("/{doctor_id}/entries/{entry_id}/serve", post(handlers::mark_served))
        .route("/{doctor_id}/entries/{entry_id}/no-show", post(handlers::mark_no_show))
        .route("/{doctor_id}/entries/{entry_id}/re-enter", post(handlers::re_enter))
        .route("/{doctor_id}/undo", post(handlers::undo_last))
        .route("/{doctor_id}/freeze", post(handlers::freeze_queue))
        .route("/{doctor_id}/resume", post(handlers::resume_queue))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(Extension(notifier))
        .with_state(state)
}
