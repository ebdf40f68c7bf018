use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{CancelEntryRequest, JoinQueueRequest, MarkNoShowRequest};
use crate::services::notify::QueueNotificationService;
use crate::services::transitions::QueueTransitionService;

/// How long an events poll parks before returning empty-handed.
const EVENT_POLL_SECONDS: u64 = 25;

fn ensure_staff_or_queue_doctor(user: &User, doctor_id: Uuid) -> Result<(), AppError> {
    if user.is_staff() {
        return Ok(());
    }
    if user.is_doctor() && user.id == doctor_id.to_string() {
        return Ok(());
    }
    Err(AppError::Forbidden(
        "only staff or the queue's doctor may manage this queue".to_string(),
    ))
}

// ==============================================================================
// PUBLIC HANDLERS (NO AUTHENTICATION REQUIRED)
// ==============================================================================

#[axum::debug_handler]
pub async fn get_queue_status(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let service = QueueTransitionService::new(&state, notifier);

    let status = service.queue_status(doctor_id).await?;

    Ok(Json(json!(status)))
}

/// Long-poll subscription to a doctor's change feed. Returns the next
/// committed transition, or `{"update": null}` once the poll window lapses;
/// either way the caller re-fetches the queue rather than patching state.
#[axum::debug_handler]
pub async fn poll_queue_events(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let service = QueueTransitionService::new(&state, notifier);
    let mut receiver = service.subscribe(doctor_id).await;

    let update = tokio::time::timeout(
        tokio::time::Duration::from_secs(EVENT_POLL_SECONDS),
        receiver.recv(),
    )
    .await;

    match update {
        Ok(Ok(event)) => Ok(Json(json!({ "update": event }))),
        // Lagged or closed channel: the subscriber resyncs by re-fetching.
        Ok(Err(_)) | Err(_) => Ok(Json(json!({ "update": null }))),
    }
}

// ==============================================================================
// PATIENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn join_queue(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<JoinQueueRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Join queue request from user {} for doctor {}", user.id, request.doctor_id);

    let service = QueueTransitionService::new(&state, notifier);

    let response = service.join(&user, &request, auth.token()).await?;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn get_my_status(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<Value>, AppError> {
    let service = QueueTransitionService::new(&state, notifier);

    let entry = service
        .my_status(&user, auth.token())
        .await?
        .ok_or_else(|| AppError::NotFound("no current queue entry".to_string()))?;

    Ok(Json(json!(entry)))
}

#[axum::debug_handler]
pub async fn cancel_entry(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path((doctor_id, entry_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<CancelEntryRequest>,
) -> Result<Json<Value>, AppError> {
    let service = QueueTransitionService::new(&state, notifier);

    let entry = service
        .cancel(&user, doctor_id, entry_id, request.reason, auth.token())
        .await?;

    Ok(Json(json!(entry)))
}

// ==============================================================================
// STAFF / DOCTOR HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn mark_served(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path((doctor_id, entry_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let response = service.mark_served(doctor_id, entry_id, auth.token()).await?;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn mark_no_show(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path((doctor_id, entry_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<MarkNoShowRequest>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let response = service
        .mark_no_show(doctor_id, entry_id, request.reason, auth.token())
        .await?;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn re_enter(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path((doctor_id, entry_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let entry = service.re_enter(doctor_id, entry_id, auth.token()).await?;

    Ok(Json(json!(entry)))
}

#[axum::debug_handler]
pub async fn undo_last(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let response = service.undo_last(doctor_id, auth.token()).await?;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn freeze_queue(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let response = service.freeze(doctor_id, auth.token()).await?;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn resume_queue(
    State(state): State<Arc<AppConfig>>,
    Extension(notifier): Extension<QueueNotificationService>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ensure_staff_or_queue_doctor(&user, doctor_id)?;

    let service = QueueTransitionService::new(&state, notifier);

    let response = service.resume(doctor_id, auth.token()).await?;

    Ok(Json(json!(response)))
}
