use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{DoctorSearchFilters, SetAvailabilityRequest, SetAvailabilityResponse};
use crate::services::doctor::DoctorService;

#[derive(Debug, Deserialize)]
pub struct DoctorListQuery {
    pub specialty: Option<String>,
    pub available_only: Option<bool>,
}

#[axum::debug_handler]
pub async fn list_doctors(
    State(state): State<Arc<AppConfig>>,
    Query(query): Query<DoctorListQuery>,
) -> Result<Json<Value>, AppError> {
    let doctor_service = DoctorService::new(&state);

    let filters = DoctorSearchFilters {
        specialty: query.specialty,
        available_only: query.available_only,
    };

    let doctors = doctor_service
        .list_doctors(filters)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "doctors": doctors,
        "total": doctors.len()
    })))
}

#[axum::debug_handler]
pub async fn get_doctor(
    State(state): State<Arc<AppConfig>>,
    Path(doctor_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let doctor_service = DoctorService::new(&state);

    let doctor = doctor_service
        .get_doctor(&doctor_id, None)
        .await
        .map_err(|_| AppError::NotFound("Doctor not found".to_string()))?;

    Ok(Json(json!(doctor)))
}

/// Staff-only toggle on whether the doctor accepts new queue joins.
#[axum::debug_handler]
pub async fn set_availability(
    State(state): State<Arc<AppConfig>>,
    Extension(user): Extension<User>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<String>,
    Json(request): Json<SetAvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    if !user.is_staff() {
        return Err(AppError::Forbidden(
            "Only staff can change doctor availability".to_string(),
        ));
    }

    let doctor_service = DoctorService::new(&state);

    let doctor = doctor_service
        .set_availability(&doctor_id, request.available, auth.token())
        .await
        .map_err(|e| {
            if e.to_string().contains("not found") {
                AppError::NotFound("Doctor not found".to_string())
            } else {
                AppError::Internal(e.to_string())
            }
        })?;

    let response = SetAvailabilityResponse {
        doctor_id: doctor.id,
        available: doctor.available,
        message: if doctor.available {
            "Doctor is now available".to_string()
        } else {
            "Doctor is now unavailable".to_string()
        },
    };

    Ok(Json(json!(response)))
}
