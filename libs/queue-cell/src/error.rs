use thiserror::Error;

use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Doctor is not accepting new queue entries: {0}")]
    DoctorUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::DoctorUnavailable(msg) => AppError::DoctorUnavailable(msg),
            QueueError::NotFound(msg) => AppError::NotFound(msg),
            QueueError::Forbidden(msg) => AppError::Forbidden(msg),
            QueueError::Conflict(msg) => AppError::Conflict(msg),
            QueueError::Validation(msg) => AppError::ValidationError(msg),
            QueueError::Database(msg) => AppError::Database(msg),
        }
    }
}
