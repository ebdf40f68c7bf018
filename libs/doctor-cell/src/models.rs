use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Uuid,
    pub full_name: String,
    pub specialty: String,
    pub qualification: Option<String>,
    pub years_experience: Option<i32>,
    /// Constant multiplier for queue wait estimation.
    pub avg_consult_minutes: i32,
    /// Cached count of waiting + re-enter entries, maintained by the queue engine.
    pub current_queue_count: i32,
    /// Gate on accepting new queue joins.
    pub available: bool,
    /// While frozen, terminating the active entry does not promote a successor.
    pub queue_frozen: bool,
    /// Per-doctor monotonic token counter. Allocation is compare-and-increment.
    pub next_token_number: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorSearchFilters {
    pub specialty: Option<String>,
    pub available_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetAvailabilityRequest {
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetAvailabilityResponse {
    pub doctor_id: Uuid,
    pub available: bool,
    pub message: String,
}
