use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use doctor_cell::models::Doctor;

/// Queue entry lifecycle. Wire strings match the `doctor_queue.status`
/// column values; anything else is rejected at deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "re-enter")]
    ReEnter,
    #[serde(rename = "served")]
    Served,
    #[serde(rename = "no-show")]
    NoShow,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Active => "active",
            QueueStatus::ReEnter => "re-enter",
            QueueStatus::Served => "served",
            QueueStatus::NoShow => "no-show",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// Queued entries hold a position and count toward the doctor's queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, QueueStatus::Waiting | QueueStatus::ReEnter)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Served | QueueStatus::NoShow | QueueStatus::Cancelled
        )
    }

    /// Selection tier: re-entered patients outrank normal waiting ones.
    pub fn tier(&self) -> u8 {
        match self {
            QueueStatus::ReEnter => 0,
            QueueStatus::Waiting => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One patient's slot in one doctor's queue (`doctor_queue` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: String,
    pub patient_name: String,
    /// Per-doctor monotonic, assigned at creation, never reused.
    pub token_number: i64,
    pub status: QueueStatus,
    /// 1-based rank among queued entries; not meaningful outside
    /// waiting/re-enter.
    pub position: Option<i32>,
    pub estimated_wait_minutes: Option<i32>,
    /// Optional appointment time; drives lazy no-show detection.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

/// Kind of staff action recorded in the undo journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueActionKind {
    #[serde(rename = "served")]
    Served,
    #[serde(rename = "no-show")]
    NoShow,
}

impl QueueActionKind {
    /// Terminal status the action left its entry in.
    pub fn terminal_status(&self) -> QueueStatus {
        match self {
            QueueActionKind::Served => QueueStatus::Served,
            QueueActionKind::NoShow => QueueStatus::NoShow,
        }
    }
}

/// Undo journal record (`queue_actions` row). Only the most recent
/// non-undone action per doctor is reversible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAction {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub action: QueueActionKind,
    pub entry_id: Uuid,
    pub promoted_entry_id: Option<Uuid>,
    pub promoted_prev_status: Option<QueueStatus>,
    pub undone: bool,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// REQUEST / RESPONSE TYPES
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct JoinQueueRequest {
    pub doctor_id: Uuid,
    pub notes: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinQueueResponse {
    pub queue_id: Uuid,
    pub token_number: i64,
    pub position: i32,
    pub estimated_wait_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkNoShowRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelEntryRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServeResponse {
    pub next_active: Option<QueueEntry>,
    pub remaining_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoShowResponse {
    pub remaining_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorQueueSummary {
    pub doctor_id: Uuid,
    pub doctor_name: String,
    pub available: bool,
    pub queue_frozen: bool,
    pub avg_consult_minutes: i32,
    pub total_in_queue: i32,
}

impl DoctorQueueSummary {
    pub fn from_doctor(doctor: &Doctor) -> Self {
        Self {
            doctor_id: doctor.id,
            doctor_name: doctor.full_name.clone(),
            available: doctor.available,
            queue_frozen: doctor.queue_frozen,
            avg_consult_minutes: doctor.avg_consult_minutes,
            total_in_queue: doctor.current_queue_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusResponse {
    pub doctor: DoctorQueueSummary,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoResponse {
    pub undone: bool,
    pub remaining_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FreezeResponse {
    pub doctor_id: Uuid,
    pub queue_frozen: bool,
}

/// Change-feed event published after every committed transition. Carries no
/// diff; subscribers re-fetch the queue and treat each event as a full
/// resync trigger.
#[derive(Debug, Clone, Serialize)]
pub struct QueueUpdate {
    pub doctor_id: Uuid,
    pub remaining_count: i32,
    pub active_entry_id: Option<Uuid>,
    pub emitted_at: DateTime<Utc>,
}
