// libs/queue-cell/src/services/ledger.rs
//
// Authoritative view of a doctor's queue in the store. All writes go through
// PostgREST with `Prefer: return=representation`; a guarded PATCH that comes
// back empty means the row no longer matched its expected state and the
// whole batch is reported as a conflict for the caller to retry.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use doctor_cell::models::Doctor;
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::QueueError;
use crate::models::{QueueAction, QueueEntry, QueueStatus};
use crate::services::engine::{EntryUpdate, NewAction, QueueSnapshot, TransitionPlan};

pub struct QueueLedgerService {
    supabase: SupabaseClient,
}

fn representation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Prefer", HeaderValue::from_static("return=representation"));
    headers
}

impl QueueLedgerService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    pub async fn get_doctor(
        &self,
        doctor_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<Doctor, QueueError> {
        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::NotFound(format!("doctor {} not found", doctor_id)));
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| QueueError::Database(format!("malformed doctor row: {}", e)))
    }

    pub async fn get_entry(
        &self,
        entry_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<QueueEntry, QueueError> {
        let path = format!("/rest/v1/doctor_queue?id=eq.{}", entry_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::NotFound(format!("queue entry {} not found", entry_id)));
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| QueueError::Database(format!("malformed queue entry: {}", e)))
    }

    /// All non-terminal entries for a doctor, ordered by position. The
    /// active entry carries no position and sorts wherever the store puts
    /// nulls; the engine re-sorts internally, so the order here only serves
    /// the read API.
    pub async fn list_active_queue(
        &self,
        doctor_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let path = format!(
            "/rest/v1/doctor_queue?doctor_id=eq.{}&status=in.(waiting,re-enter,active)&order=position.asc",
            doctor_id
        );
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| QueueError::Database(format!("malformed queue entry: {}", e)))
            })
            .collect()
    }

    /// Doctor row plus non-terminal entries, the engine's working set.
    pub async fn snapshot(
        &self,
        doctor_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<QueueSnapshot, QueueError> {
        let doctor = self.get_doctor(doctor_id, auth_token).await?;
        let entries = self.list_active_queue(doctor_id, auth_token).await?;
        Ok(QueueSnapshot { doctor, entries })
    }

    /// The patient's most recent non-terminal entry, if any.
    pub async fn latest_entry_for_patient(
        &self,
        patient_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let path = format!(
            "/rest/v1/doctor_queue?patient_id=eq.{}&status=in.(waiting,re-enter,active)&order=created_at.desc&limit=1",
            patient_id
        );
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        match result.into_iter().next() {
            Some(row) => serde_json::from_value(row)
                .map(Some)
                .map_err(|e| QueueError::Database(format!("malformed queue entry: {}", e))),
            None => Ok(None),
        }
    }

    /// Display name from the patient's profile row.
    pub async fn get_patient_name(
        &self,
        patient_id: &str,
        auth_token: Option<&str>,
    ) -> Result<String, QueueError> {
        let path = format!("/rest/v1/profiles?id=eq.{}&select=name", patient_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        result
            .first()
            .and_then(|row| row.get("name"))
            .and_then(|name| name.as_str())
            .map(|name| name.to_string())
            .ok_or_else(|| QueueError::NotFound(format!("patient profile {} not found", patient_id)))
    }

    /// Compare-and-increment on the doctor's token counter. Losing the race
    /// is a conflict; the caller retries from a fresh doctor read.
    async fn allocate_token(
        &self,
        doctor: &Doctor,
        auth_token: Option<&str>,
    ) -> Result<i64, QueueError> {
        let token_number = doctor.next_token_number;
        let path = format!(
            "/rest/v1/doctors?id=eq.{}&next_token_number=eq.{}",
            doctor.id, token_number
        );
        let body = json!({
            "next_token_number": token_number + 1,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::Conflict(format!(
                "token counter for doctor {} moved concurrently",
                doctor.id
            )));
        }

        debug!("Allocated token {} for doctor {}", token_number, doctor.id);
        Ok(token_number)
    }

    /// Append a new waiting entry at the tail of the queue.
    pub async fn append(
        &self,
        doctor: &Doctor,
        patient_id: &str,
        patient_name: &str,
        notes: Option<String>,
        scheduled_time: Option<DateTime<Utc>>,
        auth_token: Option<&str>,
    ) -> Result<QueueEntry, QueueError> {
        if !doctor.available {
            return Err(QueueError::DoctorUnavailable(format!(
                "doctor {} is not accepting new queue entries",
                doctor.id
            )));
        }

        let token_number = self.allocate_token(doctor, auth_token).await?;
        let position = doctor.current_queue_count + 1;
        let estimated_wait = position * doctor.avg_consult_minutes;
        let now = Utc::now().to_rfc3339();

        let entry_data = json!({
            "doctor_id": doctor.id,
            "patient_id": patient_id,
            "patient_name": patient_name,
            "token_number": token_number,
            "status": QueueStatus::Waiting.as_str(),
            "position": position,
            "estimated_wait_minutes": estimated_wait,
            "scheduled_time": scheduled_time.map(|t| t.to_rfc3339()),
            "notes": notes,
            "created_at": now,
            "updated_at": now,
        });

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/doctor_queue",
                auth_token,
                Some(entry_data),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::Database("failed to insert queue entry".to_string()));
        }

        let entry: QueueEntry = serde_json::from_value(result[0].clone())
            .map_err(|e| QueueError::Database(format!("malformed queue entry: {}", e)))?;

        self.update_queue_count(doctor.id, position, auth_token).await?;

        Ok(entry)
    }

    fn update_body(update: &EntryUpdate, now: DateTime<Utc>) -> Value {
        let mut body = serde_json::Map::new();
        if update.clear_queue_fields {
            body.insert("position".to_string(), Value::Null);
            body.insert("estimated_wait_minutes".to_string(), Value::Null);
        }
        if let Some(status) = update.set_status {
            body.insert("status".to_string(), json!(status.as_str()));
        }
        if let Some(position) = update.set_position {
            body.insert("position".to_string(), json!(position));
        }
        if let Some(estimate) = update.set_estimated_wait {
            body.insert("estimated_wait_minutes".to_string(), json!(estimate));
        }
        if let Some(completed_at) = update.set_completed_at {
            body.insert("completed_at".to_string(), json!(completed_at.to_rfc3339()));
        }
        if update.clear_completion {
            body.insert("completed_at".to_string(), Value::Null);
            body.insert("cancellation_reason".to_string(), Value::Null);
        }
        if let Some(ref reason) = update.set_cancellation_reason {
            body.insert("cancellation_reason".to_string(), json!(reason));
        }
        body.insert("updated_at".to_string(), json!(now.to_rfc3339()));
        Value::Object(body)
    }

    /// Write one guarded row update. The status filter is the optimistic
    /// check: an empty representation means the row moved underneath us.
    async fn write_update(
        &self,
        update: &EntryUpdate,
        now: DateTime<Utc>,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        let path = format!(
            "/rest/v1/doctor_queue?id=eq.{}&status=eq.{}",
            update.entry_id,
            update.expected_status.as_str()
        );

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(Self::update_body(update, now)),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::Conflict(format!(
                "queue entry {} changed concurrently",
                update.entry_id
            )));
        }

        Ok(())
    }

    /// Persist a transition plan as one logical batch. The guard row goes
    /// first and serializes competing writers: losing it means nothing was
    /// written. Follow-up rows are derived renumbering that any concurrent
    /// winner would recompute from its own fresh snapshot.
    pub async fn apply_transition(
        &self,
        doctor_id: Uuid,
        plan: &TransitionPlan,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();

        self.write_update(&plan.guard, now, auth_token).await?;

        for update in &plan.followups {
            self.write_update(update, now, auth_token).await?;
        }

        self.update_queue_count(doctor_id, plan.queue_count, auth_token).await?;

        if let Some(ref action) = plan.record_action {
            self.record_action(doctor_id, action, auth_token).await?;
        }
        if let Some(action_id) = plan.undo_action_id {
            self.mark_action_undone(action_id, auth_token).await?;
        }

        debug!(
            "Applied transition for doctor {}: {} follow-ups, queue count {}",
            doctor_id,
            plan.followups.len(),
            plan.queue_count
        );

        Ok(())
    }

    pub async fn update_queue_count(
        &self,
        doctor_id: Uuid,
        count: i32,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let body = json!({
            "current_queue_count": count,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let _: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(())
    }

    pub async fn set_queue_frozen(
        &self,
        doctor_id: Uuid,
        frozen: bool,
        auth_token: Option<&str>,
    ) -> Result<Doctor, QueueError> {
        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let body = json!({
            "queue_frozen": frozen,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(QueueError::NotFound(format!("doctor {} not found", doctor_id)));
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| QueueError::Database(format!("malformed doctor row: {}", e)))
    }

    async fn record_action(
        &self,
        doctor_id: Uuid,
        action: &NewAction,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        let action_data = json!({
            "doctor_id": doctor_id,
            "action": action.kind,
            "entry_id": action.entry_id,
            "promoted_entry_id": action.promoted_entry_id,
            "promoted_prev_status": action.promoted_prev_status,
            "undone": false,
            "created_at": Utc::now().to_rfc3339(),
        });

        let _: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/queue_actions",
                auth_token,
                Some(action_data),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(())
    }

    /// Most recent journal entry for the doctor, undone or not; undo decides
    /// staleness from its contents.
    pub async fn latest_action(
        &self,
        doctor_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<Option<QueueAction>, QueueError> {
        let path = format!(
            "/rest/v1/queue_actions?doctor_id=eq.{}&order=created_at.desc&limit=1",
            doctor_id
        );
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        match result.into_iter().next() {
            Some(row) => serde_json::from_value(row)
                .map(Some)
                .map_err(|e| QueueError::Database(format!("malformed action row: {}", e))),
            None => Ok(None),
        }
    }

    async fn mark_action_undone(
        &self,
        action_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        let path = format!("/rest/v1/queue_actions?id=eq.{}", action_id);
        let body = json!({ "undone": true });

        let _: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(())
    }
}
