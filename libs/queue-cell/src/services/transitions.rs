// libs/queue-cell/src/services/transitions.rs
//
// Orchestration around the pure engine: read a fresh snapshot, compute a
// plan, persist it through the ledger, publish a change-feed event. A
// conflicting write restarts the whole cycle from a fresh read, bounded by
// a small retry budget before the conflict surfaces to the caller.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;

use crate::error::QueueError;
use crate::models::{
    DoctorQueueSummary, FreezeResponse, JoinQueueRequest, JoinQueueResponse, NoShowResponse,
    QueueActionKind, QueueEntry, QueueStatus, QueueStatusResponse, QueueUpdate, ServeResponse,
    UndoResponse,
};
use crate::services::engine::{self, TransitionPlan};
use crate::services::ledger::QueueLedgerService;
use crate::services::notify::QueueNotificationService;

const MAX_RETRY_ATTEMPTS: u32 = 3;

pub struct QueueTransitionService {
    ledger: QueueLedgerService,
    notifier: QueueNotificationService,
}

impl QueueTransitionService {
    pub fn new(config: &AppConfig, notifier: QueueNotificationService) -> Self {
        Self {
            ledger: QueueLedgerService::new(config),
            notifier,
        }
    }

    async fn backoff(attempt: u32) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100 * attempt as u64)).await;
    }

    async fn publish(&self, doctor_id: Uuid, remaining_count: i32, active_entry_id: Option<Uuid>) {
        self.notifier
            .publish(QueueUpdate {
                doctor_id,
                remaining_count,
                active_entry_id,
                emitted_at: Utc::now(),
            })
            .await;
    }

    async fn commit(
        &self,
        doctor_id: Uuid,
        plan: &TransitionPlan,
        auth_token: Option<&str>,
    ) -> Result<(), QueueError> {
        self.ledger.apply_transition(doctor_id, plan, auth_token).await
    }

    /// Patient joins a doctor's queue.
    pub async fn join(
        &self,
        user: &User,
        request: &JoinQueueRequest,
        auth_token: &str,
    ) -> Result<JoinQueueResponse, QueueError> {
        let patient_name = self
            .ledger
            .get_patient_name(&user.id, Some(auth_token))
            .await?;

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let doctor = self
                .ledger
                .get_doctor(request.doctor_id, Some(auth_token))
                .await?;

            match self
                .ledger
                .append(
                    &doctor,
                    &user.id,
                    &patient_name,
                    request.notes.clone(),
                    request.scheduled_time,
                    Some(auth_token),
                )
                .await
            {
                Ok(entry) => {
                    info!(
                        "Patient {} joined queue of doctor {} with token {}",
                        user.id, doctor.id, entry.token_number
                    );
                    self.publish(
                        doctor.id,
                        doctor.current_queue_count + 1,
                        None,
                    )
                    .await;
                    return Ok(JoinQueueResponse {
                        queue_id: entry.id,
                        token_number: entry.token_number,
                        position: entry.position.unwrap_or(doctor.current_queue_count + 1),
                        estimated_wait_minutes: entry
                            .estimated_wait_minutes
                            .unwrap_or((doctor.current_queue_count + 1) * doctor.avg_consult_minutes),
                    });
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Join conflict for doctor {} (attempt {}/{}): {}",
                        request.doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "failed to join queue after repeated token conflicts".to_string(),
        ))
    }

    /// Terminate the active entry as served and promote the next candidate.
    pub async fn mark_served(
        &self,
        doctor_id: Uuid,
        entry_id: Uuid,
        auth_token: &str,
    ) -> Result<ServeResponse, QueueError> {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;
            let plan = engine::plan_serve(
                &snapshot,
                entry_id,
                QueueActionKind::Served,
                None,
                Utc::now(),
            )?;

            let Some(plan) = plan else {
                debug!("Nothing to serve for doctor {}, returning unchanged state", doctor_id);
                return Ok(ServeResponse {
                    next_active: None,
                    remaining_count: snapshot.doctor.current_queue_count,
                });
            };

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    let next_active = Self::promoted_as_active(&plan);
                    info!(
                        "Marked entry {} served for doctor {}, promoted {:?}",
                        entry_id,
                        doctor_id,
                        next_active.as_ref().map(|e| e.token_number)
                    );
                    self.publish(doctor_id, plan.queue_count, next_active.as_ref().map(|e| e.id))
                        .await;
                    return Ok(ServeResponse {
                        next_active,
                        remaining_count: plan.queue_count,
                    });
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Serve conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "queue transition lost the race after repeated retries".to_string(),
        ))
    }

    /// Terminate the active entry as a no-show.
    pub async fn mark_no_show(
        &self,
        doctor_id: Uuid,
        entry_id: Uuid,
        reason: Option<String>,
        auth_token: &str,
    ) -> Result<NoShowResponse, QueueError> {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;
            let plan = engine::plan_serve(
                &snapshot,
                entry_id,
                QueueActionKind::NoShow,
                reason.clone(),
                Utc::now(),
            )?;

            let Some(plan) = plan else {
                return Ok(NoShowResponse {
                    remaining_count: snapshot.doctor.current_queue_count,
                });
            };

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    let promoted = Self::promoted_as_active(&plan);
                    self.publish(doctor_id, plan.queue_count, promoted.as_ref().map(|e| e.id))
                        .await;
                    return Ok(NoShowResponse {
                        remaining_count: plan.queue_count,
                    });
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "No-show conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "queue transition lost the race after repeated retries".to_string(),
        ))
    }

    /// Re-admit a no-show entry into the priority tier.
    pub async fn re_enter(
        &self,
        doctor_id: Uuid,
        entry_id: Uuid,
        auth_token: &str,
    ) -> Result<QueueEntry, QueueError> {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let entry = self.ledger.get_entry(entry_id, Some(auth_token)).await?;
            if entry.doctor_id != doctor_id {
                return Err(QueueError::Validation(format!(
                    "queue entry {} does not belong to doctor {}",
                    entry_id, doctor_id
                )));
            }

            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;
            let plan = engine::plan_re_enter(&snapshot, &entry)?;

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    info!(
                        "Re-entered token {} into queue of doctor {}",
                        entry.token_number, doctor_id
                    );
                    self.publish(doctor_id, plan.queue_count, snapshot.active().map(|e| e.id))
                        .await;
                    return self.ledger.get_entry(entry_id, Some(auth_token)).await;
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Re-enter conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "queue transition lost the race after repeated retries".to_string(),
        ))
    }

    /// Patient cancels their own waiting entry; staff may cancel any.
    pub async fn cancel(
        &self,
        user: &User,
        doctor_id: Uuid,
        entry_id: Uuid,
        reason: Option<String>,
        auth_token: &str,
    ) -> Result<QueueEntry, QueueError> {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;
            let entry = snapshot
                .find(entry_id)
                .ok_or_else(|| QueueError::NotFound(format!("queue entry {} not found", entry_id)))?;

            if !user.is_staff() && entry.patient_id != user.id {
                return Err(QueueError::Forbidden(
                    "patients can only cancel their own queue entry".to_string(),
                ));
            }

            let plan = engine::plan_cancel(&snapshot, entry_id, reason.clone(), Utc::now())?;

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    self.publish(doctor_id, plan.queue_count, snapshot.active().map(|e| e.id))
                        .await;
                    return self.ledger.get_entry(entry_id, Some(auth_token)).await;
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Cancel conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "queue transition lost the race after repeated retries".to_string(),
        ))
    }

    /// Reverse the most recent serve/no-show. A stale or missing action is
    /// reported as a no-op, never an error.
    pub async fn undo_last(
        &self,
        doctor_id: Uuid,
        auth_token: &str,
    ) -> Result<UndoResponse, QueueError> {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;

            let Some(action) = self.ledger.latest_action(doctor_id, Some(auth_token)).await? else {
                return Ok(UndoResponse {
                    undone: false,
                    remaining_count: snapshot.doctor.current_queue_count,
                });
            };

            let target = self.ledger.get_entry(action.entry_id, Some(auth_token)).await?;

            let Some(plan) = engine::plan_undo(&snapshot, &action, &target) else {
                debug!("Undo for doctor {} is stale, leaving ledger unchanged", doctor_id);
                return Ok(UndoResponse {
                    undone: false,
                    remaining_count: snapshot.doctor.current_queue_count,
                });
            };

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    info!("Undid last action for doctor {}", doctor_id);
                    self.publish(doctor_id, plan.queue_count, Some(target.id)).await;
                    return Ok(UndoResponse {
                        undone: true,
                        remaining_count: plan.queue_count,
                    });
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Undo conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Conflict(
            "queue transition lost the race after repeated retries".to_string(),
        ))
    }

    /// Stop promotions while keeping serve/no-show available.
    pub async fn freeze(&self, doctor_id: Uuid, auth_token: &str) -> Result<FreezeResponse, QueueError> {
        let doctor = self.ledger.set_queue_frozen(doctor_id, true, Some(auth_token)).await?;
        info!("Queue frozen for doctor {}", doctor_id);
        self.publish(doctor_id, doctor.current_queue_count, None).await;
        Ok(FreezeResponse {
            doctor_id,
            queue_frozen: doctor.queue_frozen,
        })
    }

    /// Lift a freeze and promote the next candidate if nobody is active.
    pub async fn resume(&self, doctor_id: Uuid, auth_token: &str) -> Result<FreezeResponse, QueueError> {
        let doctor = self.ledger.set_queue_frozen(doctor_id, false, Some(auth_token)).await?;

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(doctor_id, Some(auth_token)).await?;

            let Some(plan) = engine::plan_resume(&snapshot) else {
                self.publish(doctor_id, snapshot.doctor.current_queue_count, snapshot.active().map(|e| e.id))
                    .await;
                break;
            };

            match self.commit(doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    let promoted = Self::promoted_as_active(&plan);
                    info!(
                        "Resumed queue for doctor {}, promoted {:?}",
                        doctor_id,
                        promoted.as_ref().map(|e| e.token_number)
                    );
                    self.publish(doctor_id, plan.queue_count, promoted.as_ref().map(|e| e.id))
                        .await;
                    break;
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Resume conflict for doctor {} (attempt {}/{}): {}",
                        doctor_id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(FreezeResponse {
            doctor_id,
            queue_frozen: doctor.queue_frozen,
        })
    }

    /// Public queue view: doctor summary plus the active entry and queued
    /// entries in serving order.
    pub async fn queue_status(&self, doctor_id: Uuid) -> Result<QueueStatusResponse, QueueError> {
        let snapshot = self.ledger.snapshot(doctor_id, None).await?;

        let mut queue = snapshot.entries.clone();
        queue.sort_by_key(|e| {
            (
                e.status != QueueStatus::Active,
                e.position.unwrap_or(i32::MAX),
                e.token_number,
            )
        });

        Ok(QueueStatusResponse {
            doctor: DoctorQueueSummary::from_doctor(&snapshot.doctor),
            queue,
        })
    }

    /// The caller's current entry, applying the lazy no-show rule before
    /// answering. Staleness is bounded by how often clients poll.
    pub async fn my_status(
        &self,
        user: &User,
        auth_token: &str,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let Some(entry) = self
            .ledger
            .latest_entry_for_patient(&user.id, Some(auth_token))
            .await?
        else {
            return Ok(None);
        };

        let now = Utc::now();
        if !engine::is_overdue(&entry, now) {
            return Ok(Some(entry));
        }

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let snapshot = self.ledger.snapshot(entry.doctor_id, Some(auth_token)).await?;
            if snapshot.find(entry.id).map(|e| e.status) != Some(QueueStatus::Waiting) {
                break;
            }

            let plan = engine::plan_overdue_no_show(&snapshot, entry.id, now)?;
            match self.commit(entry.doctor_id, &plan, Some(auth_token)).await {
                Ok(()) => {
                    info!(
                        "Reclassified overdue entry {} as no-show for doctor {}",
                        entry.id, entry.doctor_id
                    );
                    self.publish(entry.doctor_id, plan.queue_count, snapshot.active().map(|e| e.id))
                        .await;
                    break;
                }
                Err(QueueError::Conflict(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(
                        "Overdue reclassification conflict for entry {} (attempt {}/{}): {}",
                        entry.id, attempt, MAX_RETRY_ATTEMPTS, msg
                    );
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.ledger.get_entry(entry.id, Some(auth_token)).await.map(Some)
    }

    /// Subscribe to a doctor's change feed.
    pub async fn subscribe(&self, doctor_id: Uuid) -> crate::services::notify::QueueUpdateReceiver {
        self.notifier.subscribe(doctor_id).await
    }

    fn promoted_as_active(plan: &TransitionPlan) -> Option<QueueEntry> {
        plan.promoted.clone().map(|mut entry| {
            entry.status = QueueStatus::Active;
            entry.position = None;
            entry.estimated_wait_minutes = None;
            entry
        })
    }
}
