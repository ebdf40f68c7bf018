// libs/queue-cell/src/services/engine.rs
//
// Pure queue transition logic. Given a fresh snapshot of one doctor's
// non-terminal entries and an event, compute the batch of row updates that
// moves the ledger to its next state. No I/O happens here; the ledger
// persists the plan and the caller retries on conflict with a fresh
// snapshot, so every function is idempotent with respect to recomputation.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use doctor_cell::models::Doctor;

use crate::error::QueueError;
use crate::models::{QueueActionKind, QueueEntry, QueueStatus};

/// Grace period past the scheduled time before a waiting entry is
/// reclassified as a no-show on read.
pub const NO_SHOW_GRACE_MINUTES: i64 = 5;

/// One doctor's queue as read in a single round-trip: the doctor row plus
/// every non-terminal entry (waiting, re-enter, active).
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub doctor: Doctor,
    pub entries: Vec<QueueEntry>,
}

impl QueueSnapshot {
    pub fn active(&self) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.status == QueueStatus::Active)
    }

    pub fn queued(&self) -> Vec<&QueueEntry> {
        self.entries.iter().filter(|e| e.status.is_queued()).collect()
    }

    pub fn find(&self, entry_id: Uuid) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == entry_id)
    }
}

/// A single row update within a transition batch. `expected_status` is the
/// optimistic-concurrency filter: the write only lands if the row still has
/// that status, and an empty write result fails the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUpdate {
    pub entry_id: Uuid,
    pub expected_status: QueueStatus,
    pub set_status: Option<QueueStatus>,
    pub set_position: Option<i32>,
    pub set_estimated_wait: Option<i32>,
    /// Null out position/estimate (entry leaves the queued tier).
    pub clear_queue_fields: bool,
    pub set_completed_at: Option<DateTime<Utc>>,
    /// Null out completed_at/cancellation_reason (entry re-admitted).
    pub clear_completion: bool,
    pub set_cancellation_reason: Option<String>,
}

impl EntryUpdate {
    fn new(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            expected_status: entry.status,
            set_status: None,
            set_position: None,
            set_estimated_wait: None,
            clear_queue_fields: false,
            set_completed_at: None,
            clear_completion: false,
            set_cancellation_reason: None,
        }
    }
}

/// Journal entry to record alongside a serve/no-show batch, so the action
/// can be reversed by a single-level undo.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub kind: QueueActionKind,
    pub entry_id: Uuid,
    pub promoted_entry_id: Option<Uuid>,
    pub promoted_prev_status: Option<QueueStatus>,
}

/// The computed outcome of one transition: a guard update that serializes
/// competing writers, follow-up updates (promotion and renumbering), the
/// recomputed queue count, and journal bookkeeping.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub guard: EntryUpdate,
    pub followups: Vec<EntryUpdate>,
    pub queue_count: i32,
    pub record_action: Option<NewAction>,
    pub undo_action_id: Option<Uuid>,
    pub promoted: Option<QueueEntry>,
}

/// Next-selection rule: re-entered patients take strict priority over the
/// waiting tier; within a tier the smallest token number wins.
pub fn select_next<'a>(entries: &[&'a QueueEntry]) -> Option<&'a QueueEntry> {
    let re_entered = entries
        .iter()
        .filter(|e| e.status == QueueStatus::ReEnter)
        .min_by_key(|e| e.token_number)
        .copied();
    if re_entered.is_some() {
        return re_entered;
    }

    entries
        .iter()
        .filter(|e| e.status == QueueStatus::Waiting)
        .min_by_key(|e| e.token_number)
        .copied()
}

/// An entry together with the status it will hold once the transition
/// commits (re-entry and undo change tier membership within the same batch).
struct QueuedItem<'a> {
    entry: &'a QueueEntry,
    status: QueueStatus,
}

impl<'a> QueuedItem<'a> {
    fn unchanged(entry: &'a QueueEntry) -> Self {
        Self { entry, status: entry.status }
    }
}

/// Renumbering pass: sort by (tier, token number), assign positions 1..N and
/// estimates position * avg consult minutes. Emits updates only for rows
/// whose status, position, or estimate actually change.
fn renumber(mut items: Vec<QueuedItem<'_>>, avg_consult_minutes: i32) -> Vec<EntryUpdate> {
    items.sort_by_key(|item| (item.status.tier(), item.entry.token_number));

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let position = (index + 1) as i32;
            let estimate = position * avg_consult_minutes;
            let status_changed = item.status != item.entry.status;

            if !status_changed
                && item.entry.position == Some(position)
                && item.entry.estimated_wait_minutes == Some(estimate)
            {
                return None;
            }

            let mut update = EntryUpdate::new(item.entry);
            if status_changed {
                update.set_status = Some(item.status);
            }
            update.set_position = Some(position);
            update.set_estimated_wait = Some(estimate);
            Some(update)
        })
        .collect()
}

/// Fold the renumber update for the guard's own row into the guard, so the
/// batch touches that row exactly once.
fn merge_into_guard(guard: &mut EntryUpdate, updates: Vec<EntryUpdate>) -> Vec<EntryUpdate> {
    let mut followups = Vec::with_capacity(updates.len());
    for update in updates {
        if update.entry_id == guard.entry_id {
            guard.set_position = update.set_position;
            guard.set_estimated_wait = update.set_estimated_wait;
        } else {
            followups.push(update);
        }
    }
    followups
}

/// Terminate the active entry as served or no-show, promote the next
/// candidate unless the queue is frozen, and renumber the remainder.
/// Returns `Ok(None)` when the target is not the active entry: serving with
/// nothing active is a deliberate no-op, not an error.
pub fn plan_serve(
    snapshot: &QueueSnapshot,
    entry_id: Uuid,
    kind: QueueActionKind,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<TransitionPlan>, QueueError> {
    let target = match snapshot.find(entry_id) {
        Some(entry) if entry.status == QueueStatus::Active => entry,
        _ => return Ok(None),
    };

    let mut guard = EntryUpdate::new(target);
    guard.set_status = Some(kind.terminal_status());
    guard.clear_queue_fields = true;
    guard.set_completed_at = Some(now);
    if kind == QueueActionKind::NoShow {
        guard.set_cancellation_reason =
            Some(reason.unwrap_or_else(|| "Patient did not show up".to_string()));
    }

    let queued = snapshot.queued();
    let promoted = if snapshot.doctor.queue_frozen {
        None
    } else {
        select_next(&queued).cloned()
    };

    let mut followups = Vec::new();
    if let Some(ref next) = promoted {
        let mut promote = EntryUpdate::new(next);
        promote.set_status = Some(QueueStatus::Active);
        promote.clear_queue_fields = true;
        followups.push(promote);
    }

    let remaining: Vec<QueuedItem> = queued
        .into_iter()
        .filter(|e| promoted.as_ref().map(|p| p.id) != Some(e.id))
        .map(QueuedItem::unchanged)
        .collect();
    let queue_count = remaining.len() as i32;
    followups.extend(renumber(remaining, snapshot.doctor.avg_consult_minutes));

    Ok(Some(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: Some(NewAction {
            kind,
            entry_id: target.id,
            promoted_entry_id: promoted.as_ref().map(|p| p.id),
            promoted_prev_status: promoted.as_ref().map(|p| p.status),
        }),
        undo_action_id: None,
        promoted,
    }))
}

/// Re-admit a no-show entry into the priority tier. The entry is not part
/// of the snapshot (it is terminal), so it is passed in separately.
pub fn plan_re_enter(
    snapshot: &QueueSnapshot,
    entry: &QueueEntry,
) -> Result<TransitionPlan, QueueError> {
    if entry.status != QueueStatus::NoShow {
        return Err(QueueError::Validation(format!(
            "only no-show entries can re-enter the queue, entry {} is {}",
            entry.id, entry.status
        )));
    }

    let mut guard = EntryUpdate::new(entry);
    guard.set_status = Some(QueueStatus::ReEnter);
    guard.clear_completion = true;

    let mut items: Vec<QueuedItem> = snapshot.queued().into_iter().map(QueuedItem::unchanged).collect();
    items.push(QueuedItem { entry, status: QueueStatus::ReEnter });
    let queue_count = items.len() as i32;

    let updates = renumber(items, snapshot.doctor.avg_consult_minutes);
    let followups = merge_into_guard(&mut guard, updates);

    Ok(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: None,
        undo_action_id: None,
        promoted: None,
    })
}

/// Patient cancellation of a waiting entry.
pub fn plan_cancel(
    snapshot: &QueueSnapshot,
    entry_id: Uuid,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, QueueError> {
    let target = snapshot
        .find(entry_id)
        .ok_or_else(|| QueueError::NotFound(format!("queue entry {} not found", entry_id)))?;

    if target.status != QueueStatus::Waiting {
        return Err(QueueError::Validation(format!(
            "only waiting entries can be cancelled, entry {} is {}",
            target.id, target.status
        )));
    }

    let mut guard = EntryUpdate::new(target);
    guard.set_status = Some(QueueStatus::Cancelled);
    guard.clear_queue_fields = true;
    guard.set_completed_at = Some(now);
    guard.set_cancellation_reason = Some(reason.unwrap_or_else(|| "Cancelled by patient".to_string()));

    let remaining: Vec<QueuedItem> = snapshot
        .queued()
        .into_iter()
        .filter(|e| e.id != target.id)
        .map(QueuedItem::unchanged)
        .collect();
    let queue_count = remaining.len() as i32;
    let followups = renumber(remaining, snapshot.doctor.avg_consult_minutes);

    Ok(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: None,
        undo_action_id: None,
        promoted: None,
    })
}

/// Resume a frozen queue: promote the next candidate if nobody is active.
/// `Ok(None)` when someone is already being served or the queue is empty.
pub fn plan_resume(snapshot: &QueueSnapshot) -> Option<TransitionPlan> {
    if snapshot.active().is_some() {
        return None;
    }

    let queued = snapshot.queued();
    let promoted = select_next(&queued)?.clone();

    let mut guard = EntryUpdate::new(&promoted);
    guard.set_status = Some(QueueStatus::Active);
    guard.clear_queue_fields = true;

    let remaining: Vec<QueuedItem> = queued
        .into_iter()
        .filter(|e| e.id != promoted.id)
        .map(QueuedItem::unchanged)
        .collect();
    let queue_count = remaining.len() as i32;
    let followups = renumber(remaining, snapshot.doctor.avg_consult_minutes);

    Some(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: None,
        undo_action_id: None,
        promoted: Some(promoted),
    })
}

/// Reverse the most recent serve/no-show: the terminated entry returns to
/// active and the promoted successor (if any) drops back to its recorded
/// tier. A stale action is a no-op: already undone, the target has moved
/// on, or the active slot is no longer held by the recorded successor.
pub fn plan_undo(
    snapshot: &QueueSnapshot,
    action: &crate::models::QueueAction,
    target: &QueueEntry,
) -> Option<TransitionPlan> {
    if action.undone || target.status != action.action.terminal_status() {
        return None;
    }

    let current_active = snapshot.active();
    let demoted = match (current_active, action.promoted_entry_id) {
        (Some(active), Some(promoted_id)) if active.id == promoted_id => {
            Some((active, action.promoted_prev_status?))
        }
        (None, None) => None,
        _ => return None,
    };

    let mut guard = EntryUpdate::new(target);
    guard.set_status = Some(QueueStatus::Active);
    guard.clear_queue_fields = true;
    guard.clear_completion = true;

    let mut items: Vec<QueuedItem> = snapshot.queued().into_iter().map(QueuedItem::unchanged).collect();
    if let Some((entry, prev_status)) = demoted {
        items.push(QueuedItem { entry, status: prev_status });
    }
    let queue_count = items.len() as i32;
    let followups = renumber(items, snapshot.doctor.avg_consult_minutes);

    Some(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: None,
        undo_action_id: Some(action.id),
        promoted: None,
    })
}

/// Lazy no-show rule: a waiting entry whose scheduled time is more than the
/// grace period in the past is reclassified when the patient's status is
/// read. Evaluated on read; there is no background sweep.
pub fn is_overdue(entry: &QueueEntry, now: DateTime<Utc>) -> bool {
    entry.status == QueueStatus::Waiting
        && entry
            .scheduled_time
            .map(|scheduled| now.signed_duration_since(scheduled) > Duration::minutes(NO_SHOW_GRACE_MINUTES))
            .unwrap_or(false)
}

/// Reclassify an overdue waiting entry as a no-show and renumber the rest.
pub fn plan_overdue_no_show(
    snapshot: &QueueSnapshot,
    entry_id: Uuid,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, QueueError> {
    let target = snapshot
        .find(entry_id)
        .ok_or_else(|| QueueError::NotFound(format!("queue entry {} not found", entry_id)))?;

    if target.status != QueueStatus::Waiting {
        return Err(QueueError::Validation(format!(
            "entry {} is {} and cannot be reclassified as no-show",
            target.id, target.status
        )));
    }

    let mut guard = EntryUpdate::new(target);
    guard.set_status = Some(QueueStatus::NoShow);
    guard.clear_queue_fields = true;
    guard.set_completed_at = Some(now);
    guard.set_cancellation_reason = Some("Missed scheduled appointment time".to_string());

    let remaining: Vec<QueuedItem> = snapshot
        .queued()
        .into_iter()
        .filter(|e| e.id != target.id)
        .map(QueuedItem::unchanged)
        .collect();
    let queue_count = remaining.len() as i32;
    let followups = renumber(remaining, snapshot.doctor.avg_consult_minutes);

    Ok(TransitionPlan {
        guard,
        followups,
        queue_count,
        record_action: None,
        undo_action_id: None,
        promoted: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueueAction;

    fn make_doctor(avg_consult_minutes: i32, queue_frozen: bool) -> Doctor {
        Doctor {
            id: Uuid::new_v4(),
            full_name: "Dr. Emily Chen".to_string(),
            specialty: "Pediatrics".to_string(),
            qualification: Some("MBBS".to_string()),
            years_experience: Some(8),
            avg_consult_minutes,
            current_queue_count: 0,
            available: true,
            queue_frozen,
            next_token_number: 200,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_entry(
        doctor: &Doctor,
        token_number: i64,
        status: QueueStatus,
        position: Option<i32>,
    ) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            doctor_id: doctor.id,
            patient_id: Uuid::new_v4().to_string(),
            patient_name: format!("Patient {}", token_number),
            token_number,
            status,
            position,
            estimated_wait_minutes: position.map(|p| p * doctor.avg_consult_minutes),
            scheduled_time: None,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: if status.is_terminal() { Some(Utc::now()) } else { None },
            cancellation_reason: None,
        }
    }

    fn apply_update(entries: &mut [QueueEntry], update: &EntryUpdate) {
        let entry = entries
            .iter_mut()
            .find(|e| e.id == update.entry_id)
            .expect("update targets a known entry");
        assert_eq!(
            entry.status, update.expected_status,
            "optimistic guard must match the snapshot status"
        );
        if update.clear_queue_fields {
            entry.position = None;
            entry.estimated_wait_minutes = None;
        }
        if let Some(status) = update.set_status {
            entry.status = status;
        }
        if let Some(position) = update.set_position {
            entry.position = Some(position);
        }
        if let Some(estimate) = update.set_estimated_wait {
            entry.estimated_wait_minutes = Some(estimate);
        }
        if let Some(completed_at) = update.set_completed_at {
            entry.completed_at = Some(completed_at);
        }
        if update.clear_completion {
            entry.completed_at = None;
            entry.cancellation_reason = None;
        }
        if let Some(ref reason) = update.set_cancellation_reason {
            entry.cancellation_reason = Some(reason.clone());
        }
    }

    fn apply_plan(snapshot: &QueueSnapshot, plan: &TransitionPlan) -> Vec<QueueEntry> {
        let mut entries = snapshot.entries.clone();
        apply_update(&mut entries, &plan.guard);
        for update in &plan.followups {
            apply_update(&mut entries, update);
        }
        entries
    }

    fn assert_contiguous_positions(entries: &[QueueEntry]) {
        let mut positions: Vec<i32> = entries
            .iter()
            .filter(|e| e.status.is_queued())
            .map(|e| e.position.expect("queued entries always hold a position"))
            .collect();
        positions.sort_unstable();
        let expected: Vec<i32> = (1..=positions.len() as i32).collect();
        assert_eq!(positions, expected, "positions must form 1..N with no gaps");
    }

    #[test]
    fn select_next_prefers_re_enter_tier_over_earlier_waiting_tokens() {
        let doctor = make_doctor(15, false);
        let re_entered = make_entry(&doctor, 101, QueueStatus::ReEnter, Some(1));
        let waiting_a = make_entry(&doctor, 104, QueueStatus::Waiting, Some(2));
        let waiting_b = make_entry(&doctor, 105, QueueStatus::Waiting, Some(3));

        let entries = vec![&waiting_a, &waiting_b, &re_entered];
        let next = select_next(&entries).expect("queue is not empty");
        assert_eq!(next.token_number, 101);
        assert_eq!(next.status, QueueStatus::ReEnter);
    }

    #[test]
    fn select_next_takes_smallest_token_within_tier() {
        let doctor = make_doctor(15, false);
        let later = make_entry(&doctor, 103, QueueStatus::Waiting, Some(2));
        let earlier = make_entry(&doctor, 102, QueueStatus::Waiting, Some(1));

        let entries = vec![&later, &earlier];
        assert_eq!(select_next(&entries).unwrap().token_number, 102);
    }

    #[test]
    fn select_next_on_empty_queue_is_none() {
        assert!(select_next(&[]).is_none());
    }

    #[test]
    fn serving_the_active_entry_promotes_and_renumbers() {
        // avg 15 min; active 101, waiting 102 (pos 1, wait 15) and 103 (pos 2, wait 30)
        let doctor = make_doctor(15, false);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let second = make_entry(&doctor, 102, QueueStatus::Waiting, Some(1));
        let third = make_entry(&doctor, 103, QueueStatus::Waiting, Some(2));
        let snapshot = QueueSnapshot {
            doctor,
            entries: vec![active.clone(), second.clone(), third.clone()],
        };

        let plan = plan_serve(&snapshot, active.id, QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .expect("active entry is servable");

        assert_eq!(plan.promoted.as_ref().unwrap().id, second.id);
        assert_eq!(plan.queue_count, 1);

        let result = apply_plan(&snapshot, &plan);
        let served = result.iter().find(|e| e.id == active.id).unwrap();
        assert_eq!(served.status, QueueStatus::Served);
        assert!(served.completed_at.is_some());

        let promoted = result.iter().find(|e| e.id == second.id).unwrap();
        assert_eq!(promoted.status, QueueStatus::Active);
        assert_eq!(promoted.position, None);

        let renumbered = result.iter().find(|e| e.id == third.id).unwrap();
        assert_eq!(renumbered.position, Some(1));
        assert_eq!(renumbered.estimated_wait_minutes, Some(15));
        assert_contiguous_positions(&result);
    }

    #[test]
    fn serving_with_no_active_entry_is_a_noop() {
        let doctor = make_doctor(15, false);
        let waiting = make_entry(&doctor, 101, QueueStatus::Waiting, Some(1));
        let snapshot = QueueSnapshot { doctor, entries: vec![waiting.clone()] };

        assert!(plan_serve(&snapshot, waiting.id, QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .is_none());
        assert!(plan_serve(&snapshot, Uuid::new_v4(), QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn no_show_records_a_reason() {
        let doctor = make_doctor(10, false);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let snapshot = QueueSnapshot { doctor, entries: vec![active.clone()] };

        let plan = plan_serve(&snapshot, active.id, QueueActionKind::NoShow, None, Utc::now())
            .unwrap()
            .unwrap();
        let result = apply_plan(&snapshot, &plan);
        let entry = result.iter().find(|e| e.id == active.id).unwrap();
        assert_eq!(entry.status, QueueStatus::NoShow);
        assert_eq!(entry.cancellation_reason.as_deref(), Some("Patient did not show up"));
    }

    #[test]
    fn frozen_queue_terminates_without_promotion_and_resume_promotes() {
        let doctor = make_doctor(15, true);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let waiting = make_entry(&doctor, 102, QueueStatus::Waiting, Some(1));
        let snapshot = QueueSnapshot {
            doctor: doctor.clone(),
            entries: vec![active.clone(), waiting.clone()],
        };

        let plan = plan_serve(&snapshot, active.id, QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .unwrap();
        assert!(plan.promoted.is_none(), "frozen queue must not promote");
        assert_eq!(plan.queue_count, 1);

        let mut after = apply_plan(&snapshot, &plan);
        after.retain(|e| !e.status.is_terminal());
        let mut resumed_doctor = doctor;
        resumed_doctor.queue_frozen = false;
        let resumed = QueueSnapshot { doctor: resumed_doctor, entries: after };

        let resume_plan = plan_resume(&resumed).expect("a waiting entry is promotable");
        assert_eq!(resume_plan.promoted.as_ref().unwrap().id, waiting.id);
        assert_eq!(resume_plan.queue_count, 0);
    }

    #[test]
    fn resume_with_an_active_entry_is_a_noop() {
        let doctor = make_doctor(15, false);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let waiting = make_entry(&doctor, 102, QueueStatus::Waiting, Some(1));
        let snapshot = QueueSnapshot { doctor, entries: vec![active, waiting] };

        assert!(plan_resume(&snapshot).is_none());
    }

    #[test]
    fn re_entered_no_show_outranks_waiting_entries() {
        let doctor = make_doctor(15, false);
        let no_show = make_entry(&doctor, 101, QueueStatus::NoShow, None);
        let waiting_a = make_entry(&doctor, 104, QueueStatus::Waiting, Some(1));
        let waiting_b = make_entry(&doctor, 105, QueueStatus::Waiting, Some(2));
        let snapshot = QueueSnapshot {
            doctor,
            entries: vec![waiting_a.clone(), waiting_b.clone()],
        };

        let plan = plan_re_enter(&snapshot, &no_show).unwrap();
        assert_eq!(plan.queue_count, 3);
        assert_eq!(plan.guard.set_status, Some(QueueStatus::ReEnter));
        // Re-entered entry takes position 1 despite its earlier token number
        // belonging to a lower tier than 104/105 numerically.
        assert_eq!(plan.guard.set_position, Some(1));
        assert_eq!(plan.guard.set_estimated_wait, Some(15));

        let mut entries = snapshot.entries.clone();
        entries.push(no_show.clone());
        let full = QueueSnapshot { doctor: snapshot.doctor.clone(), entries };
        let result = apply_plan(&full, &plan);
        assert_contiguous_positions(&result);

        let shifted_a = result.iter().find(|e| e.id == waiting_a.id).unwrap();
        assert_eq!(shifted_a.position, Some(2));
        let shifted_b = result.iter().find(|e| e.id == waiting_b.id).unwrap();
        assert_eq!(shifted_b.position, Some(3));
    }

    #[test]
    fn re_enter_rejects_non_no_show_entries() {
        let doctor = make_doctor(15, false);
        let served = make_entry(&doctor, 101, QueueStatus::Served, None);
        let snapshot = QueueSnapshot { doctor, entries: vec![] };

        let err = plan_re_enter(&snapshot, &served).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn serve_then_undo_restores_the_exact_prior_state() {
        let doctor = make_doctor(15, false);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let re_entered = make_entry(&doctor, 99, QueueStatus::ReEnter, Some(1));
        let waiting = make_entry(&doctor, 102, QueueStatus::Waiting, Some(2));
        let snapshot = QueueSnapshot {
            doctor: doctor.clone(),
            entries: vec![active.clone(), re_entered.clone(), waiting.clone()],
        };

        let plan = plan_serve(&snapshot, active.id, QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .unwrap();
        // The re-entered entry wins promotion over the waiting one.
        assert_eq!(plan.promoted.as_ref().unwrap().id, re_entered.id);
        let after_serve = apply_plan(&snapshot, &plan);

        let recorded = plan.record_action.unwrap();
        let action = QueueAction {
            id: Uuid::new_v4(),
            doctor_id: doctor.id,
            action: recorded.kind,
            entry_id: recorded.entry_id,
            promoted_entry_id: recorded.promoted_entry_id,
            promoted_prev_status: recorded.promoted_prev_status,
            undone: false,
            created_at: Utc::now(),
        };

        let target = after_serve.iter().find(|e| e.id == active.id).unwrap().clone();
        let undo_snapshot = QueueSnapshot {
            doctor: doctor.clone(),
            entries: after_serve.iter().filter(|e| !e.status.is_terminal()).cloned().collect(),
        };
        let undo_plan = plan_undo(&undo_snapshot, &action, &target).expect("action is fresh");

        let mut entries = undo_snapshot.entries.clone();
        entries.push(target);
        let full = QueueSnapshot { doctor, entries };
        let restored = apply_plan(&full, &undo_plan);

        for original in &snapshot.entries {
            let now = restored.iter().find(|e| e.id == original.id).unwrap();
            assert_eq!(now.status, original.status, "status restored for {}", original.token_number);
            assert_eq!(now.position, original.position, "position restored for {}", original.token_number);
            assert_eq!(
                now.estimated_wait_minutes, original.estimated_wait_minutes,
                "estimate restored for {}",
                original.token_number
            );
        }
        assert_eq!(undo_plan.queue_count, 2);
    }

    #[test]
    fn undo_is_a_noop_when_the_action_is_already_undone() {
        let doctor = make_doctor(15, false);
        let served = make_entry(&doctor, 101, QueueStatus::Served, None);
        let snapshot = QueueSnapshot { doctor: doctor.clone(), entries: vec![] };

        let action = QueueAction {
            id: Uuid::new_v4(),
            doctor_id: doctor.id,
            action: QueueActionKind::Served,
            entry_id: served.id,
            promoted_entry_id: None,
            promoted_prev_status: None,
            undone: true,
            created_at: Utc::now(),
        };

        assert!(plan_undo(&snapshot, &action, &served).is_none());
    }

    #[test]
    fn undo_is_a_noop_when_another_entry_holds_the_active_slot() {
        let doctor = make_doctor(15, false);
        let served = make_entry(&doctor, 101, QueueStatus::Served, None);
        let other_active = make_entry(&doctor, 102, QueueStatus::Active, None);
        let snapshot = QueueSnapshot {
            doctor: doctor.clone(),
            entries: vec![other_active],
        };

        // The action recorded no promotion, yet someone else is now active.
        let action = QueueAction {
            id: Uuid::new_v4(),
            doctor_id: doctor.id,
            action: QueueActionKind::Served,
            entry_id: served.id,
            promoted_entry_id: None,
            promoted_prev_status: None,
            undone: false,
            created_at: Utc::now(),
        };

        assert!(plan_undo(&snapshot, &action, &served).is_none());
    }

    #[test]
    fn cancel_renumbers_the_entries_behind() {
        let doctor = make_doctor(20, false);
        let first = make_entry(&doctor, 101, QueueStatus::Waiting, Some(1));
        let second = make_entry(&doctor, 102, QueueStatus::Waiting, Some(2));
        let third = make_entry(&doctor, 103, QueueStatus::Waiting, Some(3));
        let snapshot = QueueSnapshot {
            doctor,
            entries: vec![first.clone(), second.clone(), third.clone()],
        };

        let plan = plan_cancel(&snapshot, second.id, None, Utc::now()).unwrap();
        assert_eq!(plan.queue_count, 2);

        let result = apply_plan(&snapshot, &plan);
        let cancelled = result.iter().find(|e| e.id == second.id).unwrap();
        assert_eq!(cancelled.status, QueueStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Cancelled by patient"));

        let moved_up = result.iter().find(|e| e.id == third.id).unwrap();
        assert_eq!(moved_up.position, Some(2));
        assert_eq!(moved_up.estimated_wait_minutes, Some(40));
        assert_contiguous_positions(&result);
    }

    #[test]
    fn cancel_rejects_non_waiting_entries() {
        let doctor = make_doctor(15, false);
        let active = make_entry(&doctor, 101, QueueStatus::Active, None);
        let snapshot = QueueSnapshot { doctor, entries: vec![active.clone()] };

        let err = plan_cancel(&snapshot, active.id, None, Utc::now()).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn overdue_check_respects_the_grace_period() {
        let doctor = make_doctor(15, false);
        let now = Utc::now();

        let mut on_time = make_entry(&doctor, 101, QueueStatus::Waiting, Some(1));
        on_time.scheduled_time = Some(now - Duration::minutes(NO_SHOW_GRACE_MINUTES));
        assert!(!is_overdue(&on_time, now), "exactly at the grace bound is still on time");

        let mut late = make_entry(&doctor, 102, QueueStatus::Waiting, Some(2));
        late.scheduled_time = Some(now - Duration::minutes(NO_SHOW_GRACE_MINUTES) - Duration::seconds(1));
        assert!(is_overdue(&late, now));

        let mut unscheduled = make_entry(&doctor, 103, QueueStatus::Waiting, Some(3));
        unscheduled.scheduled_time = None;
        assert!(!is_overdue(&unscheduled, now));

        let mut active = make_entry(&doctor, 104, QueueStatus::Active, None);
        active.scheduled_time = Some(now - Duration::hours(2));
        assert!(!is_overdue(&active, now), "only waiting entries are reclassified");
    }

    #[test]
    fn overdue_reclassification_renumbers_the_remainder() {
        let doctor = make_doctor(15, false);
        let now = Utc::now();
        let mut late = make_entry(&doctor, 101, QueueStatus::Waiting, Some(1));
        late.scheduled_time = Some(now - Duration::minutes(30));
        let behind = make_entry(&doctor, 102, QueueStatus::Waiting, Some(2));
        let snapshot = QueueSnapshot {
            doctor,
            entries: vec![late.clone(), behind.clone()],
        };

        let plan = plan_overdue_no_show(&snapshot, late.id, now).unwrap();
        assert_eq!(plan.queue_count, 1);

        let result = apply_plan(&snapshot, &plan);
        let reclassified = result.iter().find(|e| e.id == late.id).unwrap();
        assert_eq!(reclassified.status, QueueStatus::NoShow);
        let moved_up = result.iter().find(|e| e.id == behind.id).unwrap();
        assert_eq!(moved_up.position, Some(1));
        assert_contiguous_positions(&result);
    }

    #[test]
    fn renumbering_emits_no_updates_when_positions_already_hold() {
        let doctor = make_doctor(15, false);
        let first = make_entry(&doctor, 101, QueueStatus::Waiting, Some(1));
        let second = make_entry(&doctor, 102, QueueStatus::Waiting, Some(2));
        let active = make_entry(&doctor, 100, QueueStatus::Active, None);
        let snapshot = QueueSnapshot {
            doctor,
            entries: vec![active.clone(), first, second],
        };

        // Terminating the active entry while frozen changes nothing about
        // the queued tier, so the plan carries no renumber followups.
        let mut frozen = snapshot.clone();
        frozen.doctor.queue_frozen = true;
        let plan = plan_serve(&frozen, active.id, QueueActionKind::Served, None, Utc::now())
            .unwrap()
            .unwrap();
        assert!(plan.followups.is_empty());
    }
}
