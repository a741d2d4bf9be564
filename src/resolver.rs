use chrono::NaiveDateTime;

use crate::db::Store;
use crate::error::EngineError;
use crate::models::{Device, Recurrence, Schedule, ScheduleStatus, TargetMode};

/// Upper bound on occurrences skipped in one advance (about a century of hourly runs).
const MAX_SKIPPED_OCCURRENCES: u32 = 1_000_000;

/// What the dispatcher writes back when a claimed schedule finishes a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleUpdate {
    /// New stored status; `pending` again for recurring schedules.
    pub status: ScheduleStatus,
    /// Outcome of the cycle that just ran.
    pub outcome: ScheduleStatus,
    pub run_at: NaiveDateTime,
    pub occurrence: i32,
    pub result: String,
    pub completed_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub skipped_one_shot_is_final: bool,
    pub skip_missed_occurrences: bool,
}

/// Devices a schedule acts on. Only active devices are ever returned.
pub fn resolve_targets(store: &dyn Store, schedule: &Schedule) -> Result<Vec<Device>, EngineError> {
    match schedule.target_mode()? {
        TargetMode::All => store.active_devices(),
        TargetMode::Selection => store.selected_devices(schedule.id),
    }
}

/// Next `(run_at, occurrence)` of a recurring schedule, counted from its anchor.
pub fn advance(
    schedule: &Schedule,
    recurrence: Recurrence,
    now: NaiveDateTime,
    skip_missed: bool,
) -> Result<(NaiveDateTime, i32), EngineError> {
    let overflow = || {
        EngineError::InvalidData(format!("{} cannot advance past {}", schedule.label(), schedule.run_at))
    };

    let mut occurrence = u32::try_from(schedule.occurrence).unwrap_or(0) + 1;
    let mut run_at = recurrence
        .nth_after(schedule.anchor_at, occurrence)
        .ok_or_else(overflow)?;

    if skip_missed {
        let mut skipped = 0;
        while run_at <= now {
            skipped += 1;
            if skipped > MAX_SKIPPED_OCCURRENCES {
                return Err(overflow());
            }
            occurrence += 1;
            run_at = recurrence
                .nth_after(schedule.anchor_at, occurrence)
                .ok_or_else(overflow)?;
        }
    }

    let occurrence = i32::try_from(occurrence).map_err(|_| overflow())?;
    Ok((run_at, occurrence))
}

/// Turn the outcome of one cycle into the schedule's next stored state.
pub fn settle(
    schedule: &Schedule,
    outcome: ScheduleStatus,
    result: String,
    now: NaiveDateTime,
    policy: SettlePolicy,
) -> Result<ScheduleUpdate, EngineError> {
    let recurrence = schedule.recurrence()?;

    let (status, run_at, occurrence) = if recurrence.is_recurring() {
        let (run_at, occurrence) = advance(schedule, recurrence, now, policy.skip_missed_occurrences)?;
        (ScheduleStatus::Pending, run_at, occurrence)
    } else if outcome == ScheduleStatus::Skipped && !policy.skipped_one_shot_is_final {
        (ScheduleStatus::Pending, schedule.run_at, schedule.occurrence)
    } else {
        (outcome, schedule.run_at, schedule.occurrence)
    };

    Ok(ScheduleUpdate {
        status,
        outcome,
        run_at,
        occurrence,
        result,
        completed_at: now,
    })
}
