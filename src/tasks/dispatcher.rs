use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audit_log::InitiatedBy;
use crate::blackout;
use crate::db::{self, Store};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::models::{BlackoutWindow, Schedule, ScheduleStatus};
use crate::resolver::{self, ScheduleUpdate, SettlePolicy};
use crate::settings::EngineSettings;

/// Summary of one dispatcher tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub released: usize,
    pub due: usize,
    /// `(schedule id, outcome)` for every schedule this tick claimed and finished.
    pub finished: Vec<(i32, ScheduleStatus)>,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    settings: EngineSettings,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, executor: Arc<Executor>, settings: EngineSettings) -> Self {
        Self {
            store,
            executor,
            settings,
        }
    }

    fn policy(&self) -> SettlePolicy {
        SettlePolicy {
            skipped_one_shot_is_final: self.settings.skipped_one_shot_is_final,
            skip_missed_occurrences: self.settings.skip_missed_occurrences,
        }
    }

    /// Run every schedule due at `now` once.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<TickReport, EngineError> {
        let cutoff = now - self.settings.claim_lease();
        let released = db::blocking(&self.store, move |store| store.release_stale_claims(cutoff)).await?;
        if released > 0 {
            log::warn!("Released {} schedule claim(s) older than {}", released, cutoff);
        }

        let due = db::blocking(&self.store, move |store| store.due_schedules(now)).await?;
        if due.is_empty() {
            return Ok(TickReport {
                released,
                ..TickReport::default()
            });
        }
        let windows = db::blocking(&self.store, move |store| store.blackout_windows(now)).await?;

        let runs = due.iter().map(|schedule| self.run_schedule(schedule, now, &windows));
        let finished = join_all(runs).await.into_iter().flatten().collect();

        Ok(TickReport {
            released,
            due: due.len(),
            finished,
        })
    }

    /// Claim, execute and settle one schedule. `None` when it was not ours to run.
    async fn run_schedule(
        &self,
        schedule: &Schedule,
        now: NaiveDateTime,
        windows: &[BlackoutWindow],
    ) -> Option<(i32, ScheduleStatus)> {
        let id = schedule.id;
        match db::blocking(&self.store, move |store| store.claim_schedule(id, now)).await {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("{} already claimed elsewhere", schedule.label());
                return None;
            }
            Err(e) => {
                log::error!("Failed to claim {}, retrying next tick: {}", schedule.label(), e);
                return None;
            }
        }
        log::info!("Running {} ({} due at {})", schedule.label(), schedule.action, schedule.run_at);

        let run = self.execute(schedule, now, windows);
        tokio::pin!(run);
        let executed = tokio::select! {
            result = &mut run => result,
            never = self.hold_claim(id, now) => match never {},
        };

        let update = match executed {
            Ok((outcome, result)) => resolver::settle(schedule, outcome, result, now, self.policy()),
            Err(e) if e.is_persistence() && !matches!(e, EngineError::InvalidData(_)) => {
                // Nothing was attempted yet; hand the claim back for the next tick.
                log::error!("{} could not be prepared: {}", schedule.label(), e);
                Ok(ScheduleUpdate {
                    status: ScheduleStatus::Pending,
                    outcome: ScheduleStatus::Failed,
                    run_at: schedule.run_at,
                    occurrence: schedule.occurrence,
                    result: format!("not run: {}", e),
                    completed_at: now,
                })
            }
            Err(e) => Err(e),
        };

        let update = update.unwrap_or_else(|e| {
            log::error!("{} failed: {}", schedule.label(), e);
            ScheduleUpdate {
                status: ScheduleStatus::Failed,
                outcome: ScheduleStatus::Failed,
                run_at: schedule.run_at,
                occurrence: schedule.occurrence,
                result: e.to_string(),
                completed_at: now,
            }
        });

        let outcome = update.outcome;
        let finished = {
            let update = update.clone();
            db::blocking(&self.store, move |store| store.finish_schedule(id, &update)).await
        };
        match finished {
            Ok(true) => log::info!(
                "{} {}: {} (next status {}, run_at {})",
                schedule.label(),
                outcome,
                update.result,
                update.status,
                update.run_at
            ),
            Ok(false) => log::warn!("{} lost its claim before finishing", schedule.label()),
            Err(e) => log::error!("Failed to settle {}: {}", schedule.label(), e),
        }
        Some((id, outcome))
    }

    /// Renew the claim until dropped, so a run slower than the lease is not
    /// released to another tick.
    async fn hold_claim(&self, schedule_id: i32, claimed_at: NaiveDateTime) -> Infallible {
        let period = (self.settings.claim_lease() / 3)
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_millis(100));
        let started = tokio::time::Instant::now();

        loop {
            tokio::time::sleep(period).await;
            let held_for = chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
            let renewed_at = claimed_at + held_for;
            match db::blocking(&self.store, move |store| store.renew_claim(schedule_id, renewed_at)).await {
                Ok(true) => log::debug!("Schedule {} claim renewed at {}", schedule_id, renewed_at),
                Ok(false) => log::warn!("Schedule {} is no longer claimed by this run", schedule_id),
                Err(e) => log::error!("Failed to renew claim on schedule {}: {}", schedule_id, e),
            }
        }
    }

    /// Attempt the schedule on every target and summarise the cycle.
    async fn execute(
        &self,
        schedule: &Schedule,
        now: NaiveDateTime,
        windows: &[BlackoutWindow],
    ) -> Result<(ScheduleStatus, String), EngineError> {
        let action = schedule.action()?;
        let targets = {
            let schedule = schedule.clone();
            db::blocking(&self.store, move |store| resolver::resolve_targets(store, &schedule)).await?
        };
        if targets.is_empty() {
            return Ok((ScheduleStatus::Completed, "no active targets".to_string()));
        }

        let initiated_by = InitiatedBy::schedule(schedule);

        if let Some(window) = blackout::blocking_window(action, now, windows) {
            let records = targets
                .iter()
                .map(|device| self.executor.record_blocked(device, action, &initiated_by, &window.name));
            for result in join_all(records).await {
                if let Err(e) = result {
                    log::error!("Failed to record blackout skip for {}: {}", schedule.label(), e);
                }
            }
            return Ok((
                ScheduleStatus::Skipped,
                format!("blocked by blackout window '{}'", window.name),
            ));
        }

        let attempts = targets.iter().map(|device| {
            self.executor
                .power(device, action, &initiated_by, self.settings.skip_if_already_in_state)
        });
        let results = join_all(attempts).await;

        let mut failed = Vec::new();
        for (device, result) in targets.iter().zip(results) {
            match result {
                Ok(outcome) if outcome.is_success() => {}
                Ok(outcome) => failed.push(format!("{}: {}", device.name, outcome.message(action))),
                Err(e) => failed.push(format!("{}: {}", device.name, e)),
            }
        }

        if failed.is_empty() {
            Ok((
                ScheduleStatus::Completed,
                format!("{} of {} device(s) succeeded", targets.len(), targets.len()),
            ))
        } else {
            Ok((
                ScheduleStatus::Failed,
                format!(
                    "{} of {} device(s) failed; {}",
                    failed.len(),
                    targets.len(),
                    failed.join("; ")
                ),
            ))
        }
    }
}

/// Tick the dispatcher every `interval` until `shutdown` flips.
///
/// A tick in progress always runs to completion.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = dispatcher.tick(Utc::now().naive_utc()).await {
                        log::error!("Dispatcher tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Dispatcher stopped");
    })
}
