use std::sync::Arc;

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::error::EngineError;
use crate::models::{AuditRecord, BlackoutWindow, Device, DeviceStatus, NewAuditRecord, Schedule, ScheduleStatus};
#[cfg(test)]
use crate::models::{BlockAction, NewBlackoutWindow, NewDevice, NewSchedule, ScheduleTarget};
use crate::resolver::ScheduleUpdate;
use crate::schema::{audit_log, blackout_windows, device_status, devices, schedule_targets, schedules};

pub mod pool;

pub use pool::{DbConn, DbPool};

/// The narrow persistence surface the engine is allowed to touch.
///
/// Audit records can only be appended.
pub trait Store: Send + Sync + 'static {
    fn active_devices(&self) -> Result<Vec<Device>, EngineError>;

    fn device(&self, device_id: i32) -> Result<Option<Device>, EngineError>;

    fn device_status(&self, device_id: i32) -> Result<Option<DeviceStatus>, EngineError>;

    /// Insert or overwrite the status snapshot of one device.
    fn write_device_status(&self, status: &DeviceStatus) -> Result<(), EngineError>;

    fn release_stale_claims(&self, claimed_before: NaiveDateTime) -> Result<usize, EngineError>;

    fn due_schedules(&self, now: NaiveDateTime) -> Result<Vec<Schedule>, EngineError>;

    /// Compare-and-set `pending -> running`. Returns false if another tick got there first.
    fn claim_schedule(&self, schedule_id: i32, now: NaiveDateTime) -> Result<bool, EngineError>;

    /// Move `claimed_at` forward on a schedule that is still `running`.
    fn renew_claim(&self, schedule_id: i32, at: NaiveDateTime) -> Result<bool, EngineError>;

    /// Compare-and-set `running -> update.status`. Returns false if the claim was lost.
    fn finish_schedule(&self, schedule_id: i32, update: &ScheduleUpdate) -> Result<bool, EngineError>;

    /// Active devices named by the schedule's target rows.
    fn selected_devices(&self, schedule_id: i32) -> Result<Vec<Device>, EngineError>;

    /// Windows that have not ended before `now`.
    fn blackout_windows(&self, now: NaiveDateTime) -> Result<Vec<BlackoutWindow>, EngineError>;

    fn append_audit(&self, record: &NewAuditRecord) -> Result<(), EngineError>;

    /// Latest `limit` records for a device, newest first.
    fn recent_audit(&self, device_id: i32, limit: i64) -> Result<Vec<AuditRecord>, EngineError>;
}

/// Run a store call on tokio's blocking pool.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, call: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, EngineError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref())).await?
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn open(database_url: &str) -> Result<Self, EngineError> {
        Ok(Self {
            pool: pool::init_pool(database_url)?,
        })
    }

    /// Get a single connection from the pool
    pub fn conn(&self) -> Result<DbConn, EngineError> {
        Ok(self.pool.get()?)
    }
}

impl Store for SqliteStore {
    fn active_devices(&self) -> Result<Vec<Device>, EngineError> {
        let mut conn = self.conn()?;
        Ok(devices::table
            .filter(devices::active.eq(true))
            .order(devices::id.asc())
            .select(Device::as_select())
            .load(&mut conn)?)
    }

    fn device(&self, device_id: i32) -> Result<Option<Device>, EngineError> {
        let mut conn = self.conn()?;
        Ok(devices::table
            .find(device_id)
            .select(Device::as_select())
            .first(&mut conn)
            .optional()?)
    }

    fn device_status(&self, device_id: i32) -> Result<Option<DeviceStatus>, EngineError> {
        let mut conn = self.conn()?;
        Ok(device_status::table
            .find(device_id)
            .select(DeviceStatus::as_select())
            .first(&mut conn)
            .optional()?)
    }

    fn write_device_status(&self, status: &DeviceStatus) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        diesel::insert_into(device_status::table)
            .values(status)
            .on_conflict(device_status::device_id)
            .do_update()
            .set((
                device_status::reachable.eq(status.reachable),
                device_status::power_state.eq(&status.power_state),
                device_status::input.eq(&status.input),
                device_status::lamp_info.eq(&status.lamp_info),
                device_status::error_info.eq(&status.error_info),
                device_status::consecutive_failures.eq(status.consecutive_failures),
                device_status::last_error.eq(&status.last_error),
                device_status::checked_at.eq(status.checked_at),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn release_stale_claims(&self, claimed_before: NaiveDateTime) -> Result<usize, EngineError> {
        let mut conn = self.conn()?;
        let released = diesel::update(
            schedules::table
                .filter(schedules::status.eq(ScheduleStatus::Running.as_str()))
                .filter(schedules::claimed_at.lt(claimed_before)),
        )
        .set((
            schedules::status.eq(ScheduleStatus::Pending.as_str()),
            schedules::claimed_at.eq(None::<NaiveDateTime>),
        ))
        .execute(&mut conn)?;
        Ok(released)
    }

    fn due_schedules(&self, now: NaiveDateTime) -> Result<Vec<Schedule>, EngineError> {
        let mut conn = self.conn()?;
        Ok(schedules::table
            .filter(schedules::enabled.eq(true))
            .filter(schedules::status.eq(ScheduleStatus::Pending.as_str()))
            .filter(schedules::run_at.le(now))
            .order((schedules::run_at.asc(), schedules::id.asc()))
            .select(Schedule::as_select())
            .load(&mut conn)?)
    }

    fn claim_schedule(&self, schedule_id: i32, now: NaiveDateTime) -> Result<bool, EngineError> {
        let mut conn = self.conn()?;
        let claimed = diesel::update(
            schedules::table
                .filter(schedules::id.eq(schedule_id))
                .filter(schedules::enabled.eq(true))
                .filter(schedules::status.eq(ScheduleStatus::Pending.as_str())),
        )
        .set((
            schedules::status.eq(ScheduleStatus::Running.as_str()),
            schedules::claimed_at.eq(Some(now)),
        ))
        .execute(&mut conn)?;
        Ok(claimed == 1)
    }

    fn renew_claim(&self, schedule_id: i32, at: NaiveDateTime) -> Result<bool, EngineError> {
        let mut conn = self.conn()?;
        let renewed = diesel::update(
            schedules::table
                .filter(schedules::id.eq(schedule_id))
                .filter(schedules::status.eq(ScheduleStatus::Running.as_str())),
        )
        .set(schedules::claimed_at.eq(Some(at)))
        .execute(&mut conn)?;
        Ok(renewed == 1)
    }

    fn finish_schedule(&self, schedule_id: i32, update: &ScheduleUpdate) -> Result<bool, EngineError> {
        let mut conn = self.conn()?;
        let finished = diesel::update(
            schedules::table
                .filter(schedules::id.eq(schedule_id))
                .filter(schedules::status.eq(ScheduleStatus::Running.as_str())),
        )
        .set((
            schedules::status.eq(update.status.as_str()),
            schedules::run_at.eq(update.run_at),
            schedules::occurrence.eq(update.occurrence),
            schedules::result.eq(Some(update.result.as_str())),
            schedules::last_outcome.eq(Some(update.outcome.as_str())),
            schedules::completed_at.eq(Some(update.completed_at)),
            schedules::claimed_at.eq(None::<NaiveDateTime>),
        ))
        .execute(&mut conn)?;
        Ok(finished == 1)
    }

    fn selected_devices(&self, schedule_id: i32) -> Result<Vec<Device>, EngineError> {
        let mut conn = self.conn()?;
        Ok(schedule_targets::table
            .inner_join(devices::table)
            .filter(schedule_targets::schedule_id.eq(schedule_id))
            .filter(devices::active.eq(true))
            .order(devices::id.asc())
            .select(Device::as_select())
            .load(&mut conn)?)
    }

    fn blackout_windows(&self, now: NaiveDateTime) -> Result<Vec<BlackoutWindow>, EngineError> {
        let mut conn = self.conn()?;
        Ok(blackout_windows::table
            .filter(blackout_windows::end_at.ge(now))
            .order(blackout_windows::start_at.asc())
            .select(BlackoutWindow::as_select())
            .load(&mut conn)?)
    }

    fn append_audit(&self, record: &NewAuditRecord) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        diesel::insert_into(audit_log::table)
            .values(record)
            .execute(&mut conn)?;
        Ok(())
    }

    fn recent_audit(&self, device_id: i32, limit: i64) -> Result<Vec<AuditRecord>, EngineError> {
        let mut conn = self.conn()?;
        Ok(audit_log::table
            .filter(audit_log::device_id.eq(device_id))
            .order(audit_log::id.desc())
            .limit(limit)
            .select(AuditRecord::as_select())
            .load(&mut conn)?)
    }
}

/// Provisioning helpers. Devices, schedules and windows are managed outside
/// the engine, so only tests write them through here.
#[cfg(test)]
impl SqliteStore {
    pub fn insert_device(
        &self,
        name: &str,
        address: &str,
        secret_ref: Option<&str>,
    ) -> Result<Device, EngineError> {
        let mut conn = self.conn()?;
        let row = NewDevice {
            name,
            address,
            secret_ref,
            active: true,
            created_at: chrono::Utc::now().naive_utc(),
        };

        conn.transaction(|conn| {
            diesel::insert_into(devices::table).values(&row).execute(conn)?;
            devices::table
                .order(devices::id.desc())
                .select(Device::as_select())
                .first(conn)
        })
        .map_err(EngineError::from)
    }

    /// Soft delete: inactive devices keep their history but leave scheduling and polling.
    pub fn set_device_active(&self, device_id: i32, active: bool) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let updated = diesel::update(devices::table.find(device_id))
            .set(devices::active.eq(active))
            .execute(&mut conn)?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("device {}", device_id)));
        }
        Ok(())
    }

    pub fn insert_schedule(&self, new_schedule: &NewSchedule<'_>) -> Result<Schedule, EngineError> {
        let mut conn = self.conn()?;
        conn.transaction(|conn| {
            diesel::insert_into(schedules::table).values(new_schedule).execute(conn)?;
            schedules::table
                .order(schedules::id.desc())
                .select(Schedule::as_select())
                .first(conn)
        })
        .map_err(EngineError::from)
    }

    pub fn schedule(&self, schedule_id: i32) -> Result<Schedule, EngineError> {
        let mut conn = self.conn()?;
        schedules::table
            .find(schedule_id)
            .select(Schedule::as_select())
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {}", schedule_id)))
    }

    pub fn insert_blackout(
        &self,
        name: &str,
        start_at: NaiveDateTime,
        end_at: NaiveDateTime,
        block_action: BlockAction,
    ) -> Result<BlackoutWindow, EngineError> {
        if start_at >= end_at {
            return Err(EngineError::InvalidData(format!(
                "blackout window {} ends before it starts",
                name
            )));
        }

        let mut conn = self.conn()?;
        let row = NewBlackoutWindow {
            name,
            start_at,
            end_at,
            block_action: block_action.as_str(),
        };
        conn.transaction(|conn| {
            diesel::insert_into(blackout_windows::table).values(&row).execute(conn)?;
            blackout_windows::table
                .order(blackout_windows::id.desc())
                .select(BlackoutWindow::as_select())
                .first(conn)
        })
        .map_err(EngineError::from)
    }

    /// Every audit record in insertion order.
    pub fn audit_records(&self) -> Result<Vec<AuditRecord>, EngineError> {
        let mut conn = self.conn()?;
        Ok(audit_log::table
            .order(audit_log::id.asc())
            .select(AuditRecord::as_select())
            .load(&mut conn)?)
    }

    pub fn schedule_targets(&self, schedule_id: i32) -> Result<Vec<ScheduleTarget>, EngineError> {
        let mut conn = self.conn()?;
        Ok(schedule_targets::table
            .filter(schedule_targets::schedule_id.eq(schedule_id))
            .order(schedule_targets::device_id.asc())
            .select(ScheduleTarget::as_select())
            .load(&mut conn)?)
    }

    pub fn set_schedule_targets(&self, schedule_id: i32, device_ids: &[i32]) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        conn.transaction(|conn| {
            diesel::delete(
                schedule_targets::table.filter(schedule_targets::schedule_id.eq(schedule_id)),
            )
            .execute(conn)?;

            for target in device_ids {
                diesel::insert_into(schedule_targets::table)
                    .values(ScheduleTarget {
                        schedule_id,
                        device_id: *target,
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)?;
            }
            diesel::QueryResult::Ok(())
        })?;
        Ok(())
    }
}
