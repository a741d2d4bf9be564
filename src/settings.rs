use std::time::Duration;

use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::schema::engine_settings;

/// Engine tunables, persisted as a single row in `engine_settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub dispatch_interval_secs: i64,
    pub poll_interval_secs: i64,
    /// Consecutive failed polls before a device is reported unreachable.
    pub unreachable_threshold: i32,
    pub device_timeout_secs: i64,
    pub max_concurrent_devices: i32,
    /// A claim older than this is considered abandoned by a crashed process.
    pub claim_lease_secs: i64,
    pub shutdown_grace_secs: i64,
    /// Whether a blackout-skipped one-shot schedule is finished, or retried next tick.
    pub skipped_one_shot_is_final: bool,
    pub skip_missed_occurrences: bool,
    pub skip_if_already_in_state: bool,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = engine_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct EngineSettingsRow {
    id: i32,
    dispatch_interval_secs: i64,
    poll_interval_secs: i64,
    unreachable_threshold: i32,
    device_timeout_secs: i64,
    max_concurrent_devices: i32,
    claim_lease_secs: i64,
    shutdown_grace_secs: i64,
    skipped_one_shot_is_final: bool,
    skip_missed_occurrences: bool,
    skip_if_already_in_state: bool,
}

impl From<EngineSettingsRow> for EngineSettings {
    fn from(row: EngineSettingsRow) -> Self {
        Self {
            dispatch_interval_secs: row.dispatch_interval_secs,
            poll_interval_secs: row.poll_interval_secs,
            unreachable_threshold: row.unreachable_threshold,
            device_timeout_secs: row.device_timeout_secs,
            max_concurrent_devices: row.max_concurrent_devices,
            claim_lease_secs: row.claim_lease_secs,
            shutdown_grace_secs: row.shutdown_grace_secs,
            skipped_one_shot_is_final: row.skipped_one_shot_is_final,
            skip_missed_occurrences: row.skip_missed_occurrences,
            skip_if_already_in_state: row.skip_if_already_in_state,
        }
    }
}

impl EngineSettings {
    /// Load settings from DB, fallback to default
    pub fn load(conn: &mut SqliteConnection) -> Self {
        match Self::try_load(conn) {
            Ok(Some(settings)) => settings,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Failed to load engine settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn try_load(conn: &mut SqliteConnection) -> QueryResult<Option<Self>> {
        let row = engine_settings::table
            .order(engine_settings::id.asc())
            .select(EngineSettingsRow::as_select())
            .first(conn)
            .optional()?;

        Ok(row.map(|row| {
            log::debug!("Loaded engine settings row {}", row.id);
            Self::from(row).sanitized()
        }))
    }

    /// Save settings to DB (insert or update)
    pub fn save(&self, conn: &mut SqliteConnection) -> QueryResult<()> {
        use crate::schema::engine_settings::dsl::*;

        let values = (
            dispatch_interval_secs.eq(self.dispatch_interval_secs),
            poll_interval_secs.eq(self.poll_interval_secs),
            unreachable_threshold.eq(self.unreachable_threshold),
            device_timeout_secs.eq(self.device_timeout_secs),
            max_concurrent_devices.eq(self.max_concurrent_devices),
            claim_lease_secs.eq(self.claim_lease_secs),
            shutdown_grace_secs.eq(self.shutdown_grace_secs),
            skipped_one_shot_is_final.eq(self.skipped_one_shot_is_final),
            skip_missed_occurrences.eq(self.skip_missed_occurrences),
            skip_if_already_in_state.eq(self.skip_if_already_in_state),
        );

        let existing: Option<i32> = engine_settings.select(id).first(conn).optional()?;
        match existing {
            Some(row_id) => {
                diesel::update(engine_settings.filter(id.eq(row_id)))
                    .set(values)
                    .execute(conn)?;
            }
            None => {
                diesel::insert_into(engine_settings).values(values).execute(conn)?;
            }
        }

        Ok(())
    }

    /// Clamp values a hand-edited row could set to something unusable.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.dispatch_interval_secs <= 0 {
            self.dispatch_interval_secs = defaults.dispatch_interval_secs;
        }
        if self.poll_interval_secs <= 0 {
            self.poll_interval_secs = defaults.poll_interval_secs;
        }
        if self.device_timeout_secs <= 0 {
            self.device_timeout_secs = defaults.device_timeout_secs;
        }
        if self.shutdown_grace_secs <= 0 {
            self.shutdown_grace_secs = defaults.shutdown_grace_secs;
        }
        self.unreachable_threshold = self.unreachable_threshold.max(1);
        self.max_concurrent_devices = self.max_concurrent_devices.max(1);
        // Outlast two capped device operations plus a tick. Live runs also renew their claim.
        let lease_floor = self.device_timeout_secs * 12 + self.dispatch_interval_secs;
        self.claim_lease_secs = self.claim_lease_secs.max(lease_floor);
        self
    }

    pub fn dispatch_interval(&self) -> Duration {
        secs(self.dispatch_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        secs(self.device_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_secs)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs)
    }
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(1).max(1))
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 15,
            poll_interval_secs: 30,
            unreachable_threshold: 5,
            device_timeout_secs: 5,
            max_concurrent_devices: 8,
            claim_lease_secs: 900,
            shutdown_grace_secs: 30,
            skipped_one_shot_is_final: true,
            skip_missed_occurrences: false,
            skip_if_already_in_state: true,
        }
    }
}
