use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Months, NaiveDateTime};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::schema::{audit_log, blackout_windows, device_status, devices, schedules};
#[cfg(test)]
use crate::schema::schedule_targets;

/// Enumerations stored as lowercase text columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::InvalidData(format!(
                        "{} is not a valid {}",
                        other,
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(PowerAction { On => "on", Off => "off" });

text_enum!(ScheduleStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

text_enum!(Recurrence {
    None => "none",
    Hourly => "hourly",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
    Yearly => "yearly",
});

text_enum!(TargetMode { All => "all", Selection => "selection" });

text_enum!(BlockAction { On => "on", Off => "off", Both => "both" });

text_enum!(Initiator { User => "user", Schedule => "schedule", System => "system" });

text_enum!(PowerState {
    On => "on",
    Off => "off",
    Warming => "warming",
    Cooling => "cooling",
    Standby => "standby",
    Unknown => "unknown",
});

impl PowerState {
    /// Whether a device in this state already satisfies `action`.
    pub fn satisfies(&self, action: PowerAction) -> bool {
        match action {
            PowerAction::On => matches!(self, Self::On | Self::Warming),
            PowerAction::Off => matches!(self, Self::Off | Self::Cooling | Self::Standby),
        }
    }
}

impl BlockAction {
    pub fn covers(&self, action: PowerAction) -> bool {
        match self {
            Self::Both => true,
            Self::On => action == PowerAction::On,
            Self::Off => action == PowerAction::Off,
        }
    }
}

impl Recurrence {
    /// The instant `n` periods after `anchor`, or `None` for one-shot schedules.
    ///
    /// Calendar units are added to the anchor in one step so end-of-month
    /// clamping never compounds across occurrences.
    pub fn nth_after(&self, anchor: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
        match self {
            Self::None => None,
            Self::Hourly => anchor.checked_add_signed(Duration::hours(i64::from(n))),
            Self::Daily => anchor.checked_add_signed(Duration::days(i64::from(n))),
            Self::Weekly => anchor.checked_add_signed(Duration::weeks(i64::from(n))),
            Self::Monthly => anchor.checked_add_months(Months::new(n)),
            Self::Yearly => anchor.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }

    pub fn is_recurring(&self) -> bool {
        *self != Self::None
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Device {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub secret_ref: Option<String>,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

#[cfg(test)]
#[derive(Debug, Insertable)]
#[diesel(table_name = devices)]
pub struct NewDevice<'a> {
    pub name: &'a str,
    pub address: &'a str,
    pub secret_ref: Option<&'a str>,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = device_status)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceStatus {
    pub device_id: i32,
    pub reachable: bool,
    pub power_state: String,
    pub input: Option<String>,
    pub lamp_info: Option<String>,
    pub error_info: Option<String>,
    pub consecutive_failures: i32,
    pub last_error: Option<String>,
    pub checked_at: NaiveDateTime,
}

impl DeviceStatus {
    pub fn power_state(&self) -> PowerState {
        self.power_state.parse().unwrap_or(PowerState::Unknown)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schedules)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Schedule {
    pub id: i32,
    pub name: Option<String>,
    pub action: String,
    pub run_at: NaiveDateTime,
    pub anchor_at: NaiveDateTime,
    pub occurrence: i32,
    pub status: String,
    pub enabled: bool,
    pub recurrence: String,
    pub target_mode: String,
    pub result: Option<String>,
    pub last_outcome: Option<String>,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub claimed_at: Option<NaiveDateTime>,
}

impl Schedule {
    pub fn action(&self) -> Result<PowerAction, EngineError> {
        self.action.parse()
    }

    pub fn status(&self) -> Result<ScheduleStatus, EngineError> {
        self.status.parse()
    }

    pub fn recurrence(&self) -> Result<Recurrence, EngineError> {
        self.recurrence.parse()
    }

    pub fn target_mode(&self) -> Result<TargetMode, EngineError> {
        self.target_mode.parse()
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("schedule {} ({})", self.id, name),
            None => format!("schedule {}", self.id),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Insertable)]
#[diesel(table_name = schedules)]
pub struct NewSchedule<'a> {
    pub name: Option<&'a str>,
    pub action: &'a str,
    pub run_at: NaiveDateTime,
    pub anchor_at: NaiveDateTime,
    pub occurrence: i32,
    pub status: &'a str,
    pub enabled: bool,
    pub recurrence: &'a str,
    pub target_mode: &'a str,
    pub created_at: NaiveDateTime,
}

#[cfg(test)]
impl<'a> NewSchedule<'a> {
    pub fn pending(
        action: PowerAction,
        run_at: NaiveDateTime,
        recurrence: Recurrence,
        target_mode: TargetMode,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            name: None,
            action: action.as_str(),
            run_at,
            anchor_at: run_at,
            occurrence: 0,
            status: ScheduleStatus::Pending.as_str(),
            enabled: true,
            recurrence: recurrence.as_str(),
            target_mode: target_mode.as_str(),
            created_at,
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schedule_targets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScheduleTarget {
    pub schedule_id: i32,
    pub device_id: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = blackout_windows)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BlackoutWindow {
    pub id: i32,
    pub name: String,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub block_action: String,
}

impl BlackoutWindow {
    pub fn block_action(&self) -> Result<BlockAction, EngineError> {
        self.block_action.parse()
    }

    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        self.start_at <= instant && instant <= self.end_at
    }
}

#[cfg(test)]
#[derive(Debug, Insertable)]
#[diesel(table_name = blackout_windows)]
pub struct NewBlackoutWindow<'a> {
    pub name: &'a str,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub block_action: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = audit_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AuditRecord {
    pub id: i32,
    pub device_id: Option<i32>,
    pub device_name: Option<String>,
    pub action: String,
    pub initiated_by: String,
    pub initiator_ref: Option<String>,
    pub success: bool,
    pub error_kind: Option<String>,
    pub message: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_log)]
pub struct NewAuditRecord {
    pub device_id: Option<i32>,
    pub device_name: Option<String>,
    pub action: String,
    pub initiated_by: String,
    pub initiator_ref: Option<String>,
    pub success: bool,
    pub error_kind: Option<String>,
    pub message: String,
    pub created_at: NaiveDateTime,
}
