//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use crate::db::SqliteStore;
use crate::error::{DeviceError, ProtocolErrorCode};
use crate::models::{NewSchedule, PowerAction, PowerState, Recurrence, Schedule, TargetMode};
use crate::protocol::{Command, DeviceSession, DeviceTransport, Reply};

/// A migrated SQLite database that lives as long as the returned directory.
pub fn temp_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("engine.db");
    let store = SqliteStore::open(url.to_str().unwrap()).unwrap();
    (dir, store)
}

pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn add_schedule(
    store: &SqliteStore,
    action: PowerAction,
    run_at: NaiveDateTime,
    recurrence: Recurrence,
    target_mode: TargetMode,
) -> Schedule {
    store
        .insert_schedule(&NewSchedule::pending(action, run_at, recurrence, target_mode, run_at))
        .unwrap()
}

/// How the fake device at one address behaves.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub connect_error: Option<DeviceError>,
    /// Returned for every power command.
    pub command_error: Option<ProtocolErrorCode>,
    pub delay: Duration,
    pub power: PowerState,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            connect_error: None,
            command_error: None,
            delay: Duration::ZERO,
            power: PowerState::Off,
        }
    }
}

/// Scripted transport. Unknown addresses behave like a healthy device that is off.
#[derive(Default, Clone)]
pub struct MockTransport {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    connects: Arc<Mutex<usize>>,
    /// `(open now, most ever open at once)` per address.
    sessions: Arc<Mutex<HashMap<String, (usize, usize)>>>,
}

impl MockTransport {
    pub fn script(&self, address: &str, device: MockDevice) {
        self.devices.lock().unwrap().insert(address.to_string(), device);
    }

    pub fn set_unreachable(&self, address: &str) {
        self.update(address, |d| {
            d.connect_error = Some(DeviceError::Unreachable("no route to host".into()))
        });
    }

    pub fn update(&self, address: &str, change: impl FnOnce(&mut MockDevice)) {
        let mut devices = self.devices.lock().unwrap();
        change(devices.entry(address.to_string()).or_default());
    }

    pub fn power(&self, address: &str) -> PowerState {
        self.devices
            .lock()
            .unwrap()
            .get(address)
            .map(|d| d.power)
            .unwrap_or(PowerState::Off)
    }

    /// Every wire command sent, as `(address, wire)`, in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Only state-changing commands.
    pub fn power_commands(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter(|(_, wire)| wire.starts_with("%1POWR") && !wire.ends_with('?'))
            .collect()
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    /// Most sessions ever open at once against `address`.
    pub fn peak_sessions(&self, address: &str) -> usize {
        self.sessions.lock().unwrap().get(address).map(|(_, peak)| *peak).unwrap_or(0)
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn connect(
        &self,
        address: &str,
        _secret: Option<&str>,
    ) -> Result<Box<dyn DeviceSession>, DeviceError> {
        *self.connects.lock().unwrap() += 1;
        let device = self.devices.lock().unwrap().get(address).cloned().unwrap_or_default();
        if let Some(error) = device.connect_error {
            return Err(error);
        }
        {
            let mut sessions = self.sessions.lock().unwrap();
            let (open, peak) = sessions.entry(address.to_string()).or_default();
            *open += 1;
            *peak = (*peak).max(*open);
        }
        Ok(Box::new(MockSession {
            address: address.to_string(),
            transport: self.clone(),
        }))
    }
}

struct MockSession {
    address: String,
    transport: MockTransport,
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn send(&mut self, command: &Command) -> Result<Reply, DeviceError> {
        let device = self
            .transport
            .devices
            .lock()
            .unwrap()
            .get(&self.address)
            .cloned()
            .unwrap_or_default();

        if !device.delay.is_zero() {
            tokio::time::sleep(device.delay).await;
        }
        self.transport
            .sent
            .lock()
            .unwrap()
            .push((self.address.clone(), command.wire()));

        let data = match (command.body(), command.is_query()) {
            ("POWR", true) => match device.power {
                PowerState::On => "1",
                PowerState::Cooling => "2",
                PowerState::Warming => "3",
                _ => "0",
            }
            .to_string(),
            ("POWR", false) => {
                if let Some(code) = device.command_error {
                    return Err(DeviceError::Protocol(code));
                }
                let power = if command.wire().ends_with('1') {
                    PowerState::On
                } else {
                    PowerState::Off
                };
                self.transport.update(&self.address, |d| d.power = power);
                "OK".to_string()
            }
            ("INPT", _) => "31".to_string(),
            ("LAMP", _) => "1200 1".to_string(),
            ("ERST", _) => "000000".to_string(),
            _ => return Err(DeviceError::Protocol(ProtocolErrorCode::UndefinedCommand)),
        };

        Ok(Reply {
            body: command.body().to_string(),
            data,
        })
    }

    async fn close(&mut self) {
        if let Some((open, _)) = self.transport.sessions.lock().unwrap().get_mut(&self.address) {
            *open = open.saturating_sub(1);
        }
    }
}
