use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::audit_log::{AttemptOutcome, AuditRecorder, InitiatedBy};
use crate::db::{self, Store};
use crate::error::{DeviceError, EngineError};
use crate::models::{Device, DeviceStatus, PowerAction, PowerState};
use crate::protocol::{self, Command, DeviceSession, DeviceTransport, StatusSnapshot};
use crate::secrets::SecretStore;
use crate::settings::EngineSettings;

/// Serialises every operation against one device.
///
/// The slot owns the device's session while an operation runs. Waiters are
/// served in the order they asked.
#[derive(Default)]
pub struct DeviceSlot {
    session: AsyncMutex<Option<Box<dyn DeviceSession>>>,
}

/// Runs power commands and status queries through per-device slots.
pub struct Executor {
    store: Arc<dyn Store>,
    transport: Arc<dyn DeviceTransport>,
    secrets: Arc<dyn SecretStore>,
    recorder: AuditRecorder,
    slots: Mutex<HashMap<i32, Arc<DeviceSlot>>>,
    permits: Semaphore,
    operation_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn DeviceTransport>,
        secrets: Arc<dyn SecretStore>,
        settings: &EngineSettings,
    ) -> Self {
        let permits = usize::try_from(settings.max_concurrent_devices).unwrap_or(1).max(1);
        Self {
            recorder: AuditRecorder::new(Arc::clone(&store)),
            store,
            transport,
            secrets,
            slots: Mutex::new(HashMap::new()),
            permits: Semaphore::new(permits),
            // connect, authenticate and up to four exchanges
            operation_timeout: settings.device_timeout() * 6,
        }
    }

    pub fn slot(&self, device_id: i32) -> Arc<DeviceSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(device_id).or_default())
    }

    /// Refuse new device work. Operations already holding a permit finish.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Execute `action` on `device` and record the attempt.
    ///
    /// With `skip_if_in_state`, a device whose confirmed state already matches
    /// is recorded as a success without sending anything.
    pub async fn power(
        &self,
        device: &Device,
        action: PowerAction,
        initiated_by: &InitiatedBy,
        skip_if_in_state: bool,
    ) -> Result<AttemptOutcome, EngineError> {
        let slot = self.slot(device.id);
        let mut held = slot.session.lock().await;
        let _permit = self.permits.acquire().await.map_err(|_| EngineError::ShuttingDown)?;

        let mut outcome = None;
        if skip_if_in_state {
            if let Some(state) = self.confirmed_state(device).await? {
                if state.satisfies(action) {
                    outcome = Some(AttemptOutcome::AlreadyInState(state));
                }
            }
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                let sent = self
                    .within_deadline(async {
                        let session = held.insert(self.open(device).await?);
                        let reply = session.send(&Command::power(action)).await?;
                        if reply.is_ok() {
                            Ok(())
                        } else {
                            Err(DeviceError::MalformedReply(format!(
                                "unexpected acknowledgement {:?}",
                                reply.data
                            )))
                        }
                    })
                    .await;
                release(&mut held).await;

                match sent {
                    Ok(()) => AttemptOutcome::Succeeded,
                    Err(e) => AttemptOutcome::Failed(e),
                }
            }
        };

        if let AttemptOutcome::Failed(e) = &outcome {
            log::warn!("Power {} on {} failed: {}", action, device.name, e);
        } else {
            log::info!("Power {} on {} by {}", action, device.name, initiated_by.kind);
        }

        // Recorded while the slot is held so records follow initiation order.
        self.recorder.record(device, action, initiated_by, &outcome).await?;
        if outcome == AttemptOutcome::Succeeded {
            self.note_commanded(device, action).await;
        }
        Ok(outcome)
    }

    /// Power state of a reachable snapshot taken after the device's last
    /// recorded attempt. Anything older may predate a command.
    async fn confirmed_state(&self, device: &Device) -> Result<Option<PowerState>, EngineError> {
        let device_id = device.id;
        let (status, latest) = db::blocking(&self.store, move |store| {
            Ok((store.device_status(device_id)?, store.recent_audit(device_id, 1)?))
        })
        .await?;

        let Some(status) = status.filter(|s| s.reachable) else {
            return Ok(None);
        };
        if let Some(record) = latest.first().filter(|r| r.created_at > status.checked_at) {
            log::debug!(
                "Status of {} from {} predates the attempt at {}, sending anyway",
                device.name,
                status.checked_at,
                record.created_at
            );
            return Ok(None);
        }
        Ok(Some(status.power_state()))
    }

    /// Reflect an acknowledged command in the stored status until the next poll.
    async fn note_commanded(&self, device: &Device, action: PowerAction) {
        let device_id = device.id;
        let power_state = match action {
            PowerAction::On => PowerState::Warming,
            PowerAction::Off => PowerState::Cooling,
        };
        let written = db::blocking(&self.store, move |store| {
            let previous = store.device_status(device_id)?;
            store.write_device_status(&DeviceStatus {
                device_id,
                reachable: true,
                power_state: power_state.as_str().to_string(),
                input: previous.as_ref().and_then(|p| p.input.clone()),
                lamp_info: previous.as_ref().and_then(|p| p.lamp_info.clone()),
                error_info: previous.as_ref().and_then(|p| p.error_info.clone()),
                consecutive_failures: 0,
                last_error: None,
                checked_at: Utc::now().naive_utc(),
            })
        })
        .await;
        if let Err(e) = written {
            log::warn!("Failed to update status of {} after power {}: {}", device.name, action, e);
        }
    }

    /// Record an attempt suppressed by a blackout window.
    pub async fn record_blocked(
        &self,
        device: &Device,
        action: PowerAction,
        initiated_by: &InitiatedBy,
        window: &str,
    ) -> Result<AttemptOutcome, EngineError> {
        let slot = self.slot(device.id);
        let _held = slot.session.lock().await;

        let outcome = AttemptOutcome::Blocked {
            window: window.to_string(),
        };
        log::info!("Power {} on {} blocked by blackout window '{}'", action, device.name, window);
        self.recorder.record(device, action, initiated_by, &outcome).await?;
        Ok(outcome)
    }

    /// Query live status. Device failures come back as `EngineError::Device`.
    pub async fn poll(&self, device: &Device) -> Result<StatusSnapshot, EngineError> {
        let slot = self.slot(device.id);
        let mut held = slot.session.lock().await;
        let _permit = self.permits.acquire().await.map_err(|_| EngineError::ShuttingDown)?;

        let snapshot = self
            .within_deadline(async {
                let session = held.insert(self.open(device).await?);
                protocol::query_status(&mut **session).await
            })
            .await;
        release(&mut held).await;

        Ok(snapshot?)
    }

    async fn open(&self, device: &Device) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let secret = device
            .secret_ref
            .as_deref()
            .and_then(|reference| self.secrets.secret(reference));
        if device.secret_ref.is_some() && secret.is_none() {
            log::warn!("No secret available for {}, connecting without one", device.name);
        }
        self.transport.connect(&device.address, secret.as_deref()).await
    }

    async fn within_deadline<T>(
        &self,
        operation: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .unwrap_or(Err(DeviceError::Timeout("operation")))
    }
}

async fn release(held: &mut Option<Box<dyn DeviceSession>>) {
    if let Some(mut session) = held.take() {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolErrorCode;
    use crate::secrets::StaticSecretStore;
    use crate::testutil::{self, MockDevice, MockTransport};

    fn executor(store: &crate::db::SqliteStore, transport: &MockTransport) -> Arc<Executor> {
        Arc::new(Executor::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            Arc::new(StaticSecretStore::default()),
            &EngineSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_power_sends_and_records() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::user("sam"), false)
            .await
            .unwrap();

        assert_eq!(outcome, AttemptOutcome::Succeeded);
        assert_eq!(transport.power_commands(), vec![("10.0.0.1".to_string(), "%1POWR 1".to_string())]);
        let records = store.audit_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].initiated_by, "user");
    }

    #[tokio::test]
    async fn test_protocol_refusal_is_classified() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.script(
            "10.0.0.1",
            MockDevice {
                command_error: Some(ProtocolErrorCode::OutOfParameter),
                ..MockDevice::default()
            },
        );
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), false)
            .await
            .unwrap();

        assert!(!outcome.is_success());
        let record = &store.audit_records().unwrap()[0];
        assert!(!record.success);
        assert_eq!(record.error_kind.as_deref(), Some("protocol.out_of_parameter"));
    }

    #[tokio::test]
    async fn test_skip_if_already_in_state_uses_reachable_status() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        let mut status = DeviceStatus {
            device_id: device.id,
            reachable: true,
            power_state: PowerState::On.as_str().into(),
            input: None,
            lamp_info: None,
            error_info: None,
            consecutive_failures: 0,
            last_error: None,
            checked_at: testutil::at(2026, 6, 1, 8, 0),
        };
        store.write_device_status(&status).unwrap();

        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), true)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::AlreadyInState(PowerState::On));
        assert!(transport.power_commands().is_empty());

        status.reachable = false;
        store.write_device_status(&status).unwrap();
        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), true)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Succeeded);
        assert_eq!(transport.power_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_older_than_last_attempt_is_not_trusted() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        store
            .write_device_status(&DeviceStatus {
                device_id: device.id,
                reachable: true,
                power_state: PowerState::On.as_str().into(),
                input: None,
                lamp_info: None,
                error_info: None,
                consecutive_failures: 0,
                last_error: None,
                checked_at: testutil::at(2026, 6, 1, 8, 0),
            })
            .unwrap();
        let turned_off = AuditRecorder::entry(
            &device,
            PowerAction::Off,
            &InitiatedBy::user("sam"),
            &AttemptOutcome::Succeeded,
            testutil::at(2026, 6, 1, 8, 5),
        );
        store.append_audit(&turned_off).unwrap();

        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), true)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Succeeded);
        assert_eq!(transport.power_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_command_updates_status() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        executor
            .power(&device, PowerAction::On, &InitiatedBy::user("sam"), false)
            .await
            .unwrap();
        let status = store.device_status(device.id).unwrap().unwrap();
        assert!(status.reachable);
        assert_eq!(status.power_state(), PowerState::Warming);

        let outcome = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), true)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::AlreadyInState(PowerState::Warming));

        let outcome = executor
            .power(&device, PowerAction::Off, &InitiatedBy::system(), true)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Succeeded);
        assert_eq!(transport.power_commands().len(), 2);
        assert_eq!(store.device_status(device.id).unwrap().unwrap().power_state(), PowerState::Cooling);
    }

    #[tokio::test]
    async fn test_operations_on_one_device_are_serialised() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.script(
            "10.0.0.1",
            MockDevice {
                delay: Duration::from_millis(100),
                ..MockDevice::default()
            },
        );
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        let first = {
            let executor = Arc::clone(&executor);
            let device = device.clone();
            tokio::spawn(async move {
                executor.power(&device, PowerAction::On, &InitiatedBy::system(), false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = executor.power(&device, PowerAction::Off, &InitiatedBy::user("sam"), false).await;
        first.await.unwrap().unwrap();
        second.unwrap();

        let actions: Vec<String> = store.audit_records().unwrap().into_iter().map(|r| r.action).collect();
        assert_eq!(actions, vec!["on", "off"]);
        assert_eq!(transport.power(&device.address), PowerState::Off);
    }

    #[tokio::test]
    async fn test_unreachable_device_fails_without_session() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.set_unreachable("10.0.0.9");
        let device = store.insert_device("Hall Z", "10.0.0.9", None).unwrap();
        let executor = executor(&store, &transport);

        let err = executor.poll(&device).await.unwrap_err();
        assert!(matches!(err, EngineError::Device(DeviceError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_closed_executor_refuses_work() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let executor = executor(&store, &transport);

        executor.close();
        let err = executor
            .power(&device, PowerAction::On, &InitiatedBy::system(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
        assert_eq!(transport.connects(), 0);
    }
}
