use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db::{self, Store};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::models::{Device, DeviceStatus, PowerState};

/// Keeps `device_status` current for every active device.
pub struct StatusPoller {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    unreachable_threshold: i32,
    failures: Mutex<HashMap<i32, i32>>,
}

impl StatusPoller {
    pub fn new(store: Arc<dyn Store>, executor: Arc<Executor>, unreachable_threshold: i32) -> Self {
        Self {
            store,
            executor,
            unreachable_threshold: unreachable_threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Poll all active devices concurrently. Returns how many answered.
    pub async fn poll_all(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let devices = db::blocking(&self.store, |store| store.active_devices()).await?;
        let polls = devices.iter().map(|device| self.poll_device(device, now));

        let mut reachable = 0;
        for (device, result) in devices.iter().zip(join_all(polls).await) {
            match result {
                Ok(status) if status.consecutive_failures == 0 => reachable += 1,
                Ok(_) => {}
                Err(e) => log::error!("Status poll of {} not stored: {}", device.name, e),
            }
        }
        Ok(reachable)
    }

    /// Poll one device and store the snapshot, reachable or not.
    ///
    /// Device failures are folded into the returned status; only engine
    /// failures come back as errors.
    pub async fn poll_device(&self, device: &Device, now: NaiveDateTime) -> Result<DeviceStatus, EngineError> {
        let polled = self.executor.poll(device).await;

        let device_id = device.id;
        let previous = db::blocking(&self.store, move |store| store.device_status(device_id)).await?;

        let status = match polled {
            Ok(snapshot) => {
                self.reset_failures(device.id);
                if previous.as_ref().is_some_and(|p| !p.reachable) {
                    log::info!("{} is reachable again", device.name);
                }
                DeviceStatus {
                    device_id: device.id,
                    reachable: true,
                    power_state: snapshot.power.as_str().to_string(),
                    input: snapshot.input,
                    lamp_info: snapshot.lamps.map(|v| v.to_string()),
                    error_info: snapshot.errors.map(|v| v.to_string()),
                    consecutive_failures: 0,
                    last_error: None,
                    checked_at: now,
                }
            }
            Err(EngineError::Device(e)) => {
                let stored_failures = previous.as_ref().map(|p| p.consecutive_failures).unwrap_or(0);
                let failures = self.count_failure(device.id, stored_failures);
                let was_reachable = previous.as_ref().map(|p| p.reachable).unwrap_or(true);
                let reachable = was_reachable && failures < self.unreachable_threshold;

                if was_reachable && !reachable {
                    log::warn!("{} unreachable after {} failed polls: {}", device.name, failures, e);
                } else {
                    log::debug!("Poll of {} failed ({} in a row): {}", device.name, failures, e);
                }

                let power_state = match &previous {
                    Some(p) if reachable => p.power_state.clone(),
                    _ => PowerState::Unknown.as_str().to_string(),
                };
                DeviceStatus {
                    device_id: device.id,
                    reachable,
                    power_state,
                    input: previous.as_ref().and_then(|p| p.input.clone()),
                    lamp_info: previous.as_ref().and_then(|p| p.lamp_info.clone()),
                    error_info: previous.as_ref().and_then(|p| p.error_info.clone()),
                    consecutive_failures: failures,
                    last_error: Some(format!("{}: {}", e.kind(), e)),
                    checked_at: now,
                }
            }
            Err(e) => return Err(e),
        };

        let stored = status.clone();
        db::blocking(&self.store, move |store| store.write_device_status(&stored)).await?;
        Ok(status)
    }

    fn count_failure(&self, device_id: i32, stored: i32) -> i32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(device_id).or_insert(stored);
        // A successful command since the last poll clears the stored count.
        if stored == 0 {
            *count = 0;
        }
        *count = count.saturating_add(1);
        *count
    }

    fn reset_failures(&self, device_id: i32) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.insert(device_id, 0);
    }
}

/// Poll every `interval` until `shutdown` flips.
pub fn spawn_status_poller(
    poller: Arc<StatusPoller>,
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
                    match poller.poll_all(Utc::now().naive_utc()).await {
                        Ok(reachable) => log::debug!("Status poll done, {} device(s) answered", reachable),
                        Err(e) => log::error!("Status poll failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Status poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{PowerAction, Recurrence, TargetMode};
    use crate::secrets::StaticSecretStore;
    use crate::settings::EngineSettings;
    use crate::tasks::dispatcher::Dispatcher;
    use crate::testutil::{self, at, MockDevice, MockTransport};

    fn engine(store: &SqliteStore, transport: &MockTransport) -> (StatusPoller, Dispatcher) {
        let settings = EngineSettings::default();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let executor = Arc::new(Executor::new(
            Arc::clone(&shared),
            Arc::new(transport.clone()),
            Arc::new(StaticSecretStore::default()),
            &settings,
        ));
        let poller = StatusPoller::new(Arc::clone(&shared), Arc::clone(&executor), settings.unreachable_threshold);
        (poller, Dispatcher::new(shared, executor, settings))
    }

    #[tokio::test]
    async fn test_successful_poll_writes_snapshot() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.script(
            "10.0.0.1",
            MockDevice {
                power: PowerState::Warming,
                ..MockDevice::default()
            },
        );
        store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let (poller, _) = engine(&store, &transport);

        assert_eq!(poller.poll_all(at(2026, 6, 1, 8, 0)).await.unwrap(), 1);

        let device = store.active_devices().unwrap().remove(0);
        let status = store.device_status(device.id).unwrap().unwrap();
        assert!(status.reachable);
        assert_eq!(status.power_state(), PowerState::Warming);
        assert_eq!(status.input.as_deref(), Some("31"));
        assert!(status.lamp_info.unwrap().contains("1200"));
    }

    #[tokio::test]
    async fn test_unreachable_after_threshold_but_still_scheduled() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.set_unreachable("10.0.0.1");
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let (poller, dispatcher) = engine(&store, &transport);
        let start = at(2026, 6, 1, 8, 0);

        for n in 1..=4 {
            let status = poller.poll_device(&device, start + chrono::Duration::seconds(30 * n)).await.unwrap();
            assert!(status.reachable, "still reachable after {} failures", n);
        }
        let status = poller.poll_device(&device, start + chrono::Duration::seconds(150)).await.unwrap();
        assert!(!status.reachable);
        assert_eq!(status.consecutive_failures, 5);
        assert_eq!(status.power_state(), PowerState::Unknown);
        assert!(status.last_error.unwrap().starts_with("network_unreachable"));

        let due = start + chrono::Duration::minutes(5);
        let schedule = testutil::add_schedule(&store, PowerAction::On, due, Recurrence::None, TargetMode::All);
        dispatcher.tick(due).await.unwrap();

        let records = store.audit_records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error_kind.as_deref(), Some("network_unreachable"));
        assert_eq!(store.schedule(schedule.id).unwrap().status, "failed");
    }

    #[tokio::test]
    async fn test_recovery_resets_failures() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.set_unreachable("10.0.0.1");
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let (poller, _) = engine(&store, &transport);
        let now = at(2026, 6, 1, 8, 0);

        for _ in 0..6 {
            poller.poll_device(&device, now).await.unwrap();
        }
        transport.update("10.0.0.1", |d| d.connect_error = None);

        let status = poller.poll_device(&device, now).await.unwrap();
        assert!(status.reachable);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn test_inactive_devices_are_not_polled() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        let device = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        store.set_device_active(device.id, false).unwrap();
        let (poller, _) = engine(&store, &transport);

        assert_eq!(poller.poll_all(at(2026, 6, 1, 8, 0)).await.unwrap(), 0);
        assert_eq!(transport.connects(), 0);
        assert!(store.device_status(device.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_device_does_not_hold_up_others() {
        let (_dir, store) = testutil::temp_store();
        let transport = MockTransport::default();
        transport.script(
            "10.0.0.1",
            MockDevice {
                delay: Duration::from_millis(300),
                ..MockDevice::default()
            },
        );
        let slow = store.insert_device("Hall A", "10.0.0.1", None).unwrap();
        let fast = store.insert_device("Hall B", "10.0.0.2", None).unwrap();
        let (poller, _) = engine(&store, &transport);
        let poller = Arc::new(poller);
        let now = at(2026, 6, 1, 8, 0);

        let background = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.poll_device(&slow, now).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let refreshed = tokio::time::timeout(Duration::from_millis(250), poller.poll_device(&fast, now))
            .await
            .expect("refresh waited on another device")
            .unwrap();
        assert!(refreshed.reachable);
        background.await.unwrap().unwrap();
    }
}
