use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit_log::{AttemptOutcome, InitiatedBy};
use crate::db::{self, Store};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::models::{AuditRecord, Device, DeviceStatus, PowerAction};
use crate::protocol::DeviceTransport;
use crate::secrets::SecretStore;
use crate::settings::EngineSettings;
use crate::tasks::{self, Dispatcher, StatusPoller};

/// Everything the background loops and the HTTP surface share.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: EngineSettings,
    pub executor: Arc<Executor>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<StatusPoller>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn DeviceTransport>,
        secrets: Arc<dyn SecretStore>,
        settings: EngineSettings,
    ) -> Self {
        let executor = Arc::new(Executor::new(Arc::clone(&store), transport, secrets, &settings));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            settings.clone(),
        ));
        let poller = Arc::new(StatusPoller::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            settings.unreachable_threshold,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            settings,
            executor,
            dispatcher,
            poller,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatcher and status poller loops.
    pub fn start(&self) {
        let mut handles = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            return;
        }
        handles.push(tasks::spawn_dispatcher(
            Arc::clone(&self.dispatcher),
            self.settings.dispatch_interval(),
            self.shutdown.subscribe(),
        ));
        handles.push(tasks::spawn_status_poller(
            Arc::clone(&self.poller),
            self.settings.poll_interval(),
            self.shutdown.subscribe(),
        ));
        log::info!(
            "Engine started (dispatch every {:?}, poll every {:?})",
            self.settings.dispatch_interval(),
            self.settings.poll_interval()
        );
    }

    async fn active_device(&self, device_id: i32) -> Result<Device, EngineError> {
        db::blocking(&self.store, move |store| store.device(device_id))
            .await?
            .filter(|device| device.active)
            .ok_or_else(|| EngineError::NotFound(format!("device {}", device_id)))
    }

    /// Ad hoc power action on behalf of `user`. Always sent, even if the
    /// device already reports the requested state.
    pub async fn submit_user_action(
        &self,
        device_id: i32,
        action: PowerAction,
        user: &str,
    ) -> Result<AttemptOutcome, EngineError> {
        let device = self.active_device(device_id).await?;
        self.executor
            .power(&device, action, &InitiatedBy::user(user), false)
            .await
    }

    /// Poll one device right away, outside the poller's schedule.
    pub async fn refresh_now(&self, device_id: i32) -> Result<DeviceStatus, EngineError> {
        let device = self.active_device(device_id).await?;
        self.poller.poll_device(&device, Utc::now().naive_utc()).await
    }

    pub async fn device_status(&self, device_id: i32) -> Result<Option<DeviceStatus>, EngineError> {
        db::blocking(&self.store, move |store| store.device_status(device_id)).await
    }

    pub async fn recent_audit(&self, device_id: i32, limit: i64) -> Result<Vec<AuditRecord>, EngineError> {
        db::blocking(&self.store, move |store| store.recent_audit(device_id, limit)).await
    }

    /// Stop both loops, letting their current cycle finish within the grace period.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            running.drain(..).collect()
        };

        let grace = self.settings.shutdown_grace();
        for mut handle in handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Background task ended abnormally: {}", e),
                Err(_) => {
                    log::warn!("Background task still busy after {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }
        self.executor.close();
        log::info!("Engine stopped");
    }
}
