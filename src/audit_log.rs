use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::db::{self, Store};
use crate::error::{DeviceError, EngineError};
use crate::models::{Device, Initiator, NewAuditRecord, PowerAction, PowerState, Schedule};

/// Who asked for an action, and which user or schedule in particular.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatedBy {
    pub kind: Initiator,
    pub reference: Option<String>,
}

impl InitiatedBy {
    pub fn user(name: &str) -> Self {
        Self {
            kind: Initiator::User,
            reference: Some(name.to_string()),
        }
    }

    pub fn schedule(schedule: &Schedule) -> Self {
        Self {
            kind: Initiator::Schedule,
            reference: Some(schedule.id.to_string()),
        }
    }

    #[cfg(test)]
    pub fn system() -> Self {
        Self {
            kind: Initiator::System,
            reference: None,
        }
    }
}

/// Result of one action attempt against one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The device acknowledged the command.
    Succeeded,
    /// Last known status already matched, nothing was sent.
    AlreadyInState(PowerState),
    /// Suppressed by the named blackout window.
    Blocked { window: String },
    Failed(DeviceError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadyInState(_))
    }

    pub fn error_kind(&self) -> Option<String> {
        match self {
            Self::Succeeded | Self::AlreadyInState(_) => None,
            Self::Blocked { .. } => Some("blackout_blocked".to_string()),
            Self::Failed(e) => Some(e.kind()),
        }
    }

    pub fn message(&self, action: PowerAction) -> String {
        match self {
            Self::Succeeded => format!("power {} acknowledged", action),
            Self::AlreadyInState(state) => format!("already {}, no command sent", state),
            Self::Blocked { window } => format!("power {} blocked by blackout window '{}'", action, window),
            Self::Failed(e) => format!("power {} failed: {}", action, e),
        }
    }
}

/// Append-only write path into `audit_log`.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn Store>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn entry(
        device: &Device,
        action: PowerAction,
        initiated_by: &InitiatedBy,
        outcome: &AttemptOutcome,
        at: NaiveDateTime,
    ) -> NewAuditRecord {
        NewAuditRecord {
            device_id: Some(device.id),
            device_name: Some(device.name.clone()),
            action: action.as_str().to_string(),
            initiated_by: initiated_by.kind.as_str().to_string(),
            initiator_ref: initiated_by.reference.clone(),
            success: outcome.is_success(),
            error_kind: outcome.error_kind(),
            message: outcome.message(action),
            created_at: at,
        }
    }

    pub async fn record(
        &self,
        device: &Device,
        action: PowerAction,
        initiated_by: &InitiatedBy,
        outcome: &AttemptOutcome,
    ) -> Result<(), EngineError> {
        let entry = Self::entry(device, action, initiated_by, outcome, chrono::Utc::now().naive_utc());
        log::debug!(
            "Audit {} {} on {} by {}: {}",
            if entry.success { "ok" } else { "failed" },
            entry.action,
            device.name,
            entry.initiated_by,
            entry.message
        );
        db::blocking(&self.store, move |store| store.append_audit(&entry)).await
    }
}
