use std::sync::Arc;

use rocket::State;
use rocket::http::Status;
use rocket::serde::json::Json;

use super::error_status;
use crate::models::{AuditRecord, DeviceStatus};
use crate::state::AppState;

const DEFAULT_AUDIT_LIMIT: i64 = 50;
const MAX_AUDIT_LIMIT: i64 = 500;

/// Latest stored status of a device
#[get("/devices/<device_id>/status")]
pub async fn device_status(
    state: &State<Arc<AppState>>,
    device_id: i32,
) -> Result<Json<DeviceStatus>, Status> {
    state
        .device_status(device_id)
        .await
        .map_err(error_status)?
        .map(Json)
        .ok_or(Status::NotFound)
}

/// Poll a device now instead of waiting for the next poller tick
#[post("/devices/<device_id>/refresh")]
pub async fn refresh_device(
    state: &State<Arc<AppState>>,
    device_id: i32,
) -> Result<Json<DeviceStatus>, Status> {
    let status = state.refresh_now(device_id).await.map_err(error_status)?;
    Ok(Json(status))
}

/// Latest audit records for a device, newest first
#[get("/devices/<device_id>/audit?<limit>")]
pub async fn device_audit(
    state: &State<Arc<AppState>>,
    device_id: i32,
    limit: Option<i64>,
) -> Result<Json<Vec<AuditRecord>>, Status> {
    let limit = limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT);
    let records = state
        .recent_audit(device_id, limit)
        .await
        .map_err(error_status)?;
    Ok(Json(records))
}
