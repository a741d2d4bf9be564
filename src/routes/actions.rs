use std::sync::Arc;

use rocket::State;
use rocket::http::Status;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};

use super::error_status;
use crate::models::PowerAction;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
    pub user: String,
}

#[derive(Debug, Serialize)]
pub struct PowerResponse {
    pub device_id: i32,
    pub action: PowerAction,
    pub success: bool,
    pub error_kind: Option<String>,
    pub message: String,
}

/// Run an ad hoc power action for a user.
///
/// A device-side failure is still a 200: the attempt happened and was audited.
#[post("/devices/<device_id>/power", format = "json", data = "<request>")]
pub async fn submit_power_action(
    state: &State<Arc<AppState>>,
    device_id: i32,
    request: Json<PowerRequest>,
) -> Result<Json<PowerResponse>, Status> {
    let user = request.user.trim();
    if user.is_empty() {
        return Err(Status::BadRequest);
    }

    let outcome = state
        .submit_user_action(device_id, request.action, user)
        .await
        .map_err(error_status)?;

    Ok(Json(PowerResponse {
        device_id,
        action: request.action,
        success: outcome.is_success(),
        error_kind: outcome.error_kind(),
        message: outcome.message(request.action),
    }))
}
