use rocket::Route;
use rocket::http::Status;

use crate::error::EngineError;

pub mod actions;
pub mod devices;

/// API routes
pub fn api_routes() -> Vec<Route> {
    routes![
        // Devices
        devices::device_status,
        devices::refresh_device,
        devices::device_audit,

        // Actions
        actions::submit_power_action,
    ]
}

/// Map an engine failure to a response status, logging anything unexpected.
pub fn error_status(e: EngineError) -> Status {
    match e {
        EngineError::NotFound(_) => Status::NotFound,
        EngineError::ShuttingDown => Status::ServiceUnavailable,
        other => {
            log::error!("Request failed: {}", other);
            Status::InternalServerError
        }
    }
}
