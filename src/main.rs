#[macro_use]
extern crate rocket;

use std::sync::Arc;

use anyhow::{Context, Result};

mod audit_log;
mod background;
mod blackout;
mod db;
mod error;
mod executor;
mod logging;
mod models;
mod protocol;
mod resolver;
mod routes;
mod schema;
mod secrets;
mod settings;
mod state;
mod tasks;

#[cfg(test)]
mod testutil;

use db::SqliteStore;
use protocol::PjLinkTransport;
use secrets::EnvSecretStore;
use settings::EngineSettings;
use state::AppState;

#[rocket::main]
async fn main() -> Result<()> {
    let _logger = logging::init_logging()?;

    let database_url = db::pool::database_url();
    log::info!("Opening database {}", database_url);
    let store = SqliteStore::open(&database_url)
        .with_context(|| format!("failed to open database {}", database_url))?;

    let settings = {
        let mut conn = store.conn()?;
        let settings = EngineSettings::load(&mut conn);
        // Store the effective values so the row exists to be edited.
        if let Err(e) = settings.save(&mut conn) {
            log::warn!("Failed to store engine settings: {}", e);
        }
        settings
    };
    log::info!("Engine settings: {:?}", settings);

    let state = Arc::new(AppState::new(
        Arc::new(store),
        Arc::new(PjLinkTransport::new(settings.device_timeout())),
        Arc::new(EnvSecretStore::default()),
        settings,
    ));

    rocket::build()
        .manage(state)
        .mount("/api", routes::api_routes())
        .attach(background::BackgroundTasks)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    Ok(())
}
