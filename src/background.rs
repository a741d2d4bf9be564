use std::sync::Arc;

use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Orbit, Rocket};

use crate::state::AppState;

/// Starts the dispatcher and status poller with Rocket and stops them with it.
pub struct BackgroundTasks;

#[rocket::async_trait]
impl Fairing for BackgroundTasks {
    fn info(&self) -> Info {
        Info {
            name: "Scheduler and Status Poller",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        match rocket.state::<Arc<AppState>>() {
            Some(state) => {
                state.start();
                Ok(rocket)
            }
            None => {
                log::error!("AppState not managed, background tasks not started");
                Err(rocket)
            }
        }
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(state) = rocket.state::<Arc<AppState>>() {
            state.shutdown().await;
        }
    }
}
