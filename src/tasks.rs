pub mod dispatcher;
pub mod status_poller;

pub use dispatcher::{spawn_dispatcher, Dispatcher};
pub use status_poller::{spawn_status_poller, StatusPoller};
