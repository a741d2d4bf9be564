//! Projector control protocol (PJLink class 1 over TCP).
//!
//! A session is strictly request/response: one command is written, one
//! `\r`-terminated reply is read, and only then may the next command go out.

use async_trait::async_trait;

use crate::error::DeviceError;

pub mod command;
pub mod session;
pub mod status;

pub use command::{Command, Reply};
pub use session::PjLinkTransport;
pub use status::StatusSnapshot;

/// An authenticated session with one device.
#[async_trait]
pub trait DeviceSession: Send {
    async fn send(&mut self, command: &Command) -> Result<Reply, DeviceError>;

    async fn close(&mut self);
}

/// Opens sessions; the seam tests replace with a scripted transport.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        secret: Option<&str>,
    ) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// Read power, input, lamp and error state in one session.
///
/// Only the power query is mandatory. A device that refuses the optional
/// queries (no lamp on laser models, input while in standby) still yields a
/// snapshot with those fields empty.
pub async fn query_status(session: &mut dyn DeviceSession) -> Result<StatusSnapshot, DeviceError> {
    let power = session.send(&Command::query("POWR")?).await?;

    let input = optional(session.send(&Command::query("INPT")?).await)?.map(|reply| reply.data);
    let lamps = match optional(session.send(&Command::query("LAMP")?).await)? {
        Some(reply) => Some(status::parse_lamps(&reply.data)?),
        None => None,
    };
    let errors = match optional(session.send(&Command::query("ERST")?).await)? {
        Some(reply) => Some(status::parse_errors(&reply.data)?),
        None => None,
    };

    Ok(StatusSnapshot {
        power: status::parse_power(&power.data),
        input,
        lamps,
        errors,
    })
}

fn optional(result: Result<Reply, DeviceError>) -> Result<Option<Reply>, DeviceError> {
    match result {
        Ok(reply) => Ok(Some(reply)),
        Err(DeviceError::Protocol(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
