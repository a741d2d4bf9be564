use crate::error::{DeviceError, ProtocolErrorCode};
use crate::models::PowerAction;

/// Longest frame a device may send, terminator included.
pub const MAX_FRAME: usize = 136;
const MAX_PARAMETER: usize = 128;
const CLASS: char = '1';

/// A validated class 1 command, safe to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    body: String,
    parameter: String,
}

impl Command {
    /// Validate body and parameter against the device's character set.
    pub fn new(body: &str, parameter: &str) -> Result<Self, DeviceError> {
        if body.len() != 4 || !body.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DeviceError::InvalidCommand(format!(
                "command body must be 4 ASCII alphanumerics, got {:?}",
                body.escape_debug().to_string()
            )));
        }
        if parameter.is_empty() || parameter.len() > MAX_PARAMETER {
            return Err(DeviceError::InvalidCommand(format!(
                "parameter must be 1..={} bytes",
                MAX_PARAMETER
            )));
        }
        if let Some(bad) = parameter.chars().find(|c| !(' '..='~').contains(c)) {
            return Err(DeviceError::InvalidCommand(format!(
                "parameter contains disallowed character {:?}",
                bad.escape_debug().to_string()
            )));
        }

        Ok(Self {
            body: body.to_ascii_uppercase(),
            parameter: parameter.to_string(),
        })
    }

    pub fn query(body: &str) -> Result<Self, DeviceError> {
        Self::new(body, "?")
    }

    pub fn power(action: PowerAction) -> Self {
        let parameter = match action {
            PowerAction::On => "1",
            PowerAction::Off => "0",
        };
        Self {
            body: "POWR".to_string(),
            parameter: parameter.to_string(),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_query(&self) -> bool {
        self.parameter == "?"
    }

    /// Wire form without the terminator, e.g. `%1POWR 1`.
    pub fn wire(&self) -> String {
        format!("%{}{} {}", CLASS, self.body, self.parameter)
    }
}

/// A successful reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: String,
    pub data: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.data.eq_ignore_ascii_case("OK")
    }

    /// Parse `%1BODY=data` and classify error codes.
    pub fn parse(line: &str, expected_body: &str) -> Result<Self, DeviceError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.eq_ignore_ascii_case("PJLINK ERRA") {
            return Err(DeviceError::AuthenticationFailed(
                "device rejected the password".to_string(),
            ));
        }

        let rest = line
            .strip_prefix('%')
            .ok_or_else(|| malformed("missing header", line))?;
        let mut chars = rest.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_digit()) {
            return Err(malformed("missing class", line));
        }
        let rest = chars.as_str();
        let (body, data) = rest
            .split_once('=')
            .ok_or_else(|| malformed("missing separator", line))?;

        if !body.eq_ignore_ascii_case(expected_body) {
            return Err(malformed("reply to a different command", line));
        }
        if let Some(code) = ProtocolErrorCode::from_reply(data) {
            return Err(DeviceError::Protocol(code));
        }

        Ok(Self {
            body: body.to_ascii_uppercase(),
            data: data.to_string(),
        })
    }
}

fn malformed(reason: &str, line: &str) -> DeviceError {
    let shown: String = line.chars().take(32).filter(|c| !c.is_control()).collect();
    DeviceError::MalformedReply(format!("{} in {:?}", reason, shown))
}
