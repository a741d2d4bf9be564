use serde_json::{Map, Value, json};

use crate::error::DeviceError;
use crate::models::PowerState;

const ERROR_FIELDS: [&str; 6] = ["fan", "lamp", "temperature", "cover", "filter", "other"];

/// Live state read from a device in one session.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub power: PowerState,
    pub input: Option<String>,
    pub lamps: Option<Value>,
    pub errors: Option<Value>,
}

pub fn parse_power(data: &str) -> PowerState {
    match data.trim() {
        "0" => PowerState::Off,
        "1" => PowerState::On,
        "2" => PowerState::Cooling,
        "3" => PowerState::Warming,
        _ => PowerState::Unknown,
    }
}

/// `LAMP` data is `hours on` pairs, one per lamp.
pub fn parse_lamps(data: &str) -> Result<Value, DeviceError> {
    let fields: Vec<&str> = data.split_whitespace().collect();
    if fields.is_empty() || fields.len() % 2 != 0 {
        return Err(DeviceError::MalformedReply(format!("lamp data {:?}", data)));
    }

    let lamps = fields
        .chunks(2)
        .map(|pair| {
            let hours: u64 = pair[0]
                .parse()
                .map_err(|_| DeviceError::MalformedReply(format!("lamp hours {:?}", pair[0])))?;
            Ok(json!({ "hours": hours, "on": pair[1] == "1" }))
        })
        .collect::<Result<Vec<_>, DeviceError>>()?;

    Ok(Value::Array(lamps))
}

/// `ERST` data is six digits: 0 ok, 1 warning, 2 error.
pub fn parse_errors(data: &str) -> Result<Value, DeviceError> {
    let digits = data.trim();
    if digits.len() != ERROR_FIELDS.len() {
        return Err(DeviceError::MalformedReply(format!("error status {:?}", data)));
    }

    let mut report = Map::new();
    for (field, digit) in ERROR_FIELDS.iter().zip(digits.chars()) {
        let level = match digit {
            '0' => "ok",
            '1' => "warning",
            '2' => "error",
            _ => return Err(DeviceError::MalformedReply(format!("error status {:?}", data))),
        };
        report.insert(field.to_string(), Value::String(level.to_string()));
    }

    Ok(Value::Object(report))
}
