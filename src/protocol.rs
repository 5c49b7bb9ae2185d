use crate::consts::{self, ButtonId, DeviceId};
use crate::error::ParseError;

/// Signal carried by a device notification.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Action {
    Press,
    Release,
    /// Any other action code (LED states, hold, ...). Never reaches a
    /// classifier.
    Unknown(i32),
}

impl Action {
    pub fn from_code(code: i32) -> Self {
        match code {
            consts::action::PRESS => Action::Press,
            consts::action::RELEASE => Action::Release,
            other => Action::Unknown(other),
        }
    }
}

/// Decoded `~DEVICE,<device>,<button>,<action>` record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DeviceEvent {
    pub device: DeviceId,
    pub button: ButtonId,
    pub action_code: i32,
}

impl DeviceEvent {
    pub fn action(&self) -> Action {
        Action::from_code(self.action_code)
    }
}

fn number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ParseError> {
    let value = raw.trim();
    value.parse::<T>().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Parse a single line received from the bridge.
///
/// `Ok(None)` is returned for anything that is not a device notification:
/// prompts, monitoring output for other integration types and device records
/// with the wrong number of fields. `Err` means a device notification whose
/// numeric fields do not parse.
pub fn parse_line(line: &str) -> Result<Option<DeviceEvent>, ParseError> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() != consts::DEVICE_FIELDS || fields[0] != consts::DEVICE_TAG {
        return Ok(None);
    }

    Ok(Some(DeviceEvent {
        device: number("device", fields[1])?,
        button: number("button", fields[2])?,
        action_code: number("action", fields[3])?,
    }))
}
