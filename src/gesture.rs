use crate::consts::{ButtonId, DeviceId};
use serde::Serialize;
use std::fmt;

/// A classified press cycle.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    SinglePress,
    DoublePress,
    LongPress,
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gesture::SinglePress => "Single Press",
            Gesture::DoublePress => "Double Press",
            Gesture::LongPress => "Long Press",
        };
        f.write_str(name)
    }
}

/// Emitted upward once per completed press cycle.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub struct GestureEvent {
    pub device: DeviceId,
    pub button: ButtonId,
    pub gesture: Gesture,
}

impl GestureEvent {
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("All should be serializable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_flat_json() {
        let event = GestureEvent {
            device: 2,
            button: 3,
            gesture: Gesture::DoublePress,
        };
        assert_eq!(
            event.serialize(),
            r#"{"device":2,"button":3,"gesture":"double_press"}"#
        );
    }
}
