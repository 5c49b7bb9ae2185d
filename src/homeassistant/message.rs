use crate::gesture::GestureEvent;

/// Things we sent to HA.
#[derive(Debug)]
pub enum Outgoing {
    /// Send on initialization once.
    Initial,
    /// A classified gesture, published to
    /// <topic>/<device>/<button>/action
    Gesture(GestureEvent),
}

impl Outgoing {
    pub fn topic(&self, base: &str) -> String {
        match self {
            Outgoing::Initial => format!("{}/status", base),
            Outgoing::Gesture(event) => {
                format!("{}/{}/{}/action", base, event.device, event.button)
            }
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Outgoing::Initial => "online".to_string(),
            Outgoing::Gesture(event) => event.serialize(),
        }
    }
}
