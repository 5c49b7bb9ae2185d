mod connection;
mod message;

pub use connection::{HomeAssistant, Initiator};
pub use message::Outgoing;
