pub mod button;
pub mod classifier;
pub mod config;
pub mod consts;
pub mod dispatcher;
pub mod error;
pub mod gesture;
pub mod homeassistant;
pub mod protocol;
pub mod registry;
pub mod transport;
