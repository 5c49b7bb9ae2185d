use crate::consts::{ButtonId, DeviceId};
use std::time::Duration;
use thiserror::Error;

/// Problems found while building the device registry. Each one excludes
/// only the named entity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device #{index} has no id configured")]
    MissingDeviceId { index: usize },
    #[error("device {device} has no name configured and is not ignored")]
    MissingDeviceName { device: DeviceId },
    #[error("device {device} is configured more than once")]
    DuplicateDevice { device: DeviceId },
    #[error("device {device}, button #{index} has no id configured")]
    MissingButtonId { device: DeviceId, index: usize },
    #[error("device {device}, button {button} has no name configured and is not ignored")]
    MissingButtonName { device: DeviceId, button: ButtonId },
    #[error("device {device}, button {button} is configured more than once")]
    DuplicateButton { device: DeviceId, button: ButtonId },
    #[error("timing `{field}` must be greater than zero, using default")]
    InvalidTiming { field: &'static str },
}

/// A protocol record that looked like a device notification but did not
/// parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("field `{field}` is not a base-10 integer: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Why a bridge session could not be established or ended.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unable to resolve bridge host `{host}`")]
    UnknownHost {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("bridge at {addr} refused the connection")]
    ConnectionRefused { addr: String },
    #[error("bridge rejected the configured credentials")]
    BadCredentials,
    #[error("bridge did not complete {stage} within {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("bridge closed the session")]
    Closed,
    #[error("bridge session failed")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Classifies a low level socket failure.
    pub fn from_io(addr: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused {
                addr: addr.to_string(),
            },
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }

    /// What the operator should check.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::UnknownHost { .. } => {
                "Check the bridge `host` setting: the name does not resolve to an address."
            }
            Self::ConnectionRefused { .. } => {
                "Check the bridge `host` and `port` settings and that telnet integration is enabled on the bridge."
            }
            Self::BadCredentials => {
                "Check the bridge `username` and `password` settings against the integration credentials."
            }
            Self::Timeout { .. } => {
                "The bridge did not answer with the expected prompt. Check the prompt settings and that the host is the bridge."
            }
            Self::Closed => "The bridge ended the session. Reconnecting.",
            Self::Io(_) => "Unexpected network failure. Check connectivity to the bridge.",
        }
    }
}
