// Identifiers used by the bridge integration protocol.

/// Device number as reported by the bridge (Pico remote integration ID).
pub type DeviceId = u32;
/// Button number within a device (Pico component number).
pub type ButtonId = u32;

/// First field of a device notification record.
pub const DEVICE_TAG: &str = "~DEVICE";
/// Device notifications carry tag, device, button and action.
pub const DEVICE_FIELDS: usize = 4;

/// Raw action codes carried by `~DEVICE` records.
pub mod action {
    pub const PRESS: i32 = 3;
    pub const RELEASE: i32 = 4;
}

/// Telnet integration port of the bridge.
pub const DEFAULT_PORT: u16 = 23;
pub const DEFAULT_LOGIN_PROMPT: &str = "login: ";
pub const DEFAULT_PASSWORD_PROMPT: &str = "password: ";
pub const DEFAULT_READY_PROMPT: &str = "GNET> ";
/// Records are short; anything longer without a line end is dropped.
pub const MAX_LINE_LEN: usize = 4096;
/// Covers TCP connect and the whole login exchange.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Second press must arrive within this interval after a release to count
/// as a double press.
pub const DEFAULT_SINGLE_PRESS_MS: u64 = 500;
/// Hold longer than this without a release and it is a long press.
pub const DEFAULT_LONG_PRESS_MS: u64 = 2000;

pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;

/// Software version
pub const GATE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GATE_NAME: &str = "pico-gate";

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_TOPIC: &str = "pico-gate";
