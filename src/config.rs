use crate::consts::{self, ButtonId, DeviceId};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

fn default_port() -> u16 {
    consts::DEFAULT_PORT
}

fn default_login_prompt() -> String {
    consts::DEFAULT_LOGIN_PROMPT.to_string()
}

fn default_password_prompt() -> String {
    consts::DEFAULT_PASSWORD_PROMPT.to_string()
}

fn default_ready_prompt() -> String {
    consts::DEFAULT_READY_PROMPT.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    consts::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_initial_delay_ms() -> u64 {
    consts::DEFAULT_RECONNECT_INITIAL_MS
}

fn default_max_delay_ms() -> u64 {
    consts::DEFAULT_RECONNECT_MAX_MS
}

fn default_mqtt_port() -> u16 {
    consts::DEFAULT_MQTT_PORT
}

fn default_mqtt_topic() -> String {
    consts::DEFAULT_MQTT_TOPIC.to_string()
}

/// Telnet session parameters of the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_login_prompt")]
    pub login_prompt: String,
    #[serde(default = "default_password_prompt")]
    pub password_prompt: String,
    #[serde(default = "default_ready_prompt")]
    pub ready_prompt: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl BridgeConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            login_prompt: default_login_prompt(),
            password_prompt: default_password_prompt(),
            ready_prompt: default_ready_prompt(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Global overrides of the gesture windows. Absent values use defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    pub single_press_ms: Option<u64>,
    pub long_press_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
}

/// Identifier and name are optional here; the registry reports them
/// missing with the offending entity named.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ButtonConfig {
    pub id: Option<ButtonId>,
    pub name: Option<String>,
    #[serde(default)]
    pub ignore: bool,
    pub single_press_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: Option<DeviceId>,
    pub name: Option<String>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub single_press_only: bool,
    /// Verbose diagnostics for this device.
    #[serde(default)]
    pub logging: bool,
    pub buttons: Option<Vec<ButtonConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(filename: P) -> anyhow::Result<Self> {
        let handle = File::open(filename)?;
        let data: Config = serde_yaml::from_reader(handle)?;

        Ok(data)
    }

    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}
