//! Relay configuration
//!
//! The relay reads a single TOML file at startup into an immutable
//! [`RelayConfig`]. Every section carries defaults so a minimal file (or an
//! empty one) yields a working local setup. Broker credentials are never stored
//! in the file itself; the file names the environment variables that hold them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerSection,
    pub server: ServerSection,
    pub buffer: BufferSection,
    pub reconnect: ReconnectSection,
    pub health: HealthSection,
    pub topics: TopicsSection,
    pub limits: LimitsSection,
}

/// Upstream broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    /// MQTT client identifier presented to the broker
    pub client_id: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Use TLS transport (typically port 8883)
    pub tls: bool,
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the first ConnAck
    pub connect_timeout_secs: u64,
    /// Refuse to start without credentials
    pub require_credentials: bool,
    /// Resolved at load time, never serialized back out
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "robot-relay".to_string(),
            username_env: None,
            password_env: None,
            tls: false,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            require_credentials: false,
            credentials: None,
        }
    }
}

/// Broker credentials resolved from the environment
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Downstream session server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub listen_port: u16,
    /// Per-session outbound backlog; a session that falls this far behind is disconnected
    pub outbound_queue: usize,
    /// Patterns every new session starts with
    pub default_subscriptions: Vec<String>,
    /// Time between the shutdown notice and force-closing everything
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_port: 8765,
            outbound_queue: 256,
            default_subscriptions: Vec::new(),
            shutdown_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferSection {
    /// Entries kept per topic
    pub capacity: usize,
    /// Trailing window used for arrival-rate statistics
    pub rate_window_secs: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: 1000,
            rate_window_secs: 60,
        }
    }
}

/// Backoff policy for the reconnect supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive failures before the supervisor gives up
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 15000,
            multiplier: 1.5,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    /// Consecutive degraded cycles before the relay reports itself unhealthy
    pub unhealthy_after: u32,
    /// Heartbeat topic
    pub topic: String,
    /// Startup/shutdown notices
    pub status_topic: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            unhealthy_after: 3,
            topic: "system/health/heartbeat".to_string(),
            status_topic: "system/status".to_string(),
        }
    }
}

/// Upstream topic families
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicsSection {
    pub telemetry_list: Vec<String>,
    pub weight: Vec<String>,
    pub concentration: Vec<String>,
    /// Control commands live under this prefix; the command type is the last segment
    pub control_prefix: String,
    /// Command topics outside the control prefix, e.g. the panel start button
    pub commands: Vec<String>,
    pub health: Vec<String>,
    pub errors: Vec<String>,
    /// Topics expected in every telemetry list
    pub required_telemetry: Vec<String>,
    pub processed_weight: String,
    pub processed_concentration: String,
    /// Command responses are published to `{command_response_prefix}/{command}`
    pub command_response_prefix: String,
    pub emergency: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            telemetry_list: strings(&["robot/topics"]),
            weight: strings(&[
                "scale/weight",
                "scale/raw",
                "scale/moving_average",
                "scale/exponential_average",
                "scale/kalman_simple",
                "scale/kalman_pv",
                "scale/ekf",
                "scale/ukf",
                "test",
            ]),
            concentration: strings(&["robot/concentration/target", "robot/command/sugar"]),
            control_prefix: "robot/control".to_string(),
            commands: strings(&["robot/command/start"]),
            health: strings(&["system/health"]),
            errors: strings(&["robot/error", "system/error"]),
            required_telemetry: strings(&["/joint_states", "/tf", "/robot_state"]),
            processed_weight: "processed/weight".to_string(),
            processed_concentration: "processed/concentration".to_string(),
            command_response_prefix: "robot/response".to_string(),
            emergency: "robot/emergency".to_string(),
        }
    }
}

impl TopicsSection {
    /// Control-family subscription pattern (`robot/control/#`)
    pub fn control_pattern(&self) -> String {
        format!("{}/#", self.control_prefix.trim_end_matches('/'))
    }

    /// Every pattern the relay subscribes to upstream
    pub fn upstream_subscriptions(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        patterns.extend(self.telemetry_list.iter().cloned());
        patterns.extend(self.weight.iter().cloned());
        patterns.extend(self.concentration.iter().cloned());
        patterns.push(self.control_pattern());
        patterns.extend(self.commands.iter().cloned());
        patterns.extend(self.health.iter().cloned());
        patterns.extend(self.errors.iter().cloned());
        patterns.dedup();
        patterns
    }
}

/// Inclusive numeric range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Workspace cuboid for linear moves, in millimetres
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub x: Range,
    pub y: Range,
    pub z: Range,
}

/// Sensor and actuator safety limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsSection {
    pub weight: Range,
    pub weight_unit: String,
    pub weight_empty_threshold: f64,
    pub weight_heavy_threshold: f64,
    pub concentration: Range,
    /// One range per joint, degrees
    pub joints: Vec<Range>,
    pub workspace: Workspace,
    pub default_speed: f64,
    pub default_acceleration: f64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            weight: Range::new(0.0, 50.0),
            weight_unit: "kg".to_string(),
            weight_empty_threshold: 0.05,
            weight_heavy_threshold: 40.0,
            concentration: Range::new(0.0, 100.0),
            joints: vec![
                Range::new(-360.0, 360.0),
                Range::new(-135.0, 135.0),
                Range::new(-150.0, 150.0),
                Range::new(-360.0, 360.0),
                Range::new(-135.0, 135.0),
                Range::new(-360.0, 360.0),
            ],
            workspace: Workspace {
                x: Range::new(-900.0, 900.0),
                y: Range::new(-900.0, 900.0),
                z: Range::new(0.0, 1200.0),
            },
            default_speed: 50.0,
            default_acceleration: 50.0,
        }
    }
}

/// Number of joints a joint move must address
pub const JOINT_COUNT: usize = 6;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Broker credentials are required but were not provided")]
    MissingCredentials,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Load configuration from a TOML file, validate it and resolve credentials
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, validate and resolve credentials from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        config.resolve_credentials()?;
        Ok(config)
    }

    /// Check internal consistency of every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfig(msg));

        if self.broker.host.trim().is_empty() {
            return invalid("broker.host must not be empty".to_string());
        }
        if self.broker.client_id.trim().is_empty() {
            return invalid("broker.client_id must not be empty".to_string());
        }
        // rumqttc refuses client ids with leading whitespace
        if self.broker.client_id.starts_with(char::is_whitespace) {
            return invalid("broker.client_id must not start with whitespace".to_string());
        }
        if self.buffer.capacity == 0 {
            return invalid("buffer.capacity must be greater than 0".to_string());
        }
        if self.server.outbound_queue == 0 {
            return invalid("server.outbound_queue must be greater than 0".to_string());
        }
        if self.health.interval_secs == 0 {
            return invalid("health.interval_secs must be greater than 0".to_string());
        }
        if self.health.unhealthy_after == 0 {
            return invalid("health.unhealthy_after must be greater than 0".to_string());
        }
        if self.reconnect.max_attempts == 0 {
            return invalid("reconnect.max_attempts must be greater than 0".to_string());
        }
        if self.reconnect.base_delay_ms == 0 {
            return invalid("reconnect.base_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return invalid("reconnect.max_delay_ms must be >= base_delay_ms".to_string());
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return invalid("reconnect.multiplier must be >= 1.0".to_string());
        }
        if self.limits.joints.len() != JOINT_COUNT {
            return invalid(format!(
                "limits.joints must list exactly {JOINT_COUNT} ranges, got {}",
                self.limits.joints.len()
            ));
        }

        let ranges = [
            ("limits.weight", self.limits.weight),
            ("limits.concentration", self.limits.concentration),
            ("limits.workspace.x", self.limits.workspace.x),
            ("limits.workspace.y", self.limits.workspace.y),
            ("limits.workspace.z", self.limits.workspace.z),
        ];
        for (name, range) in ranges
            .into_iter()
            .chain(self.limits.joints.iter().map(|r| ("limits.joints", *r)))
        {
            if !(range.min < range.max) {
                return invalid(format!("{name} requires min < max"));
            }
        }

        if self.topics.control_prefix.trim_matches('/').is_empty() {
            return invalid("topics.control_prefix must not be empty".to_string());
        }

        Ok(())
    }

    /// Resolve broker credentials from the environment variables named in the config
    fn resolve_credentials(&mut self) -> Result<(), ConfigError> {
        let username = match &self.broker.username_env {
            Some(name) => Some(Self::get_env_var_required(name)?),
            None => None,
        };
        let password = Self::get_env_var_optional(self.broker.password_env.as_ref());

        self.broker.credentials = username.map(|username| Credentials {
            username,
            password: password.unwrap_or_default(),
        });

        if self.broker.require_credentials && self.broker.credentials.is_none() {
            return Err(ConfigError::MissingCredentials);
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}
