//! Harness configuration: defaults, JSON file, `PEERPROBE_*` overrides.

use peerprobe_lib::ports::{PEER_A_PORT_RANGE, PEER_B_PORT_RANGE, RELAY_PORT};
use peerprobe_lib::{validate_port_range, PortRange};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, io};
use thiserror::Error;

use crate::peer::PeerConfig;
use crate::relay::RelayConfig;
use crate::retry::RetryPolicy;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_VAR: &str = "PEERPROBE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {var}: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Identity and port range of one test peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSettings {
    pub name: String,
    pub port_range: PortRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub relay_address: String,
    pub relay_port: u16,
    pub peer_a: PeerSettings,
    pub peer_b: PeerSettings,

    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub friend_request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Duration,
    /// Pause after relay start before its health is verified.
    #[serde(with = "humantime_serde")]
    pub relay_settle_delay: Duration,
    /// Pause after a contact request is accepted.
    #[serde(with = "humantime_serde")]
    pub contact_settle_delay: Duration,

    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Option<Duration>,

    /// Capacity of each peer event queue.
    pub queue_capacity: usize,

    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,

    pub udp_enabled: bool,
    pub ipv6_enabled: bool,
    pub local_discovery_enabled: bool,

    /// Where to write the JSON report, if anywhere.
    pub report_json: Option<PathBuf>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1".to_string(),
            relay_port: RELAY_PORT,
            peer_a: PeerSettings {
                name: "Alice".to_string(),
                port_range: PEER_A_PORT_RANGE,
            },
            peer_b: PeerSettings {
                name: "Bob".to_string(),
                port_range: PEER_B_PORT_RANGE,
            },
            connection_timeout: Duration::from_secs(30),
            friend_request_timeout: Duration::from_secs(15),
            message_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(120),
            relay_settle_delay: Duration::from_millis(500),
            contact_settle_delay: Duration::from_secs(1),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: None,
            queue_capacity: 100,
            log_level: "info".to_string(),
            log_file: None,
            verbose: false,
            udp_enabled: true,
            ipv6_enabled: false,
            local_discovery_enabled: false,
            report_json: None,
        }
    }
}

impl TestConfig {
    /// Defaults, overlaid with the file named by `PEERPROBE_CONFIG` if set,
    /// then with `PEERPROBE_*` variables. Not validated; the orchestrator
    /// records validation as a step of its own.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_path(path)?,
            Err(_missing) => Self::default(),
        };
        config.apply_env(|var| env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Overrides fields from variables returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PEERPROBE_RELAY_ADDRESS") {
            self.relay_address = value;
        }
        if let Some(value) = lookup("PEERPROBE_RELAY_PORT") {
            self.relay_port = parse_var("PEERPROBE_RELAY_PORT", &value)?;
        }
        if let Some(value) = lookup("PEERPROBE_PEER_A_NAME") {
            self.peer_a.name = value;
        }
        if let Some(value) = lookup("PEERPROBE_PEER_B_NAME") {
            self.peer_b.name = value;
        }
        if let Some(value) = lookup("PEERPROBE_PEER_A_PORTS") {
            self.peer_a.port_range = parse_range_var("PEERPROBE_PEER_A_PORTS", &value)?;
        }
        if let Some(value) = lookup("PEERPROBE_PEER_B_PORTS") {
            self.peer_b.port_range = parse_range_var("PEERPROBE_PEER_B_PORTS", &value)?;
        }

        let durations: [(&str, &mut Duration); 7] = [
            ("PEERPROBE_CONNECTION_TIMEOUT", &mut self.connection_timeout),
            ("PEERPROBE_FRIEND_REQUEST_TIMEOUT", &mut self.friend_request_timeout),
            ("PEERPROBE_MESSAGE_TIMEOUT", &mut self.message_timeout),
            ("PEERPROBE_OVERALL_TIMEOUT", &mut self.overall_timeout),
            ("PEERPROBE_RETRY_BACKOFF", &mut self.retry_backoff),
            ("PEERPROBE_RELAY_SETTLE_DELAY", &mut self.relay_settle_delay),
            ("PEERPROBE_CONTACT_SETTLE_DELAY", &mut self.contact_settle_delay),
        ];
        for (var, field) in durations {
            if let Some(value) = lookup(var) {
                *field = parse_duration_var(var, &value)?;
            }
        }
        if let Some(value) = lookup("PEERPROBE_MAX_RETRY_BACKOFF") {
            self.max_retry_backoff = Some(parse_duration_var("PEERPROBE_MAX_RETRY_BACKOFF", &value)?);
        }
        if let Some(value) = lookup("PEERPROBE_RETRY_ATTEMPTS") {
            self.retry_attempts = parse_var("PEERPROBE_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("PEERPROBE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_var("PEERPROBE_QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = lookup("PEERPROBE_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("PEERPROBE_LOG_FILE") {
            self.log_file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("PEERPROBE_REPORT_JSON") {
            self.report_json = Some(PathBuf::from(value));
        }

        let flags: [(&str, &mut bool); 4] = [
            ("PEERPROBE_VERBOSE", &mut self.verbose),
            ("PEERPROBE_UDP", &mut self.udp_enabled),
            ("PEERPROBE_IPV6", &mut self.ipv6_enabled),
            ("PEERPROBE_LOCAL_DISCOVERY", &mut self.local_discovery_enabled),
        ];
        for (var, field) in flags {
            if let Some(value) = lookup(var) {
                *field = parse_flag(var, &value)?;
            }
        }
        Ok(())
    }

    /// Checks every constraint a run depends on. Fails before any network
    /// resource is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connection_timeout", self.connection_timeout),
            ("friend_request_timeout", self.friend_request_timeout),
            ("message_timeout", self.message_timeout),
            ("overall_timeout", self.overall_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }

        if self.relay_address.trim().is_empty() {
            return Err(invalid("relay_address must not be empty"));
        }
        if self.relay_port == 0 {
            return Err(invalid("relay_port must not be zero"));
        }
        let port = u32::from(self.relay_port);
        if !validate_port_range(port, port) {
            return Err(invalid(format!(
                "relay_port {} is outside the allowed range",
                self.relay_port
            )));
        }

        if self.retry_attempts == 0 {
            return Err(invalid("retry_attempts must be at least 1"));
        }
        if self.retry_backoff.is_zero() {
            return Err(invalid("retry_backoff must be greater than zero"));
        }
        if self.max_retry_backoff.is_some_and(|cap| cap.is_zero()) {
            return Err(invalid("max_retry_backoff must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }

        for (label, peer) in [("peer_a", &self.peer_a), ("peer_b", &self.peer_b)] {
            if peer.name.trim().is_empty() {
                return Err(invalid(format!("{label} name must not be empty")));
            }
            if !peer.port_range.is_valid() {
                return Err(invalid(format!(
                    "{label} port range {} is invalid",
                    peer.port_range
                )));
            }
        }
        if self.peer_a.name == self.peer_b.name {
            return Err(invalid("peer_a and peer_b must have different names"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: self.retry_backoff,
            max_backoff: self.max_retry_backoff,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            address: self.relay_address.clone(),
            port: self.relay_port,
            settle_delay: self.relay_settle_delay,
            udp_enabled: self.udp_enabled,
            ipv6_enabled: self.ipv6_enabled,
        }
    }

    pub fn peer_config(&self, peer: &PeerSettings) -> PeerConfig {
        PeerConfig {
            name: peer.name.clone(),
            port_range: peer.port_range,
            udp_enabled: self.udp_enabled,
            ipv6_enabled: self.ipv6_enabled,
            local_discovery_enabled: self.local_discovery_enabled,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation(reason.into())
}

fn env_error(var: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e| env_error(var, value, e))
}

fn parse_duration_var(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| env_error(var, value, e))
}

/// Parses `START-END`, e.g. `33500-33599`. Bounds are checked by `validate`.
fn parse_range_var(var: &str, value: &str) -> Result<PortRange, ConfigError> {
    let (start, end) = value
        .trim()
        .split_once('-')
        .ok_or_else(|| env_error(var, value, "expected START-END"))?;
    Ok(PortRange::new(parse_var(var, start)?, parse_var(var, end)?))
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(env_error(var, value, "expected true or false")),
    }
}
