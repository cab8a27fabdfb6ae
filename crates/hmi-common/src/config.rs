//! Configuration structures for PLC links.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for shipboard deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Modbus TCP link; absent means no Modbus client is started.
    pub modbus: Option<ModbusConfig>,

    /// MR link; absent means no MR master is started.
    pub mr: Option<MrConfig>,

    /// Reconnect backoff and circuit breaker.
    pub reconnect: ReconnectConfig,

    /// Transaction timeout and disconnect policy.
    pub transactions: TransactionConfig,

    /// Status reporting.
    pub diagnostics: DiagnosticsConfig,
}

/// Modbus TCP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Server address (host:port).
    pub address: String,

    /// Unit identifier written into every request.
    pub unit_id: u8,

    /// Log every frame at trace level.
    pub debug: bool,

    /// Periodic reads issued by the daemon.
    pub polls: Vec<ModbusPoll>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:502"),
            unit_id: 0xFF,
            debug: false,
            polls: Vec::new(),
        }
    }
}

/// Table read by a Modbus poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusPollKind {
    /// Function 0x01.
    Coils,
    /// Function 0x02.
    DiscreteInputs,
    /// Function 0x03.
    HoldingRegisters,
    /// Function 0x04.
    InputRegisters,
}

impl ModbusPollKind {
    /// Largest quantity a single read may request.
    #[must_use]
    pub fn max_quantity(self) -> u16 {
        match self {
            Self::Coils | Self::DiscreteInputs => 2000,
            Self::HoldingRegisters | Self::InputRegisters => 125,
        }
    }
}

/// A periodic Modbus read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusPoll {
    /// Which table to read.
    pub kind: ModbusPollKind,
    /// Starting address.
    pub address: u16,
    /// Number of bits or registers.
    pub quantity: u16,
    /// Poll period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// MR master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MrConfig {
    /// Device host. When absent the master listens on `0.0.0.0:port`
    /// and waits for the device to connect.
    pub host: Option<String>,

    /// Device port (or listening port).
    pub port: u16,

    /// Leading marker byte of every frame.
    pub leading_marker: u8,

    /// End-of-message marker closing every frame.
    pub end_marker: u16,

    /// Reject replies whose checksum does not match the payload.
    pub verify_checksum: bool,

    /// Tidemark sent with every read-all-signal request.
    pub tidemark: f32,

    /// Layout of the data blocks inside a read-all-signal reply.
    pub blocks: Vec<SignalBlockConfig>,

    /// Periodic reads issued by the daemon.
    pub polls: Vec<MrPoll>,
}

impl Default for MrConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 2100,
            leading_marker: 0x24,
            end_marker: 0x0D0A,
            verify_checksum: false,
            tidemark: 0.0,
            blocks: Vec::new(),
            polls: Vec::new(),
        }
    }
}

/// Placement of one data block inside the read-all-signal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBlockConfig {
    /// Data block identifier.
    pub db: u16,
    /// Number of values in the block (floats for analog, bytes for digital).
    pub count: u16,
    /// First byte offset of the block.
    pub addr0: u16,
    /// Last byte offset of the block (inclusive).
    pub addrn: u16,
}

/// A periodic MR read-all-signal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrPoll {
    /// Data block to read (usually the all-signals block).
    pub db: u16,
    /// First address.
    pub addr0: u16,
    /// Last address (inclusive).
    pub addrn: u16,
    /// Poll period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for the retry delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied after each consecutive failure.
    pub multiplier: f64,

    /// Consecutive failures before the circuit opens. `None` retries forever.
    ///
    /// Failed connects and connections dropped before they became stable
    /// count alike.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// A connection that stays up this long, or delivers a reply, resets
    /// the consecutive failure count.
    #[serde(with = "humantime_serde")]
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
            stable_after: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// Grows as `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// What happens to sent-but-unanswered transactions when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Drop them silently.
    #[default]
    Abandon,
    /// Resend them after reconnecting, in issue order.
    Requeue,
    /// Report `ConnectionLost` to their confirmation.
    Fail,
}

/// Transaction handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Retire in-flight transactions without a reply after this long.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Disconnect policy for in-flight transactions.
    pub in_flight_policy: InFlightPolicy,

    /// Latency samples retained per link.
    pub histogram_size: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            in_flight_policy: InFlightPolicy::Abandon,
            histogram_size: 1024,
        }
    }
}

/// Status reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Period of the status log line.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,

    /// Emit the status in Prometheus text format as well.
    pub prometheus: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(10),
            prometheus: false,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that parse but cannot be run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.reconnect;
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(invalid(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                reconnect.multiplier
            )));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(invalid("reconnect.initial_delay exceeds reconnect.max_delay"));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(invalid("reconnect.max_attempts must be at least 1"));
        }
        if self.transactions.timeout == Some(Duration::ZERO) {
            return Err(invalid("transactions.timeout must be non-zero"));
        }
        if self.diagnostics.status_interval.is_zero() {
            return Err(invalid("diagnostics.status_interval must be non-zero"));
        }

        if let Some(modbus) = &self.modbus {
            if modbus.address.trim().is_empty() {
                return Err(invalid("modbus.address is empty"));
            }
            for (i, poll) in modbus.polls.iter().enumerate() {
                if poll.quantity == 0 || poll.quantity > poll.kind.max_quantity() {
                    return Err(invalid(format!(
                        "modbus.polls[{i}].quantity must be in 1..={}, got {}",
                        poll.kind.max_quantity(),
                        poll.quantity
                    )));
                }
                if poll.interval.is_zero() {
                    return Err(invalid(format!("modbus.polls[{i}].interval is zero")));
                }
            }
        }

        if let Some(mr) = &self.mr {
            if mr.port == 0 {
                return Err(invalid("mr.port must be non-zero"));
            }
            if matches!(&mr.host, Some(host) if host.trim().is_empty()) {
                return Err(invalid("mr.host is empty; omit it to listen instead"));
            }
            for (i, block) in mr.blocks.iter().enumerate() {
                if block.addr0 > block.addrn {
                    return Err(invalid(format!("mr.blocks[{i}] has addr0 > addrn")));
                }
            }
            for (i, poll) in mr.polls.iter().enumerate() {
                if poll.addr0 > poll.addrn {
                    return Err(invalid(format!("mr.polls[{i}] has addr0 > addrn")));
                }
                if poll.interval.is_zero() {
                    return Err(invalid(format!("mr.polls[{i}].interval is zero")));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Well-formed but unusable configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        #[allow(clippy::ref_option)]
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
