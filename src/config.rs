//! Configuration management for Wallbox Sync
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. The path can be overridden through the
//! `WALLBOX_SYNC_CONFIG` environment variable.

use crate::catalog::{MAX_REGISTERS_PER_REQUEST, PlanLimits};
use crate::error::{Result, WallboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Lower bound for the polling interval in seconds
pub const MIN_SCAN_INTERVAL_SECS: u64 = 2;

/// Upper bound for the polling interval in seconds
pub const MAX_SCAN_INTERVAL_SECS: u64 = 60;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "WALLBOX_SYNC_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Modbus TCP connection configuration
    pub modbus: ModbusConfig,

    /// Poll scheduling configuration
    pub polling: PollingConfig,

    /// Life bit handshake configuration
    pub keepalive: KeepAliveConfig,

    /// Optional web API side-channel
    pub rest: RestConfig,

    /// Hardware variant limits
    pub hardware: HardwareConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Modbus TCP connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Host name or IP address of the wallbox
    pub host: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Modbus unit identifier (Webasto Next answers on 255)
    pub unit_id: u8,

    /// Connection attempts per `connect()` call
    pub connect_attempts: u32,

    /// Delay between connection attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Timeout of a single connection attempt in milliseconds
    pub connect_timeout_ms: u64,

    /// Timeout of a single read or write in milliseconds
    pub operation_timeout_ms: u64,

    /// Upper bound for closing the connection in milliseconds
    pub close_timeout_ms: u64,

    /// Maximum number of registers requested in one frame
    pub max_registers_per_request: u16,

    /// Unmapped registers tolerated inside one read block
    pub max_register_gap: u16,

    /// Consecutive failed operations after which the connection is recycled
    pub degraded_after_failures: u32,
}

/// Poll scheduling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between scheduled refreshes (clamped to 2..=60)
    pub scan_interval_secs: u64,

    /// Consecutive protocol-exception cycles before an optional block is dropped
    pub optional_block_failure_threshold: u32,

    /// Consecutive failed cycles before a persistent failure is announced
    pub failure_notification_threshold: u32,
}

/// Life bit handshake parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Whether the background handshake runs at all
    pub enabled: bool,

    /// Holding register carrying the life bit
    pub register: u16,

    /// Value written to arm the handshake
    pub set_value: u16,

    /// Value the wallbox writes back once it observed the handshake
    pub reset_value: u16,

    /// Interval between echo polls in milliseconds
    pub poll_interval_ms: u64,

    /// Echo polls per cycle before the cycle counts as a soft failure
    pub max_polls: u32,
}

/// Web API parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Whether the REST side-channel is polled
    pub enabled: bool,

    /// Host of the web interface; defaults to the Modbus host when empty
    pub host: String,

    /// Full API base URL; overrides `https://{host}/api` when set
    pub base_url: Option<String>,

    /// Web interface user name
    pub username: String,

    /// Web interface password
    pub password: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Assumed token lifetime when the login response carries none
    pub token_lifetime_secs: u64,

    /// Tokens closer than this to their expiry are refreshed before use
    pub refresh_margin_secs: u64,

    /// Attempts per request on network-level failures
    pub max_attempts: u32,

    /// First backoff interval in milliseconds
    pub initial_backoff_ms: u64,

    /// The wallbox ships a self-signed certificate
    pub accept_invalid_certs: bool,
}

/// Hardware variant limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Maximum charging current of the installed variant (16 A or 32 A)
    pub max_current_a: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to the log file (its directory receives daily rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the environment override or default locations
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Self::from_file(path);
        }

        let default_paths = [
            "wallbox_sync.yaml",
            "/data/wallbox_sync.yaml",
            "/etc/wallbox-sync/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.modbus.host.trim().is_empty() {
            return Err(WallboxError::validation(
                "modbus.host",
                "Host cannot be empty",
            ));
        }

        if self.modbus.port == 0 {
            return Err(WallboxError::validation(
                "modbus.port",
                "Port must be greater than 0",
            ));
        }

        if self.modbus.connect_attempts == 0 {
            return Err(WallboxError::validation(
                "modbus.connect_attempts",
                "At least one attempt is required",
            ));
        }

        for (field, value) in [
            ("modbus.connect_timeout_ms", self.modbus.connect_timeout_ms),
            ("modbus.operation_timeout_ms", self.modbus.operation_timeout_ms),
            ("modbus.close_timeout_ms", self.modbus.close_timeout_ms),
            ("keepalive.poll_interval_ms", self.keepalive.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(WallboxError::validation(field, "Must be greater than 0"));
            }
        }

        if self.modbus.max_registers_per_request == 0
            || self.modbus.max_registers_per_request > MAX_REGISTERS_PER_REQUEST
        {
            return Err(WallboxError::validation(
                "modbus.max_registers_per_request",
                "Must be within 1..=125",
            ));
        }

        if self.keepalive.enabled && self.keepalive.set_value == self.keepalive.reset_value {
            return Err(WallboxError::validation(
                "keepalive.set_value",
                "Must differ from keepalive.reset_value",
            ));
        }

        if self.keepalive.max_polls == 0 {
            return Err(WallboxError::validation(
                "keepalive.max_polls",
                "Must be greater than 0",
            ));
        }

        if self.rest.enabled && self.rest.username.trim().is_empty() {
            return Err(WallboxError::validation(
                "rest.username",
                "Required when the REST API is enabled",
            ));
        }

        if self.rest.max_attempts == 0 {
            return Err(WallboxError::validation(
                "rest.max_attempts",
                "Must be greater than 0",
            ));
        }

        if !(self.hardware.max_current_a.is_finite() && self.hardware.max_current_a > 0.0) {
            return Err(WallboxError::validation(
                "hardware.max_current_a",
                "Must be positive",
            ));
        }

        Ok(())
    }
}

impl ModbusConfig {
    pub const fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            max_registers: self.max_registers_per_request,
            max_gap: self.max_register_gap,
        }
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl PollingConfig {
    /// Scan interval clamped into the supported window
    pub fn interval(&self) -> Duration {
        Duration::from_secs(
            self.scan_interval_secs
                .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS),
        )
    }
}

impl RestConfig {
    /// API base URL without trailing slash
    pub fn resolved_base_url(&self, fallback_host: &str) -> String {
        if let Some(url) = self.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return url.trim_end_matches('/').to_string();
        }
        let host = if self.host.trim().is_empty() {
            fallback_host
        } else {
            self.host.trim()
        };
        format!("https://{host}/api")
    }
}
