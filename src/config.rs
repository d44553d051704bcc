//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, TelemetryError};
use crate::geofence::TriggerMode;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub serial: SerialConfig,
    pub gps: GpsConfig,
    pub geofence: GeofenceConfig,
    pub uplink: UplinkConfig,
    pub queue: QueueConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
    pub supervisor: SupervisorConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bound on each command write and response read
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_open_attempts")]
    pub max_open_attempts: u32,
}

/// GPS protocol configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_max_handshake_failures")]
    pub max_handshake_failures: u32,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Fix cell staleness after which the supervisor restarts the GPS worker
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Offset applied to device UTC time for fix timestamps
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_power_up_command")]
    pub power_up_command: String,

    #[serde(default = "default_ack_token")]
    pub ack_token: String,

    #[serde(default = "default_fix_request_command")]
    pub fix_request_command: String,

    #[serde(default = "default_fix_response_marker")]
    pub fix_response_marker: String,
}

/// Geofence and capture trigger configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GeofenceConfig {
    #[serde(default = "default_locations_file")]
    pub locations_file: String,

    #[serde(default = "default_distance_threshold_m")]
    pub distance_threshold_m: f64,

    #[serde(default = "default_speed_threshold_kmh")]
    pub speed_threshold_kmh: f64,

    #[serde(default = "default_mode")]
    pub mode: TriggerMode,

    #[serde(default = "default_decision_interval_ms")]
    pub decision_interval_ms: u64,
}

/// Remote endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UplinkConfig {
    pub device_id: String,

    pub device_type: String,

    /// Position pings go to `<location_endpoint>/<device_id>`
    pub location_endpoint: String,

    /// Capture metadata goes to `<image_info_endpoint>/<device_id>`; unset
    /// disables image-info uploads
    #[serde(default)]
    pub image_info_endpoint: Option<String>,

    /// Probed with HEAD to decide whether the device is online
    pub connectivity_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    #[serde(default = "default_min_report_distance_m")]
    pub min_report_distance_m: f64,
}

/// Retry queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: String,

    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Serialized payloads smaller than this are dropped as corrupt
    #[serde(default = "default_min_payload_bytes")]
    pub min_payload_bytes: usize,
}

/// Raw fix log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_telemetry_log_dir")]
    pub log_dir: String,
}

/// Application log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: String,
}

/// Worker supervision configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// GPS restarts without a publication before the process gives up
    #[serde(default = "default_max_gps_restarts")]
    pub max_gps_restarts: u32,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB2".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_reconnect_interval_ms() -> u64 { 1000 }
fn default_max_open_attempts() -> u32 { 5 }

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_handshake_timeout_ms() -> u64 { 3000 }
fn default_max_handshake_failures() -> u32 { 3 }
fn default_max_consecutive_failures() -> u32 { 10 }
fn default_liveness_timeout_ms() -> u64 { 30000 }
fn default_utc_offset_minutes() -> i32 { 180 }
fn default_power_up_command() -> String { "AT$GPSP=1".to_string() }
fn default_ack_token() -> String { "OK".to_string() }
fn default_fix_request_command() -> String { "AT$GPSACP".to_string() }
fn default_fix_response_marker() -> String { "$GPSACP".to_string() }

fn default_locations_file() -> String { "config/locations.json".to_string() }
fn default_distance_threshold_m() -> f64 { 50.0 }
fn default_speed_threshold_kmh() -> f64 { 5.0 }
fn default_mode() -> TriggerMode { TriggerMode::Stationary }
fn default_decision_interval_ms() -> u64 { 100 }

fn default_request_timeout_ms() -> u64 { 10000 }
fn default_report_interval_ms() -> u64 { 1000 }
fn default_min_report_distance_m() -> f64 { 20.0 }

fn default_queue_path() -> String { "uploads/failed_locations.json".to_string() }
fn default_drain_interval_ms() -> u64 { 10000 }
fn default_min_payload_bytes() -> usize { 8 }

fn default_telemetry_enabled() -> bool { true }
fn default_telemetry_log_dir() -> String { "location_records".to_string() }

fn default_logging_dir() -> String { "logs".to_string() }

fn default_restart_backoff_ms() -> u64 { 1000 }
fn default_max_gps_restarts() -> u32 { 10 }

/// Largest UTC offset accepted, in minutes
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

fn invalid(message: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Config(toml::de::Error::custom(message))
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(format!("{} must be between {} and {}", name, min, max)));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vehicle_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is empty or out of range
    pub fn validate(&self) -> Result<()> {
        // Required strings
        for (name, value) in [
            ("serial port", &self.serial.port),
            ("power_up_command", &self.gps.power_up_command),
            ("ack_token", &self.gps.ack_token),
            ("fix_request_command", &self.gps.fix_request_command),
            ("fix_response_marker", &self.gps.fix_response_marker),
            ("locations_file", &self.geofence.locations_file),
            ("device_id", &self.uplink.device_id),
            ("device_type", &self.uplink.device_type),
            ("location_endpoint", &self.uplink.location_endpoint),
            ("connectivity_url", &self.uplink.connectivity_url),
            ("queue path", &self.queue.path),
            ("logging dir", &self.logging.dir),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} cannot be empty", name)));
            }
        }

        if matches!(&self.uplink.image_info_endpoint, Some(url) if url.trim().is_empty()) {
            return Err(invalid("image_info_endpoint cannot be empty when set"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.serial.baud_rate == 0 {
            return Err(invalid("baud_rate must be greater than 0"));
        }

        // Timing fields
        check_range("timeout_ms", self.serial.timeout_ms, 1, 10000)?;
        check_range("reconnect_interval_ms", self.serial.reconnect_interval_ms, 1, 60000)?;
        check_range("poll_interval_ms", self.gps.poll_interval_ms, 1, 60000)?;
        check_range("handshake_timeout_ms", self.gps.handshake_timeout_ms, 1, 60000)?;
        check_range("liveness_timeout_ms", self.gps.liveness_timeout_ms, 1000, 600000)?;
        check_range("decision_interval_ms", self.geofence.decision_interval_ms, 1, 60000)?;
        check_range("request_timeout_ms", self.uplink.request_timeout_ms, 1, 120000)?;
        check_range("report_interval_ms", self.uplink.report_interval_ms, 1, 3600000)?;
        check_range("drain_interval_ms", self.queue.drain_interval_ms, 1, 3600000)?;
        check_range("restart_backoff_ms", self.supervisor.restart_backoff_ms, 1, 60000)?;

        // A dead GPS worker must be noticed after it has had time to poll
        if self.gps.liveness_timeout_ms <= self.gps.poll_interval_ms {
            return Err(invalid("liveness_timeout_ms must be greater than poll_interval_ms"));
        }

        // Counters
        for (name, value) in [
            ("max_open_attempts", self.serial.max_open_attempts),
            ("max_handshake_failures", self.gps.max_handshake_failures),
            ("max_consecutive_failures", self.gps.max_consecutive_failures),
            ("max_gps_restarts", self.supervisor.max_gps_restarts),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.gps.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(invalid("utc_offset_minutes must be between -840 and 840"));
        }

        // Thresholds
        if !(self.geofence.distance_threshold_m > 0.0) {
            return Err(invalid("distance_threshold_m must be greater than 0"));
        }

        if !(self.geofence.speed_threshold_kmh > 0.0) {
            return Err(invalid("speed_threshold_kmh must be greater than 0"));
        }

        if !(self.uplink.min_report_distance_m >= 0.0) {
            return Err(invalid("min_report_distance_m cannot be negative"));
        }

        Ok(())
    }
}
