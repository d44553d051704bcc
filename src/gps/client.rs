//! # GPS Protocol Client
//!
//! Drives the device handshake and poll loop over a [`SerialChannel`] and
//! publishes every poll result into the shared [`FixCell`].
//!
//! ## State machine
//!
//! ```text
//! Disconnected --open ok--> Handshaking --ack--> AwaitingFix --+
//!      ^                        |                    |  ^       | fix / NoFix
//!      |                 N failures            too many  +------+
//!      |                        v              failures
//!      +-------------------- Degraded <--------------+
//! ```
//!
//! Degraded closes the channel and returns to Disconnected. It is the
//! recovery path, never a terminal state.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cell::FixCell;
use super::fix::{Fix, FixParser};
use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::serial::SerialChannel;
use crate::telemetry::FixRecorder;

/// Protocol state, owned exclusively by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Disconnected,
    Handshaking,
    AwaitingFix,
    Degraded,
}

/// Protocol commands, timeouts and thresholds
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub power_up_command: String,
    pub ack_token: String,
    pub fix_request_command: String,
    pub fix_response_marker: String,
    /// Bound on each command write and fix read
    pub io_timeout: Duration,
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_handshake_failures: u32,
    pub max_consecutive_failures: u32,
    /// Consecutive open failures before the worker gives up
    pub max_open_attempts: u32,
    pub utc_offset_minutes: i32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            power_up_command: "AT$GPSP=1".to_string(),
            ack_token: "OK".to_string(),
            fix_request_command: "AT$GPSACP".to_string(),
            fix_response_marker: "$GPSACP".to_string(),
            io_timeout: Duration::from_millis(1000),
            handshake_timeout: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(1000),
            reconnect_interval: Duration::from_millis(1000),
            max_handshake_failures: 3,
            max_consecutive_failures: 10,
            max_open_attempts: 5,
            utc_offset_minutes: 180,
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            power_up_command: config.gps.power_up_command.clone(),
            ack_token: config.gps.ack_token.clone(),
            fix_request_command: config.gps.fix_request_command.clone(),
            fix_response_marker: config.gps.fix_response_marker.clone(),
            io_timeout: Duration::from_millis(config.serial.timeout_ms),
            handshake_timeout: Duration::from_millis(config.gps.handshake_timeout_ms),
            poll_interval: Duration::from_millis(config.gps.poll_interval_ms),
            reconnect_interval: Duration::from_millis(config.serial.reconnect_interval_ms),
            max_handshake_failures: config.gps.max_handshake_failures,
            max_consecutive_failures: config.gps.max_consecutive_failures,
            max_open_attempts: config.serial.max_open_attempts,
            utc_offset_minutes: config.gps.utc_offset_minutes,
        }
    }
}

/// GPS protocol client
pub struct GpsProtocolClient {
    channel: SerialChannel,
    state: ProtocolState,
    settings: ClientSettings,
    parser: FixParser,
    cell: Arc<FixCell>,
    recorder: Option<FixRecorder>,
    open_failures: u32,
    handshake_failures: u32,
    consecutive_failures: u32,
}

impl GpsProtocolClient {
    /// Create a disconnected client publishing into `cell`
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the configured UTC offset is invalid.
    pub fn new(channel: SerialChannel, settings: ClientSettings, cell: Arc<FixCell>) -> Result<Self> {
        let parser = FixParser::new(
            settings.fix_response_marker.clone(),
            settings.utc_offset_minutes,
        )?;
        Ok(Self {
            channel,
            state: ProtocolState::Disconnected,
            settings,
            parser,
            cell,
            recorder: None,
            open_failures: 0,
            handshake_failures: 0,
            consecutive_failures: 0,
        })
    }

    /// Record every raw fix response line
    pub fn with_recorder(mut self, recorder: FixRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Run the poll loop until `cancel` fires
    ///
    /// The stop signal is checked between steps; a read or write in flight
    /// completes (or times out) first.
    ///
    /// # Errors
    ///
    /// Returns `PortUnavailable` once the port could not be opened
    /// `max_open_attempts` times in a row.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("Starting GPS protocol client on {}", self.channel.device());

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let state = match self.step().await {
                Ok(state) => state,
                Err(e) => break Err(e),
            };

            let pause = match state {
                ProtocolState::AwaitingFix => self.settings.poll_interval,
                ProtocolState::Disconnected => self.settings.reconnect_interval,
                ProtocolState::Handshaking | ProtocolState::Degraded => Duration::ZERO,
            };

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(pause) => {}
            }
        };

        self.channel.close();
        info!("GPS protocol client stopped");
        result
    }

    /// Perform one state-machine transition and return the new state
    ///
    /// # Errors
    ///
    /// Only fails when the port stays unavailable; every protocol failure is
    /// absorbed into NoFix or Degraded.
    pub async fn step(&mut self) -> Result<ProtocolState> {
        let next = match self.state {
            ProtocolState::Disconnected => self.connect()?,
            ProtocolState::Handshaking => self.handshake_step().await,
            ProtocolState::AwaitingFix => self.poll_step().await,
            ProtocolState::Degraded => {
                warn!("GPS link degraded, reopening {}", self.channel.device());
                self.channel.close();
                self.handshake_failures = 0;
                self.consecutive_failures = 0;
                ProtocolState::Disconnected
            }
        };

        if next != self.state {
            debug!("GPS protocol state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        Ok(next)
    }

    fn connect(&mut self) -> Result<ProtocolState> {
        match self.channel.open() {
            Ok(()) => {
                self.open_failures = 0;
                Ok(ProtocolState::Handshaking)
            }
            Err(e) => {
                self.open_failures += 1;
                warn!(
                    "Failed to open GPS port (attempt {}/{}): {}",
                    self.open_failures, self.settings.max_open_attempts, e
                );
                if self.open_failures >= self.settings.max_open_attempts {
                    return Err(e);
                }
                Ok(ProtocolState::Disconnected)
            }
        }
    }

    async fn handshake_step(&mut self) -> ProtocolState {
        match self.handshake().await {
            Ok(()) => {
                info!("GPS device acknowledged power-up");
                self.handshake_failures = 0;
                self.consecutive_failures = 0;
                ProtocolState::AwaitingFix
            }
            Err(e) => {
                self.handshake_failures += 1;
                warn!(
                    "GPS handshake failed ({}/{}): {}",
                    self.handshake_failures, self.settings.max_handshake_failures, e
                );
                if !self.channel.is_open()
                    || self.handshake_failures >= self.settings.max_handshake_failures
                {
                    ProtocolState::Degraded
                } else {
                    ProtocolState::Handshaking
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let command = self.settings.power_up_command.clone();
        self.channel
            .write_line(command.as_bytes(), self.settings.io_timeout)
            .await?;

        let deadline = Instant::now() + self.settings.handshake_timeout;
        loop {
            let line = self.read_before(deadline).await?;
            let line = line.trim();
            if line == self.settings.ack_token {
                return Ok(());
            }
            if line.starts_with("ERROR") {
                return Err(TelemetryError::Protocol(format!("unexpected ack: {:?}", line)));
            }
            // echo, blank line or unsolicited output
            debug!("Ignoring handshake line {:?}", line);
        }
    }

    async fn poll_step(&mut self) -> ProtocolState {
        match self.poll().await {
            Ok(fix) => {
                self.consecutive_failures = 0;
                self.cell.publish(fix);
                ProtocolState::AwaitingFix
            }
            Err(e) => {
                self.cell.publish(Fix::no_fix());
                self.consecutive_failures += 1;
                if e.is_transient() {
                    debug!(
                        "GPS poll timed out ({} consecutive): {}",
                        self.consecutive_failures, e
                    );
                } else {
                    warn!(
                        "GPS poll failed ({} consecutive): {}",
                        self.consecutive_failures, e
                    );
                }

                if matches!(e, TelemetryError::EmptyRead) || !self.channel.is_open() {
                    ProtocolState::Degraded
                } else if self.consecutive_failures > self.settings.max_consecutive_failures {
                    ProtocolState::Degraded
                } else {
                    ProtocolState::AwaitingFix
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<Fix> {
        let command = self.settings.fix_request_command.clone();
        self.channel
            .write_line(command.as_bytes(), self.settings.io_timeout)
            .await?;

        let deadline = Instant::now() + self.settings.io_timeout;
        loop {
            let line = self.read_before(deadline).await?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed == command || trimmed == self.settings.ack_token {
                // echo or trailing status of the previous response
                continue;
            }

            if let Some(recorder) = &self.recorder {
                recorder.record(trimmed).await;
            }
            return self.parser.parse(trimmed);
        }
    }

    async fn read_before(&mut self, deadline: Instant) -> Result<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TelemetryError::ReadTimeout);
        }
        self.channel.read_line(remaining).await
    }
}
