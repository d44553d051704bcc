//! # Serial Communication Module
//!
//! Line-oriented serial channel to the GPS peripheral.
//!
//! This module handles:
//! - Opening the serial port through a [`PortOpener`]
//! - Writing newline-terminated command lines with a write timeout
//! - Reading delimiter-terminated lines with a read timeout
//! - Marking the channel closed after any OS-level failure
//!
//! The channel never reopens on its own. After a failure every operation
//! returns `PortUnavailable` until the owner calls [`SerialChannel::open`].

pub mod port_trait;

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
pub use port_trait::{PortOpener, SerialPortIO, StreamPort, TokioSerialOpener};

/// Line delimiter used by the device
pub const LINE_DELIMITER: u8 = b'\n';

/// Terminator appended to every outgoing command
const COMMAND_TERMINATOR: &[u8] = b"\r\n";

/// Size of a single read from the port
const READ_CHUNK_SIZE: usize = 256;

/// Upper bound on a buffered line before it is discarded as garbage
const MAX_LINE_LENGTH: usize = 4096;

/// Serial channel owning one port handle
pub struct SerialChannel {
    opener: Arc<dyn PortOpener>,
    port: Option<Box<dyn SerialPortIO>>,
    buffer: BytesMut,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("device", &self.opener.describe())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SerialChannel {
    /// Create a closed channel; call [`open`](Self::open) before use
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            port: None,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Acquire the port
    ///
    /// An already open port is closed first, so `open()` always yields a
    /// fresh handle.
    ///
    /// # Errors
    ///
    /// Returns `PortUnavailable` if the OS cannot grant access to the device.
    pub fn open(&mut self) -> Result<()> {
        self.close();
        let port = self.opener.open()?;
        info!("Opened serial device {}", self.opener.describe());
        self.port = Some(port);
        Ok(())
    }

    /// Release the port. Idempotent.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial device {}", self.opener.describe());
        }
        self.buffer.clear();
    }

    /// Whether the channel currently holds a port
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Name of the underlying device
    pub fn device(&self) -> String {
        self.opener.describe()
    }

    /// Write `line` followed by CRLF
    ///
    /// # Errors
    ///
    /// - `PortUnavailable` if the channel is closed
    /// - `WriteTimeout` if the write does not complete within `timeout`
    /// - `Serial` on an OS error (the channel closes itself)
    pub async fn write_line(&mut self, line: &[u8], timeout: Duration) -> Result<()> {
        let port = self.port_mut()?;

        let mut frame = Vec::with_capacity(line.len() + COMMAND_TERMINATOR.len());
        frame.extend_from_slice(line);
        frame.extend_from_slice(COMMAND_TERMINATOR);

        let write = async {
            port.write_all(&frame).await?;
            port.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                debug!("Wrote {} bytes to serial port", frame.len());
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(format!("Failed to write line: {}", e))),
            Err(_) => Err(TelemetryError::WriteTimeout),
        }
    }

    /// Read one line, without its terminator
    ///
    /// Bytes that arrive after the delimiter stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// - `PortUnavailable` if the channel is closed
    /// - `ReadTimeout` if no complete line arrives within `timeout`
    /// - `EmptyRead` if the port reports end-of-stream
    /// - `Serial` on an OS error (the channel closes itself)
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(line);
            }

            let port = self.port_mut()?;
            let mut chunk = [0u8; READ_CHUNK_SIZE];

            match timeout_at(deadline, port.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(TelemetryError::EmptyRead),
                Ok(Ok(n)) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if self.buffer.len() > MAX_LINE_LENGTH
                        && !self.buffer.contains(&LINE_DELIMITER)
                    {
                        warn!("Discarding {} bytes without line delimiter", self.buffer.len());
                        self.buffer.clear();
                    }
                }
                Ok(Err(e)) => return Err(self.fail(format!("Failed to read line: {}", e))),
                Err(_) => return Err(TelemetryError::ReadTimeout),
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == LINE_DELIMITER)?;
        let raw = self.buffer.split_to(pos + 1);
        let mut line = &raw[..pos];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Some(String::from_utf8_lossy(line).into_owned())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPortIO>> {
        let device = self.opener.describe();
        self.port
            .as_mut()
            .ok_or_else(|| TelemetryError::PortUnavailable(format!("{} is closed", device)))
    }

    fn fail(&mut self, message: String) -> TelemetryError {
        warn!("Serial failure on {}: {}", self.opener.describe(), message);
        self.close();
        TelemetryError::Serial(message)
    }
}
