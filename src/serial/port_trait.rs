//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TelemetryError};

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Read available bytes into `buf`, returning 0 at end-of-stream
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens a fresh handle to the serial device
///
/// The channel asks its opener for a new port every time `open()` is
/// called, so a port lost to an OS error is replaced by a new handle.
pub trait PortOpener: Send + Sync {
    /// Open the port, failing with `PortUnavailable` if the OS refuses
    fn open(&self) -> Result<Box<dyn SerialPortIO>>;

    /// Human-readable name of the device (e.g. "/dev/ttyUSB2")
    fn describe(&self) -> String;
}

/// Wrapper around any async byte stream that implements SerialPortIO
///
/// Used with `tokio_serial::SerialStream` in production.
pub struct StreamPort<S> {
    stream: S,
}

impl<S> StreamPort<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> SerialPortIO for StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }
}

/// Opens a `tokio_serial` port with 8N1 settings
#[derive(Debug, Clone)]
pub struct TokioSerialOpener {
    path: String,
    baud_rate: u32,
}

impl TokioSerialOpener {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl PortOpener for TokioSerialOpener {
    fn open(&self) -> Result<Box<dyn SerialPortIO>> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                TelemetryError::PortUnavailable(format!("Failed to open {}: {}", self.path, e))
            })?;

        Ok(Box::new(StreamPort::new(port)))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}
