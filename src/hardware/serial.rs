//! Serial line transport
//!
//! [`LineTransport`] over a tokio-serial port, used for the modulator controller and the
//! monochromator. Both speak ASCII with device-specific terminators, baud rates and
//! timeouts, so the transport is configured through [`SerialLineBuilder`].
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use cpl_daq::hardware::serial::SerialLineBuilder;
//!
//! # fn main() -> anyhow::Result<()> {
//! let line = SerialLineBuilder::new("/dev/ttyUSB1", 9600)
//!     .with_timeout(Duration::from_millis(5000))
//!     .with_write_terminator("\r")
//!     .with_read_terminator("\r\n")
//!     .open()?;
//! # Ok(())
//! # }
//! ```

use crate::hardware::capabilities::LineTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Builder for [`SerialLine`]
///
/// Default configuration:
/// * timeout: 1 second
/// * write terminator: "\r\n"
/// * read terminator: "\n"
pub struct SerialLineBuilder {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    write_terminator: String,
    read_terminator: String,
}

impl SerialLineBuilder {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            write_terminator: "\r\n".to_string(),
            read_terminator: "\n".to_string(),
        }
    }

    /// Set the read timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Terminator appended to every command
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Terminator that ends a reply
    pub fn with_read_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.read_terminator = terminator.into();
        self
    }

    /// Open the port with 8N1, no flow control
    pub fn open(self) -> Result<SerialLine> {
        if self.read_terminator.is_empty() {
            return Err(anyhow!("read terminator must not be empty"));
        }
        let port = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port {}", self.port_name))?;

        Ok(SerialLine {
            port: Some(port),
            port_name: self.port_name,
            timeout: self.timeout,
            write_terminator: self.write_terminator,
            read_terminator: self.read_terminator,
            pending: Vec::new(),
        })
    }
}

/// An open serial line.
pub struct SerialLine {
    port: Option<SerialStream>,
    port_name: String,
    timeout: Duration,
    write_terminator: String,
    read_terminator: String,
    /// Bytes received after the last complete reply
    pending: Vec<u8>,
}

impl SerialLine {
    async fn read_reply(&mut self) -> Result<String> {
        let terminator = self.read_terminator.as_bytes().to_vec();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("serial port {} is closed", self.port_name))?;

        let mut buf = [0u8; 256];
        loop {
            if let Some(pos) = find(&self.pending, &terminator) {
                let line: Vec<u8> = self.pending.drain(..pos + terminator.len()).collect();
                let text = String::from_utf8_lossy(&line[..pos]);
                return Ok(text.trim().to_string());
            }
            let n = port.read(&mut buf).await.context("serial read error")?;
            if n == 0 {
                return Err(anyhow!("serial port {} closed by peer", self.port_name));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[async_trait]
impl LineTransport for SerialLine {
    async fn query(&mut self, command: &str) -> Result<String> {
        // Stale bytes belong to an earlier, timed-out exchange.
        self.pending.clear();
        let payload = format!("{}{}", command, self.write_terminator);
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("serial port {} is closed", self.port_name))?;
        port.write_all(payload.as_bytes())
            .await
            .context("serial write failed")?;

        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.read_reply())
            .await
            .map_err(|_| anyhow!("read timeout after {} ms", timeout.as_millis()))?
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_multi_byte_terminator() {
        assert_eq!(find(b"500.00 nm ok\r\n", b"\r\n"), Some(12));
        assert_eq!(find(b"partial", b"\r\n"), None);
    }

    #[test]
    fn empty_read_terminator_is_rejected() {
        let result = SerialLineBuilder::new("/dev/null", 9600)
            .with_read_terminator("")
            .open();
        assert!(result.is_err());
    }
}
