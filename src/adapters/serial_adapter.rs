use super::Transport;
use crate::config::Sim900Config;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(not(feature = "instrument_serial"))]
use crate::error::ReadoutError;

#[cfg(feature = "instrument_serial")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// RS-232 transport.
///
/// The serialport crate is blocking, so every read and write runs on Tokio's blocking
/// pool with the port behind a mutex.
#[derive(Clone)]
pub struct SerialAdapter {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: u8,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// An unopened adapter; call [`SerialAdapter::connect`] before use.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    pub fn from_config(config: &Sim900Config) -> Self {
        Self::new(config.port.clone(), config.baud_rate).with_timeout(Duration::from_millis(config.timeout_ms))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .with_context(|| format!("Failed to open serial port '{}' at {} baud", self.port_name, self.baud_rate))?;
            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ReadoutError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    pub async fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", self.port_name))
    }

    /// Read up to the delimiter. Returns `None` if the timeout passes with nothing read.
    #[cfg(feature = "instrument_serial")]
    async fn read_until_delimiter(&self, timeout: Duration) -> Result<Option<String>> {
        let port = self.port()?;
        let delimiter = self.response_delimiter;
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            use std::io::Read;

            let mut guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();
            loop {
                if start.elapsed() > timeout {
                    if response.is_empty() {
                        return Ok(None);
                    }
                    return Err(anyhow!("Serial read timed out mid-line after {:?}", timeout));
                }
                match guard.read(&mut buffer) {
                    Ok(0) => return Err(anyhow!("Unexpected end of file on serial port")),
                    Ok(_) => {
                        if buffer[0] == delimiter {
                            break;
                        }
                        response.push(buffer[0]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }
            Ok(Some(String::from_utf8_lossy(&response).trim().to_string()))
        })
        .await
        .context("Serial I/O task panicked")?
    }
}

#[async_trait]
impl Transport for SerialAdapter {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let bytes = format!("{}{}", line, self.line_terminator).into_bytes();
            tokio::task::spawn_blocking(move || -> Result<()> {
                use std::io::Write;

                let mut guard = port.blocking_lock();
                guard.write_all(&bytes).context("Failed to write to serial port")?;
                guard.flush().context("Failed to flush serial port")?;
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")??;
            debug!(port = %self.port_name, command = line, "serial write");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = line;
            Err(ReadoutError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let line = self
                .read_until_delimiter(self.timeout)
                .await?
                .ok_or_else(|| anyhow!("Serial read timeout after {:?} on '{}'", self.timeout, self.port_name))?;
            debug!(port = %self.port_name, response = %line, "serial read");
            Ok(line)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ReadoutError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    async fn read_lines(&mut self, quiet: Duration) -> Result<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let mut lines = Vec::new();
            while let Some(line) = self.read_until_delimiter(quiet).await? {
                lines.push(line);
            }
            debug!(port = %self.port_name, count = lines.len(), "serial read until quiet");
            Ok(lines)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = quiet;
            Err(ReadoutError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 9600);
        assert_eq!(adapter.port_name(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate(), 9600);
        assert!(!adapter.is_connected());
    }

    #[test]
    fn test_from_config() {
        let config = Sim900Config {
            port: "COM3".to_string(),
            baud_rate: 115200,
            timeout_ms: 500,
            bridge_slot: '2',
        };
        let adapter = SerialAdapter::from_config(&config);
        assert_eq!(adapter.port_name(), "COM3");
        assert_eq!(adapter.timeout, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let mut adapter = SerialAdapter::new("/dev/null-port", 9600);
        assert!(adapter.write_line("*IDN?").await.is_err());
    }
}
