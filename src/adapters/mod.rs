//! Line-oriented transports for instrument communication.
//!
//! Every instrument in the lab speaks ASCII lines: the SRS SIM modules over RS-232 and
//! the function generator over a SCPI socket. Drivers are written against [`Transport`]
//! so they run unchanged on a serial port, a TCP connection or a [`MockAdapter`].

pub mod mock;
pub mod serial_adapter;
pub mod tcp_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::SerialAdapter;
pub use tcp_adapter::TcpAdapter;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send {
    /// Write `line` followed by the transport's terminator.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Read one line with the terminator and surrounding whitespace removed.
    ///
    /// Fails if nothing arrives before the transport's timeout.
    async fn read_line(&mut self) -> Result<String>;

    /// Read lines until the link has been silent for `quiet`.
    async fn read_lines(&mut self, quiet: Duration) -> Result<Vec<String>>;

    async fn query(&mut self, line: &str) -> Result<String> {
        self.write_line(line).await?;
        self.read_line().await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        (**self).write_line(line).await
    }

    async fn read_line(&mut self) -> Result<String> {
        (**self).read_line().await
    }

    async fn read_lines(&mut self, quiet: Duration) -> Result<Vec<String>> {
        (**self).read_lines(quiet).await
    }
}
