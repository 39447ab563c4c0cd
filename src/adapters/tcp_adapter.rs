//! SCPI over a raw TCP socket.

use super::Transport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub struct TcpAdapter {
    address: String,
    timeout: Duration,
    line_terminator: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpAdapter {
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        let stream = timeout(io_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", address))?
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        let (read_half, write_half) = stream.into_split();
        debug!(%address, "TCP connection opened");
        Ok(Self {
            address,
            timeout: io_timeout,
            line_terminator: "\n".to_string(),
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn read_within(&mut self, limit: Duration) -> Result<Option<String>> {
        let mut line = String::new();
        match timeout(limit, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(anyhow!("{} closed the connection", self.address)),
            Ok(Ok(_)) => Ok(Some(line.trim().to_string())),
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to read from {}", self.address)),
        }
    }
}

#[async_trait]
impl Transport for TcpAdapter {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let bytes = format!("{}{}", line, self.line_terminator);
        timeout(self.timeout, self.writer.write_all(bytes.as_bytes()))
            .await
            .map_err(|_| anyhow!("Timed out writing to {}", self.address))?
            .with_context(|| format!("Failed to write to {}", self.address))?;
        debug!(address = %self.address, command = line, "TCP write");
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let limit = self.timeout;
        let line = self
            .read_within(limit)
            .await?
            .ok_or_else(|| anyhow!("Read timeout after {:?} from {}", limit, self.address))?;
        debug!(address = %self.address, response = %line, "TCP read");
        Ok(line)
    }

    async fn read_lines(&mut self, quiet: Duration) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_within(quiet).await? {
            lines.push(line);
        }
        Ok(lines)
    }
}
