//! SIM922 diode temperature monitor.

use super::calibration::SimThermometer;
use super::sim900::{parse_reply, SimLink};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

const CURVE_TYPES: [&str; 4] = ["0", "STAN", "1", "USER"];

fn check_channel(channel: u8) -> Result<()> {
    if (1..=4).contains(&channel) {
        Ok(())
    } else {
        bail!("SIM922 channels are 1 through 4, got {}", channel)
    }
}

pub struct Sim922<L: SimLink> {
    link: L,
}

impl<L: SimLink> Sim922<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    /// Diode voltage on `channel`, in volts.
    pub async fn voltage(&mut self, channel: u8) -> Result<f64> {
        check_channel(channel)?;
        let command = format!("VOLT? {}", channel);
        let reply = self.link.query(&command).await?;
        parse_reply(&reply, &command)
    }

    pub async fn temperature(&mut self, channel: u8) -> Result<f64> {
        check_channel(channel)?;
        let command = format!("TVAL? {}", channel);
        let reply = self.link.query(&command).await?;
        parse_reply(&reply, &command)
    }

    pub async fn curve_type(&mut self, channel: u8) -> Result<String> {
        check_channel(channel)?;
        self.link.query(&format!("CURV? {}", channel)).await
    }

    /// Select the standard (`STAN`/0) or user (`USER`/1) curve for `channel`.
    pub async fn set_curve_type(&mut self, channel: u8, curve_type: &str) -> Result<()> {
        check_channel(channel)?;
        if !CURVE_TYPES.contains(&curve_type.to_uppercase().as_str()) {
            bail!("Invalid curve type '{}'", curve_type);
        }
        self.link.send(&format!("CURV {}, {}", channel, curve_type)).await
    }
}

#[async_trait]
impl<L: SimLink> SimLink for Sim922<L> {
    async fn send(&mut self, message: &str) -> Result<()> {
        self.link.send(message).await
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.link.query(message).await
    }

    async fn send_paced(&mut self, messages: &[String], delay: Duration) -> Result<()> {
        self.link.send_paced(messages, delay).await
    }
}

impl<L: SimLink> SimThermometer for Sim922<L> {
    // The CAPT? reply is space separated, whatever the manual says.
    const CAPT_SEPARATOR: char = ' ';
    const MAXIMUM_POINTS: usize = 256;
    const WRITE_DELAY: Duration = Duration::from_secs(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::instrument::sim900::Direct;

    #[tokio::test]
    async fn test_channel_commands() {
        let mock = MockAdapter::new();
        mock.on("VOLT? 1", &["1.0523"]);
        mock.on("TVAL? 3", &["77.35"]);
        let mut sim922 = Sim922::new(Direct::new(mock.clone()));
        assert_eq!(sim922.voltage(1).await.unwrap(), 1.0523);
        assert_eq!(sim922.temperature(3).await.unwrap(), 77.35);
        assert!(sim922.temperature(5).await.is_err());
        sim922.set_curve_type(2, "user").await.unwrap();
        assert!(sim922.set_curve_type(2, "custom").await.is_err());
        assert_eq!(mock.call_log(), vec!["VOLT? 1", "TVAL? 3", "CURV 2, user"]);
    }

    #[tokio::test]
    async fn test_read_curve_uses_space_separator() {
        let mock = MockAdapter::new();
        mock.on("CINI? 2", &["1,DT670,2"]);
        mock.on("CAPT? 2, 1", &["0.09  300.0"]);
        mock.on("CAPT? 2, 2", &["1.6 4.2"]);
        let mut sim922 = Sim922::new(Direct::new(mock));
        let curve = sim922.read_curve(2).await.unwrap();
        assert_eq!(curve.identification, "DT670");
        assert_eq!(curve.format, "1");
        assert_eq!(curve.sensor, vec![0.09, 1.6]);
        assert_eq!(curve.temperature, vec![300.0, 4.2]);
    }
}
