//! SIM925 octal multiplexer. Only the common SIM commands are supported.

use super::sim900::SimLink;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub struct Sim925<L: SimLink> {
    link: L,
}

impl<L: SimLink> Sim925<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn into_inner(self) -> L {
        self.link
    }
}

#[async_trait]
impl<L: SimLink> SimLink for Sim925<L> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::instrument::sim900::Sim900;

    #[tokio::test]
    async fn test_identity_in_mainframe() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", &["Stanford_Research_Systems,SIM925,s/n001,ver1.4"]);
        let mut sim900 = Sim900::new(mock.clone());
        let mut sim925 = sim900.sim925('8');
        assert!(sim925.identity().await.unwrap().contains("SIM925"));
        sim925.set_token("ON").await.unwrap();
        assert!(sim925.set_token("yes").await.is_err());
        assert_eq!(mock.call_log()[4], "TOKN ON");
    }
}
