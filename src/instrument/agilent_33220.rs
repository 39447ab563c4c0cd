//! Agilent 33220A function generator over its SCPI socket, used as a DC heater supply.

use crate::adapters::{TcpAdapter, Transport};
use crate::config::FunctionGeneratorConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// A programmable DC voltage source.
#[async_trait]
pub trait DcSource: Send {
    async fn set_dc_voltage(&mut self, volts: f64) -> Result<()>;
    async fn enable_output(&mut self, enabled: bool) -> Result<()>;
}

pub struct Agilent33220<T: Transport> {
    transport: T,
}

impl Agilent33220<TcpAdapter> {
    pub async fn connect(config: &FunctionGeneratorConfig) -> Result<Self> {
        let transport = TcpAdapter::connect(&config.host, config.port, Duration::from_secs(5))
            .await
            .with_context(|| format!("Failed to reach function generator at {}:{}", config.host, config.port))?;
        let mut generator = Self::new(transport);
        generator.set_load_ohms(config.load_ohms).await?;
        Ok(generator)
    }
}

impl<T: Transport> Agilent33220<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn identity(&mut self) -> Result<String> {
        self.transport.query("*IDN?").await
    }

    /// Expected load impedance; the displayed voltage assumes this load.
    pub async fn set_load_ohms(&mut self, ohms: f64) -> Result<()> {
        if !ohms.is_finite() || ohms <= 0.0 {
            bail!("Load impedance must be a positive number of ohms, got {}", ohms);
        }
        self.transport.write_line(&format!("OUTP:LOAD {}", ohms)).await
    }
}

#[async_trait]
impl<T: Transport> DcSource for Agilent33220<T> {
    async fn set_dc_voltage(&mut self, volts: f64) -> Result<()> {
        if !volts.is_finite() {
            bail!("DC voltage must be finite, got {}", volts);
        }
        self.transport.write_line(&format!("APPL:DC DEF,DEF,{}", volts)).await?;
        info!(volts, "function generator DC level set");
        Ok(())
    }

    async fn enable_output(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.transport.write_line(&format!("OUTP {}", state)).await
    }
}

/// Stands in for the function generator when no hardware is attached.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SimulatedDcSource {
    pub volts: f64,
    pub enabled: bool,
}

#[async_trait]
impl DcSource for SimulatedDcSource {
    async fn set_dc_voltage(&mut self, volts: f64) -> Result<()> {
        if !volts.is_finite() {
            bail!("DC voltage must be finite, got {}", volts);
        }
        self.volts = volts;
        info!(volts, "simulated DC level set");
        Ok(())
    }

    async fn enable_output(&mut self, enabled: bool) -> Result<()> {
        self.enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[tokio::test]
    async fn test_commands() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", &["Agilent Technologies,33220A,MY123,2.02"]);
        let mut fg = Agilent33220::new(mock.clone());
        fg.set_load_ohms(1000.0).await.unwrap();
        fg.set_dc_voltage(0.0025).await.unwrap();
        fg.enable_output(true).await.unwrap();
        fg.enable_output(false).await.unwrap();
        assert!(fg.identity().await.unwrap().contains("33220A"));
        assert!(fg.set_load_ohms(-5.0).await.is_err());
        assert!(fg.set_dc_voltage(f64::NAN).await.is_err());
        assert_eq!(
            mock.call_log(),
            vec!["OUTP:LOAD 1000", "APPL:DC DEF,DEF,0.0025", "OUTP ON", "OUTP OFF", "*IDN?"]
        );
    }

    #[tokio::test]
    async fn test_simulated_source() {
        let mut source = SimulatedDcSource::default();
        source.set_dc_voltage(1.5).await.unwrap();
        source.enable_output(true).await.unwrap();
        assert_eq!(source, SimulatedDcSource { volts: 1.5, enabled: true });
        assert!(source.set_dc_voltage(f64::INFINITY).await.is_err());
    }
}
