//! SIM921 AC resistance bridge.

use super::calibration::SimThermometer;
use super::sim900::{check_boolean_token, parse_reply, SimLink};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

pub const MINIMUM_FREQUENCY_HZ: f64 = 1.95;
pub const MAXIMUM_FREQUENCY_HZ: f64 = 61.1;

const EXCITATION_MODES: [&str; 8] = ["PASSIVE", "0", "CURRENT", "1", "VOLTAGE", "2", "POWER", "3"];

fn check_code(code: i32, low: i32, high: i32, what: &str) -> Result<()> {
    if (low..=high).contains(&code) {
        Ok(())
    } else {
        bail!("Valid {} codes are integers {} through {}, got {}", what, low, high, code)
    }
}

pub struct Sim921<L: SimLink> {
    link: L,
}

impl<L: SimLink> Sim921<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    async fn set_boolean(&mut self, command: &str, mode: &str) -> Result<()> {
        check_boolean_token(mode)?;
        self.link.send(&format!("{} {}", command, mode)).await
    }

    async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let reply = self.link.query(command).await?;
        parse_reply(&reply, command)
    }

    async fn query_i32(&mut self, command: &str) -> Result<i32> {
        let reply = self.link.query(command).await?;
        parse_reply(&reply, command)
    }

    /// Excitation frequency in Hz.
    pub async fn frequency(&mut self) -> Result<f64> {
        self.query_f64("FREQ?").await
    }

    pub async fn set_frequency(&mut self, hz: f64) -> Result<()> {
        if !(MINIMUM_FREQUENCY_HZ..=MAXIMUM_FREQUENCY_HZ).contains(&hz) {
            bail!(
                "Valid excitation frequency range is from {} to {} Hz",
                MINIMUM_FREQUENCY_HZ,
                MAXIMUM_FREQUENCY_HZ
            );
        }
        self.link.send(&format!("FREQ {}", hz)).await
    }

    pub async fn range(&mut self) -> Result<i32> {
        self.query_i32("RANG?").await
    }

    pub async fn set_range(&mut self, code: i32) -> Result<()> {
        check_code(code, 0, 9, "range")?;
        self.link.send(&format!("RANG {}", code)).await
    }

    pub async fn excitation(&mut self) -> Result<i32> {
        self.query_i32("EXCI?").await
    }

    pub async fn set_excitation(&mut self, code: i32) -> Result<()> {
        check_code(code, -1, 8, "excitation")?;
        self.link.send(&format!("EXCI {}", code)).await
    }

    pub async fn excitation_state(&mut self) -> Result<String> {
        self.link.query("EXON?").await
    }

    pub async fn set_excitation_state(&mut self, state: &str) -> Result<()> {
        self.set_boolean("EXON", state).await
    }

    pub async fn excitation_mode(&mut self) -> Result<String> {
        self.link.query("MODE?").await
    }

    pub async fn set_excitation_mode(&mut self, mode: &str) -> Result<()> {
        if !EXCITATION_MODES.contains(&mode.to_uppercase().as_str()) {
            bail!("Invalid excitation mode '{}'", mode);
        }
        self.link.send(&format!("MODE {}", mode)).await
    }

    /// Actual excitation current amplitude in amperes.
    pub async fn excitation_current(&mut self) -> Result<f64> {
        self.query_f64("IEXC?").await
    }

    /// Actual excitation voltage amplitude in volts.
    pub async fn excitation_voltage(&mut self) -> Result<f64> {
        self.query_f64("VEXC?").await
    }

    pub async fn resistance(&mut self) -> Result<f64> {
        self.query_f64("RVAL?").await
    }

    pub async fn resistance_deviation(&mut self) -> Result<f64> {
        self.query_f64("RDEV?").await
    }

    /// Temperature from the active calibration curve, in kelvin.
    pub async fn temperature(&mut self) -> Result<f64> {
        self.query_f64("TVAL?").await
    }

    pub async fn temperature_deviation(&mut self) -> Result<f64> {
        self.query_f64("TDEV?").await
    }

    pub async fn display(&mut self) -> Result<i32> {
        self.query_i32("DISP?").await
    }

    pub async fn set_display(&mut self, code: i32) -> Result<()> {
        check_code(code, 0, 8, "display")?;
        self.link.send(&format!("DISP {}", code)).await
    }

    /// Reset the post-detection filter.
    pub async fn filter_reset(&mut self) -> Result<()> {
        self.link.send("FRST").await
    }

    pub async fn time_constant(&mut self) -> Result<i32> {
        self.query_i32("TCON?").await
    }

    pub async fn set_time_constant(&mut self, code: i32) -> Result<()> {
        check_code(code, -1, 6, "time constant")?;
        self.link.send(&format!("TCON {}", code)).await
    }

    pub async fn phase_hold(&mut self) -> Result<String> {
        self.link.query("PHLD?").await
    }

    pub async fn set_phase_hold(&mut self, mode: &str) -> Result<()> {
        self.set_boolean("PHLD", mode).await
    }

    pub async fn display_temperature(&mut self) -> Result<String> {
        self.link.query("DTEM?").await
    }

    pub async fn set_display_temperature(&mut self, mode: &str) -> Result<()> {
        self.set_boolean("DTEM", mode).await
    }

    pub async fn analog_output_temperature(&mut self) -> Result<String> {
        self.link.query("ATEM?").await
    }

    pub async fn set_analog_output_temperature(&mut self, mode: &str) -> Result<()> {
        self.set_boolean("ATEM", mode).await
    }

    /// Active calibration curve, 1–3.
    pub async fn active_curve(&mut self) -> Result<i32> {
        self.query_i32("CURV?").await
    }

    pub async fn set_active_curve(&mut self, number: i32) -> Result<()> {
        check_code(number, 1, 3, "curve")?;
        self.link.send(&format!("CURV {}", number)).await
    }

    pub async fn autorange_gain(&mut self) -> Result<String> {
        self.link.query("AGAI?").await
    }

    pub async fn set_autorange_gain(&mut self, mode: &str) -> Result<()> {
        self.set_boolean("AGAI", mode).await
    }

    pub async fn autorange_display(&mut self) -> Result<String> {
        self.link.query("ADIS?").await
    }

    pub async fn set_autorange_display(&mut self, mode: &str) -> Result<()> {
        self.set_boolean("ADIS", mode).await
    }

    /// Start the internal autocalibration cycle.
    pub async fn autocalibrate(&mut self) -> Result<()> {
        self.link.send("ACAL").await
    }
}

#[async_trait]
impl<L: SimLink> SimLink for Sim921<L> {
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

impl<L: SimLink> SimThermometer for Sim921<L> {
    const CAPT_SEPARATOR: char = ',';
    const MAXIMUM_POINTS: usize = 225;
    const WRITE_DELAY: Duration = Duration::from_millis(500);
}
