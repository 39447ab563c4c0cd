//! The digitizer: tone generation, channelization and streaming.
//!
//! The procedures in [`crate::acquire`] talk to the digitizer only through [`Readout`].
//! [`SimulatedReadout`] stands in for hardware in the CLI `--simulate` path and in
//! tests.

pub mod calculate;
pub mod simulated;
pub mod state;

pub use simulated::SimulatedReadout;
pub use state::RoachState;

use crate::measurement::{AdcSnap, StreamArray};
use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// Largest FFT gain code; each step doubles the channelized amplitude.
pub const MAX_FFT_GAIN: u32 = 15;

/// Magnitude at which channelized samples overflow.
pub const FFT_FULL_SCALE: f64 = 32768.0;

/// Blocks per stream when the length in seconds is zero.
const MINIMUM_BLOCKS: usize = 1;

#[async_trait]
pub trait Readout: Send {
    /// Snapshot of the current configuration, stored with every measurement.
    fn roach_state(&self) -> RoachState;

    /// Demodulated samples delivered per channel in one block.
    fn samples_per_block(&self) -> usize;

    async fn set_dac_attenuation(&mut self, attenuation_db: f64) -> Result<()>;

    /// Tune the LO to the nearest allowed step. Returns the frequency set, in MHz.
    async fn set_lo(&mut self, lo_mhz: f64) -> Result<f64>;

    /// Load tone banks, given as tone bins for a buffer of `num_tone_samples`, and
    /// select bank 0.
    async fn set_tone_bins(&mut self, banks: &[Vec<i64>], num_tone_samples: u64) -> Result<()>;

    async fn select_bank(&mut self, bank: usize) -> Result<()>;

    /// Choose which tones of the current bank are streamed, by index within the bank.
    async fn select_fft_bins(&mut self, tone_indices: &[usize]) -> Result<()>;

    async fn set_modulation_output(&mut self, output: u32) -> Result<()>;

    async fn set_fft_gain(&mut self, gain: u32) -> Result<()>;

    async fn get_measurement_blocks(&mut self, num_blocks: usize, demodulate: bool) -> Result<StreamArray>;

    async fn get_adc_measurement(&mut self) -> Result<AdcSnap>;

    /// Load tone banks given in MHz. Returns the bins actually used.
    async fn set_tone_frequencies(&mut self, banks_mhz: &[Vec<f64>], num_tone_samples: u64) -> Result<Vec<Vec<i64>>> {
        let state = self.roach_state();
        let banks: Vec<Vec<i64>> = banks_mhz
            .iter()
            .map(|bank| {
                bank.iter()
                    .map(|f| calculate::tone_bin(&state, f * 1e6, num_tone_samples))
                    .collect()
            })
            .collect();
        self.set_tone_bins(&banks, num_tone_samples).await?;
        Ok(banks)
    }

    /// Stream the selected tones for at least `num_seconds`.
    async fn get_measurement(&mut self, num_seconds: f64) -> Result<StreamArray> {
        if !num_seconds.is_finite() || num_seconds < 0.0 {
            bail!("Stream length must be a non-negative number of seconds, got {}", num_seconds);
        }
        let rate = calculate::stream_sample_rate(&self.roach_state());
        let samples = (num_seconds * rate).ceil() as usize;
        let blocks = samples.div_ceil(self.samples_per_block()).max(MINIMUM_BLOCKS);
        debug!(num_seconds, blocks, "streaming");
        self.get_measurement_blocks(blocks, true).await
    }

    /// Lower the FFT gain from the top until one block of data stays below half of
    /// full scale. Returns the gain chosen.
    async fn optimize_fft_gain(&mut self) -> Result<u32> {
        for gain in (0..=MAX_FFT_GAIN).rev() {
            self.set_fft_gain(gain).await?;
            let block = self.get_measurement_blocks(1, true).await?;
            let peak = block
                .s21_raw
                .iter()
                .flatten()
                .filter(|z| !z.is_nan())
                .fold(0.0f64, |peak, z| peak.max(z.re.abs()).max(z.im.abs()));
            if peak < 0.5 * FFT_FULL_SCALE {
                info!(gain, peak, "FFT gain optimized");
                return Ok(gain);
            }
        }
        bail!("Signal overflows even at FFT gain 0")
    }
}
