//! A digitizer stand-in that synthesizes resonator transmission.
//!
//! Each configured resonance is a [`ResonatorModel::LinearResonatorWithCable`]
//! foreground; the product of all of them is multiplied by a cable background and
//! scaled by the DAC attenuation and FFT gain. Gaussian noise comes from a seeded RNG,
//! so runs with the same configuration are reproducible.

use super::calculate;
use super::state::{RoachState, MODULATION_SQUARE_WAVE};
use super::{Readout, FFT_FULL_SCALE, MAX_FFT_GAIN};
use crate::analysis::fitting::{Parameter, Parameters};
use crate::analysis::resonator::{background, ResonatorModel};
use crate::config::{ReadoutConfig, SimulationConfig};
use crate::measurement::{AdcSnap, StreamArray};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use tracing::{debug, info};

pub const SAMPLES_PER_BLOCK: usize = 4096;

const ADC_SNAPSHOT_LENGTH: usize = 1 << 14;

/// Channelized amplitude at FFT gain 0 and no attenuation.
const TONE_LEVEL: f64 = 4.0;

const MAXIMUM_DAC_ATTENUATION: f64 = 63.0;

/// Fractional resonance shift while the modulated source is on.
const MODULATION_SHIFT: f64 = 1e-6;

const CABLE_DELAY: f64 = 3e-9;

fn gaussian(rng: &mut StdRng) -> f64 {
    // Box-Muller; u1 is kept away from zero.
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub struct SimulatedReadout {
    state: RoachState,
    simulation: SimulationConfig,
    lo_step_mhz: f64,
    rng: StdRng,
    resonators: Vec<Parameters>,
    cable: Parameters,
    banks: Vec<Vec<i64>>,
    phases: Vec<Vec<f64>>,
    selected: Vec<usize>,
    epoch: f64,
    sequence: u64,
}

impl SimulatedReadout {
    pub fn new(config: &ReadoutConfig) -> Self {
        let simulation = config.simulation.clone();
        let resonators = simulation
            .resonances_mhz
            .iter()
            .map(|f| {
                Parameters::new()
                    .with(Parameter::new("f_0", f * 1e6))
                    .with(Parameter::new("Q", simulation.q))
                    .with(Parameter::new("Q_e_real", simulation.q_e))
                    .with(Parameter::new("Q_e_imag", 0.0))
            })
            .collect();
        let f_phi = simulation.resonances_mhz.first().copied().unwrap_or(0.0) * 1e6;
        let cable = Parameters::new()
            .with(Parameter::new("A_mag", 1.0))
            .with(Parameter::new("A_slope", 0.0))
            .with(Parameter::new("A_phase", 0.3))
            .with(Parameter::new("delay", CABLE_DELAY))
            .with(Parameter::new("f_phi", f_phi));
        let state = RoachState {
            heterodyne: config.heterodyne,
            adc_sample_rate: config.adc_sample_rate_hz,
            num_tone_samples: config.num_tone_samples,
            num_filterbank_channels: config.num_filterbank_channels,
            ..RoachState::default()
        };
        Self {
            state,
            rng: StdRng::seed_from_u64(simulation.seed),
            simulation,
            lo_step_mhz: config.lo_step_mhz,
            resonators,
            cable,
            banks: Vec::new(),
            phases: Vec::new(),
            selected: Vec::new(),
            epoch: Utc::now().timestamp_millis() as f64 / 1e3,
            sequence: 0,
        }
    }

    fn current_bank(&self) -> Result<&[i64]> {
        match self.banks.get(self.state.bank as usize) {
            Some(bank) => Ok(bank),
            None => bail!("No tone bank loaded"),
        }
    }

    /// Noise-free transmission at `frequency` (Hz). `shifted` moves every resonance
    /// down by the modulation shift.
    fn transmission(&self, frequency: f64, shifted: bool) -> Result<Complex64> {
        let mut s21 = background(&self.cable, frequency)?;
        for resonator in &self.resonators {
            let model = ResonatorModel::LinearResonatorWithCable;
            if shifted {
                let mut moved = resonator.clone();
                let f_0 = resonator.value("f_0")?;
                moved.add(Parameter::new("f_0", f_0 * (1.0 - MODULATION_SHIFT)));
                s21 *= model.foreground(&moved, frequency)?;
            } else {
                s21 *= model.foreground(resonator, frequency)?;
            }
        }
        Ok(s21)
    }

    fn amplitude(&self) -> f64 {
        TONE_LEVEL * 2f64.powi(self.state.fft_gain as i32) * 10f64.powf(-self.state.dac_attenuation / 20.0)
    }

    /// Whether the modulated source is on at sample `n`.
    fn source_on(&self, n: usize) -> bool {
        match self.state.modulation_output {
            1 => true,
            MODULATION_SQUARE_WAVE => match calculate::modulation_period_samples(&self.state) {
                Ok(period) => n % period >= period / 2,
                Err(_) => false,
            },
            _ => false,
        }
    }

    fn clip(value: f64) -> f64 {
        value.clamp(-FFT_FULL_SCALE, FFT_FULL_SCALE)
    }
}

#[async_trait]
impl Readout for SimulatedReadout {
    fn roach_state(&self) -> RoachState {
        self.state.clone()
    }

    fn samples_per_block(&self) -> usize {
        SAMPLES_PER_BLOCK
    }

    async fn set_dac_attenuation(&mut self, attenuation_db: f64) -> Result<()> {
        if !(0.0..=MAXIMUM_DAC_ATTENUATION).contains(&attenuation_db) {
            bail!(
                "DAC attenuation must be between 0 and {} dB, got {}",
                MAXIMUM_DAC_ATTENUATION,
                attenuation_db
            );
        }
        self.state.dac_attenuation = attenuation_db;
        debug!(attenuation_db, "DAC attenuation set");
        Ok(())
    }

    async fn set_lo(&mut self, lo_mhz: f64) -> Result<f64> {
        if !self.state.heterodyne {
            bail!("The LO cannot be set in baseband mode");
        }
        if !lo_mhz.is_finite() || lo_mhz <= 0.0 {
            bail!("LO frequency must be positive, got {} MHz", lo_mhz);
        }
        let rounded = (lo_mhz / self.lo_step_mhz).round() * self.lo_step_mhz;
        self.state.lo_frequency = rounded * 1e6;
        info!(requested_mhz = lo_mhz, lo_mhz = rounded, "LO set");
        Ok(rounded)
    }

    async fn set_tone_bins(&mut self, banks: &[Vec<i64>], num_tone_samples: u64) -> Result<()> {
        if banks.is_empty() || banks.iter().any(Vec::is_empty) {
            bail!("Every tone bank needs at least one tone");
        }
        if num_tone_samples == 0 {
            bail!("The tone buffer must hold at least one sample");
        }
        let limit = num_tone_samples as i64;
        if let Some(bad) = banks.iter().flatten().find(|&&b| !(0..limit).contains(&b)) {
            bail!("Tone bin {} is outside a buffer of {} samples", bad, num_tone_samples);
        }
        let rng = &mut self.rng;
        self.phases = banks
            .iter()
            .map(|bank| bank.iter().map(|_| rng.gen_range(0.0..2.0 * PI)).collect())
            .collect();
        self.banks = banks.to_vec();
        self.state.num_tone_samples = num_tone_samples;
        debug!(banks = banks.len(), tones = banks[0].len(), "tone banks loaded");
        self.select_bank(0).await
    }

    async fn select_bank(&mut self, bank: usize) -> Result<()> {
        let Some(tones) = self.banks.get(bank) else {
            bail!("Bank {} does not exist; {} banks are loaded", bank, self.banks.len());
        };
        self.state.bank = bank as u32;
        self.state.num_tones = tones.len() as u32;
        self.selected = (0..tones.len()).collect();
        Ok(())
    }

    async fn select_fft_bins(&mut self, tone_indices: &[usize]) -> Result<()> {
        let num_tones = self.current_bank()?.len();
        if let Some(bad) = tone_indices.iter().find(|&&i| i >= num_tones) {
            bail!("Tone index {} is out of range for a bank of {} tones", bad, num_tones);
        }
        self.selected = tone_indices.to_vec();
        Ok(())
    }

    async fn set_modulation_output(&mut self, output: u32) -> Result<()> {
        if output > MODULATION_SQUARE_WAVE {
            bail!("Modulation output must be 0 (low), 1 (high) or 2 (square wave), got {}", output);
        }
        self.state.modulation_output = output;
        Ok(())
    }

    async fn set_fft_gain(&mut self, gain: u32) -> Result<()> {
        if gain > MAX_FFT_GAIN {
            bail!("FFT gain must be at most {}, got {}", MAX_FFT_GAIN, gain);
        }
        self.state.fft_gain = gain;
        Ok(())
    }

    async fn get_measurement_blocks(&mut self, num_blocks: usize, demodulate: bool) -> Result<StreamArray> {
        if self.selected.is_empty() {
            bail!("No tones are selected");
        }
        let bank = self.current_bank()?.to_vec();
        let bank_index = self.state.bank as usize;
        let phases = self.phases.get(bank_index).cloned().unwrap_or_else(|| vec![0.0; bank.len()]);
        let length = num_blocks * SAMPLES_PER_BLOCK;
        let amplitude = self.amplitude();
        let noise = amplitude * self.simulation.noise_amplitude;

        let mut filterbank_bins = Vec::with_capacity(self.selected.len());
        let mut s21_raw = Vec::with_capacity(self.selected.len());
        for &index in &self.selected {
            let bin = bank[index];
            let frequency = calculate::frequency(&self.state, bin);
            let fb_bin = calculate::filterbank_bin(&self.state, bin);
            let offset = calculate::tone_offset_frequency(
                bin,
                self.state.num_tone_samples,
                fb_bin,
                self.state.num_filterbank_channels,
            );
            let quiet = self.transmission(frequency, false)? * amplitude;
            let modulated = self.transmission(frequency, true)? * amplitude;
            let mut row = Vec::with_capacity(length);
            for n in 0..length {
                let clean = if self.source_on(n) { modulated } else { quiet };
                let mut z = Complex64::new(
                    clean.re + noise * gaussian(&mut self.rng),
                    clean.im + noise * gaussian(&mut self.rng),
                );
                if !demodulate {
                    z *= Complex64::from_polar(1.0, 2.0 * PI * offset * n as f64 + phases[index]);
                }
                row.push(Complex64::new(Self::clip(z.re), Self::clip(z.im)));
            }
            filterbank_bins.push(fb_bin);
            s21_raw.push(row);
        }

        let mut stream = StreamArray::new(
            bank.clone(),
            vec![1.0; bank.len()],
            phases,
            self.selected.clone(),
            filterbank_bins,
            s21_raw,
            self.state.clone(),
        )?
        .with_epoch(self.epoch, Some(self.sequence));
        stream.data_demodulated = demodulate;
        self.epoch += length as f64 / calculate::stream_sample_rate(&self.state);
        self.sequence += num_blocks as u64;
        Ok(stream)
    }

    async fn get_adc_measurement(&mut self) -> Result<AdcSnap> {
        let bank = self.current_bank()?.to_vec();
        let phases = self.phases.get(self.state.bank as usize).cloned().unwrap_or_default();
        let scale = 0.5 / bank.len() as f64;
        let dt = if self.state.heterodyne {
            1.0 / self.state.adc_sample_rate
        } else {
            // Baseband tones are real; the snapshot interleaves two ADC samples.
            0.5 / self.state.adc_sample_rate
        };
        let mut x = vec![0.0; ADC_SNAPSHOT_LENGTH];
        let mut y = vec![0.0; ADC_SNAPSHOT_LENGTH];
        for (k, &bin) in bank.iter().enumerate() {
            let f = calculate::baseband_frequency(&self.state, bin);
            let phase = phases.get(k).copied().unwrap_or(0.0);
            for (n, (xn, yn)) in x.iter_mut().zip(y.iter_mut()).enumerate() {
                let theta = 2.0 * PI * f * n as f64 * dt + phase;
                *xn += scale * theta.cos();
                *yn += scale * theta.sin();
            }
        }
        let noise = self.simulation.noise_amplitude;
        for (xn, yn) in x.iter_mut().zip(y.iter_mut()) {
            *xn += noise * gaussian(&mut self.rng);
            *yn += noise * gaussian(&mut self.rng);
        }
        Ok(AdcSnap::new(self.epoch, x, y, self.state.clone())?)
    }
}
