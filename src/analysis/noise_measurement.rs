//! Resonator noise from one sweep and the stream taken next to it.
//!
//! The stream is normalized by the fitted cable background, projected onto the
//! frequency direction of the resonance circle and expressed as a fractional frequency
//! shift. The result keeps both the decimated time series and the spectra.

use crate::analysis::despike::deglitch_window;
use crate::analysis::filters::low_pass_fir;
use crate::analysis::iqnoise::{pca_noise, PcaNoise, PcaOptions};
use crate::analysis::resonator::{fit_best_resonator, Resonator};
use crate::analysis::spectral::{psd, SpectralOptions};
use crate::error::{ReadoutError, ReadoutResult};
use crate::measurement::complex_serde;
use crate::measurement::stream::{nan_mean, nan_mean_error, RoachStream};
use crate::measurement::{argsort, linspace, SingleStream, SingleSweep};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

const BOLTZMANN: f64 = 1.380649e-23;
/// Amplifier noise temperature in kelvin used for the expected noise floor.
const AMPLIFIER_NOISE_TEMPERATURE: f64 = 4.0;
const LINE_IMPEDANCE: f64 = 50.0;
const MODEL_POINTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseMeasurementOptions {
    /// Cutoff of the low-pass filter applied before decimation, in Hz. The filter is
    /// designed against the Nyquist frequency (half the sample rate), so this is the
    /// true half-amplitude point rather than half of it.
    pub low_pass_cutoff: f64,
    pub num_taps: usize,
    /// Gain from the DAC output to the device, in dB.
    pub dac_chain_gain: f64,
    pub deglitch_threshold: f64,
    /// Cable delay in seconds; estimated from the sweep when absent.
    pub delay_estimate: Option<f64>,
    /// Number of leading stream samples averaged into an extra sweep point.
    pub sweep_point_samples: usize,
    pub coarse_nfft: usize,
    /// Frequency at which the reported noise level is read off, in Hz.
    pub reference_frequency: f64,
}

impl Default for NoiseMeasurementOptions {
    fn default() -> Self {
        Self {
            low_pass_cutoff: 4.0,
            num_taps: 1024,
            dac_chain_gain: -52.0,
            deglitch_threshold: 5.0,
            delay_estimate: None,
            sweep_point_samples: 2048,
            coarse_nfft: 4096,
            reference_frequency: 500.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepNoiseMeasurement {
    pub options: NoiseMeasurementOptions,
    pub channel: Option<usize>,
    pub sweep_epoch: f64,
    pub stream_epoch: f64,
    pub measurement_frequency: f64,
    pub sample_rate: f64,
    pub dac_attenuation: f64,
    pub power_dbm: f64,

    /// Sweep points including the one taken from the stream, ascending in frequency.
    pub sweep_frequency: Vec<f64>,
    #[serde(with = "complex_serde::vec")]
    pub sweep_s21: Vec<Complex64>,
    #[serde(with = "complex_serde::vec")]
    pub sweep_errors: Vec<Complex64>,
    #[serde(with = "complex_serde::vec")]
    pub sweep_normalized_s21: Vec<Complex64>,
    pub resonator: Resonator,

    pub model_frequency: Vec<f64>,
    #[serde(with = "complex_serde::vec")]
    pub model_normalized_s21: Vec<Complex64>,
    pub normalized_model_s21_at_measurement: Complex64,
    pub normalized_model_s21_at_resonance: Complex64,
    pub normalized_ds21_df_at_measurement: Complex64,
    pub normalized_timeseries_mean: Complex64,

    /// Seconds between samples of the low-passed series.
    pub low_pass_timestep: f64,
    #[serde(with = "complex_serde::vec")]
    pub low_pass_normalized_timeseries: Vec<Complex64>,
    #[serde(with = "complex_serde::vec")]
    pub low_pass_projected_timeseries: Vec<Complex64>,

    pub deglitch_window: usize,
    pub pca: PcaNoise,
    pub coarse_frequency: Vec<f64>,
    /// Real (frequency direction) part of the fractional fluctuation spectrum, 1/Hz.
    pub prr_coarse: Vec<f64>,
    /// Imaginary (dissipation direction) part, 1/Hz.
    pub pii_coarse: Vec<f64>,
    /// Frequency noise at the reference frequency, Hz²/Hz.
    pub reference_noise: f64,
    pub expected_amplifier_noise: f64,

    /// Thermometer readings, keyed by channel name, during the sweep and the stream.
    #[serde(default)]
    pub sweep_temperatures: BTreeMap<String, f64>,
    #[serde(default)]
    pub stream_temperatures: BTreeMap<String, f64>,

    #[serde(with = "complex_serde::vec")]
    projected_timeseries: Vec<Complex64>,
}

/// Scalar results of a [`SweepNoiseMeasurement`], one row per resonator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseSummary {
    pub channel: Option<usize>,
    pub sweep_epoch: f64,
    pub stream_epoch: f64,
    pub measurement_frequency: f64,
    pub sample_rate: f64,
    pub power_dbm: f64,
    pub dac_attenuation: f64,
    pub model: String,
    pub f_0: f64,
    pub f_0_error: Option<f64>,
    pub q: f64,
    pub q_i: f64,
    pub q_e_real: f64,
    pub q_e_imag: f64,
    pub redchi: f64,
    pub normalized_model_s21_at_measurement: Complex64,
    pub normalized_model_s21_at_resonance: Complex64,
    pub normalized_ds21_df_at_measurement: Complex64,
    pub normalized_timeseries_mean: Complex64,
    pub reference_frequency: f64,
    pub reference_noise: f64,
    pub expected_amplifier_noise: f64,
    pub deglitch_window: usize,
    pub sweep_temperatures: BTreeMap<String, f64>,
    pub stream_temperatures: BTreeMap<String, f64>,
}

/// Smallest power of two covering `samples`, or half the series when that is longer than `n`.
fn deglitch_window_length(samples: f64, n: usize) -> usize {
    let window = 1usize << samples.max(1.0).log2().ceil() as u32;
    if window > n {
        (n / 2).max(1)
    } else {
        window
    }
}

fn one_second_window(sample_rate: f64, n: usize) -> usize {
    deglitch_window_length(sample_rate, n)
}

impl SweepNoiseMeasurement {
    /// Analyze `stream` against `sweep`, which must be the same channel.
    pub fn new(sweep: &SingleSweep, stream: &SingleStream, options: NoiseMeasurementOptions) -> ReadoutResult<Self> {
        if stream.s21_raw.is_empty() {
            return Err(ReadoutError::InvalidArgument("noise measurement needs stream samples".to_string()));
        }
        let measurement_frequency = stream.frequency();
        let sample_rate = stream.stream_sample_rate();
        let timeseries = &stream.s21_raw;

        // The mean of the start of the stream is one more sweep point.
        let head = &timeseries[..options.sweep_point_samples.min(timeseries.len())];
        let extra_point = nan_mean(head);
        let extra_error = nan_mean_error(head);
        let mut frequency = sweep.frequency();
        let mut s21 = sweep.s21_point();
        let mut errors = sweep.s21_point_error();
        frequency.push(measurement_frequency);
        s21.push(extra_point);
        errors.push(extra_error);
        let order = argsort(&frequency);
        let sweep_frequency: Vec<f64> = order.iter().map(|&i| frequency[i]).collect();
        let sweep_s21: Vec<Complex64> = order.iter().map(|&i| s21[i]).collect();
        let sweep_errors: Vec<Complex64> = order.iter().map(|&i| errors[i]).collect();

        let resonator = fit_best_resonator(&sweep_frequency, &sweep_s21, Some(&sweep_errors), options.delay_estimate)?;
        debug!(
            model = resonator.model.name(),
            f_0 = resonator.f_0(),
            q = resonator.q(),
            redchi = resonator.redchi(),
            "noise measurement resonator"
        );

        let normalized = resonator.remove_background(measurement_frequency, timeseries)?;
        let normalized_timeseries_mean = nan_mean(&normalized);
        let decimation = sample_rate / options.low_pass_cutoff;
        let nyquist = sample_rate / 2.0;
        let low_pass_normalized_timeseries =
            low_pass_fir(&normalized, options.num_taps, options.low_pass_cutoff, nyquist, decimation)?;

        let projected = resonator.project_s21_to_delta_freq(measurement_frequency, &normalized, true)?;
        let window = one_second_window(sample_rate, projected.len());
        let deglitched = deglitch_window(&projected, window, options.deglitch_threshold)?;
        let low_pass_projected_timeseries =
            low_pass_fir(&deglitched, options.num_taps, options.low_pass_cutoff, nyquist, decimation)?;
        let low_pass_timestep = decimation.floor().max(1.0) / sample_rate;

        let sweep_normalized_s21 = resonator.normalize_points(&sweep_frequency, &sweep_s21)?;
        let first = sweep_frequency.first().copied().unwrap_or(measurement_frequency);
        let last = sweep_frequency.last().copied().unwrap_or(measurement_frequency);
        let model_frequency = linspace(first, last, MODEL_POINTS);
        let model_normalized_s21 = model_frequency
            .iter()
            .map(|&f| resonator.normalized_model(f))
            .collect::<ReadoutResult<Vec<_>>>()?;
        let normalized_model_s21_at_measurement = resonator.normalized_model(measurement_frequency)?;
        let normalized_model_s21_at_resonance = resonator.normalized_model(resonator.f_0())?;
        let normalized_ds21_df_at_measurement = resonator.approx_normalized_gradient(measurement_frequency)?;

        let fractional: Vec<Complex64> = deglitched.iter().map(|z| z / measurement_frequency).collect();
        let pca = pca_noise(&fractional, &PcaOptions::new(sample_rate))?;
        let coarse = SpectralOptions::new(options.coarse_nfft, sample_rate);
        let real: Vec<f64> = fractional.iter().map(|z| z.re).collect();
        let imag: Vec<f64> = fractional.iter().map(|z| z.im).collect();
        let prr = psd(&real, &coarse)?;
        let pii = psd(&imag, &coarse)?;
        let reference_noise = prr
            .frequency
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - options.reference_frequency)
                    .abs()
                    .total_cmp(&(*b - options.reference_frequency).abs())
            })
            .map_or(f64::NAN, |(i, _)| prr.density[i] * measurement_frequency * measurement_frequency);

        let dac_attenuation = stream.roach_state.dac_attenuation;
        let power_dbm = options.dac_chain_gain - dac_attenuation;
        let expected_amplifier_noise = expected_amplifier_noise(power_dbm, resonator.q(), resonator.q_e().norm());

        info!(
            frequency = measurement_frequency,
            power_dbm,
            reference_noise,
            expected_amplifier_noise,
            "noise measurement complete"
        );
        Ok(Self {
            channel: stream.number,
            sweep_epoch: sweep.start_epoch(),
            stream_epoch: stream.epoch,
            measurement_frequency,
            sample_rate,
            dac_attenuation,
            power_dbm,
            sweep_frequency,
            sweep_s21,
            sweep_errors,
            sweep_normalized_s21,
            resonator,
            model_frequency,
            model_normalized_s21,
            normalized_model_s21_at_measurement,
            normalized_model_s21_at_resonance,
            normalized_ds21_df_at_measurement,
            normalized_timeseries_mean,
            low_pass_timestep,
            low_pass_normalized_timeseries,
            low_pass_projected_timeseries,
            deglitch_window: window,
            pca,
            coarse_frequency: prr.frequency,
            prr_coarse: prr.density,
            pii_coarse: pii.density,
            reference_noise,
            expected_amplifier_noise,
            sweep_temperatures: BTreeMap::new(),
            stream_temperatures: BTreeMap::new(),
            projected_timeseries: projected,
            options,
        })
    }

    pub fn with_temperatures(mut self, sweep: BTreeMap<String, f64>, stream: BTreeMap<String, f64>) -> Self {
        self.sweep_temperatures = sweep;
        self.stream_temperatures = stream;
        self
    }

    /// Projected frequency shift in Hz before any deglitching or filtering.
    pub fn projected_timeseries(&self) -> &[Complex64] {
        &self.projected_timeseries
    }

    /// Deglitch the projected series again with a different window or threshold.
    pub fn get_deglitched_timeseries(
        &self,
        window_seconds: f64,
        threshold: Option<f64>,
    ) -> ReadoutResult<Vec<Complex64>> {
        if window_seconds.is_nan() || window_seconds <= 0.0 {
            return Err(ReadoutError::InvalidArgument(format!(
                "deglitch window of {} s is not positive",
                window_seconds
            )));
        }
        let window = deglitch_window_length(window_seconds * self.sample_rate, self.projected_timeseries.len());
        deglitch_window(
            &self.projected_timeseries,
            window,
            threshold.unwrap_or(self.options.deglitch_threshold),
        )
    }

    pub fn q_i(&self) -> f64 {
        self.resonator.q_i()
    }

    pub fn summary(&self) -> NoiseSummary {
        let params = self.resonator.current_params();
        let q_e = self.resonator.q_e();
        NoiseSummary {
            channel: self.channel,
            sweep_epoch: self.sweep_epoch,
            stream_epoch: self.stream_epoch,
            measurement_frequency: self.measurement_frequency,
            sample_rate: self.sample_rate,
            power_dbm: self.power_dbm,
            dac_attenuation: self.dac_attenuation,
            model: self.resonator.model.name().to_string(),
            f_0: self.resonator.f_0(),
            f_0_error: params.get("f_0").and_then(|p| p.stderr),
            q: self.resonator.q(),
            q_i: self.resonator.q_i(),
            q_e_real: q_e.re,
            q_e_imag: q_e.im,
            redchi: self.resonator.redchi(),
            normalized_model_s21_at_measurement: self.normalized_model_s21_at_measurement,
            normalized_model_s21_at_resonance: self.normalized_model_s21_at_resonance,
            normalized_ds21_df_at_measurement: self.normalized_ds21_df_at_measurement,
            normalized_timeseries_mean: self.normalized_timeseries_mean,
            reference_frequency: self.options.reference_frequency,
            reference_noise: self.reference_noise,
            expected_amplifier_noise: self.expected_amplifier_noise,
            deglitch_window: self.deglitch_window,
            sweep_temperatures: self.sweep_temperatures.clone(),
            stream_temperatures: self.stream_temperatures.clone(),
        }
    }
}

/// Frequency noise in Hz²/Hz equivalent to the amplifier's voltage noise at `power_dbm`.
pub fn expected_amplifier_noise(power_dbm: f64, q: f64, q_e_magnitude: f64) -> f64 {
    let amplifier_voltage = (4.0 * BOLTZMANN * AMPLIFIER_NOISE_TEMPERATURE * LINE_IMPEDANCE).sqrt();
    let read_voltage = (LINE_IMPEDANCE * 10f64.powf(power_dbm / 10.0) * 1e-3).sqrt();
    let dv_df_times_f_0 = 4.0 * read_voltage * q * q / q_e_magnitude;
    (amplifier_voltage / dv_df_times_f_0).powi(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fitting::{Parameter, Parameters};
    use crate::analysis::resonator::{background, ResonatorModel};
    use crate::measurement::{State, StreamArray, SweepArray};
    use crate::readout::calculate;
    use crate::readout::state::RoachState;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const F_0: f64 = 100e6;

    fn roach_state() -> RoachState {
        RoachState {
            num_tone_samples: 1 << 21,
            dac_attenuation: 20.0,
            ..RoachState::default()
        }
    }

    fn s21(f: f64) -> Complex64 {
        let params = Parameters::new()
            .with(Parameter::new("f_0", F_0))
            .with(Parameter::new("Q", 2e4))
            .with(Parameter::new("Q_e_real", 4e4))
            .with(Parameter::new("Q_e_imag", 0.0))
            .with(Parameter::new("A_mag", 0.5));
        background(&params, f).unwrap() * ResonatorModel::LinearResonatorWithCable.foreground(&params, f).unwrap()
    }

    fn sweep_and_stream(samples: usize, glitch: bool) -> (SingleSweep, SingleStream) {
        let state = roach_state();
        let mut rng = StdRng::seed_from_u64(17);
        let center = calculate::tone_bin(&state, F_0, state.num_tone_samples);
        let stream_arrays = (-30..=30)
            .map(|step| {
                let bin = center + 3 * step;
                let f = calculate::frequency(&state, bin);
                let data = (0..32)
                    .map(|_| s21(f) + Complex64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5) * 1e-4)
                    .collect();
                StreamArray::new(vec![bin], vec![1.0], vec![0.0], vec![0], vec![0], vec![data], state.clone())
                    .unwrap()
                    .with_epoch(10.0, None)
            })
            .collect();
        let sweep = SweepArray::new(stream_arrays, State::new(), "").sweep(0).unwrap();
        let f = calculate::frequency(&state, center + 1);
        let mut data: Vec<Complex64> = (0..samples)
            .map(|_| s21(f) + Complex64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5) * 1e-4)
            .collect();
        if glitch {
            data[samples / 2] += Complex64::new(0.2, -0.2);
        }
        let stream = StreamArray::new(vec![center + 1], vec![1.0], vec![0.0], vec![0], vec![0], vec![data], state)
            .unwrap()
            .with_epoch(20.0, None)
            .stream(0)
            .unwrap();
        (sweep, stream)
    }

    #[test]
    fn test_one_second_window() {
        assert_eq!(one_second_window(15625.0, 100_000), 16384);
        assert_eq!(one_second_window(15625.0, 16_384), 16384);
        assert_eq!(one_second_window(15625.0, 10_000), 5000);
        assert_eq!(one_second_window(15625.0, 3), 1);
        assert_eq!(deglitch_window_length(7812.5, 100_000), 8192);
        assert_eq!(deglitch_window_length(0.2, 100), 1);
    }

    #[test]
    fn test_expected_amplifier_noise_scales_with_power() {
        let low = expected_amplifier_noise(-100.0, 2e4, 4e4);
        let high = expected_amplifier_noise(-90.0, 2e4, 4e4);
        assert!(low > 0.0);
        assert!((low / high - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_measurement_on_synthetic_resonator() {
        let (sweep, stream) = sweep_and_stream(1 << 15, true);
        let measurement = SweepNoiseMeasurement::new(&sweep, &stream, NoiseMeasurementOptions::default()).unwrap();

        assert_eq!(measurement.sweep_frequency.len(), 62);
        assert!(measurement.sweep_frequency.windows(2).all(|w| w[0] <= w[1]));
        assert!((measurement.resonator.f_0() - F_0).abs() < 2e3);
        assert_eq!(measurement.power_dbm, -72.0);
        assert_eq!(measurement.deglitch_window, 16384);
        assert_eq!(measurement.model_frequency.len(), MODEL_POINTS);
        assert!(measurement.reference_noise.is_finite() && measurement.reference_noise > 0.0);
        assert_eq!(measurement.prr_coarse.len(), measurement.coarse_frequency.len());
        assert!(measurement.low_pass_timestep > 0.0);
        assert!(!measurement.low_pass_projected_timeseries.is_empty());

        let spike = measurement.projected_timeseries()[1 << 14].norm();
        let cleaned = measurement.get_deglitched_timeseries(0.5, None).unwrap();
        assert_eq!(cleaned.len(), 1 << 15);
        assert!(cleaned[1 << 14].norm() < spike);
    }

    #[test]
    fn test_redeglitch_uses_the_measurement_window() {
        let (sweep, stream) = sweep_and_stream(1 << 15, true);
        let measurement = SweepNoiseMeasurement::new(&sweep, &stream, NoiseMeasurementOptions::default()).unwrap();
        let threshold = measurement.options.deglitch_threshold;
        let expected =
            deglitch_window(measurement.projected_timeseries(), measurement.deglitch_window, threshold).unwrap();
        let again = measurement.get_deglitched_timeseries(1.0, None).unwrap();
        assert_eq!(again, expected);

        // A window longer than the series falls back to half of it.
        let n = measurement.projected_timeseries().len();
        assert_eq!(deglitch_window_length(4.0 * measurement.sample_rate, n), n / 2);
        assert_eq!(measurement.get_deglitched_timeseries(4.0, None).unwrap(), expected);
    }

    #[test]
    fn test_summary_serializes() {
        let (sweep, stream) = sweep_and_stream(1 << 13, false);
        let mut temperatures = BTreeMap::new();
        temperatures.insert("package".to_string(), 0.1);
        let measurement = SweepNoiseMeasurement::new(&sweep, &stream, NoiseMeasurementOptions::default())
            .unwrap()
            .with_temperatures(temperatures.clone(), temperatures);
        let summary = measurement.summary();
        assert_eq!(summary.sweep_epoch, 10.0);
        assert_eq!(summary.stream_epoch, 20.0);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["sweep_temperatures"]["package"], 0.1);
        assert!(measurement.get_deglitched_timeseries(0.0, None).is_err());
    }
}
