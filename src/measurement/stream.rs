//! Time-ordered data demodulated from one or more tones.

use super::complex_serde;
use super::record::{Origin, Record, RecordTable};
use super::state::State;
use super::analysis_epoch;
use crate::analysis::binning::Binnable;
use crate::analysis::periodic::fold_mean;
use crate::error::{ReadoutError, ReadoutResult};
use crate::readout::calculate;
use crate::readout::state::RoachState;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Behaviour shared by stream measurements.
pub trait RoachStream {
    fn roach_state(&self) -> &RoachState;

    /// Unix time of the first sample.
    fn epoch(&self) -> f64;

    fn num_samples(&self) -> usize;

    fn stream_sample_rate(&self) -> f64 {
        calculate::stream_sample_rate(self.roach_state())
    }

    /// Time of each sample relative to the first.
    fn sample_time(&self) -> Vec<f64> {
        let rate = self.stream_sample_rate();
        (0..self.num_samples()).map(|i| i as f64 / rate).collect()
    }

    /// Sample index range for `start <= epoch < stop`.
    fn epoch_range(&self, start: f64, stop: f64) -> (usize, usize) {
        let epoch = self.epoch();
        let times = self.sample_time();
        let first = times.partition_point(|t| epoch + t < start);
        let last = times.partition_point(|t| epoch + t < stop).max(first);
        (first, last)
    }

    /// Average `array` over the modulation period of the square-wave output.
    fn fold<T: Binnable>(&self, array: &[T]) -> ReadoutResult<Vec<T>>
    where
        Self: Sized,
    {
        fold_mean(array, calculate::modulation_period_samples(self.roach_state())?)
    }
}

/// Mean of the samples that are not NaN; NaN when none are.
pub(crate) fn nan_mean(samples: &[Complex64]) -> Complex64 {
    let good: Vec<&Complex64> = samples.iter().filter(|z| !z.is_nan()).collect();
    if good.is_empty() {
        return Complex64::new(f64::NAN, f64::NAN);
    }
    good.iter().fold(Complex64::new(0.0, 0.0), |acc, z| acc + **z) / good.len() as f64
}

/// Standard error of [`nan_mean`], computed separately for the real and imaginary parts.
pub(crate) fn nan_mean_error(samples: &[Complex64]) -> Complex64 {
    let good: Vec<&Complex64> = samples.iter().filter(|z| !z.is_nan()).collect();
    if good.is_empty() {
        return Complex64::new(f64::NAN, f64::NAN);
    }
    let n = good.len() as f64;
    let mean = good.iter().fold(Complex64::new(0.0, 0.0), |acc, z| acc + **z) / n;
    let var_re = good.iter().map(|z| (z.re - mean.re).powi(2)).sum::<f64>() / n;
    let var_im = good.iter().map(|z| (z.im - mean.im).powi(2)).sum::<f64>() / n;
    Complex64::new(var_re.sqrt(), var_im.sqrt()) / n.sqrt()
}

/// Simultaneously sampled data from several channels.
///
/// `s21_raw[k]` holds the samples demodulated from tone `tone_bin[tone_index[k]]`,
/// which lies in filter bank channel `filterbank_bin[k]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamArray {
    pub tone_bin: Vec<i64>,
    pub tone_amplitude: Vec<f64>,
    pub tone_phase: Vec<f64>,
    pub tone_index: Vec<usize>,
    pub filterbank_bin: Vec<i64>,
    pub epoch: f64,
    /// Digitizer packet sequence number of the first sample; unknown after slicing.
    pub sequence_start_number: Option<u64>,
    #[serde(with = "complex_serde::matrix")]
    pub s21_raw: Vec<Vec<Complex64>>,
    pub data_demodulated: bool,
    pub roach_state: RoachState,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

fn check_tones(tone_bin: &[i64], tone_amplitude: &[f64], tone_phase: &[f64]) -> ReadoutResult<()> {
    if tone_amplitude.len() != tone_bin.len() || tone_phase.len() != tone_bin.len() {
        return Err(ReadoutError::Shape(format!(
            "{} tone bins with {} amplitudes and {} phases",
            tone_bin.len(),
            tone_amplitude.len(),
            tone_phase.len()
        )));
    }
    Ok(())
}

impl StreamArray {
    pub fn new(
        tone_bin: Vec<i64>,
        tone_amplitude: Vec<f64>,
        tone_phase: Vec<f64>,
        tone_index: Vec<usize>,
        filterbank_bin: Vec<i64>,
        s21_raw: Vec<Vec<Complex64>>,
        roach_state: RoachState,
    ) -> ReadoutResult<Self> {
        let stream_array = Self {
            tone_bin,
            tone_amplitude,
            tone_phase,
            tone_index,
            filterbank_bin,
            epoch: 0.0,
            sequence_start_number: None,
            s21_raw,
            data_demodulated: true,
            roach_state,
            state: State::new(),
            description: String::new(),
            origin: None,
        };
        stream_array.validate()?;
        Ok(stream_array)
    }

    pub fn with_epoch(mut self, epoch: f64, sequence_start_number: Option<u64>) -> Self {
        self.epoch = epoch;
        self.sequence_start_number = sequence_start_number;
        self
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check that the array dimensions agree.
    pub fn validate(&self) -> ReadoutResult<()> {
        check_tones(&self.tone_bin, &self.tone_amplitude, &self.tone_phase)?;
        if self.filterbank_bin.len() != self.tone_index.len() {
            return Err(ReadoutError::Shape(format!(
                "{} filter bank bins for {} channels",
                self.filterbank_bin.len(),
                self.tone_index.len()
            )));
        }
        if self.s21_raw.len() != self.tone_index.len() {
            return Err(ReadoutError::Shape(format!(
                "s21_raw has {} rows for {} channels",
                self.s21_raw.len(),
                self.tone_index.len()
            )));
        }
        if let Some(first) = self.s21_raw.first() {
            if self.s21_raw.iter().any(|row| row.len() != first.len()) {
                return Err(ReadoutError::Shape("s21_raw rows differ in length".to_string()));
            }
        }
        if let Some(&bad) = self.tone_index.iter().find(|&&i| i >= self.tone_bin.len()) {
            return Err(ReadoutError::Shape(format!(
                "tone index {} is out of range for {} tones",
                bad,
                self.tone_bin.len()
            )));
        }
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.tone_index.len()
    }

    /// The data from channel `number` as a [`SingleStream`].
    pub fn stream(&self, number: usize) -> ReadoutResult<SingleStream> {
        if number >= self.num_channels() {
            return Err(ReadoutError::InvalidArgument(format!(
                "channel {} does not exist in a stream array of {} channels",
                number,
                self.num_channels()
            )));
        }
        Ok(SingleStream {
            tone_bin: self.tone_bin.clone(),
            tone_amplitude: self.tone_amplitude.clone(),
            tone_phase: self.tone_phase.clone(),
            tone_index: self.tone_index[number],
            filterbank_bin: self.filterbank_bin[number],
            epoch: self.epoch,
            sequence_start_number: self.sequence_start_number,
            s21_raw: self.s21_raw[number].clone(),
            data_demodulated: self.data_demodulated,
            roach_state: self.roach_state.clone(),
            number: Some(number),
            state: self.state.clone(),
            description: self.description.clone(),
            origin: self.origin.clone(),
        })
    }

    fn channel_bins(&self) -> impl Iterator<Item = i64> + '_ {
        self.tone_index.iter().map(|&i| self.tone_bin[i])
    }

    pub fn frequency(&self) -> Vec<f64> {
        self.channel_bins()
            .map(|bin| calculate::frequency(&self.roach_state, bin))
            .collect()
    }

    pub fn baseband_frequency(&self) -> Vec<f64> {
        self.channel_bins()
            .map(|bin| calculate::baseband_frequency(&self.roach_state, bin))
            .collect()
    }

    pub fn s21_raw_mean(&self) -> Vec<Complex64> {
        self.s21_raw.iter().map(|row| nan_mean(row)).collect()
    }

    pub fn s21_raw_mean_error(&self) -> Vec<Complex64> {
        self.s21_raw.iter().map(|row| nan_mean_error(row)).collect()
    }

    /// One S21 value per channel.
    pub fn s21_point(&self) -> Vec<Complex64> {
        self.s21_raw_mean()
    }

    pub fn s21_point_error(&self) -> Vec<Complex64> {
        self.s21_raw_mean_error()
    }

    /// Offset of each channel's tone from its filter bank channel center, in channel
    /// widths, or in Hz when `normalized` is false.
    pub fn tone_offset_frequency(&self, normalized: bool) -> Vec<f64> {
        let rate = self.stream_sample_rate();
        self.channel_bins()
            .zip(&self.filterbank_bin)
            .map(|(bin, &fb)| {
                let offset = calculate::tone_offset_frequency(
                    bin,
                    self.roach_state.num_tone_samples,
                    fb,
                    self.roach_state.num_filterbank_channels,
                );
                if normalized {
                    offset
                } else {
                    offset * rate
                }
            })
            .collect()
    }

    /// The samples with `start <= epoch < stop`.
    pub fn epochs(&self, start: f64, stop: f64) -> StreamArray {
        let (first, last) = self.epoch_range(start, stop);
        StreamArray {
            epoch: self.epoch + first as f64 / self.stream_sample_rate(),
            sequence_start_number: None,
            s21_raw: self.s21_raw.iter().map(|row| row[first..last].to_vec()).collect(),
            ..self.clone()
        }
    }

    pub fn to_records(&self) -> ReadoutResult<RecordTable> {
        (0..self.num_channels())
            .map(|k| Ok(self.stream(k)?.to_record()))
            .collect()
    }
}

impl RoachStream for StreamArray {
    fn roach_state(&self) -> &RoachState {
        &self.roach_state
    }

    fn epoch(&self) -> f64 {
        self.epoch
    }

    fn num_samples(&self) -> usize {
        self.s21_raw.first().map_or(0, Vec::len)
    }
}

/// Time-ordered data from one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleStream {
    pub tone_bin: Vec<i64>,
    pub tone_amplitude: Vec<f64>,
    pub tone_phase: Vec<f64>,
    pub tone_index: usize,
    pub filterbank_bin: i64,
    pub epoch: f64,
    pub sequence_start_number: Option<u64>,
    #[serde(with = "complex_serde::vec")]
    pub s21_raw: Vec<Complex64>,
    pub data_demodulated: bool,
    pub roach_state: RoachState,
    /// Position in the array this stream came from.
    pub number: Option<usize>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl SingleStream {
    pub fn validate(&self) -> ReadoutResult<()> {
        check_tones(&self.tone_bin, &self.tone_amplitude, &self.tone_phase)?;
        if self.tone_index >= self.tone_bin.len() {
            return Err(ReadoutError::Shape(format!(
                "tone index {} is out of range for {} tones",
                self.tone_index,
                self.tone_bin.len()
            )));
        }
        Ok(())
    }

    fn bin(&self) -> i64 {
        self.tone_bin[self.tone_index]
    }

    pub fn frequency(&self) -> f64 {
        calculate::frequency(&self.roach_state, self.bin())
    }

    pub fn baseband_frequency(&self) -> f64 {
        calculate::baseband_frequency(&self.roach_state, self.bin())
    }

    pub fn s21_raw_mean(&self) -> Complex64 {
        nan_mean(&self.s21_raw)
    }

    pub fn s21_raw_mean_error(&self) -> Complex64 {
        nan_mean_error(&self.s21_raw)
    }

    pub fn s21_point(&self) -> Complex64 {
        self.s21_raw_mean()
    }

    pub fn s21_point_error(&self) -> Complex64 {
        self.s21_raw_mean_error()
    }

    pub fn tone_offset_frequency(&self, normalized: bool) -> f64 {
        let offset = calculate::tone_offset_frequency(
            self.bin(),
            self.roach_state.num_tone_samples,
            self.filterbank_bin,
            self.roach_state.num_filterbank_channels,
        );
        if normalized {
            offset
        } else {
            offset * self.stream_sample_rate()
        }
    }

    pub fn epochs(&self, start: f64, stop: f64) -> SingleStream {
        let (first, last) = self.epoch_range(start, stop);
        SingleStream {
            epoch: self.epoch + first as f64 / self.stream_sample_rate(),
            sequence_start_number: None,
            s21_raw: self.s21_raw[first..last].to_vec(),
            ..self.clone()
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("number", self.number);
        record.insert("analysis_epoch", analysis_epoch());
        record.insert("start_epoch", self.epoch);
        record.extend_prefixed("roach", self.roach_state.items());
        record.extend(self.state.flatten(""));
        record.insert("s21_point", self.s21_point());
        record.insert("s21_point_error", self.s21_point_error());
        record.insert("frequency", self.frequency());
        record.insert("frequency_MHz", 1e-6 * self.frequency());
        record.add_origin(self.origin.as_ref());
        record
    }
}

impl RoachStream for SingleStream {
    fn roach_state(&self) -> &RoachState {
        &self.roach_state
    }

    fn epoch(&self) -> f64 {
        self.epoch
    }

    fn num_samples(&self) -> usize {
        self.s21_raw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roach_state() -> RoachState {
        RoachState {
            adc_sample_rate: 512e6,
            num_tone_samples: 1 << 16,
            num_filterbank_channels: 1 << 14,
            modulation_output: 2,
            modulation_rate: 1,
            ..RoachState::default()
        }
    }

    fn stream_array(samples: usize) -> StreamArray {
        let s21_raw = vec![
            (0..samples).map(|i| Complex64::new(i as f64, 1.0)).collect(),
            (0..samples).map(|i| Complex64::new(1.0, -(i as f64))).collect(),
        ];
        StreamArray::new(
            vec![1000, 2001, 3002],
            vec![1.0; 3],
            vec![0.0; 3],
            vec![0, 2],
            vec![250, 750],
            s21_raw,
            roach_state(),
        )
        .unwrap()
        .with_epoch(1000.0, Some(42))
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let result = StreamArray::new(
            vec![1, 2],
            vec![1.0; 2],
            vec![0.0; 2],
            vec![0, 1],
            vec![0],
            vec![vec![], vec![]],
            roach_state(),
        );
        assert!(matches!(result, Err(ReadoutError::Shape(_))));

        let result = StreamArray::new(
            vec![1],
            vec![1.0],
            vec![0.0],
            vec![3],
            vec![0],
            vec![vec![]],
            roach_state(),
        );
        assert!(matches!(result, Err(ReadoutError::Shape(_))));
    }

    #[test]
    fn test_stream_extracts_channel() {
        let sa = stream_array(8);
        let single = sa.stream(1).unwrap();
        assert_eq!(single.number, Some(1));
        assert_eq!(single.filterbank_bin, 750);
        assert_eq!(single.frequency(), sa.frequency()[1]);
        assert_eq!(single.s21_raw, sa.s21_raw[1]);
        assert!(sa.stream(2).is_err());
    }

    #[test]
    fn test_mean_excludes_nan() {
        let samples = vec![
            Complex64::new(1.0, 1.0),
            Complex64::new(f64::NAN, 0.0),
            Complex64::new(3.0, -1.0),
        ];
        assert_eq!(nan_mean(&samples), Complex64::new(2.0, 0.0));
        let error = nan_mean_error(&samples);
        assert!((error.re - 1.0 / 2f64.sqrt()).abs() < 1e-12);
        assert!((error.im - 1.0 / 2f64.sqrt()).abs() < 1e-12);
        assert!(nan_mean_error(&[Complex64::new(f64::NAN, f64::NAN)]).re.is_nan());
    }

    #[test]
    fn test_epochs_are_half_open() {
        let sa = stream_array(16);
        let dt = 1.0 / sa.stream_sample_rate();
        let split = 1000.0 + 4.5 * dt;
        let head = sa.epochs(f64::NEG_INFINITY, split);
        let tail = sa.epochs(split, f64::INFINITY);
        assert_eq!(head.num_samples() + tail.num_samples(), 16);
        assert_eq!(head.num_samples(), 5);
        assert_eq!(tail.s21_raw[0][0], sa.s21_raw[0][5]);
        assert!((tail.epoch - (1000.0 + 5.0 * dt)).abs() < 1e-9);
        assert_eq!(tail.sequence_start_number, None);
    }

    #[test]
    fn test_fold_uses_modulation_period() {
        let sa = stream_array(8);
        let single = sa.stream(0).unwrap();
        let x: Vec<f64> = (0..8).map(|i| (i % 4) as f64).collect();
        assert_eq!(single.fold(&x).unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_tone_offset_frequency() {
        let sa = stream_array(4);
        let offsets = sa.tone_offset_frequency(true);
        assert!((offsets[0] - 0.0).abs() < 1e-12);
        assert!((offsets[1] - 0.5).abs() < 1e-12);
        let hz = sa.tone_offset_frequency(false);
        assert!((hz[1] - 0.5 * sa.stream_sample_rate()).abs() < 1e-6);
    }

    #[test]
    fn test_records_have_one_row_per_channel() {
        let table = stream_array(4).to_records().unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.rows[0].contains_key("roach_num_tone_samples"));
        assert!(table.rows[0].contains_key("frequency_MHz"));
    }
}
