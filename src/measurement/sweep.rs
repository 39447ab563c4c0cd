//! Frequency sweeps built from streams at stepped tone frequencies.

use super::record::{Origin, Record, RecordTable};
use super::state::State;
use super::stream::{SingleStream, StreamArray};
use super::{analysis_epoch, argsort, linspace};
use crate::analysis::fitting::Parameters;
use crate::analysis::peaks::find_peaks_cwt;
use crate::analysis::polynomial::{polyfit, unwrap};
use crate::analysis::resonator::{Resonator, ResonatorModel};
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Points in the model curves added to records.
pub const NUM_MODEL_POINTS: usize = 1000;

/// Cable background from weighted polynomial fits of |S21| and unwrapped phase.
///
/// The default weights `|S21|^2` push the fit away from resonance dips; `mask`
/// zeroes the weight of excluded points.
pub fn fit_polynomial_background(
    frequency: &[f64],
    s21: &[Complex64],
    amplitude_degree: usize,
    phase_degree: usize,
    weights: Option<&[f64]>,
    mask: Option<&[bool]>,
) -> ReadoutResult<Vec<Complex64>> {
    let mut w: Vec<f64> = match weights {
        Some(w) => w.to_vec(),
        None => s21.iter().map(|z| z.norm_sqr()).collect(),
    };
    if let Some(mask) = mask {
        if mask.len() != w.len() {
            return Err(ReadoutError::Shape(format!(
                "background mask has {} values for {} points",
                mask.len(),
                w.len()
            )));
        }
        w.iter_mut().zip(mask).filter(|(_, m)| !**m).for_each(|(v, _)| *v = 0.0);
    }
    let amplitude: Vec<f64> = s21.iter().map(|z| z.norm()).collect();
    let phase = unwrap(&s21.iter().map(|z| z.arg()).collect::<Vec<_>>());
    let amplitude_poly = polyfit(frequency, &amplitude, amplitude_degree, Some(&w))?;
    let phase_poly = polyfit(frequency, &phase, phase_degree, Some(&w))?;
    Ok(frequency
        .iter()
        .map(|&f| Complex64::from_polar(amplitude_poly.eval(f), phase_poly.eval(f)))
        .collect())
}

/// Settings for [`SweepArray::find_peaks`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSearch {
    pub expected_q: f64,
    pub num_widths: usize,
    /// Minimum peak height in standard deviations of the search data.
    pub threshold: f64,
}

impl Default for PeakSearch {
    fn default() -> Self {
        Self {
            expected_q: 30_000.0,
            num_widths: 100,
            threshold: 1.0,
        }
    }
}

/// A list of [`StreamArray`]s taken at stepped frequencies.
///
/// Channel `k` of every stream array belongs to the same resonator, so [`SweepArray::sweep`]
/// gives one resonator's sweep. For a scan over unknown resonators, use the ascending
/// arrays with [`SweepArray::find_peaks`] and [`SweepArray::resonator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepArray {
    pub stream_arrays: Vec<StreamArray>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl SweepArray {
    pub fn new(stream_arrays: Vec<StreamArray>, state: State, description: impl Into<String>) -> Self {
        Self {
            stream_arrays,
            state,
            description: description.into(),
            origin: None,
        }
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        self.stream_arrays.iter().try_for_each(StreamArray::validate)
    }

    /// Channels per stream array; an error if the stream arrays disagree.
    pub fn num_channels(&self) -> ReadoutResult<usize> {
        let Some(first) = self.stream_arrays.first() else {
            return Ok(0);
        };
        let n = first.num_channels();
        if self.stream_arrays.iter().any(|sa| sa.num_channels() != n) {
            return Err(ReadoutError::Shape(
                "channel numbers differ between stream arrays".to_string(),
            ));
        }
        Ok(n)
    }

    /// Channel `number` of every stream array.
    pub fn sweep(&self, number: usize) -> ReadoutResult<SingleSweep> {
        let streams = self
            .stream_arrays
            .iter()
            .map(|sa| sa.stream(number))
            .collect::<ReadoutResult<Vec<_>>>()?;
        Ok(SingleSweep {
            streams,
            number: Some(number),
            state: self.state.clone(),
            description: self.description.clone(),
            origin: self.origin.clone(),
            resonator: None,
        })
    }

    pub fn start_epoch(&self) -> f64 {
        self.stream_arrays
            .iter()
            .map(|sa| sa.epoch)
            .fold(f64::NAN, f64::min)
    }

    fn ascending_order(&self) -> Vec<usize> {
        argsort(&self.unsorted_frequency())
    }

    fn unsorted_frequency(&self) -> Vec<f64> {
        self.stream_arrays.iter().flat_map(|sa| sa.frequency()).collect()
    }

    fn sorted<T: Clone>(&self, values: Vec<T>) -> Vec<T> {
        self.ascending_order().into_iter().map(|i| values[i].clone()).collect()
    }

    /// Every data point's frequency in ascending order.
    pub fn frequency(&self) -> Vec<f64> {
        self.sorted(self.unsorted_frequency())
    }

    pub fn frequency_mhz(&self) -> Vec<f64> {
        self.frequency().into_iter().map(|f| 1e-6 * f).collect()
    }

    pub fn s21_point(&self) -> Vec<Complex64> {
        self.sorted(self.stream_arrays.iter().flat_map(|sa| sa.s21_point()).collect())
    }

    pub fn s21_point_error(&self) -> Vec<Complex64> {
        self.sorted(self.stream_arrays.iter().flat_map(|sa| sa.s21_point_error()).collect())
    }

    pub fn s21_raw(&self) -> Vec<Vec<Complex64>> {
        self.sorted(
            self.stream_arrays
                .iter()
                .flat_map(|sa| sa.s21_raw.iter().cloned())
                .collect(),
        )
    }

    /// Cubic background of the ascending sweep.
    pub fn background(&self) -> ReadoutResult<Vec<Complex64>> {
        fit_polynomial_background(&self.frequency(), &self.s21_point(), 3, 3, None, None)
    }

    pub fn s21_point_foreground(&self) -> ReadoutResult<Vec<Complex64>> {
        let background = self.background()?;
        Ok(self.s21_point().iter().zip(&background).map(|(s, b)| s / b).collect())
    }

    pub fn s21_point_error_foreground(&self) -> ReadoutResult<Vec<Complex64>> {
        let background = self.background()?;
        Ok(self
            .s21_point_error()
            .iter()
            .zip(&background)
            .map(|(s, b)| s / b)
            .collect())
    }

    /// Indices into the ascending arrays where resonance dips appear.
    pub fn find_peaks(&self, search: &PeakSearch) -> ReadoutResult<Vec<usize>> {
        let frequency = self.frequency();
        if frequency.len() < 3 {
            return Ok(Vec::new());
        }
        let mean_frequency = frequency.iter().sum::<f64>() / frequency.len() as f64;
        let linewidth = mean_frequency / search.expected_q;
        let width = linewidth / (frequency[1] - frequency[0]);
        if !(width.is_finite() && width > 0.0) {
            return Err(ReadoutError::InvalidArgument(
                "sweep frequencies must be strictly ascending to search for peaks".to_string(),
            ));
        }
        let data: Vec<f64> = self
            .s21_point_foreground()?
            .iter()
            .map(|z| 1.0 / z.norm() - 1.0)
            .collect();
        let widths = linspace(width / 10.0, 10.0 * width, search.num_widths);
        let peaks = find_peaks_cwt(&data, &widths)?;
        let mean = data.iter().sum::<f64>() / data.len() as f64;
        let std = (data.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / data.len() as f64).sqrt();
        let upper = data.len() as f64 - width;
        let found: Vec<usize> = peaks
            .into_iter()
            .filter(|&p| width < p as f64 && (p as f64) < upper && data[p] > search.threshold * std)
            .collect();
        debug!(count = found.len(), width_samples = width, "found resonance candidates");
        Ok(found)
    }

    /// Fit the linear-loss model to the foreground within `width` Hz around `frequency`.
    pub fn resonator(&self, frequency: f64, width: f64) -> ReadoutResult<Resonator> {
        let all_frequency = self.frequency();
        let foreground = self.s21_point_foreground()?;
        let errors = self.s21_point_error_foreground()?;
        let keep: Vec<usize> = all_frequency
            .iter()
            .enumerate()
            .filter(|(_, &f)| frequency - width / 2.0 <= f && f <= frequency + width / 2.0)
            .map(|(i, _)| i)
            .collect();
        let mut resonator = Resonator::new(
            ResonatorModel::LinearLossResonatorWithCable,
            keep.iter().map(|&i| all_frequency[i]).collect(),
            keep.iter().map(|&i| foreground[i]).collect(),
            Some(keep.iter().map(|&i| errors[i]).collect()),
        )?;
        resonator.fit(None)?;
        Ok(resonator)
    }

    /// One row per channel, or with `one_sweep_per_row` false a single row holding the
    /// whole ascending sweep.
    pub fn to_records(&self, one_sweep_per_row: bool) -> ReadoutResult<RecordTable> {
        if one_sweep_per_row {
            return (0..self.num_channels()?)
                .map(|k| self.sweep(k)?.to_record())
                .collect();
        }
        let mut record = Record::new();
        record.insert("analysis_epoch", analysis_epoch());
        record.insert("start_epoch", self.start_epoch());
        if let Some(first) = self.stream_arrays.first() {
            record.extend_prefixed("roach", first.roach_state.items());
        }
        record.extend(self.state.flatten(""));
        record.insert("frequency", self.frequency());
        record.insert("s21_point", self.s21_point());
        record.insert("s21_point_error", self.s21_point_error());
        record.add_origin(self.origin.as_ref());
        Ok(RecordTable::from(vec![record]))
    }
}

/// One channel's streams at several frequencies.
///
/// The arrays are returned in ascending frequency order. The resonator fit is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleSweep {
    pub streams: Vec<SingleStream>,
    pub number: Option<usize>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
    #[serde(skip)]
    resonator: Option<Resonator>,
}

impl SingleSweep {
    pub fn new(streams: Vec<SingleStream>, state: State, description: impl Into<String>) -> Self {
        Self {
            streams,
            number: None,
            state,
            description: description.into(),
            origin: None,
            resonator: None,
        }
    }

    fn ascending_order(&self) -> Vec<usize> {
        argsort(&self.streams.iter().map(SingleStream::frequency).collect::<Vec<_>>())
    }

    fn sorted<T, F: Fn(&SingleStream) -> T>(&self, value: F) -> Vec<T> {
        self.ascending_order()
            .into_iter()
            .map(|i| value(&self.streams[i]))
            .collect()
    }

    pub fn start_epoch(&self) -> f64 {
        self.streams.iter().map(|s| s.epoch).fold(f64::NAN, f64::min)
    }

    pub fn frequency(&self) -> Vec<f64> {
        self.sorted(SingleStream::frequency)
    }

    pub fn frequency_mhz(&self) -> Vec<f64> {
        self.sorted(|s| 1e-6 * s.frequency())
    }

    pub fn s21_point(&self) -> Vec<Complex64> {
        self.sorted(SingleStream::s21_point)
    }

    pub fn s21_point_error(&self) -> Vec<Complex64> {
        self.sorted(SingleStream::s21_point_error)
    }

    pub fn s21_raw(&self) -> Vec<Vec<Complex64>> {
        self.sorted(|s| s.s21_raw.clone())
    }

    /// Fit `model`, replacing any cached fit.
    pub fn fit_resonator(&mut self, model: ResonatorModel, initial: Option<Parameters>) -> ReadoutResult<&Resonator> {
        let mut resonator = Resonator::new(
            model,
            self.frequency(),
            self.s21_point(),
            Some(self.s21_point_error()),
        )?;
        resonator.fit(initial)?;
        Ok(self.resonator.insert(resonator))
    }

    /// The cached fit, fitting the linear model on first use.
    pub fn resonator(&mut self) -> ReadoutResult<&Resonator> {
        let resonator = match self.resonator.take() {
            Some(r) => r,
            None => {
                let mut r = Resonator::new(
                    ResonatorModel::LinearResonatorWithCable,
                    self.frequency(),
                    self.s21_point(),
                    Some(self.s21_point_error()),
                )?;
                r.fit(None)?;
                r
            }
        };
        Ok(self.resonator.insert(resonator))
    }

    /// Use an already fitted resonator instead of fitting.
    pub fn set_resonator(&mut self, resonator: Resonator) {
        self.resonator = Some(resonator);
    }

    pub fn s21_normalized(&mut self) -> ReadoutResult<Vec<Complex64>> {
        let frequency = self.frequency();
        let s21 = self.s21_point();
        self.resonator()?.normalize_points(&frequency, &s21)
    }

    pub fn s21_normalized_error(&mut self) -> ReadoutResult<Vec<Complex64>> {
        let frequency = self.frequency();
        let errors = self.s21_point_error();
        self.resonator()?.normalize_points(&frequency, &errors)
    }

    pub fn to_record(&mut self) -> ReadoutResult<Record> {
        let mut record = Record::new();
        record.insert("number", self.number);
        record.insert("analysis_epoch", analysis_epoch());
        record.insert("start_epoch", self.start_epoch());
        if let Some(first) = self.streams.first() {
            record.extend_prefixed("roach", first.roach_state.items());
        }
        record.extend(self.state.flatten(""));
        let origin = self.origin.clone();
        insert_resonator_fields(&mut record, self.resonator()?, NUM_MODEL_POINTS)?;
        record.add_origin(origin.as_ref());
        Ok(record)
    }
}

/// Add fitted parameters, quality factors, data and model curves under `res_` keys.
pub(crate) fn insert_resonator_fields(
    record: &mut Record,
    resonator: &Resonator,
    num_model_points: usize,
) -> ReadoutResult<()> {
    let params = resonator
        .current_result()
        .map_or_else(|| resonator.current_params(), |r| &r.params);
    for p in params.iter() {
        record.insert(format!("res_{}", p.name), p.value);
        record.insert(format!("res_{}_error", p.name), p.stderr);
    }
    record.insert("res_redchi", resonator.redchi());
    record.insert("res_Q_i", resonator.q_i());
    record.insert("res_Q_e", resonator.q_e().re);
    record.insert("res_frequency_data", &resonator.frequency);
    record.insert("res_s21_data", &resonator.data);
    record.insert("res_s21_errors", &resonator.errors);

    let (f_min, f_max) = resonator
        .frequency
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| (lo.min(f), hi.max(f)));
    let model_frequency = linspace(f_min, f_max, num_model_points);
    let model_s21 = resonator.model(&model_frequency)?;
    record.insert("res_model_frequency", &model_frequency);
    record.insert("res_model_s21", &model_s21);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::state::RoachState;

    fn state() -> RoachState {
        RoachState {
            adc_sample_rate: 512e6,
            num_tone_samples: 1 << 16,
            num_filterbank_channels: 1 << 14,
            ..RoachState::default()
        }
    }

    /// Two channels stepped over `steps` offsets, stored in descending order.
    fn sweep_array(steps: i64) -> SweepArray {
        let stream_arrays = (0..steps)
            .rev()
            .map(|step| {
                let bins = vec![10_000 + step, 20_000 + step];
                let s21 = bins
                    .iter()
                    .map(|&b| vec![Complex64::new(b as f64, 0.0); 4])
                    .collect();
                StreamArray::new(bins, vec![1.0; 2], vec![0.0; 2], vec![0, 1], vec![2500, 5000], s21, state())
                    .unwrap()
                    .with_epoch(100.0 + step as f64, None)
            })
            .collect();
        SweepArray::new(stream_arrays, State::new(), "test sweep")
    }

    #[test]
    fn test_arrays_are_ascending() {
        let sa = sweep_array(5);
        let f = sa.frequency();
        assert_eq!(f.len(), 10);
        assert!(f.windows(2).all(|w| w[0] < w[1]));
        let s21 = sa.s21_point();
        assert_eq!(s21[0], Complex64::new(10_000.0, 0.0));
        assert_eq!(s21[9], Complex64::new(20_004.0, 0.0));
        assert_eq!(sa.start_epoch(), 100.0);
    }

    #[test]
    fn test_single_sweep_selects_channel() {
        let sa = sweep_array(4);
        let sweep = sa.sweep(1).unwrap();
        assert_eq!(sweep.streams.len(), 4);
        assert_eq!(sweep.s21_point()[0], Complex64::new(20_000.0, 0.0));
        assert!(sweep.frequency().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_num_channels_mismatch() {
        let mut sa = sweep_array(3);
        let single = StreamArray::new(
            vec![5],
            vec![1.0],
            vec![0.0],
            vec![0],
            vec![1],
            vec![vec![Complex64::new(1.0, 0.0)]],
            state(),
        )
        .unwrap();
        assert_eq!(sa.num_channels().unwrap(), 2);
        sa.stream_arrays.push(single);
        assert!(sa.num_channels().is_err());
    }

    #[test]
    fn test_polynomial_background_recovers_smooth_cable() {
        let f: Vec<f64> = (0..200).map(|i| 100e6 + 1e3 * i as f64).collect();
        let cable: Vec<Complex64> = f
            .iter()
            .map(|&v| Complex64::from_polar(0.5 + 1e-9 * (v - 100e6), -2.0 * std::f64::consts::PI * 30e-9 * v))
            .collect();
        let fitted = fit_polynomial_background(&f, &cable, 3, 3, None, None).unwrap();
        for (a, b) in fitted.iter().zip(&cable) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_vna_style_record() {
        let table = sweep_array(3).to_records(false).unwrap();
        assert_eq!(table.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.get("frequency").and_then(|v| v.as_array()).map(Vec::len), Some(6));
        assert!(row.contains_key("roach_heterodyne"));
    }
}
