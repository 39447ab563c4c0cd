//! A sweep paired with a stream taken near resonance, and the noise analysis built on it.
//!
//! The sweep's resonator fit turns stream samples into the fractional frequency shift
//! `x = f / f_r - 1` and the inverse internal quality factor `q = 1 / Q_i`. Noise spectra
//! of `x` and `y = q / 2` are equal when amplifier noise dominates, which makes them the
//! natural pair to compare.

use super::record::{Origin, Record, RecordTable};
use super::state::State;
use super::stream::{RoachStream, SingleStream, StreamArray};
use super::sweep::{insert_resonator_fields, SingleSweep, SweepArray, NUM_MODEL_POINTS};
use super::{analysis_epoch, linspace};
use crate::analysis::binning::{log_bin_with_variance, Binnable};
use crate::analysis::despike::{deglitch_mask_mad, mask_glitches};
use crate::analysis::iqnoise::{pca_noise, PcaOptions};
use crate::analysis::resonator::Resonator;
use crate::analysis::spectral::{csd, default_nfft, psd, Detrend, SpectralOptions, Window};
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeglitchOptions {
    /// Robust standard deviations beyond which a sample is a glitch.
    pub threshold: f64,
    /// Window length, rounded up to a power of two samples.
    pub window_seconds: f64,
    pub mask_extend_samples: usize,
}

impl Default for DeglitchOptions {
    fn default() -> Self {
        Self {
            threshold: 8.0,
            window_seconds: 1.0,
            mask_extend_samples: 50,
        }
    }
}

/// Selects spectral points to keep, given the frequency, S_xx, S_qq and S_xq.
pub type SpectrumMask = fn(&[f64], &[f64], &[f64], &[Complex64]) -> Vec<bool>;

#[derive(Debug, Clone)]
pub struct NoiseSpectrumOptions {
    /// Segment length; about eight averaged segments when `None`.
    pub nfft: Option<usize>,
    pub window: Window,
    pub detrend: Detrend,
    /// Half a segment when `None`.
    pub noverlap: Option<usize>,
    pub binned: bool,
    pub bins_per_decade: usize,
    pub mask: Option<SpectrumMask>,
}

impl Default for NoiseSpectrumOptions {
    fn default() -> Self {
        Self {
            nfft: None,
            window: Window::None,
            detrend: Detrend::None,
            noverlap: None,
            binned: true,
            bins_per_decade: 30,
            mask: None,
        }
    }
}

/// Single-sided spectral densities of `x` and `q`, without the DC and Nyquist bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseSpectra {
    pub frequency: Vec<f64>,
    pub s_xx: Vec<f64>,
    pub s_qq: Vec<f64>,
    pub s_xq: Vec<Complex64>,
    pub s_xx_variance: Vec<f64>,
    pub s_qq_variance: Vec<f64>,
    pub s_xq_variance: Vec<Complex64>,
    /// Spectral points averaged into each value.
    pub counts: Vec<usize>,
    /// Bin edges; `None` when not binned.
    pub edges: Option<Vec<f64>>,
    /// Points kept by the mask function, before the DC and Nyquist bins were dropped.
    pub mask: Option<Vec<bool>>,
}

impl NoiseSpectra {
    pub fn s_yy(&self) -> Vec<f64> {
        self.s_qq.iter().map(|s| s / 4.0).collect()
    }

    pub fn s_xy(&self) -> Vec<Complex64> {
        self.s_xq.iter().map(|s| s / 2.0).collect()
    }

    pub fn s_yy_variance(&self) -> Vec<f64> {
        self.s_qq_variance.iter().map(|v| v / 16.0).collect()
    }
}

/// Noise along the quiet and loud axes of `x + i y`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaSpectra {
    pub frequency: Vec<f64>,
    /// The smaller eigenvalue at each frequency.
    pub s_00: Vec<f64>,
    pub s_11: Vec<f64>,
    pub angles: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Inversion {
    s21_normalized: Vec<Complex64>,
    x: Vec<f64>,
    q: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Deglitched {
    mask: Vec<bool>,
    masked: usize,
    x: Vec<f64>,
    q: Vec<f64>,
    s21_normalized: Vec<Complex64>,
}

impl Deglitched {
    fn unmasked(raw: &Inversion) -> Self {
        Self {
            mask: vec![false; raw.x.len()],
            masked: 0,
            x: raw.x.clone(),
            q: raw.q.clone(),
            s21_normalized: raw.s21_normalized.clone(),
        }
    }

    fn mask_and_replace(raw: &Inversion, window: usize, options: &DeglitchOptions) -> ReadoutResult<Self> {
        let mask = deglitch_mask_mad(&raw.x, options.threshold, window, options.mask_extend_samples)?;
        let mut real = mask_glitches(&[&raw.x[..], &raw.q[..]], &mask, window)?.into_iter();
        let mut complex = mask_glitches(&[&raw.s21_normalized[..]], &mask, window)?.into_iter();
        let missing = || ReadoutError::Processing("glitch replacement returned too few arrays".to_string());
        let x = real.next().ok_or_else(missing)?;
        let q = real.next().ok_or_else(missing)?;
        let s21_normalized = complex.next().ok_or_else(missing)?;
        Ok(Self {
            masked: mask.iter().filter(|m| **m).count(),
            mask,
            x,
            q,
            s21_normalized,
        })
    }
}

/// One resonator's sweep and the stream taken afterwards.
///
/// Derived quantities are computed on first use and cached, so most accessors take
/// `&mut self`.
#[derive(Debug, Clone)]
pub struct SingleSweepStream {
    pub sweep: SingleSweep,
    pub stream: SingleStream,
    pub number: Option<usize>,
    pub state: State,
    pub description: String,
    pub origin: Option<Origin>,
    raw: Option<Inversion>,
    deglitched: Option<Deglitched>,
    spectra: Option<NoiseSpectra>,
    pca: Option<PcaSpectra>,
}

impl SingleSweepStream {
    pub fn new(
        sweep: SingleSweep,
        stream: SingleStream,
        number: Option<usize>,
        state: State,
        description: impl Into<String>,
    ) -> Self {
        Self {
            sweep,
            stream,
            number,
            state,
            description: description.into(),
            origin: None,
            raw: None,
            deglitched: None,
            spectra: None,
            pca: None,
        }
    }

    pub fn resonator(&mut self) -> ReadoutResult<&Resonator> {
        self.sweep.resonator()
    }

    pub fn start_epoch(&self) -> f64 {
        self.sweep.start_epoch().min(self.stream.epoch)
    }

    fn inversion(&mut self) -> ReadoutResult<&Inversion> {
        let inversion = match self.raw.take() {
            Some(inversion) => inversion,
            None => {
                let frequency = self.stream.frequency();
                let resonator = self.sweep.resonator()?;
                let s21_normalized = resonator.remove_background(frequency, &self.stream.s21_raw)?;
                let (x, q) = resonator.invert(&s21_normalized)?;
                Inversion { s21_normalized, x, q }
            }
        };
        Ok(self.raw.insert(inversion))
    }

    /// Stream samples divided by the cable background at the stream frequency.
    pub fn stream_s21_normalized(&mut self) -> ReadoutResult<&[Complex64]> {
        Ok(&self.inversion()?.s21_normalized)
    }

    pub fn x_raw(&mut self) -> ReadoutResult<&[f64]> {
        Ok(&self.inversion()?.x)
    }

    pub fn q_raw(&mut self) -> ReadoutResult<&[f64]> {
        Ok(&self.inversion()?.q)
    }

    pub fn y_raw(&mut self) -> ReadoutResult<Vec<f64>> {
        Ok(self.q_raw()?.iter().map(|q| q / 2.0).collect())
    }

    /// Mask glitches found in `x_raw` and replace them in `x`, `q` and the normalized stream.
    ///
    /// If masking fails the raw values are used and nothing is masked.
    pub fn deglitch(&mut self, options: &DeglitchOptions) -> ReadoutResult<()> {
        let samples = options.window_seconds * self.stream.stream_sample_rate();
        let window = samples.max(1.0).log2().ceil().exp2() as usize;
        debug!(
            threshold = options.threshold,
            window_seconds = options.window_seconds,
            window,
            extend = options.mask_extend_samples,
            "deglitching"
        );
        let deglitched = {
            let raw = self.inversion()?;
            match Deglitched::mask_and_replace(raw, window, options) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "deglitching failed; using raw data");
                    Deglitched::unmasked(raw)
                }
            }
        };
        let total = deglitched.mask.len();
        debug!(
            masked = deglitched.masked,
            total,
            fraction = deglitched.masked as f64 / total.max(1) as f64,
            "masked samples"
        );
        self.deglitched = Some(deglitched);
        self.spectra = None;
        self.pca = None;
        Ok(())
    }

    fn deglitched(&mut self) -> ReadoutResult<&Deglitched> {
        if self.deglitched.is_none() {
            self.deglitch(&DeglitchOptions::default())?;
        }
        self.deglitched
            .as_ref()
            .ok_or_else(|| ReadoutError::Processing("deglitching produced no result".to_string()))
    }

    pub fn x(&mut self) -> ReadoutResult<&[f64]> {
        Ok(&self.deglitched()?.x)
    }

    pub fn q(&mut self) -> ReadoutResult<&[f64]> {
        Ok(&self.deglitched()?.q)
    }

    pub fn y(&mut self) -> ReadoutResult<Vec<f64>> {
        Ok(self.q()?.iter().map(|q| q / 2.0).collect())
    }

    pub fn glitch_mask(&mut self) -> ReadoutResult<&[bool]> {
        Ok(&self.deglitched()?.mask)
    }

    pub fn number_of_masked_samples(&mut self) -> ReadoutResult<usize> {
        Ok(self.deglitched()?.masked)
    }

    pub fn stream_s21_normalized_deglitched(&mut self) -> ReadoutResult<&[Complex64]> {
        Ok(&self.deglitched()?.s21_normalized)
    }

    /// Compute and cache the spectral densities of `x` and `q`.
    pub fn set_s(&mut self, options: &NoiseSpectrumOptions) -> ReadoutResult<&NoiseSpectra> {
        let nfft = options.nfft.unwrap_or_else(|| default_nfft(self.stream.s21_raw.len()));
        let spectral = SpectralOptions::new(nfft, self.stream.stream_sample_rate())
            .with_window(options.window)
            .with_detrend(options.detrend)
            .with_noverlap(options.noverlap.unwrap_or(nfft / 2));
        let spectra = {
            let d = self.deglitched()?;
            noise_spectra(&d.x, &d.q, &spectral, options)?
        };
        Ok(self.spectra.insert(spectra))
    }

    /// The cached spectra, computed with default options on first use.
    pub fn spectra(&mut self) -> ReadoutResult<&NoiseSpectra> {
        if self.spectra.is_none() {
            self.set_s(&NoiseSpectrumOptions::default())?;
        }
        self.spectra
            .as_ref()
            .ok_or_else(|| ReadoutError::Processing("spectra were not computed".to_string()))
    }

    /// Compute and cache the principal-component spectra of `x + i y`.
    ///
    /// Binning, when requested, happens before the decomposition.
    pub fn set_pca(
        &mut self,
        nfft: Option<usize>,
        window: Window,
        detrend: Detrend,
        binned: bool,
    ) -> ReadoutResult<&PcaSpectra> {
        let options = PcaOptions {
            nfft: Some(nfft.unwrap_or_else(|| default_nfft(self.stream.s21_raw.len()))),
            fs: self.stream.stream_sample_rate(),
            window,
            detrend,
            bins_per_decade: binned.then_some(30),
        };
        let pca = {
            let d = self.deglitched()?;
            let data: Vec<Complex64> = d
                .x
                .iter()
                .zip(&d.q)
                .map(|(&x, &q)| Complex64::new(x, q / 2.0))
                .collect();
            pca_noise(&data, &options)?
        };
        let [s_00, s_11] = pca.eigenvalues;
        Ok(self.pca.insert(PcaSpectra {
            frequency: pca.frequency,
            s_00,
            s_11,
            angles: pca.angles,
        }))
    }

    pub fn pca(&mut self) -> ReadoutResult<&PcaSpectra> {
        if self.pca.is_none() {
            self.set_pca(None, Window::None, Detrend::None, true)?;
        }
        self.pca
            .as_ref()
            .ok_or_else(|| ReadoutError::Processing("PCA spectra were not computed".to_string()))
    }

    pub fn fold<T: Binnable>(&self, array: &[T]) -> ReadoutResult<Vec<T>> {
        self.stream.fold(array)
    }

    /// The same sweep with only the stream samples in `start <= epoch < stop`.
    pub fn epochs(&self, start: f64, stop: f64) -> SingleSweepStream {
        let mut sliced = SingleSweepStream::new(
            self.sweep.clone(),
            self.stream.epochs(start, stop),
            self.number,
            self.state.clone(),
            self.description.clone(),
        );
        sliced.origin = self.origin.clone();
        sliced
    }

    pub fn to_record(&mut self) -> ReadoutResult<Record> {
        let mut record = Record::new();
        record.insert("number", self.number);
        record.insert("analysis_epoch", analysis_epoch());
        record.insert("start_epoch", self.start_epoch());
        record.extend(self.state.flatten(""));
        record.extend(self.stream.state.flatten("stream"));
        record.extend(self.sweep.state.flatten("sweep"));
        record.extend_prefixed("roach", self.stream.roach_state.items());
        record.insert("stream_frequency", self.stream.frequency());

        {
            let resonator = self.sweep.resonator()?;
            insert_resonator_fields(&mut record, resonator, NUM_MODEL_POINTS)?;
            insert_normalized_resonator_fields(&mut record, resonator, NUM_MODEL_POINTS)?;
        }

        let folded = {
            let raw = self.inversion()?.clone();
            match (
                self.stream.fold(&raw.x),
                self.stream.fold(&raw.q),
                self.stream.fold(&raw.s21_normalized),
            ) {
                (Ok(x), Ok(q), Ok(s21)) => Some((x, q, s21)),
                _ => None,
            }
        };
        if let Some((x, q, s21)) = folded {
            record.insert("folded_x", x);
            record.insert("folded_q", q);
            record.insert("folded_normalized_s21", s21);
        }

        let spectra = self.spectra()?;
        record.insert("S_xx", &spectra.s_xx);
        record.insert("S_yy", spectra.s_yy());
        record.insert("S_xy", spectra.s_xy());
        record.insert("S_xx_variance", &spectra.s_xx_variance);
        record.insert("S_yy_variance", spectra.s_yy_variance());
        record.insert("S_counts", &spectra.counts);
        record.insert("S_frequency", &spectra.frequency);
        record.add_origin(self.origin.as_ref());
        Ok(record)
    }
}

fn noise_spectra(
    x: &[f64],
    q: &[f64],
    spectral: &SpectralOptions,
    options: &NoiseSpectrumOptions,
) -> ReadoutResult<NoiseSpectra> {
    let s_qq = psd(q, spectral)?;
    let s_xx = psd(x, spectral)?;
    let s_xq = csd(x, q, spectral)?;
    let mut frequency = s_qq.frequency;
    let (mut s_xx, mut s_qq, mut s_xq) = (s_xx.density, s_qq.density, s_xq.density);

    let mut kept = None;
    if let Some(mask_fn) = options.mask {
        let mask = mask_fn(&frequency, &s_xx, &s_qq, &s_xq);
        if mask.len() != frequency.len() {
            return Err(ReadoutError::Shape(format!(
                "spectrum mask has {} values for {} frequencies",
                mask.len(),
                frequency.len()
            )));
        }
        let keep = |values: Vec<_>| -> Vec<_> {
            values.into_iter().zip(&mask).filter(|(_, m)| **m).map(|(v, _)| v).collect()
        };
        frequency = keep(frequency);
        s_xx = keep(s_xx);
        s_qq = keep(s_qq);
        s_xq = s_xq.into_iter().zip(&mask).filter(|(_, m)| **m).map(|(v, _)| v).collect();
        debug!(removed = mask.iter().filter(|m| !**m).count(), "masked raw spectral points");
        kept = Some(mask);
    }

    if frequency.len() < 3 {
        return Err(ReadoutError::Processing(format!(
            "only {} spectral points; nothing is left after dropping DC and Nyquist",
            frequency.len()
        )));
    }
    let interior = 1..frequency.len() - 1;
    let frequency = frequency[interior.clone()].to_vec();
    let s_xx = s_xx[interior.clone()].to_vec();
    let s_qq = s_qq[interior.clone()].to_vec();
    let s_xq = s_xq[interior].to_vec();

    // Each value is chi-squared with twice the number of averaged segments as degrees of freedom.
    let ndof = ((2 * x.len()) / spectral.nfft).max(1) as f64;
    let v_xx: Vec<f64> = s_xx.iter().map(|s| s * s / ndof).collect();
    let v_qq: Vec<f64> = s_qq.iter().map(|s| s * s / ndof).collect();
    let v_xq: Vec<Complex64> = s_xq.iter().map(|s| s * s / ndof).collect();

    if !options.binned {
        return Ok(NoiseSpectra {
            counts: vec![1; frequency.len()],
            frequency,
            s_xx,
            s_qq,
            s_xq,
            s_xx_variance: v_xx,
            s_qq_variance: v_qq,
            s_xq_variance: v_xq,
            edges: None,
            mask: kept,
        });
    }

    let (bins, real) = log_bin_with_variance(
        &frequency,
        options.bins_per_decade,
        &[(&s_xx[..], &v_xx[..]), (&s_qq[..], &v_qq[..])],
    )?;
    let (_, cross) = log_bin_with_variance(&frequency, options.bins_per_decade, &[(&s_xq[..], &v_xq[..])])?;
    let mut real = real.into_iter();
    let missing = || ReadoutError::Processing("log binning returned too few arrays".to_string());
    let (s_xx, s_xx_variance) = real.next().ok_or_else(missing)?;
    let (s_qq, s_qq_variance) = real.next().ok_or_else(missing)?;
    let (s_xq, s_xq_variance) = cross.into_iter().next().ok_or_else(missing)?;
    Ok(NoiseSpectra {
        frequency: bins.frequency,
        s_xx,
        s_qq,
        s_xq,
        s_xx_variance,
        s_qq_variance,
        s_xq_variance,
        counts: bins.counts,
        edges: Some(bins.edges),
        mask: kept,
    })
}

fn insert_normalized_resonator_fields(
    record: &mut Record,
    resonator: &Resonator,
    num_model_points: usize,
) -> ReadoutResult<()> {
    let (f_min, f_max) = resonator
        .frequency
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| (lo.min(f), hi.max(f)));
    let model_frequency = linspace(f_min, f_max, num_model_points);
    let model_s21 = resonator.model(&model_frequency)?;
    record.insert(
        "res_s21_data_normalized",
        resonator.normalize_points(&resonator.frequency, &resonator.data)?,
    );
    record.insert(
        "res_model_s21_normalized",
        resonator.normalize_points(&model_frequency, &model_s21)?,
    );
    let f_0 = resonator.f_0();
    let at_f_0 = resonator.model_at(f_0)?;
    record.insert("res_model_s21_at_f_0", at_f_0);
    record.insert("res_model_s21_normalized_at_f_0", at_f_0 / resonator.background(f_0)?);
    Ok(())
}

/// A sweep array and the stream array taken with the same channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStreamArray {
    pub sweep_array: SweepArray,
    pub stream_array: StreamArray,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl SweepStreamArray {
    pub fn new(
        sweep_array: SweepArray,
        stream_array: StreamArray,
        state: State,
        description: impl Into<String>,
    ) -> ReadoutResult<Self> {
        let array = Self {
            sweep_array,
            stream_array,
            state,
            description: description.into(),
            origin: None,
        };
        array.validate()?;
        Ok(array)
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        self.sweep_array.validate()?;
        self.stream_array.validate()?;
        let sweep_channels = self.sweep_array.num_channels()?;
        if sweep_channels != self.stream_array.num_channels() {
            return Err(ReadoutError::Shape(format!(
                "the sweep has {} channels but the stream has {}",
                sweep_channels,
                self.stream_array.num_channels()
            )));
        }
        Ok(())
    }

    pub fn num_channels(&self) -> ReadoutResult<usize> {
        self.sweep_array.num_channels()
    }

    pub fn start_epoch(&self) -> f64 {
        self.sweep_array.start_epoch().min(self.stream_array.epoch)
    }

    /// The same sweep with only the stream samples in `start <= epoch < stop`.
    pub fn epochs(&self, start: f64, stop: f64) -> SweepStreamArray {
        SweepStreamArray {
            stream_array: self.stream_array.epochs(start, stop),
            ..self.clone()
        }
    }

    pub fn sweep_stream(&self, number: usize) -> ReadoutResult<SingleSweepStream> {
        let mut single = SingleSweepStream::new(
            self.sweep_array.sweep(number)?,
            self.stream_array.stream(number)?,
            Some(number),
            self.state.clone(),
            self.description.clone(),
        );
        single.origin = self.origin.clone();
        Ok(single)
    }

    pub fn to_records(&self) -> ReadoutResult<RecordTable> {
        (0..self.num_channels()?)
            .map(|k| self.sweep_stream(k)?.to_record())
            .collect()
    }
}

/// One sweep array followed by several stream arrays, e.g. one per heater setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStreamList {
    pub sweep: SweepArray,
    pub stream_list: Vec<StreamArray>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl SweepStreamList {
    pub fn validate(&self) -> ReadoutResult<()> {
        self.sweep.validate()?;
        self.stream_list.iter().try_for_each(StreamArray::validate)
    }

    pub fn single_sweep_stream_list(&self, number: usize) -> ReadoutResult<SingleSweepStreamList> {
        Ok(SingleSweepStreamList {
            single_sweep: self.sweep.sweep(number)?,
            stream_list: self
                .stream_list
                .iter()
                .map(|sa| sa.stream(number))
                .collect::<ReadoutResult<_>>()?,
            number: Some(number),
            state: self.state.clone(),
            description: self.description.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SingleSweepStreamList {
    pub single_sweep: SingleSweep,
    pub stream_list: Vec<SingleStream>,
    pub number: Option<usize>,
    pub state: State,
    pub description: String,
}

impl SingleSweepStreamList {
    /// Invert stream `index` with the sweep's resonator.
    pub fn x_and_q(&mut self, index: usize) -> ReadoutResult<(Vec<f64>, Vec<f64>)> {
        let stream = self.stream_list.get(index).ok_or_else(|| {
            ReadoutError::InvalidArgument(format!(
                "stream {} does not exist in a list of {}",
                index,
                self.stream_list.len()
            ))
        })?;
        let resonator = self.single_sweep.resonator()?;
        resonator.invert_raw(stream.frequency(), &stream.s21_raw)
    }

    /// The numeric state value at `keys` for every stream; NaN where it is missing.
    pub fn state_vector(&self, keys: &[&str]) -> Vec<f64> {
        self.stream_list
            .iter()
            .map(|s| s.state.get_path(keys).and_then(Value::as_f64).unwrap_or(f64::NAN))
            .collect()
    }
}
