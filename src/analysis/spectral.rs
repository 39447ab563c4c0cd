//! Averaged-periodogram (Welch) spectral densities.
//!
//! The normalization matches `matplotlib.mlab.psd` and `mlab.csd` with
//! `scale_by_freq=True`:
//!
//! - the data is cut into `nfft`-sample segments overlapping by `noverlap`;
//! - each segment is detrended, windowed and transformed;
//! - `Pxy = conj(X) * Y` is averaged over segments and divided by `fs * sum(w^2)`;
//! - one-sided results double every bin except DC and, for even `nfft`, Nyquist.
//!
//! Real input defaults to one-sided output, complex input to two-sided output with
//! frequencies running from `-fs/2` upward.

use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    #[default]
    None,
    Hanning,
}

impl Window {
    pub fn values(&self, n: usize) -> Vec<f64> {
        match self {
            Window::None => vec![1.0; n],
            Window::Hanning => {
                if n <= 1 {
                    return vec![1.0; n];
                }
                (0..n)
                    .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detrend {
    #[default]
    None,
    Mean,
    Linear,
}

impl Detrend {
    pub fn apply(&self, segment: &mut [Complex64]) {
        let n = segment.len();
        if n == 0 {
            return;
        }
        match self {
            Detrend::None => {}
            Detrend::Mean => {
                let mean = segment.iter().sum::<Complex64>() / n as f64;
                segment.iter_mut().for_each(|v| *v -= mean);
            }
            Detrend::Linear => {
                if n < 2 {
                    segment.iter_mut().for_each(|v| *v = Complex64::new(0.0, 0.0));
                    return;
                }
                let t_mean = (n - 1) as f64 / 2.0;
                let y_mean = segment.iter().sum::<Complex64>() / n as f64;
                let mut stt = 0.0;
                let mut sty = Complex64::new(0.0, 0.0);
                for (i, v) in segment.iter().enumerate() {
                    let dt = i as f64 - t_mean;
                    stt += dt * dt;
                    sty += (*v - y_mean) * dt;
                }
                let slope = sty / stt;
                for (i, v) in segment.iter_mut().enumerate() {
                    *v -= y_mean + slope * (i as f64 - t_mean);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sides {
    /// One-sided for real input, two-sided for complex input.
    #[default]
    Default,
    OneSided,
    TwoSided,
}

/// Parameters shared by [`psd`], [`csd`] and their complex variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralOptions {
    pub nfft: usize,
    pub fs: f64,
    pub window: Window,
    pub detrend: Detrend,
    pub noverlap: usize,
    /// FFT length per segment; segments are zero padded up to this length.
    pub pad_to: Option<usize>,
    pub sides: Sides,
}

impl Default for SpectralOptions {
    fn default() -> Self {
        Self {
            nfft: 256,
            fs: 2.0,
            window: Window::None,
            detrend: Detrend::None,
            noverlap: 0,
            pad_to: None,
            sides: Sides::Default,
        }
    }
}

impl SpectralOptions {
    pub fn new(nfft: usize, fs: f64) -> Self {
        Self {
            nfft,
            fs,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_detrend(mut self, detrend: Detrend) -> Self {
        self.detrend = detrend;
        self
    }

    pub fn with_noverlap(mut self, noverlap: usize) -> Self {
        self.noverlap = noverlap;
        self
    }

    pub fn with_sides(mut self, sides: Sides) -> Self {
        self.sides = sides;
        self
    }

    pub fn with_pad_to(mut self, pad_to: usize) -> Self {
        self.pad_to = Some(pad_to);
        self
    }
}

/// A spectral density and the frequencies at which it is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum<T> {
    pub frequency: Vec<f64>,
    pub density: Vec<T>,
}

/// Averaged cross spectral density `conj(X) * Y` of two equally long series.
///
/// `real_input` selects the default sidedness; it does not change the arithmetic.
pub fn spectral_helper(
    x: &[Complex64],
    y: Option<&[Complex64]>,
    options: &SpectralOptions,
    real_input: bool,
) -> ReadoutResult<Spectrum<Complex64>> {
    let nfft = options.nfft;
    if nfft == 0 {
        return Err(ReadoutError::InvalidArgument("nfft must be positive".to_string()));
    }
    if options.noverlap >= nfft {
        return Err(ReadoutError::InvalidArgument(format!(
            "noverlap ({}) must be less than nfft ({})",
            options.noverlap, nfft
        )));
    }
    if options.fs <= 0.0 {
        return Err(ReadoutError::InvalidArgument("fs must be positive".to_string()));
    }
    if let Some(y) = y {
        if y.len() != x.len() {
            return Err(ReadoutError::Shape(format!(
                "cross spectrum inputs have lengths {} and {}",
                x.len(),
                y.len()
            )));
        }
    }
    let pad_to = options.pad_to.unwrap_or(nfft).max(nfft);

    let padded = |data: &[Complex64]| -> Vec<Complex64> {
        let mut v = data.to_vec();
        if v.len() < nfft {
            v.resize(nfft, Complex64::new(0.0, 0.0));
        }
        v
    };
    let x = padded(x);
    let y = y.map(padded);

    let one_sided = match options.sides {
        Sides::Default => real_input,
        Sides::OneSided => true,
        Sides::TwoSided => false,
    };
    let (num_freqs, scaling_factor) = if one_sided {
        (if pad_to % 2 == 1 { (pad_to + 1) / 2 } else { pad_to / 2 + 1 }, 2.0)
    } else {
        (pad_to, 1.0)
    };

    let window = options.window.values(nfft);
    let step = nfft - options.noverlap;
    let num_segments = 1 + (x.len() - nfft) / step;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(pad_to);

    let transform = |data: &[Complex64], start: usize| -> Vec<Complex64> {
        let mut segment: Vec<Complex64> = data[start..start + nfft].to_vec();
        options.detrend.apply(&mut segment);
        for (v, w) in segment.iter_mut().zip(&window) {
            *v *= *w;
        }
        segment.resize(pad_to, Complex64::new(0.0, 0.0));
        fft.process(&mut segment);
        segment.truncate(num_freqs);
        segment
    };

    let mut accumulated = vec![Complex64::new(0.0, 0.0); num_freqs];
    for k in 0..num_segments {
        let start = k * step;
        let fx = transform(&x, start);
        match &y {
            Some(y) => {
                let fy = transform(y, start);
                for ((acc, a), b) in accumulated.iter_mut().zip(&fx).zip(&fy) {
                    *acc += a.conj() * b;
                }
            }
            None => {
                for (acc, a) in accumulated.iter_mut().zip(&fx) {
                    *acc += a.conj() * a;
                }
            }
        }
    }

    let window_power: f64 = window.iter().map(|w| w * w).sum();
    let norm = 1.0 / (num_segments as f64 * options.fs * window_power);
    let mut density: Vec<Complex64> = accumulated.into_iter().map(|v| v * norm).collect();

    if one_sided {
        // DC is never doubled; neither is Nyquist when nfft is even.
        let end = if nfft % 2 == 0 { num_freqs.saturating_sub(1) } else { num_freqs };
        for v in density.iter_mut().take(end).skip(1) {
            *v *= scaling_factor;
        }
    }

    let df = options.fs / pad_to as f64;
    let mut frequency: Vec<f64> = (0..num_freqs)
        .map(|i| {
            if one_sided || i < (pad_to + 1) / 2 {
                i as f64 * df
            } else {
                (i as f64 - pad_to as f64) * df
            }
        })
        .collect();

    if !one_sided {
        let center = if pad_to % 2 == 1 { (pad_to - 1) / 2 + 1 } else { pad_to / 2 };
        frequency.rotate_left(center);
        density.rotate_left(center);
    }

    Ok(Spectrum { frequency, density })
}

fn as_complex(x: &[f64]) -> Vec<Complex64> {
    x.iter().map(|&v| Complex64::new(v, 0.0)).collect()
}

/// Power spectral density of a real series.
pub fn psd(x: &[f64], options: &SpectralOptions) -> ReadoutResult<Spectrum<f64>> {
    let s = spectral_helper(&as_complex(x), None, options, true)?;
    Ok(Spectrum {
        frequency: s.frequency,
        density: s.density.iter().map(|v| v.re).collect(),
    })
}

/// Power spectral density of a complex series.
pub fn psd_complex(x: &[Complex64], options: &SpectralOptions) -> ReadoutResult<Spectrum<f64>> {
    let s = spectral_helper(x, None, options, false)?;
    Ok(Spectrum {
        frequency: s.frequency,
        density: s.density.iter().map(|v| v.re).collect(),
    })
}

/// Cross spectral density of two real series.
pub fn csd(x: &[f64], y: &[f64], options: &SpectralOptions) -> ReadoutResult<Spectrum<Complex64>> {
    spectral_helper(&as_complex(x), Some(&as_complex(y)), options, true)
}

/// Cross spectral density of two complex series.
pub fn csd_complex(
    x: &[Complex64],
    y: &[Complex64],
    options: &SpectralOptions,
) -> ReadoutResult<Spectrum<Complex64>> {
    spectral_helper(x, Some(y), options, false)
}

/// The default segment length for `n` samples: about eight averaged spectra.
pub fn default_nfft(n: usize) -> usize {
    if n < 16 {
        return n.max(1);
    }
    let exponent = (n as f64).log2().floor() as i32 - 3;
    1usize << exponent.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_noise(n: usize, seed: u64) -> Vec<f64> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen::<f64>() - 0.5).collect()
    }

    #[test]
    fn test_parseval_one_sided() {
        let x = white_noise(4096, 1);
        let fs = 1000.0;
        let options = SpectralOptions::new(4096, fs);
        let s = psd(&x, &options).unwrap();
        assert_eq!(s.frequency.len(), 2049);
        let df = s.frequency[1] - s.frequency[0];
        let integral: f64 = s.density.iter().sum::<f64>() * df;
        let variance: f64 = x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64;
        assert!((integral - variance).abs() / variance < 1e-9);
        assert!((s.frequency[2048] - fs / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_sine_peak_location() {
        let fs = 256.0;
        let x: Vec<f64> = (0..1024)
            .map(|i| (2.0 * PI * 32.0 * i as f64 / fs).sin())
            .collect();
        let options = SpectralOptions::new(256, fs)
            .with_window(Window::Hanning)
            .with_noverlap(128);
        let s = psd(&x, &options).unwrap();
        let (peak, _) = s
            .density
            .iter()
            .enumerate()
            .fold((0, 0.0), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        assert!((s.frequency[peak] - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_sided_complex_frequencies_are_centered() {
        let x: Vec<Complex64> = (0..64)
            .map(|i| Complex64::from_polar(1.0, 2.0 * PI * 0.25 * i as f64))
            .collect();
        let s = psd_complex(&x, &SpectralOptions::new(16, 1.0)).unwrap();
        assert_eq!(s.frequency.len(), 16);
        assert!((s.frequency[0] + 0.5).abs() < 1e-12);
        assert!(s.frequency.windows(2).all(|w| w[1] > w[0]));
        let peak = s
            .density
            .iter()
            .enumerate()
            .fold((0, 0.0), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
            .0;
        assert!((s.frequency[peak] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_csd_of_series_with_itself_matches_psd() {
        let x = white_noise(2048, 7);
        let options = SpectralOptions::new(256, 10.0).with_noverlap(128);
        let p = psd(&x, &options).unwrap();
        let c = csd(&x, &x, &options).unwrap();
        for (a, b) in p.density.iter().zip(&c.density) {
            assert!((a - b.re).abs() < 1e-12);
            assert!(b.im.abs() < 1e-12);
        }
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let x = white_noise(100, 3);
        let s = psd(&x, &SpectralOptions::new(256, 1.0)).unwrap();
        assert_eq!(s.density.len(), 129);
    }

    #[test]
    fn test_rejects_large_overlap() {
        let x = white_noise(100, 3);
        assert!(psd(&x, &SpectralOptions::new(16, 1.0).with_noverlap(16)).is_err());
    }

    #[test]
    fn test_default_nfft() {
        assert_eq!(default_nfft(1 << 16), 1 << 13);
        assert_eq!(default_nfft(100_000), 1 << 13);
    }
}
