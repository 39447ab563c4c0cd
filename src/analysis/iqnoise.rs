//! Principal component decomposition of I/Q noise spectra.
//!
//! At each frequency the 2x2 cross spectral matrix of the real and imaginary parts is
//! diagonalized. The smaller eigenvalue is the noise along the quiet axis, usually
//! amplifier noise. The larger one is the noise along the loud axis, usually
//! frequency noise.

use crate::analysis::binning::log_bin;
use crate::analysis::spectral::{csd, default_nfft, psd, Detrend, SpectralOptions, Window};
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Largest segment length chosen when none is given.
pub const MAX_DEFAULT_NFFT: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaNoise {
    pub frequency: Vec<f64>,
    pub s_ii: Vec<f64>,
    pub s_qq: Vec<f64>,
    pub s_iq: Vec<Complex64>,
    /// `eigenvalues[0] <= eigenvalues[1]` at every frequency.
    pub eigenvalues: [Vec<f64>; 2],
    /// Unit eigenvectors as columns, in the same order as the eigenvalues.
    pub eigenvectors: Vec<[[Complex64; 2]; 2]>,
    /// Angle of the major axis of the real part of the spectral matrix, in radians.
    pub angles: Vec<f64>,
    /// `S_iq / sqrt(S_ii S_qq)`.
    pub correlation: Vec<Complex64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaOptions {
    pub nfft: Option<usize>,
    pub fs: f64,
    pub window: Window,
    pub detrend: Detrend,
    /// Log-bin the spectra before diagonalizing.
    pub bins_per_decade: Option<usize>,
}

impl PcaOptions {
    pub fn new(fs: f64) -> Self {
        Self {
            nfft: None,
            fs,
            window: Window::Hanning,
            detrend: Detrend::Mean,
            bins_per_decade: Some(30),
        }
    }
}

/// Eigen-decomposition of the Hermitian matrix `[[a, b], [conj(b), c]]`, ascending.
fn hermitian_eigen(a: f64, b: Complex64, c: f64) -> ([f64; 2], [[Complex64; 2]; 2]) {
    let mean = 0.5 * (a + c);
    let radius = (0.25 * (a - c) * (a - c) + b.norm_sqr()).sqrt();
    let values = [mean - radius, mean + radius];
    let zero = Complex64::new(0.0, 0.0);
    let one = Complex64::new(1.0, 0.0);

    if b.norm() <= f64::EPSILON * (a.abs() + c.abs()).max(f64::MIN_POSITIVE) {
        let vectors = if a <= c {
            [[one, zero], [zero, one]]
        } else {
            [[zero, one], [one, zero]]
        };
        return (values, vectors);
    }

    let column = |lambda: f64| {
        let v = [b, Complex64::new(lambda - a, 0.0)];
        let norm = (v[0].norm_sqr() + v[1].norm_sqr()).sqrt();
        [v[0] / norm, v[1] / norm]
    };
    let v0 = column(values[0]);
    let v1 = column(values[1]);
    (values, [[v0[0], v1[0]], [v0[1], v1[1]]])
}

pub fn pca_noise(d: &[Complex64], options: &PcaOptions) -> ReadoutResult<PcaNoise> {
    if d.is_empty() {
        return Err(ReadoutError::InvalidArgument("pca_noise needs data".to_string()));
    }
    let nfft = options
        .nfft
        .unwrap_or_else(|| default_nfft(d.len()).min(MAX_DEFAULT_NFFT));
    let spectral = SpectralOptions::new(nfft, options.fs)
        .with_window(options.window)
        .with_detrend(options.detrend);

    let re: Vec<f64> = d.iter().map(|z| z.re).collect();
    let im: Vec<f64> = d.iter().map(|z| z.im).collect();
    let pii = psd(&re, &spectral)?;
    let pqq = psd(&im, &spectral)?;
    let piq = csd(&re, &im, &spectral)?;

    let (frequency, s_ii, s_qq, s_iq) = match options.bins_per_decade {
        Some(bins_per_decade) => {
            // Log binning needs strictly positive spacing; DC stays in the first bin.
            let (bins, real) = log_bin(&pii.frequency, bins_per_decade, &[&pii.density[..], &pqq.density[..]])?;
            let (_, cross) = log_bin(&piq.frequency, bins_per_decade, &[&piq.density[..]])?;
            let mut real = real.into_iter();
            let s_ii = real.next().unwrap_or_default();
            let s_qq = real.next().unwrap_or_default();
            let s_iq = cross.into_iter().next().unwrap_or_default();
            (bins.frequency, s_ii, s_qq, s_iq)
        }
        None => (pii.frequency, pii.density, pqq.density, piq.density),
    };

    let n = frequency.len();
    let mut eigenvalues = [Vec::with_capacity(n), Vec::with_capacity(n)];
    let mut eigenvectors = Vec::with_capacity(n);
    let mut angles = Vec::with_capacity(n);
    let mut correlation = Vec::with_capacity(n);
    for k in 0..n {
        let (values, vectors) = hermitian_eigen(s_ii[k], s_iq[k], s_qq[k]);
        eigenvalues[0].push(values[0]);
        eigenvalues[1].push(values[1]);
        eigenvectors.push(vectors);
        angles.push(0.5 * (2.0 * s_iq[k].re).atan2(s_ii[k] - s_qq[k]));
        correlation.push(s_iq[k] / (s_ii[k] * s_qq[k]).sqrt());
    }

    Ok(PcaNoise {
        frequency,
        s_ii,
        s_qq,
        s_iq,
        eigenvalues,
        eigenvectors,
        angles,
        correlation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_hermitian_eigen() {
        let (values, vectors) = hermitian_eigen(2.0, Complex64::new(1.0, 0.0), 2.0);
        assert!((values[0] - 1.0).abs() < 1e-12);
        assert!((values[1] - 3.0).abs() < 1e-12);
        // A v = lambda v for the larger eigenvalue
        let v = [vectors[0][1], vectors[1][1]];
        let av0 = 2.0 * v[0] + v[1];
        assert!((av0 - 3.0 * v[0]).norm() < 1e-12);
    }

    #[test]
    fn test_diagonal_matrix() {
        let (values, vectors) = hermitian_eigen(5.0, Complex64::new(0.0, 0.0), 1.0);
        assert_eq!(values, [1.0, 5.0]);
        assert_eq!(vectors[1][0], Complex64::new(1.0, 0.0));
    }

    #[test]
    fn test_elongated_noise_has_expected_angle() {
        let mut rng = StdRng::seed_from_u64(5);
        let angle: f64 = 0.3;
        let data: Vec<Complex64> = (0..1 << 14)
            .map(|_| {
                let major = 10.0 * (rng.gen::<f64>() - 0.5);
                let minor = 0.1 * (rng.gen::<f64>() - 0.5);
                Complex64::new(major, minor) * Complex64::from_polar(1.0, angle)
            })
            .collect();
        let pca = pca_noise(&data, &PcaOptions::new(1000.0)).unwrap();
        let n = pca.frequency.len();
        assert!(n > 10);
        let mid = n / 2;
        assert!(pca.eigenvalues[1][mid] > 100.0 * pca.eigenvalues[0][mid]);
        assert!((pca.angles[mid] - angle).abs() < 0.05);
        assert!(pca.eigenvalues[0].iter().zip(&pca.eigenvalues[1]).all(|(a, b)| a <= b));
    }
}
