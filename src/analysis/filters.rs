//! FIR low-pass filtering and FFT convolution.

use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Hamming-windowed sinc low-pass taps with unit gain at DC.
///
/// `cutoff` is relative to the Nyquist frequency, so it must lie in `(0, 1)`.
pub fn firwin(num_taps: usize, cutoff: f64) -> ReadoutResult<Vec<f64>> {
    if num_taps == 0 {
        return Err(ReadoutError::InvalidArgument("num_taps must be positive".to_string()));
    }
    if !(cutoff > 0.0 && cutoff < 1.0) {
        return Err(ReadoutError::InvalidArgument(format!(
            "normalized cutoff {} must be between 0 and 1",
            cutoff
        )));
    }
    let alpha = 0.5 * (num_taps as f64 - 1.0);
    let mut taps: Vec<f64> = (0..num_taps)
        .map(|n| {
            let m = n as f64 - alpha;
            let window = if num_taps > 1 {
                0.54 - 0.46 * (2.0 * PI * n as f64 / (num_taps as f64 - 1.0)).cos()
            } else {
                1.0
            };
            cutoff * sinc(cutoff * m) * window
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter_mut().for_each(|t| *t /= sum);
    Ok(taps)
}

/// Linear convolution via FFT, cropped to the central `data.len()` samples.
pub fn fft_convolve_same(data: &[Complex64], kernel: &[Complex64]) -> Vec<Complex64> {
    if data.is_empty() || kernel.is_empty() {
        return data.to_vec();
    }
    let full_len = data.len() + kernel.len() - 1;
    let n = full_len.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut a: Vec<Complex64> = data.to_vec();
    a.resize(n, Complex64::new(0.0, 0.0));
    let mut b: Vec<Complex64> = kernel.to_vec();
    b.resize(n, Complex64::new(0.0, 0.0));
    forward.process(&mut a);
    forward.process(&mut b);
    for (x, y) in a.iter_mut().zip(&b) {
        *x *= y;
    }
    inverse.process(&mut a);

    let scale = 1.0 / n as f64;
    let start = (kernel.len() - 1) / 2;
    a[start..start + data.len()].iter().map(|v| v * scale).collect()
}

/// Real-valued variant of [`fft_convolve_same`].
pub fn fft_convolve_same_real(data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let d: Vec<Complex64> = data.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    let k: Vec<Complex64> = kernel.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    fft_convolve_same(&d, &k).into_iter().map(|v| v.re).collect()
}

/// Low-pass filter `data` and keep every `decimate_by`-th sample.
///
/// `cutoff` and `nyquist` share units; a `decimate_by` below 2 disables decimation.
pub fn low_pass_fir(
    data: &[Complex64],
    num_taps: usize,
    cutoff: f64,
    nyquist: f64,
    decimate_by: f64,
) -> ReadoutResult<Vec<Complex64>> {
    let taps = firwin(num_taps, cutoff / nyquist)?;
    let kernel: Vec<Complex64> = taps.iter().map(|&t| Complex64::new(t, 0.0)).collect();
    let filtered = fft_convolve_same(data, &kernel);
    let step = decimate_by.floor() as usize;
    if step > 1 {
        Ok(filtered.into_iter().step_by(step).collect())
    } else {
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firwin_unit_dc_gain_and_symmetry() {
        let taps = firwin(101, 0.1).unwrap();
        assert!((taps.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for i in 0..50 {
            assert!((taps[i] - taps[100 - i]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_firwin_rejects_bad_cutoff() {
        assert!(firwin(11, 1.5).is_err());
        assert!(firwin(0, 0.5).is_err());
    }

    #[test]
    fn test_convolve_same_matches_direct() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        let kernel = [1.0, 0.0, -1.0];
        let out = fft_convolve_same_real(&data, &kernel);
        // full: [1, 2, 2, 2, 2, -4, -5]; centered slice starts at 1
        let expected = [2.0, 2.0, 2.0, 2.0, -4.0];
        for (o, e) in out.iter().zip(&expected) {
            assert!((o - e).abs() < 1e-9);
        }
    }

    #[test]
    fn test_low_pass_keeps_dc_and_decimates() {
        let data = vec![Complex64::new(2.0, -1.0); 4096];
        let out = low_pass_fir(&data, 255, 4.0, 1000.0, 10.0).unwrap();
        assert_eq!(out.len(), 410);
        let middle = out[205];
        assert!((middle.re - 2.0).abs() < 1e-9);
        assert!((middle.im + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_low_pass_suppresses_high_frequency() {
        let n = 4096;
        let data: Vec<Complex64> = (0..n)
            .map(|i| Complex64::new((2.0 * PI * 0.25 * i as f64).cos(), 0.0))
            .collect();
        let out = low_pass_fir(&data, 255, 0.05, 1.0, 1.0).unwrap();
        assert!(out[n / 2].norm() < 1e-2);
    }
}
