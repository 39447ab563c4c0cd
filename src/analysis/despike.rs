//! Glitch detection and removal for time-ordered data.
//!
//! Cosmic rays and readout hiccups show up as short excursions far outside the
//! Gaussian noise. They are found per window using the median absolute deviation,
//! which the glitches themselves barely move.

use crate::analysis::binning::Binnable;
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use tracing::debug;

/// Scale factor from MAD to standard deviation for Gaussian data.
pub const MAD_TO_SIGMA: f64 = 1.4826;

pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

fn check_window(n: usize, window: usize) -> ReadoutResult<()> {
    if window == 0 {
        return Err(ReadoutError::InvalidArgument("deglitch window must be positive".to_string()));
    }
    if n == 0 {
        return Err(ReadoutError::InvalidArgument("cannot deglitch an empty series".to_string()));
    }
    Ok(())
}

/// Flag samples further than `threshold` robust standard deviations from their window
/// median, then widen each flagged region by `extend` samples on both sides.
pub fn deglitch_mask_mad(x: &[f64], threshold: f64, window: usize, extend: usize) -> ReadoutResult<Vec<bool>> {
    check_window(x.len(), window)?;
    let mut flagged = vec![false; x.len()];

    for (k, chunk) in x.chunks(window).enumerate() {
        let med = median(chunk);
        let deviations: Vec<f64> = chunk.iter().map(|v| (v - med).abs()).collect();
        let sigma = median(&deviations) * MAD_TO_SIGMA;
        for (i, d) in deviations.iter().enumerate() {
            if *d > threshold * sigma {
                flagged[k * window + i] = true;
            }
        }
    }

    if extend == 0 {
        return Ok(flagged);
    }
    let mut mask = flagged.clone();
    for (i, _) in flagged.iter().enumerate().filter(|(_, f)| **f) {
        let lo = i.saturating_sub(extend);
        let hi = (i + extend + 1).min(mask.len());
        mask[lo..hi].iter_mut().for_each(|m| *m = true);
    }
    Ok(mask)
}

/// Replace masked samples in every array.
///
/// Within each window the masked samples are filled by cycling through that window's
/// unmasked samples in order. A window with no unmasked samples is filled with the
/// mean of all unmasked samples.
pub fn mask_glitches<T: Binnable>(arrays: &[&[T]], mask: &[bool], window: usize) -> ReadoutResult<Vec<Vec<T>>> {
    check_window(mask.len(), window)?;
    for a in arrays {
        if a.len() != mask.len() {
            return Err(ReadoutError::Shape(format!(
                "array of length {} does not match mask of length {}",
                a.len(),
                mask.len()
            )));
        }
    }
    let good: Vec<usize> = (0..mask.len()).filter(|&i| !mask[i]).collect();
    if good.is_empty() {
        return Err(ReadoutError::Processing("every sample is masked".to_string()));
    }

    let mut out: Vec<Vec<T>> = arrays.iter().map(|a| a.to_vec()).collect();
    let global_means: Vec<T> = arrays
        .iter()
        .map(|a| good.iter().fold(T::zero(), |acc, &i| acc + a[i]) / good.len() as f64)
        .collect();

    let num_windows = mask.len().div_ceil(window);
    for k in 0..num_windows {
        let start = k * window;
        let stop = (start + window).min(mask.len());
        let unmasked: Vec<usize> = (start..stop).filter(|&i| !mask[i]).collect();
        let masked = (start..stop).filter(|&i| mask[i]);
        if unmasked.is_empty() {
            debug!(window = k, "no unmasked samples; using global mean");
            for i in masked {
                for (o, mean) in out.iter_mut().zip(&global_means) {
                    o[i] = *mean;
                }
            }
        } else {
            for (j, i) in masked.enumerate() {
                let source = unmasked[j % unmasked.len()];
                for (o, a) in out.iter_mut().zip(arrays) {
                    o[i] = a[source];
                }
            }
        }
    }
    Ok(out)
}

/// Replace outliers of a complex series with the median of their window.
///
/// The median is taken separately for the real and imaginary parts, and the
/// deviation is the complex distance from it.
pub fn deglitch_window(data: &[Complex64], window: usize, threshold: f64) -> ReadoutResult<Vec<Complex64>> {
    check_window(data.len(), window)?;
    let mut out = data.to_vec();
    let mut replaced = 0usize;
    for (k, chunk) in data.chunks(window).enumerate() {
        let re: Vec<f64> = chunk.iter().map(|c| c.re).collect();
        let im: Vec<f64> = chunk.iter().map(|c| c.im).collect();
        let med = Complex64::new(median(&re), median(&im));
        let deviations: Vec<f64> = chunk.iter().map(|c| (c - med).norm()).collect();
        let sigma = median(&deviations) * MAD_TO_SIGMA;
        for (i, d) in deviations.iter().enumerate() {
            if *d > threshold * sigma {
                out[k * window + i] = med;
                replaced += 1;
            }
        }
    }
    debug!(replaced, total = data.len(), "deglitch_window");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(n: usize) -> Vec<f64> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(11);
        (0..n).map(|_| rng.gen::<f64>() - 0.5).collect()
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_mask_finds_and_extends_glitch() {
        let mut x = noisy(1024);
        x[500] = 100.0;
        let mask = deglitch_mask_mad(&x, 8.0, 256, 5).unwrap();
        assert!(mask[500]);
        assert!(mask[495] && mask[505]);
        assert!(!mask[494] && !mask[506]);
        assert_eq!(mask.iter().filter(|m| **m).count(), 11);
    }

    #[test]
    fn test_mask_glitches_cycles_through_window() {
        let x = [1.0, 2.0, 9.0, 9.0, 9.0, 3.0];
        let mask = [false, false, true, true, true, false];
        let out = mask_glitches(&[&x[..]], &mask, 6).unwrap();
        assert_eq!(out[0], vec![1.0, 2.0, 1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_fully_masked_window_uses_global_mean() {
        let x = [1.0, 3.0, 9.0, 9.0];
        let mask = [false, false, true, true];
        let out = mask_glitches(&[&x[..]], &mask, 2).unwrap();
        assert_eq!(out[0], vec![1.0, 3.0, 2.0, 2.0]);
    }

    #[test]
    fn test_everything_masked_is_an_error() {
        let x = [1.0, 2.0];
        assert!(mask_glitches(&[&x[..]], &[true, true], 2).is_err());
    }

    #[test]
    fn test_deglitch_window_replaces_outlier() {
        let mut data: Vec<Complex64> = noisy(512)
            .into_iter()
            .zip(noisy(512).into_iter().rev())
            .map(|(a, b)| Complex64::new(a, b))
            .collect();
        data[100] = Complex64::new(50.0, -50.0);
        let out = deglitch_window(&data, 128, 5.0).unwrap();
        assert!(out[100].norm() < 1.0);
        assert_eq!(out[101], data[101]);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(deglitch_mask_mad(&[1.0], 8.0, 0, 0).is_err());
    }
}
