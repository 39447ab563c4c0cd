//! Logarithmic frequency binning of spectra.
//!
//! Bins grow by a factor of `10^(1/bins_per_decade)` but are never narrower than the
//! native frequency spacing, so every bin contains at least one sample.

use crate::error::{ReadoutError, ReadoutResult};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Div};

/// Values that can be averaged within a bin.
pub trait Binnable: Copy + Zero + Add<Output = Self> + Div<f64, Output = Self> {}

impl<T> Binnable for T where T: Copy + Zero + Add<Output = T> + Div<f64, Output = T> {}

/// Bin layout shared by every binned quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBins {
    /// `counts.len() + 1` edges; bin `i` holds `edges[i] <= f < edges[i + 1]`.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    /// Mean frequency of the samples in each bin.
    pub frequency: Vec<f64>,
    ranges: Vec<(usize, usize)>,
}

impl LogBins {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Mean of `data` in each bin.
    pub fn mean<T: Binnable>(&self, data: &[T]) -> Vec<T> {
        self.ranges
            .iter()
            .map(|&(start, stop)| {
                let sum = data[start..stop].iter().fold(T::zero(), |acc, &v| acc + v);
                sum / (stop - start) as f64
            })
            .collect()
    }

    /// Variance of the bin mean given per-sample variances: `sum(var) / count^2`.
    pub fn mean_variance<T: Binnable>(&self, variance: &[T]) -> Vec<T> {
        self.ranges
            .iter()
            .map(|&(start, stop)| {
                let n = (stop - start) as f64;
                let sum = variance[start..stop].iter().fold(T::zero(), |acc, &v| acc + v);
                sum / (n * n)
            })
            .collect()
    }
}

/// Bin edges for the ascending, evenly spaced frequencies `frequency`.
pub fn log_bin_edges(frequency: &[f64], bins_per_decade: usize) -> ReadoutResult<Vec<f64>> {
    if bins_per_decade == 0 {
        return Err(ReadoutError::InvalidArgument(
            "bins_per_decade must be positive".to_string(),
        ));
    }
    if frequency.len() < 2 {
        return Err(ReadoutError::InvalidArgument(format!(
            "log binning needs at least two frequencies, got {}",
            frequency.len()
        )));
    }
    let df = frequency[1] - frequency[0];
    if !(df > 0.0) {
        return Err(ReadoutError::InvalidArgument(
            "frequencies must be ascending".to_string(),
        ));
    }
    let ratio = 10f64.powf(1.0 / bins_per_decade as f64);
    let last = frequency[frequency.len() - 1];

    let mut edges = vec![frequency[0]];
    let mut edge = frequency[0];
    while edge <= last {
        edge = (edge * ratio).max(edge + df);
        edges.push(edge);
    }
    Ok(edges)
}

/// Compute the bin layout, dropping any bin that happens to be empty.
pub fn log_bins(frequency: &[f64], bins_per_decade: usize) -> ReadoutResult<LogBins> {
    let raw_edges = log_bin_edges(frequency, bins_per_decade)?;
    let mut edges = vec![raw_edges[0]];
    let mut counts = Vec::new();
    let mut means = Vec::new();
    let mut ranges = Vec::new();

    let mut start = 0;
    for upper in raw_edges.iter().skip(1) {
        let mut stop = start;
        while stop < frequency.len() && frequency[stop] < *upper {
            stop += 1;
        }
        if stop > start {
            let n = stop - start;
            counts.push(n);
            means.push(frequency[start..stop].iter().sum::<f64>() / n as f64);
            ranges.push((start, stop));
            edges.push(*upper);
        }
        start = stop;
    }

    Ok(LogBins {
        edges,
        counts,
        frequency: means,
        ranges,
    })
}

/// Bin each array in `data`, returning the layout and the bin means.
pub fn log_bin<T: Binnable>(
    frequency: &[f64],
    bins_per_decade: usize,
    data: &[&[T]],
) -> ReadoutResult<(LogBins, Vec<Vec<T>>)> {
    check_lengths(frequency, data.iter().map(|d| d.len()))?;
    let bins = log_bins(frequency, bins_per_decade)?;
    let binned = data.iter().map(|d| bins.mean(d)).collect();
    Ok((bins, binned))
}

/// Bin `(data, variance)` pairs, propagating the per-sample variance to the bin mean.
#[allow(clippy::type_complexity)]
pub fn log_bin_with_variance<T: Binnable>(
    frequency: &[f64],
    bins_per_decade: usize,
    data_and_variance: &[(&[T], &[T])],
) -> ReadoutResult<(LogBins, Vec<(Vec<T>, Vec<T>)>)> {
    check_lengths(
        frequency,
        data_and_variance
            .iter()
            .flat_map(|(d, v)| [d.len(), v.len()]),
    )?;
    let bins = log_bins(frequency, bins_per_decade)?;
    let binned = data_and_variance
        .iter()
        .map(|(d, v)| (bins.mean(d), bins.mean_variance(v)))
        .collect();
    Ok((bins, binned))
}

fn check_lengths(frequency: &[f64], lengths: impl Iterator<Item = usize>) -> ReadoutResult<()> {
    for len in lengths {
        if len != frequency.len() {
            return Err(ReadoutError::Shape(format!(
                "binned array has {} values for {} frequencies",
                len,
                frequency.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    fn frequencies(n: usize, df: f64) -> Vec<f64> {
        (1..=n).map(|i| i as f64 * df).collect()
    }

    #[test]
    fn test_every_sample_lands_in_exactly_one_bin() {
        let f = frequencies(5000, 0.5);
        let bins = log_bins(&f, 30).unwrap();
        assert_eq!(bins.counts.iter().sum::<usize>(), f.len());
        assert_eq!(bins.edges.len(), bins.counts.len() + 1);
        assert!(bins.counts.iter().all(|&c| c > 0));
    }

    #[test]
    fn test_low_bins_are_native_width_and_high_bins_grow() {
        let f = frequencies(10000, 1.0);
        let bins = log_bins(&f, 10).unwrap();
        assert_eq!(bins.counts[0], 1);
        assert_eq!(bins.counts[1], 1);
        let n = bins.len();
        assert!(bins.counts[n - 2] > 100);
        assert!(bins.frequency.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_variance_of_mean() {
        let f = frequencies(1000, 1.0);
        let data = vec![2.0; 1000];
        let variance = vec![4.0; 1000];
        let (bins, binned) =
            log_bin_with_variance(&f, 5, &[(&data[..], &variance[..])]).unwrap();
        let (mean, var) = &binned[0];
        for ((m, v), &c) in mean.iter().zip(var).zip(&bins.counts) {
            assert!((m - 2.0).abs() < 1e-12);
            assert!((v - 4.0 / c as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_complex_values() {
        let f = frequencies(100, 1.0);
        let data: Vec<Complex64> = (0..100).map(|i| Complex64::new(1.0, i as f64)).collect();
        let (bins, binned) = log_bin(&f, 3, &[&data[..]]).unwrap();
        let last = bins.len() - 1;
        let (start, stop) = bins.ranges[last];
        let expected_im = (start..stop).map(|i| i as f64).sum::<f64>() / (stop - start) as f64;
        assert!((binned[0][last].im - expected_im).abs() < 1e-12);
        assert!((binned[0][last].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let f = frequencies(10, 1.0);
        let data = vec![0.0; 9];
        assert!(log_bin(&f, 3, &[&data[..]]).is_err());
    }
}
