//! Peak finding with a continuous wavelet transform.
//!
//! The data is convolved with Ricker wavelets of increasing width. Local maxima are
//! chained across scales into ridge lines, and a ridge that is long enough and stands
//! out of the local noise at the finest scale marks a peak.

use crate::analysis::filters::fft_convolve_same_real;
use crate::error::{ReadoutError, ReadoutResult};
use std::f64::consts::PI;

/// Ricker ("Mexican hat") wavelet with `points` samples and width `a`.
pub fn ricker(points: usize, a: f64) -> Vec<f64> {
    let amplitude = 2.0 / ((3.0 * a).sqrt() * PI.powf(0.25));
    let wsq = a * a;
    let center = (points as f64 - 1.0) / 2.0;
    (0..points)
        .map(|i| {
            let x = i as f64 - center;
            let xsq = x * x;
            amplitude * (1.0 - xsq / wsq) * (-xsq / (2.0 * wsq)).exp()
        })
        .collect()
}

/// Wavelet transform, one row per width.
pub fn cwt(data: &[f64], widths: &[f64]) -> Vec<Vec<f64>> {
    widths
        .iter()
        .map(|&width| {
            // An odd length keeps the wavelet centred on a sample.
            let mut n = ((10.0 * width) as usize | 1).min(data.len().max(1));
            if n % 2 == 0 {
                n -= 1;
            }
            let mut wavelet = ricker(n, width);
            wavelet.reverse();
            fft_convolve_same_real(data, &wavelet)
        })
        .collect()
}

/// Options for [`find_peaks_cwt_with`]; `None` fields use values derived from the data.
#[derive(Debug, Clone, Default)]
pub struct PeakOptions {
    pub max_distances: Option<Vec<f64>>,
    pub gap_threshold: Option<f64>,
    pub min_length: Option<usize>,
    pub min_snr: Option<f64>,
    pub noise_percentile: Option<f64>,
    pub window_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct RidgeLine {
    rows: Vec<usize>,
    cols: Vec<usize>,
    gap: usize,
}

/// Interior local maxima. A flat top of equal values counts once, at its centre.
fn relative_maxima(row: &[f64]) -> Vec<usize> {
    let mut maxima = Vec::new();
    let mut i = 1;
    while i + 1 < row.len() {
        if row[i] > row[i - 1] {
            let mut end = i;
            while end + 1 < row.len() && row[end + 1] == row[i] {
                end += 1;
            }
            if end + 1 < row.len() && row[end + 1] < row[i] {
                maxima.push(i + (end - i) / 2);
            }
            i = end + 1;
        } else {
            i += 1;
        }
    }
    maxima
}

fn identify_ridge_lines(matrix: &[Vec<f64>], max_distances: &[f64], gap_threshold: f64) -> Vec<RidgeLine> {
    let maxima: Vec<Vec<usize>> = matrix.iter().map(|row| relative_maxima(row)).collect();
    let Some(start_row) = maxima.iter().rposition(|m| !m.is_empty()) else {
        return Vec::new();
    };

    let mut ridge_lines: Vec<RidgeLine> = maxima[start_row]
        .iter()
        .map(|&col| RidgeLine {
            rows: vec![start_row],
            cols: vec![col],
            gap: 0,
        })
        .collect();
    let mut final_lines = Vec::new();

    for row in (0..start_row).rev() {
        for line in ridge_lines.iter_mut() {
            line.gap += 1;
        }
        let previous_cols: Vec<usize> = ridge_lines
            .iter()
            .map(|line| line.cols.last().copied().unwrap_or(0))
            .collect();
        for &col in &maxima[row] {
            let closest = previous_cols
                .iter()
                .enumerate()
                .map(|(i, &c)| (i, (col as f64 - c as f64).abs()))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            match closest {
                Some((i, distance)) if distance <= max_distances[row] => {
                    let line = &mut ridge_lines[i];
                    line.rows.push(row);
                    line.cols.push(col);
                    line.gap = 0;
                }
                _ => ridge_lines.push(RidgeLine {
                    rows: vec![row],
                    cols: vec![col],
                    gap: 0,
                }),
            }
        }
        let mut i = ridge_lines.len();
        while i > 0 {
            i -= 1;
            if ridge_lines[i].gap as f64 > gap_threshold {
                final_lines.push(ridge_lines.remove(i));
            }
        }
    }

    final_lines.extend(ridge_lines);
    for line in final_lines.iter_mut() {
        // Rows were appended from coarse to fine scale.
        line.rows.reverse();
        line.cols.reverse();
    }
    final_lines
}

/// Linear-interpolation percentile of `values`.
fn percentile(values: &[f64], per: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = per / 100.0 * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

/// Indices of peaks in `data` for the given wavelet widths, in ascending order.
pub fn find_peaks_cwt(data: &[f64], widths: &[f64]) -> ReadoutResult<Vec<usize>> {
    find_peaks_cwt_with(data, widths, &PeakOptions::default())
}

pub fn find_peaks_cwt_with(data: &[f64], widths: &[f64], options: &PeakOptions) -> ReadoutResult<Vec<usize>> {
    if widths.is_empty() || widths.iter().any(|w| !(*w > 0.0)) {
        return Err(ReadoutError::InvalidArgument(
            "wavelet widths must be positive and non-empty".to_string(),
        ));
    }
    if data.len() < 3 {
        return Ok(Vec::new());
    }

    let max_distances = match &options.max_distances {
        Some(d) if d.len() == widths.len() => d.clone(),
        Some(d) => {
            return Err(ReadoutError::Shape(format!(
                "{} max distances for {} widths",
                d.len(),
                widths.len()
            )))
        }
        None => widths.iter().map(|w| w / 4.0).collect(),
    };
    let gap_threshold = options.gap_threshold.unwrap_or_else(|| widths[0].ceil());
    let min_length = options
        .min_length
        .unwrap_or_else(|| (widths.len() as f64 / 4.0).ceil() as usize);
    let min_snr = options.min_snr.unwrap_or(1.0);
    let noise_percentile = options.noise_percentile.unwrap_or(10.0);
    let window_size = options
        .window_size
        .unwrap_or_else(|| (data.len() as f64 / 20.0).ceil() as usize);

    let matrix = cwt(data, widths);
    let lines = identify_ridge_lines(&matrix, &max_distances, gap_threshold);

    let row_one = &matrix[0];
    let half_window = window_size / 2;
    let odd = window_size % 2;
    let noises: Vec<f64> = (0..row_one.len())
        .map(|i| {
            let start = i.saturating_sub(half_window);
            let stop = (i + half_window + odd).min(row_one.len());
            let window: Vec<f64> = row_one[start..stop.max(start + 1).min(row_one.len())]
                .iter()
                .map(|v| v.abs())
                .collect();
            percentile(&window, noise_percentile)
        })
        .collect();

    let mut peaks: Vec<usize> = lines
        .iter()
        .filter(|line| line.rows.len() >= min_length)
        .filter(|line| {
            let (row, col) = (line.rows[0], line.cols[0]);
            (matrix[row][col] / noises[col]).abs() >= min_snr
        })
        .map(|line| line.cols[0])
        .collect();
    peaks.sort_unstable();
    peaks.dedup();
    Ok(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ricker_is_symmetric_with_central_max() {
        let w = ricker(41, 4.0);
        assert_eq!(w.len(), 41);
        for i in 0..20 {
            assert!((w[i] - w[40 - i]).abs() < 1e-15);
        }
        assert!(w.iter().all(|&v| v <= w[20]));
    }

    #[test]
    fn test_percentile() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), 3.0);
        assert!((percentile(&v, 10.0) - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_finds_gaussian_peaks() {
        let n = 1000;
        let centers = [200.0, 500.0, 800.0];
        let data: Vec<f64> = (0..n)
            .map(|i| {
                centers
                    .iter()
                    .map(|c| (-((i as f64 - c) / 10.0).powi(2)).exp())
                    .sum()
            })
            .collect();
        let widths: Vec<f64> = (1..=30).map(|w| w as f64).collect();
        let peaks: Vec<usize> = find_peaks_cwt(&data, &widths)
            .unwrap()
            .into_iter()
            .filter(|&p| data[p] > 0.5)
            .collect();
        assert_eq!(peaks.len(), 3);
        for (p, c) in peaks.iter().zip(&centers) {
            assert!((*p as f64 - c).abs() <= 2.0);
        }
    }

    #[test]
    fn test_flat_tops_count_once() {
        assert_eq!(relative_maxima(&[0.0, 1.0, 1.0, 0.0, 2.0, 2.0, 2.0, 1.0]), vec![1, 5]);
        assert_eq!(relative_maxima(&[0.0, 1.0, 1.0]), Vec::<usize>::new());
        assert_eq!(relative_maxima(&[3.0, 1.0, 2.0, 0.5]), vec![2]);
    }

    #[test]
    fn test_finds_peaks_centred_between_samples() {
        let n = 1000;
        let centers = [200.5, 500.5, 800.5];
        let data: Vec<f64> = (0..n)
            .map(|i| {
                centers
                    .iter()
                    .map(|c| (-((i as f64 - c) / 10.0).powi(2)).exp())
                    .sum()
            })
            .collect();
        let widths: Vec<f64> = (1..=30).map(|w| w as f64).collect();
        let peaks: Vec<usize> = find_peaks_cwt(&data, &widths)
            .unwrap()
            .into_iter()
            .filter(|&p| data[p] > 0.5)
            .collect();
        assert_eq!(peaks.len(), 3, "peaks {:?}", peaks);
        for (p, c) in peaks.iter().zip(&centers) {
            assert!((*p as f64 - c).abs() <= 2.0);
        }
    }

    #[test]
    fn test_cwt_row_peaks_at_the_data_peak() {
        let data: Vec<f64> = (0..301).map(|i| (-((i as f64 - 150.0) / 8.0).powi(2)).exp()).collect();
        for row in cwt(&data, &[2.0, 5.0, 10.0]) {
            let top = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            // The flat tails carry only convolution rounding noise.
            let maxima: Vec<usize> = relative_maxima(&row)
                .into_iter()
                .filter(|&i| row[i] > 1e-6 * top)
                .collect();
            assert_eq!(maxima, vec![150]);
        }
    }

    #[test]
    fn test_rejects_empty_widths() {
        assert!(find_peaks_cwt(&[0.0; 10], &[]).is_err());
    }
}
