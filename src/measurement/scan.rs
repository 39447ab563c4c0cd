//! Several sweep arrays addressed as one scan across a wide band.

use super::record::Origin;
use super::state::State;
use super::sweep::SweepArray;
use super::linspace;
use crate::analysis::filters::fft_convolve_same_real;
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub sweep_arrays: Vec<SweepArray>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

/// The result of [`Scan::stitch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stitched {
    pub frequency: Vec<f64>,
    pub amplitude: Vec<f64>,
    pub smoothed: Vec<f64>,
}

impl Scan {
    pub fn new(sweep_arrays: Vec<SweepArray>, state: State, description: impl Into<String>) -> Self {
        Self {
            sweep_arrays,
            state,
            description: description.into(),
            origin: None,
        }
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        self.sweep_arrays.iter().try_for_each(SweepArray::validate)
    }

    pub fn frequency(&self) -> Vec<f64> {
        self.sweep_arrays.iter().flat_map(SweepArray::frequency).collect()
    }

    pub fn s21_point(&self) -> Vec<Complex64> {
        self.sweep_arrays.iter().flat_map(SweepArray::s21_point).collect()
    }

    pub fn s21_point_foreground(&self) -> ReadoutResult<Vec<Complex64>> {
        let mut out = Vec::new();
        for sweep_array in &self.sweep_arrays {
            out.extend(sweep_array.s21_point_foreground()?);
        }
        Ok(out)
    }

    /// Join the sweeps into one |S21| trace and smooth it.
    ///
    /// Where a sweep overlaps the next, the two amplitudes are cross-faded linearly.
    /// The default kernel is a Gaussian spanning a tenth of the first sweep.
    pub fn stitch(&self, kernel: Option<&[f64]>) -> ReadoutResult<Stitched> {
        if self.sweep_arrays.is_empty() {
            return Err(ReadoutError::InvalidArgument("cannot stitch an empty scan".to_string()));
        }
        let frequencies: Vec<Vec<f64>> = self.sweep_arrays.iter().map(SweepArray::frequency).collect();
        let amplitudes: Vec<Vec<f64>> = self
            .sweep_arrays
            .iter()
            .map(|sa| sa.s21_point().iter().map(|z| z.norm()).collect())
            .collect();

        // overlaps[k] is the number of points sweep k shares with sweep k + 1.
        let overlaps: Vec<usize> = frequencies
            .windows(2)
            .map(|pair| match pair[1].first() {
                Some(&start) => pair[0]
                    .iter()
                    .filter(|&&f| f >= start)
                    .count()
                    .min(pair[1].len()),
                None => 0,
            })
            .collect();

        let mut frequency = Vec::new();
        let mut amplitude = Vec::new();
        for k in 0..frequencies.len() {
            let head = if k == 0 { 0 } else { overlaps[k - 1] };
            let tail = overlaps.get(k).copied().unwrap_or(0);
            let len = frequencies[k].len();
            if head + tail > len {
                return Err(ReadoutError::Shape(format!(
                    "sweep {} has {} points but overlaps its neighbours by {}",
                    k,
                    len,
                    head + tail
                )));
            }
            frequency.extend_from_slice(&frequencies[k][head..len - tail]);
            amplitude.extend_from_slice(&amplitudes[k][head..len - tail]);
            if tail > 0 {
                let right = &amplitudes[k + 1];
                for i in 0..tail {
                    let w = if tail > 1 { i as f64 / (tail - 1) as f64 } else { 0.5 };
                    frequency.push(frequencies[k][len - tail + i]);
                    amplitude.push((1.0 - w) * amplitudes[k][len - tail + i] + w * right[i]);
                }
            }
        }

        let default_kernel;
        let kernel = match kernel {
            Some(k) => k,
            None => {
                let width = (frequencies[0].len() / 10).max(1);
                let mut gaussian: Vec<f64> = linspace(-4.0, 4.0, width).iter().map(|u| (-u * u).exp()).collect();
                let total: f64 = gaussian.iter().sum();
                gaussian.iter_mut().for_each(|g| *g /= total);
                default_kernel = gaussian;
                &default_kernel[..]
            }
        };
        let mut smoothed = fft_convolve_same_real(&amplitude, kernel);
        // The convolution is biased low where the kernel hangs off either end.
        let half = kernel.len() / 2;
        let n = smoothed.len();
        if n > 2 * half + 1 && half > 0 {
            let first = smoothed[half];
            let last = smoothed[n - 1 - half];
            smoothed[..half].iter_mut().for_each(|v| *v = first);
            smoothed[n - half..].iter_mut().for_each(|v| *v = last);
        }
        Ok(Stitched {
            frequency,
            amplitude,
            smoothed,
        })
    }
}
