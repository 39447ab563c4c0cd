//! Weighted least-squares polynomials and phase unwrapping.
//!
//! Polynomials are fit in a scaled abscissa `u = (x - offset) / scale` with `u` in
//! `[-1, 1]` over the data. Sweep frequencies sit near 1e8 Hz with spans of a few kHz,
//! so an unscaled Vandermonde matrix would be hopelessly ill-conditioned.

use crate::error::{ReadoutError, ReadoutResult};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A polynomial in the scaled abscissa, coefficients in ascending order of power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub coefficients: Vec<f64>,
    pub offset: f64,
    pub scale: f64,
}

impl Polynomial {
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Evaluate with Horner's rule.
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.offset) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * u + c)
    }

    pub fn eval_many(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&v| self.eval(v)).collect()
    }
}

/// Fit a polynomial of the given degree.
///
/// Like `numpy.polyfit`, each weight multiplies the unsquared residual, so `1/sigma`
/// weights give a chi-squared fit. Points with zero weight are ignored.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize, weights: Option<&[f64]>) -> ReadoutResult<Polynomial> {
    if x.len() != y.len() {
        return Err(ReadoutError::Shape(format!(
            "polyfit: x has {} points but y has {}",
            x.len(),
            y.len()
        )));
    }
    if let Some(w) = weights {
        if w.len() != x.len() {
            return Err(ReadoutError::Shape(format!(
                "polyfit: {} weights for {} points",
                w.len(),
                x.len()
            )));
        }
    }

    let used: Vec<usize> = (0..x.len())
        .filter(|&i| weights.map_or(true, |w| w[i] != 0.0) && x[i].is_finite() && y[i].is_finite())
        .collect();
    if used.len() < degree + 1 {
        return Err(ReadoutError::Fit(format!(
            "polyfit: degree {} needs at least {} weighted points, got {}",
            degree,
            degree + 1,
            used.len()
        )));
    }

    let (min, max) = used
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| (lo.min(x[i]), hi.max(x[i])));
    let offset = 0.5 * (max + min);
    let scale = if max > min { 0.5 * (max - min) } else { 1.0 };

    let rows = used.len();
    let cols = degree + 1;
    let mut a = DMatrix::<f64>::zeros(rows, cols);
    let mut b = DVector::<f64>::zeros(rows);
    for (row, &i) in used.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        let u = (x[i] - offset) / scale;
        let mut power = 1.0;
        for col in 0..cols {
            a[(row, col)] = w * power;
            power *= u;
        }
        b[row] = w * y[i];
    }

    let solution = a
        .svd(true, true)
        .solve(&b, 1e-14)
        .map_err(|e| ReadoutError::Fit(format!("polyfit: {}", e)))?;

    Ok(Polynomial {
        coefficients: solution.iter().copied().collect(),
        offset,
        scale,
    })
}

pub fn polyval(polynomial: &Polynomial, x: &[f64]) -> Vec<f64> {
    polynomial.eval_many(x)
}

/// Remove 2π jumps between consecutive phase samples.
pub fn unwrap(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut correction = 0.0;
    for (i, &p) in phase.iter().enumerate() {
        if i > 0 {
            let dd = p - phase[i - 1];
            let mut ddmod = (dd + PI).rem_euclid(2.0 * PI) - PI;
            if ddmod == -PI && dd > 0.0 {
                ddmod = PI;
            }
            if dd.abs() >= PI {
                correction += ddmod - dd;
            }
        }
        out.push(p + correction);
    }
    out
}
