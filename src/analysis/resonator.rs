//! Resonator models with a cable background, fitting and inversion.
//!
//! Both models multiply a resonant foreground by the transmission of the readout
//! chain:
//!
//! ```text
//! background(f) = A_mag (1 + A_slope (f - f_phi)) exp(i (-2 pi (f - f_phi) delay + A_phase))
//! ```
//!
//! The linear foreground is `1 - (Q / Q_e) / (1 + 2 i Q x)` with `x = f / f_0 - 1` and a
//! complex coupling quality factor `Q_e`. The loss foreground writes the same shape as
//! `1 - (1 + i a) c / (i_loss + c + 2 i x)`, where `c` and `i_loss` are the coupling and
//! internal losses.
//!
//! Frequencies are in Hz and the delay is in seconds.

use crate::analysis::fitting::{minimize, FitOptions, FitResult, Parameter, Parameters};
use crate::analysis::polynomial::unwrap;
use crate::error::{ReadoutError, ReadoutResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_1_SQRT_2, PI};
use tracing::{debug, warn};

/// Step used for the numerical derivative of the normalized model, in Hz.
const GRADIENT_STEP_HZ: f64 = 1.0;

const I: Complex64 = Complex64 { re: 0.0, im: 1.0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResonatorModel {
    LinearResonatorWithCable,
    LinearLossResonatorWithCable,
}

impl ResonatorModel {
    pub fn name(&self) -> &'static str {
        match self {
            ResonatorModel::LinearResonatorWithCable => "LinearResonatorWithCable",
            ResonatorModel::LinearLossResonatorWithCable => "LinearLossResonatorWithCable",
        }
    }

    /// Resonant part of the transmission, without the cable background.
    pub fn foreground(&self, params: &Parameters, f: f64) -> ReadoutResult<Complex64> {
        let f_0 = params.value("f_0")?;
        let x = f / f_0 - 1.0;
        match self {
            ResonatorModel::LinearResonatorWithCable => {
                let q = params.value("Q")?;
                let q_e = Complex64::new(params.value("Q_e_real")?, params.value("Q_e_imag")?);
                Ok(Complex64::new(1.0, 0.0) - (q / q_e) / (Complex64::new(1.0, 0.0) + 2.0 * I * q * x))
            }
            ResonatorModel::LinearLossResonatorWithCable => {
                let c = params.value("c")?;
                let i_loss = params.value("i_loss")?;
                let a = params.value("a")?;
                Ok(Complex64::new(1.0, 0.0)
                    - (Complex64::new(1.0, a) * c) / Complex64::new(i_loss + c, 2.0 * x))
            }
        }
    }

    /// The complex inverse coupling quality factor `1 / Q_e`.
    pub fn inverse_q_e(&self, params: &Parameters) -> ReadoutResult<Complex64> {
        match self {
            ResonatorModel::LinearResonatorWithCable => {
                let q_e = Complex64::new(params.value("Q_e_real")?, params.value("Q_e_imag")?);
                Ok(q_e.inv())
            }
            ResonatorModel::LinearLossResonatorWithCable => {
                Ok(Complex64::new(1.0, params.value("a")?) * params.value("c")?)
            }
        }
    }

    /// The loaded quality factor `Q`.
    pub fn q(&self, params: &Parameters) -> ReadoutResult<f64> {
        match self {
            ResonatorModel::LinearResonatorWithCable => params.value("Q"),
            ResonatorModel::LinearLossResonatorWithCable => {
                Ok(1.0 / (params.value("i_loss")? + params.value("c")?))
            }
        }
    }

    fn foreground_parameters(&self, guess: &ForegroundGuess, f_min: f64, f_max: f64) -> Vec<Parameter> {
        let f_0 = Parameter::new("f_0", guess.f_0).with_bounds(f_min, f_max);
        match self {
            ResonatorModel::LinearResonatorWithCable => vec![
                f_0,
                Parameter::new("Q", guess.q).with_bounds(1.0, 1e9),
                Parameter::new("Q_e_real", guess.q_e).with_bounds(1.0, 1e10),
                Parameter::new("Q_e_imag", 0.0),
            ],
            ResonatorModel::LinearLossResonatorWithCable => {
                let c = 1.0 / guess.q_e;
                let i_loss = (1.0 / guess.q - c).max(1e-9);
                vec![
                    f_0,
                    Parameter::new("c", c).with_bounds(0.0, 1.0),
                    Parameter::new("i_loss", i_loss).with_bounds(0.0, 1.0),
                    Parameter::new("a", 0.0),
                ]
            }
        }
    }

    /// Initial parameters estimated from the data.
    pub fn guess(
        &self,
        frequency: &[f64],
        s21: &[Complex64],
        delay_estimate: Option<f64>,
    ) -> ReadoutResult<Parameters> {
        let (cable, guess) = estimate(frequency, s21, delay_estimate)?;
        let f_min = frequency.iter().cloned().fold(f64::INFINITY, f64::min);
        let f_max = frequency.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut params = Parameters::new();
        for p in self.foreground_parameters(&guess, f_min, f_max) {
            params.add(p);
        }
        params.add(Parameter::new("A_mag", cable.magnitude).with_bounds(0.0, f64::INFINITY));
        params.add(Parameter::new("A_slope", 0.0));
        params.add(Parameter::new("A_phase", cable.phase));
        params.add(Parameter::new("delay", cable.delay));
        params.add(Parameter::new("f_phi", cable.f_phi).fixed());
        Ok(params)
    }
}

/// Cable transmission at `f`.
pub fn background(params: &Parameters, f: f64) -> ReadoutResult<Complex64> {
    let a_mag = params.value("A_mag")?;
    let a_slope = params.value_or("A_slope", 0.0);
    let a_phase = params.value_or("A_phase", 0.0);
    let delay = params.value_or("delay", 0.0);
    let f_phi = params.value_or("f_phi", 0.0);
    let df = f - f_phi;
    Ok(Complex64::from_polar(
        a_mag * (1.0 + a_slope * df),
        -2.0 * PI * df * delay + a_phase,
    ))
}

struct BackgroundGuess {
    magnitude: f64,
    phase: f64,
    delay: f64,
    f_phi: f64,
}

struct ForegroundGuess {
    f_0: f64,
    q: f64,
    q_e: f64,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

fn estimate(
    frequency: &[f64],
    s21: &[Complex64],
    delay_estimate: Option<f64>,
) -> ReadoutResult<(BackgroundGuess, ForegroundGuess)> {
    let n = frequency.len();
    let edge = (n / 10).max(1);
    let edges: Vec<usize> = (0..edge).chain(n - edge..n).collect();
    let f_min = frequency[0];
    let f_max = frequency[n - 1];
    let f_phi = 0.5 * (f_min + f_max);

    let magnitude = mean(edges.iter().map(|&i| s21[i].norm()));
    let phase = unwrap(&s21.iter().map(|z| z.arg()).collect::<Vec<_>>());
    let delay = match delay_estimate {
        Some(d) => d,
        None => {
            let low_f = mean((0..edge).map(|i| frequency[i]));
            let high_f = mean((n - edge..n).map(|i| frequency[i]));
            let low_phase = mean((0..edge).map(|i| phase[i]));
            let high_phase = mean((n - edge..n).map(|i| phase[i]));
            if high_f > low_f {
                -(high_phase - low_phase) / (2.0 * PI * (high_f - low_f))
            } else {
                0.0
            }
        }
    };
    let phase_offset = mean(edges.iter().map(|&i| phase[i] + 2.0 * PI * (frequency[i] - f_phi) * delay));
    let phase_offset = (phase_offset + PI).rem_euclid(2.0 * PI) - PI;

    let background_guess = BackgroundGuess {
        magnitude,
        phase: phase_offset,
        delay,
        f_phi,
    };
    let background_params = Parameters::new()
        .with(Parameter::new("A_mag", magnitude))
        .with(Parameter::new("A_phase", phase_offset))
        .with(Parameter::new("delay", delay))
        .with(Parameter::new("f_phi", f_phi));
    let normalized: Vec<Complex64> = frequency
        .iter()
        .zip(s21)
        .map(|(&f, &z)| background(&background_params, f).map(|b| z / b))
        .collect::<ReadoutResult<_>>()?;

    let i_min = (0..n)
        .min_by(|&a, &b| normalized[a].norm().total_cmp(&normalized[b].norm()))
        .unwrap_or(n / 2);
    let f_0 = frequency[i_min];
    let depth = normalized[i_min].norm().clamp(0.01, 0.99);
    let coupling = 1.0 - depth;
    let half_power = coupling * FRAC_1_SQRT_2;
    let dip = |i: usize| (Complex64::new(1.0, 0.0) - normalized[i]).norm() >= half_power;
    let mut lo = i_min;
    while lo > 0 && dip(lo - 1) {
        lo -= 1;
    }
    let mut hi = i_min;
    while hi + 1 < n && dip(hi + 1) {
        hi += 1;
    }
    let spacing = (f_max - f_min) / (n - 1) as f64;
    let bandwidth = frequency[hi] - frequency[lo] + spacing;
    let q = (f_0 / bandwidth).clamp(10.0, 1e8);

    Ok((
        background_guess,
        ForegroundGuess {
            f_0,
            q,
            q_e: q / coupling,
        },
    ))
}

/// A resonator model attached to sweep data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resonator {
    pub model: ResonatorModel,
    pub frequency: Vec<f64>,
    pub data: Vec<Complex64>,
    pub errors: Option<Vec<Complex64>>,
    params: Parameters,
    result: Option<FitResult>,
}

impl Resonator {
    /// Attach `model` to the data and estimate initial parameters. `frequency` must be ascending.
    pub fn new(
        model: ResonatorModel,
        frequency: Vec<f64>,
        data: Vec<Complex64>,
        errors: Option<Vec<Complex64>>,
    ) -> ReadoutResult<Self> {
        Self::with_delay_estimate(model, frequency, data, errors, None)
    }

    pub fn with_delay_estimate(
        model: ResonatorModel,
        frequency: Vec<f64>,
        data: Vec<Complex64>,
        errors: Option<Vec<Complex64>>,
        delay_estimate: Option<f64>,
    ) -> ReadoutResult<Self> {
        if frequency.len() != data.len() {
            return Err(ReadoutError::Shape(format!(
                "{} frequencies for {} s21 points",
                frequency.len(),
                data.len()
            )));
        }
        if let Some(e) = &errors {
            if e.len() != data.len() {
                return Err(ReadoutError::Shape(format!(
                    "{} errors for {} s21 points",
                    e.len(),
                    data.len()
                )));
            }
        }
        if frequency.len() < 5 {
            return Err(ReadoutError::Fit(format!(
                "a resonator fit needs at least 5 points, got {}",
                frequency.len()
            )));
        }
        if frequency.windows(2).any(|w| w[1] < w[0]) {
            return Err(ReadoutError::InvalidArgument(
                "resonator frequencies must be ascending".to_string(),
            ));
        }
        let params = model.guess(&frequency, &data, delay_estimate)?;
        Ok(Self {
            model,
            frequency,
            data,
            errors,
            params,
            result: None,
        })
    }

    fn weights(&self) -> Vec<(f64, f64)> {
        let Some(errors) = &self.errors else {
            return vec![(1.0, 1.0); self.data.len()];
        };
        let valid = |v: f64| v.is_finite() && v > 0.0;
        let mut components: Vec<f64> = errors
            .iter()
            .flat_map(|e| [e.re, e.im])
            .filter(|v| valid(*v))
            .collect();
        if components.is_empty() {
            return vec![(1.0, 1.0); self.data.len()];
        }
        components.sort_by(|a, b| a.total_cmp(b));
        let fallback = components[components.len() / 2];
        errors
            .iter()
            .map(|e| {
                let re = if valid(e.re) { e.re } else { fallback };
                let im = if valid(e.im) { e.im } else { fallback };
                (1.0 / re, 1.0 / im)
            })
            .collect()
    }

    /// Fit the data, starting from `initial` if given and from the current parameters otherwise.
    pub fn fit(&mut self, initial: Option<Parameters>) -> ReadoutResult<&FitResult> {
        let start = initial.unwrap_or_else(|| self.params.clone());
        let weights = self.weights();
        let model = self.model;
        let frequency = &self.frequency;
        let data = &self.data;
        let residual = |p: &Parameters| -> ReadoutResult<Vec<f64>> {
            let mut r = Vec::with_capacity(2 * data.len());
            for ((&f, &d), &(wr, wi)) in frequency.iter().zip(data).zip(&weights) {
                let diff = background(p, f)? * model.foreground(p, f)? - d;
                r.push(diff.re * wr);
                r.push(diff.im * wi);
            }
            Ok(r)
        };
        let result = minimize(residual, &start, &FitOptions::default())?;
        if !result.success {
            warn!(model = model.name(), message = %result.message, "resonator fit did not converge");
        }
        debug!(
            model = model.name(),
            f_0 = result.params.value_or("f_0", f64::NAN),
            redchi = result.redchi,
            "resonator fit"
        );
        self.params = result.params.clone();
        Ok(self.result.insert(result))
    }

    pub fn current_params(&self) -> &Parameters {
        &self.params
    }

    pub fn current_result(&self) -> Option<&FitResult> {
        self.result.as_ref()
    }

    pub fn redchi(&self) -> f64 {
        self.result.as_ref().map_or(f64::NAN, |r| r.redchi)
    }

    /// Full model, background included, at one frequency.
    pub fn model_at(&self, f: f64) -> ReadoutResult<Complex64> {
        Ok(background(&self.params, f)? * self.model.foreground(&self.params, f)?)
    }

    pub fn model(&self, frequency: &[f64]) -> ReadoutResult<Vec<Complex64>> {
        frequency.iter().map(|&f| self.model_at(f)).collect()
    }

    pub fn background(&self, f: f64) -> ReadoutResult<Complex64> {
        background(&self.params, f)
    }

    /// Divide out the cable background evaluated at the single frequency `f`.
    pub fn remove_background(&self, f: f64, s21: &[Complex64]) -> ReadoutResult<Vec<Complex64>> {
        let b = self.background(f)?;
        Ok(s21.iter().map(|z| z / b).collect())
    }

    /// Divide out the background point by point.
    pub fn normalize_points(&self, frequency: &[f64], s21: &[Complex64]) -> ReadoutResult<Vec<Complex64>> {
        frequency
            .iter()
            .zip(s21)
            .map(|(&f, &z)| Ok(z / self.background(f)?))
            .collect()
    }

    pub fn normalized_model(&self, f: f64) -> ReadoutResult<Complex64> {
        self.model.foreground(&self.params, f)
    }

    /// Forward-difference derivative of the normalized model with respect to frequency.
    pub fn approx_normalized_gradient(&self, f: f64) -> ReadoutResult<Complex64> {
        Ok((self.normalized_model(f + GRADIENT_STEP_HZ)? - self.normalized_model(f)?) / GRADIENT_STEP_HZ)
    }

    /// Express S21 fluctuations at `f` as a complex frequency shift in Hz.
    pub fn project_s21_to_delta_freq(
        &self,
        f: f64,
        s21: &[Complex64],
        already_normalized: bool,
    ) -> ReadoutResult<Vec<Complex64>> {
        let normalized = if already_normalized {
            s21.to_vec()
        } else {
            self.remove_background(f, s21)?
        };
        let center = self.normalized_model(f)?;
        let gradient = self.approx_normalized_gradient(f)?;
        Ok(normalized.iter().map(|z| (z - center) / gradient).collect())
    }

    /// Invert normalized S21 into the fractional frequency shift `x` and the inverse
    /// internal quality factor `q`.
    pub fn invert(&self, s21_normalized: &[Complex64]) -> ReadoutResult<(Vec<f64>, Vec<f64>)> {
        let inverse_q_e = self.model.inverse_q_e(&self.params)?;
        let mut x = Vec::with_capacity(s21_normalized.len());
        let mut q = Vec::with_capacity(s21_normalized.len());
        for z in s21_normalized {
            let w = inverse_q_e / (Complex64::new(1.0, 0.0) - z);
            x.push(w.im / 2.0);
            q.push(w.re - inverse_q_e.re);
        }
        Ok((x, q))
    }

    pub fn invert_raw(&self, frequency: f64, s21_raw: &[Complex64]) -> ReadoutResult<(Vec<f64>, Vec<f64>)> {
        self.invert(&self.remove_background(frequency, s21_raw)?)
    }

    pub fn f_0(&self) -> f64 {
        self.params.value_or("f_0", f64::NAN)
    }

    pub fn q(&self) -> f64 {
        self.model.q(&self.params).unwrap_or(f64::NAN)
    }

    pub fn q_e(&self) -> Complex64 {
        self.model
            .inverse_q_e(&self.params)
            .map(|v| v.inv())
            .unwrap_or(Complex64::new(f64::NAN, f64::NAN))
    }

    /// Internal quality factor `1 / (1 / Q - Re(1 / Q_e))`.
    pub fn q_i(&self) -> f64 {
        match self.model.inverse_q_e(&self.params) {
            Ok(inv) => 1.0 / (1.0 / self.q() - inv.re),
            Err(_) => f64::NAN,
        }
    }
}

/// Fit both models and keep the one with the lower reduced chi-squared.
pub fn fit_best_resonator(
    frequency: &[f64],
    s21: &[Complex64],
    errors: Option<&[Complex64]>,
    delay_estimate: Option<f64>,
) -> ReadoutResult<Resonator> {
    let mut best: Option<Resonator> = None;
    let mut last_error = None;
    for model in [
        ResonatorModel::LinearResonatorWithCable,
        ResonatorModel::LinearLossResonatorWithCable,
    ] {
        let attempt = Resonator::with_delay_estimate(
            model,
            frequency.to_vec(),
            s21.to_vec(),
            errors.map(|e| e.to_vec()),
            delay_estimate,
        )
        .and_then(|mut r| {
            r.fit(None)?;
            Ok(r)
        });
        match attempt {
            Ok(r) => {
                if best.as_ref().map_or(true, |b| r.redchi() < b.redchi()) {
                    best = Some(r);
                }
            }
            Err(e) => {
                debug!(model = model.name(), error = %e, "model fit failed");
                last_error = Some(e);
            }
        }
    }
    best.ok_or_else(|| last_error.unwrap_or_else(|| ReadoutError::Fit("no model could be fit".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth() -> Parameters {
        Parameters::new()
            .with(Parameter::new("f_0", 100e6))
            .with(Parameter::new("Q", 2e4))
            .with(Parameter::new("Q_e_real", 4e4))
            .with(Parameter::new("Q_e_imag", 2e3))
            .with(Parameter::new("A_mag", 0.8))
            .with(Parameter::new("A_slope", 0.0))
            .with(Parameter::new("A_phase", 0.5))
            .with(Parameter::new("delay", 30e-9))
            .with(Parameter::new("f_phi", 100e6))
    }

    fn synthetic(params: &Parameters, n: usize) -> (Vec<f64>, Vec<Complex64>) {
        let model = ResonatorModel::LinearResonatorWithCable;
        let f: Vec<f64> = (0..n).map(|i| 100e6 - 25e3 + 50e3 * i as f64 / (n - 1) as f64).collect();
        let s21 = f
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let wiggle = 1e-4 * Complex64::new((i as f64 * 1.3).sin(), (i as f64 * 0.7).cos());
                background(params, f).unwrap() * model.foreground(params, f).unwrap() + wiggle
            })
            .collect();
        (f, s21)
    }

    #[test]
    fn test_linear_fit_recovers_parameters() {
        let params = truth();
        let (f, s21) = synthetic(&params, 201);
        let mut r = Resonator::new(ResonatorModel::LinearResonatorWithCable, f, s21, None).unwrap();
        let result = r.fit(None).unwrap().clone();
        assert!(result.redchi < 1e-6);
        assert!((r.f_0() - 100e6).abs() < 5.0);
        assert!((r.q() - 2e4).abs() / 2e4 < 1e-2);
        let expected_q_i = 1.0 / (1.0 / 2e4 - Complex64::new(4e4, 2e3).inv().re);
        assert!((r.q_i() - expected_q_i).abs() / expected_q_i < 2e-2);
        assert!(result.params.get("f_0").unwrap().stderr.is_some());
    }

    #[test]
    fn test_guess_normalizes_by_estimated_cable() {
        let (f, s21) = synthetic(&truth(), 201);
        let guess = ResonatorModel::LinearResonatorWithCable
            .guess(&f, &s21, None)
            .unwrap();
        let step = f[1] - f[0];
        assert!((guess.value("f_0").unwrap() - 100e6).abs() <= 2.0 * step);
        assert!(guess.value("A_mag").unwrap() > 0.0);
        assert!(guess.value("Q").unwrap() >= 10.0);
    }

    #[test]
    fn test_best_resonator_picks_a_good_fit() {
        let (f, s21) = synthetic(&truth(), 151);
        let r = fit_best_resonator(&f, &s21, None, Some(30e-9)).unwrap();
        assert!(r.redchi() < 1e-6);
        assert!((r.f_0() - 100e6).abs() < 10.0);
    }

    #[test]
    fn test_loss_model_matches_linear_model() {
        let model = ResonatorModel::LinearLossResonatorWithCable;
        let linear = truth();
        let inv = Complex64::new(4e4, 2e3).inv();
        let loss = Parameters::new()
            .with(Parameter::new("f_0", 100e6))
            .with(Parameter::new("c", inv.re))
            .with(Parameter::new("a", inv.im / inv.re))
            .with(Parameter::new("i_loss", 1.0 / 2e4 - inv.re));
        for f in [99.99e6, 100e6, 100.004e6] {
            let a = ResonatorModel::LinearResonatorWithCable.foreground(&linear, f).unwrap();
            let b = model.foreground(&loss, f).unwrap();
            assert!((a - b).norm() < 1e-12);
        }
        assert!((model.q(&loss).unwrap() - 2e4).abs() < 1e-6);
    }

    #[test]
    fn test_invert_round_trip() {
        let (f, s21) = synthetic(&truth(), 101);
        let mut r = Resonator::new(ResonatorModel::LinearResonatorWithCable, f, s21, None).unwrap();
        r.fit(None).unwrap();
        let points: Vec<f64> = [-2e3, 0.0, 1.5e3].iter().map(|d| r.f_0() + d).collect();
        let normalized: Vec<Complex64> = points.iter().map(|&f| r.normalized_model(f).unwrap()).collect();
        let (x, q) = r.invert(&normalized).unwrap();
        for ((xi, qi), fi) in x.iter().zip(&q).zip(&points) {
            assert!((xi - (fi / r.f_0() - 1.0)).abs() < 1e-12);
            assert!((qi - 1.0 / r.q_i()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_projection_of_model_point_is_zero() {
        let (f, s21) = synthetic(&truth(), 101);
        let r = Resonator::new(ResonatorModel::LinearResonatorWithCable, f, s21, None).unwrap();
        let f0 = r.f_0();
        let center = r.normalized_model(f0).unwrap();
        let shifted = r.normalized_model(f0 + 10.0).unwrap();
        let d = r.project_s21_to_delta_freq(f0, &[center, shifted], true).unwrap();
        assert!(d[0].norm() < 1e-9);
        assert!((d[1].re - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let err = Resonator::new(
            ResonatorModel::LinearResonatorWithCable,
            vec![1.0, 2.0],
            vec![Complex64::new(1.0, 0.0)],
            None,
        );
        assert!(err.is_err());
    }
}
