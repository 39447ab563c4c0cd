//! Bounded Levenberg–Marquardt least squares over named parameters.
//!
//! A model exposes its parameters as a [`Parameters`] set and a residual function
//! evaluated on that set. [`minimize`] adjusts the varying parameters, clamps them to
//! their bounds and reports standard errors scaled by the reduced chi-squared.

use crate::error::{ReadoutError, ReadoutResult};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
    pub vary: bool,
    pub min: f64,
    pub max: f64,
    /// Standard error after a fit; `None` for fixed parameters or a singular fit.
    pub stderr: Option<f64>,
}

impl Parameter {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            vary: true,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            stderr: None,
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.vary = false;
        self
    }

    fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// An ordered set of named parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    params: Vec<Parameter>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter.
    pub fn add(&mut self, parameter: Parameter) {
        match self.params.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) => *existing = parameter,
            None => self.params.push(parameter),
        }
    }

    pub fn with(mut self, parameter: Parameter) -> Self {
        self.add(parameter);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The value of a parameter that the model requires.
    pub fn value(&self, name: &str) -> ReadoutResult<f64> {
        self.get(name)
            .map(|p| p.value)
            .ok_or_else(|| ReadoutError::Fit(format!("missing parameter '{}'", name)))
    }

    pub fn value_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).map_or(default, |p| p.value)
    }

    pub fn set_value(&mut self, name: &str, value: f64) -> ReadoutResult<()> {
        let p = self
            .get_mut(name)
            .ok_or_else(|| ReadoutError::Fit(format!("missing parameter '{}'", name)))?;
        p.value = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn varying(&self) -> Vec<usize> {
        (0..self.params.len()).filter(|&i| self.params[i].vary).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Stop when the relative decrease of chi-squared falls below this.
    pub ftol: f64,
    /// Stop when every relative parameter step falls below this.
    pub xtol: f64,
    pub initial_lambda: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

/// Outcome of [`minimize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub params: Parameters,
    pub chisqr: f64,
    pub redchi: f64,
    pub ndata: usize,
    pub nvarys: usize,
    pub nfev: usize,
    pub success: bool,
    pub message: String,
}

const MAX_LAMBDA: f64 = 1e16;

struct Problem<'a, F> {
    residual: &'a F,
    template: Parameters,
    varying: Vec<usize>,
    nfev: usize,
}

impl<'a, F> Problem<'a, F>
where
    F: Fn(&Parameters) -> ReadoutResult<Vec<f64>>,
{
    fn params_at(&self, x: &[f64]) -> Parameters {
        let mut params = self.template.clone();
        for (&i, &v) in self.varying.iter().zip(x) {
            params.params[i].value = v;
        }
        params
    }

    fn evaluate(&mut self, x: &[f64]) -> ReadoutResult<DVector<f64>> {
        self.nfev += 1;
        let r = (self.residual)(&self.params_at(x))?;
        if r.iter().any(|v| !v.is_finite()) {
            return Err(ReadoutError::Fit("residual is not finite".to_string()));
        }
        Ok(DVector::from_vec(r))
    }

    fn jacobian(&mut self, x: &[f64], r0: &DVector<f64>) -> ReadoutResult<DMatrix<f64>> {
        let mut jac = DMatrix::<f64>::zeros(r0.len(), x.len());
        for j in 0..x.len() {
            let param = &self.template.params[self.varying[j]];
            let mut h = f64::EPSILON.sqrt() * x[j].abs();
            if h == 0.0 {
                h = f64::EPSILON.sqrt();
            }
            if x[j] + h > param.max {
                h = -h;
            }
            let mut shifted = x.to_vec();
            shifted[j] = param.clamp(x[j] + h);
            let step = shifted[j] - x[j];
            if step == 0.0 {
                continue;
            }
            let r = self.evaluate(&shifted)?;
            for i in 0..r0.len() {
                jac[(i, j)] = (r[i] - r0[i]) / step;
            }
        }
        Ok(jac)
    }
}

/// Minimize the sum of squared residuals over the varying parameters.
pub fn minimize<F>(residual: F, params: &Parameters, options: &FitOptions) -> ReadoutResult<FitResult>
where
    F: Fn(&Parameters) -> ReadoutResult<Vec<f64>>,
{
    let varying = params.varying();
    let mut problem = Problem {
        residual: &residual,
        template: params.clone(),
        varying,
        nfev: 0,
    };
    let mut x: Vec<f64> = problem
        .varying
        .iter()
        .map(|&i| {
            let p = &params.params[i];
            p.clamp(p.value)
        })
        .collect();

    let mut r = problem.evaluate(&x)?;
    let ndata = r.len();
    let nvarys = x.len();
    if ndata <= nvarys {
        return Err(ReadoutError::Fit(format!(
            "{} residuals cannot constrain {} varying parameters",
            ndata, nvarys
        )));
    }

    let mut cost = r.norm_squared();
    let mut lambda = options.initial_lambda;
    let mut success = false;
    let mut message = format!("reached {} iterations", options.max_iterations);

    if nvarys > 0 {
        'outer: for iteration in 0..options.max_iterations {
            let jac = problem.jacobian(&x, &r)?;
            let jtj = jac.transpose() * &jac;
            let descent = -(jac.transpose() * &r);

            loop {
                let mut damped = jtj.clone();
                for k in 0..nvarys {
                    damped[(k, k)] += lambda * jtj[(k, k)].max(1e-30);
                }
                let solved = match damped.clone().cholesky() {
                    Some(cholesky) => Some(cholesky.solve(&descent)),
                    None => damped.lu().solve(&descent),
                };
                let Some(delta) = solved else {
                    lambda *= 10.0;
                    if lambda > MAX_LAMBDA {
                        message = "damped normal equations are singular".to_string();
                        break 'outer;
                    }
                    continue;
                };

                let candidate: Vec<f64> = x
                    .iter()
                    .zip(delta.iter())
                    .zip(&problem.varying)
                    .map(|((xi, di), &pi)| problem.template.params[pi].clamp(xi + di))
                    .collect();
                let r_new = match problem.evaluate(&candidate) {
                    Ok(r_new) => r_new,
                    Err(_) => {
                        lambda *= 10.0;
                        if lambda > MAX_LAMBDA {
                            message = "could not find a finite step".to_string();
                            break 'outer;
                        }
                        continue;
                    }
                };
                let new_cost = r_new.norm_squared();
                if new_cost <= cost {
                    let relative_decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    let small_step = candidate
                        .iter()
                        .zip(&x)
                        .all(|(a, b)| (a - b).abs() <= options.xtol * (b.abs() + options.xtol));
                    x = candidate;
                    r = r_new;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-15);
                    trace!(iteration, cost, lambda, "accepted step");
                    if relative_decrease < options.ftol || small_step {
                        success = true;
                        message = format!("converged after {} iterations", iteration + 1);
                        break 'outer;
                    }
                    break;
                }
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    success = true;
                    message = "no further improvement possible".to_string();
                    break 'outer;
                }
            }
        }
    } else {
        success = true;
        message = "no varying parameters".to_string();
    }

    let dof = (ndata - nvarys) as f64;
    let redchi = cost / dof;
    let mut fitted = problem.params_at(&x);

    if nvarys > 0 {
        let jac = problem.jacobian(&x, &r)?;
        let jtj = jac.transpose() * &jac;
        match jtj.try_inverse() {
            Some(covariance) => {
                for (k, &pi) in problem.varying.iter().enumerate() {
                    let variance = covariance[(k, k)] * redchi;
                    fitted.params[pi].stderr = (variance >= 0.0).then(|| variance.sqrt());
                }
            }
            None => debug!("covariance matrix is singular; standard errors unavailable"),
        }
    }

    debug!(chisqr = cost, redchi, nfev = problem.nfev, %message, "fit finished");
    Ok(FitResult {
        params: fitted,
        chisqr: cost,
        redchi,
        ndata,
        nvarys,
        nfev: problem.nfev,
        success,
        message,
    })
}
