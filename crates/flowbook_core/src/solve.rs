//! Problem assembly and integration.
//!
//! [`solve`] is the single entry point used by the rest of the crate: it
//! validates an [`OdeProblem`] against its vector field, picks a stepper from
//! [`SolverSettings`], and records a [`Trajectory`].

use crate::dataset::Trajectory;
use crate::solvers::{DiscreteMap, RungeKutta, Stepper};
use crate::traits::{DynamicalSystem, Parameterized, Scalar, Steppable, SystemKind, VectorField};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
/// Upper bound on samples reserved up front; longer runs grow the buffer.
const MAX_RESERVED_SAMPLES: usize = 1 << 16;

/// Integration failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("initial state has {got} components but the system expects {expected}")]
    StateDimension { expected: usize, got: usize },
    #[error("parameter vector has {got} entries but the system expects {expected}")]
    ParameterCount { expected: usize, got: usize },
    #[error("time span must be finite and increasing (got {t0} to {t1})")]
    InvalidSpan { t0: f64, t1: f64 },
    #[error("step size dt must be positive (got {0})")]
    NonPositiveStep(f64),
    #[error("tolerances must be positive (rtol = {rtol}, atol = {atol})")]
    InvalidTolerance { rtol: f64, atol: f64 },
    #[error("saveat times must be sorted and lie inside the time span")]
    InvalidSaveat,
    #[error("{method:?} cannot integrate a {kind:?} system")]
    MethodMismatch { method: Method, kind: SystemKind },
    #[error("step size underflow at t = {t} (h = {h})")]
    StepSizeUnderflow { t: f64, h: f64 },
    #[error("exceeded the maximum of {max_steps} steps at t = {t}")]
    MaxStepsExceeded { max_steps: usize, t: f64 },
    #[error("state became non-finite at t = {t}")]
    NonFinite { t: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Classic fixed-step RK4.
    Rk4,
    /// Fixed-step Tsitouras 5.
    Tsit5,
    /// Adaptive Dormand–Prince 5(4).
    Dopri5,
    /// Iterate a map; `dt` counts iterations.
    Discrete,
}

impl Method {
    pub fn is_adaptive(self) -> bool {
        matches!(self, Method::Dopri5)
    }

    pub fn stepper<T: Scalar>(self, dim: usize) -> Stepper<T> {
        match self {
            Method::Rk4 => Stepper::RungeKutta(RungeKutta::rk4(dim)),
            Method::Tsit5 => Stepper::RungeKutta(RungeKutta::tsit5(dim)),
            Method::Dopri5 => Stepper::RungeKutta(RungeKutta::dopri5(dim)),
            Method::Discrete => Stepper::Discrete(DiscreteMap::new(dim)),
        }
    }
}

/// Solver choice, step control and output sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub method: Method,
    /// Fixed step size, or the first trial step for adaptive methods.
    pub dt: f64,
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
    /// Sample times; when absent every (accepted) step is recorded.
    pub saveat: Option<Vec<f64>>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            method: Method::Dopri5,
            dt: 1e-2,
            rtol: 1e-6,
            atol: 1e-8,
            max_steps: 1_000_000,
            saveat: None,
        }
    }
}

impl SolverSettings {
    pub fn fixed(method: Method, dt: f64) -> Self {
        Self {
            method,
            dt,
            ..Self::default()
        }
    }

    pub fn with_saveat(mut self, saveat: Vec<f64>) -> Self {
        self.saveat = Some(saveat);
        self
    }
}

/// Initial state, time span and parameters for one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeProblem {
    pub u0: Vec<f64>,
    pub tspan: (f64, f64),
    pub params: Vec<f64>,
}

impl OdeProblem {
    pub fn new(u0: &[f64], tspan: (f64, f64), params: &[f64]) -> Self {
        Self {
            u0: u0.to_vec(),
            tspan,
            params: params.to_vec(),
        }
    }

    /// Checks dimensional consistency with `field`.
    pub fn validate<F: VectorField<f64> + ?Sized>(&self, field: &F) -> Result<(), SolveError> {
        if self.u0.len() != field.dimension() {
            return Err(SolveError::StateDimension {
                expected: field.dimension(),
                got: self.u0.len(),
            });
        }
        if self.params.len() != field.parameter_count() {
            return Err(SolveError::ParameterCount {
                expected: field.parameter_count(),
                got: self.params.len(),
            });
        }
        let (t0, t1) = self.tspan;
        if !t0.is_finite() || !t1.is_finite() || t1 <= t0 {
            return Err(SolveError::InvalidSpan { t0, t1 });
        }
        Ok(())
    }
}

/// Evenly spaced sample times `t0, t0 + dt, ...` up to and including `t1`.
pub fn time_grid(t0: f64, t1: f64, dt: f64) -> Vec<f64> {
    if dt <= 0.0 || t1 < t0 {
        return vec![t0];
    }
    let n = ((t1 - t0) / dt + 1e-9).floor() as usize;
    let mut grid: Vec<f64> = (0..=n).map(|i| t0 + i as f64 * dt).collect();
    if let Some(last) = grid.last_mut() {
        if (t1 - *last).abs() < 1e-9 * dt {
            *last = t1;
        }
    }
    grid
}

/// Integrates `field` over `problem.tspan`.
pub fn solve<F>(field: &F, problem: &OdeProblem, settings: &SolverSettings) -> Result<Trajectory, SolveError>
where
    F: VectorField<f64> + ?Sized,
{
    problem.validate(field)?;
    validate_settings(settings, problem.tspan)?;

    let kind = field.kind();
    let map_method = settings.method == Method::Discrete;
    if (kind == SystemKind::Map) != map_method {
        return Err(SolveError::MethodMismatch {
            method: settings.method,
            kind,
        });
    }

    let system = Parameterized::new(field, &problem.params);
    let trajectory = if settings.method.is_adaptive() {
        integrate_adaptive(&system, problem, settings)?
    } else {
        integrate_fixed(&system, problem, settings)?
    };

    debug!(
        method = ?settings.method,
        samples = trajectory.len(),
        t_end = trajectory.t.last().copied().unwrap_or(problem.tspan.0),
        "solve finished"
    );
    Ok(trajectory)
}

fn validate_settings(settings: &SolverSettings, tspan: (f64, f64)) -> Result<(), SolveError> {
    if !(settings.dt > 0.0) || !settings.dt.is_finite() {
        return Err(SolveError::NonPositiveStep(settings.dt));
    }
    if settings.method.is_adaptive() && (!(settings.rtol > 0.0) || !(settings.atol > 0.0)) {
        return Err(SolveError::InvalidTolerance {
            rtol: settings.rtol,
            atol: settings.atol,
        });
    }
    if let Some(saveat) = &settings.saveat {
        let (t0, t1) = tspan;
        let sorted = saveat.windows(2).all(|w| w[0] < w[1]);
        let inside = saveat.iter().all(|&s| s >= t0 && s <= t1);
        if saveat.is_empty() || !sorted || !inside {
            return Err(SolveError::InvalidSaveat);
        }
    }
    Ok(())
}

/// Tracks which requested sample time comes next.
struct SampleCursor<'a> {
    saveat: Option<&'a [f64]>,
    next: usize,
}

impl<'a> SampleCursor<'a> {
    fn new(saveat: Option<&'a [f64]>) -> Self {
        Self { saveat, next: 0 }
    }

    fn target(&self) -> Option<f64> {
        self.saveat.and_then(|s| s.get(self.next).copied())
    }

    fn records_every_step(&self) -> bool {
        self.saveat.is_none()
    }

    /// Records `(t, state)` if it is due, returning whether it was recorded.
    fn offer(&mut self, t: f64, state: &[f64], out: &mut Trajectory) -> bool {
        if self.records_every_step() {
            out.push(t, state);
            return true;
        }
        let mut recorded = false;
        while let Some(target) = self.target() {
            if t + time_epsilon(target) < target {
                break;
            }
            if !recorded {
                out.push(t, state);
                recorded = true;
            }
            self.next += 1;
        }
        recorded
    }
}

/// Samples a fixed-step run is expected to record, capped by `max_steps`.
fn reserved_samples(settings: &SolverSettings, span: f64) -> usize {
    let expected = match &settings.saveat {
        Some(saveat) => saveat.len(),
        None => {
            let steps = (span / settings.dt).ceil();
            if steps.is_finite() && steps < settings.max_steps as f64 {
                steps as usize + 1
            } else {
                settings.max_steps.saturating_add(1)
            }
        }
    };
    expected.min(MAX_RESERVED_SAMPLES)
}

fn time_epsilon(t: f64) -> f64 {
    1e-12 * t.abs().max(1.0)
}

fn integrate_fixed<S>(system: &S, problem: &OdeProblem, settings: &SolverSettings) -> Result<Trajectory, SolveError>
where
    S: DynamicalSystem<f64>,
{
    let (t0, t1) = problem.tspan;
    let dim = problem.u0.len();
    let mut stepper: Stepper<f64> = settings.method.stepper(dim);
    let mut cursor = SampleCursor::new(settings.saveat.as_deref());
    let clip_to_samples = settings.method != Method::Discrete;

    let mut state = problem.u0.clone();
    let mut t = t0;
    let mut out = Trajectory::with_capacity(reserved_samples(settings, t1 - t0));
    cursor.offer(t, &state, &mut out);

    let mut steps = 0usize;
    while t1 - t > time_epsilon(t1) {
        if steps >= settings.max_steps {
            return Err(SolveError::MaxStepsExceeded {
                max_steps: settings.max_steps,
                t,
            });
        }
        let mut h = settings.dt;
        if clip_to_samples {
            h = h.min(t1 - t);
            if let Some(target) = cursor.target() {
                if target - t > time_epsilon(target) {
                    h = h.min(target - t);
                }
            }
        } else if t + h > t1 + time_epsilon(t1) {
            break;
        }

        stepper.step(system, &mut t, &mut state, h);
        steps += 1;
        if let Some(target) = cursor.target() {
            if (t - target).abs() <= time_epsilon(target) {
                t = target;
            }
        }
        if (t1 - t).abs() <= time_epsilon(t1) {
            t = t1;
        }
        if state.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::NonFinite { t });
        }
        cursor.offer(t, &state, &mut out);
    }

    Ok(out)
}

fn integrate_adaptive<S>(system: &S, problem: &OdeProblem, settings: &SolverSettings) -> Result<Trajectory, SolveError>
where
    S: DynamicalSystem<f64>,
{
    let (t0, t1) = problem.tspan;
    let dim = problem.u0.len();
    let mut stepper = RungeKutta::<f64>::dopri5(dim);
    let exponent = 1.0 / stepper.tableau().order as f64;
    let mut cursor = SampleCursor::new(settings.saveat.as_deref());

    let mut state = problem.u0.clone();
    let mut candidate = vec![0.0; dim];
    let mut t = t0;
    let mut h = settings.dt.min(t1 - t0);
    let mut out = Trajectory::default();
    cursor.offer(t, &state, &mut out);

    let mut attempts = 0usize;
    let mut rejected = 0usize;
    while t1 - t > time_epsilon(t1) {
        if attempts >= settings.max_steps {
            return Err(SolveError::MaxStepsExceeded {
                max_steps: settings.max_steps,
                t,
            });
        }
        attempts += 1;

        let mut h_step = h.min(t1 - t);
        let mut landing = None;
        if let Some(target) = cursor.target() {
            if target - t <= h_step + time_epsilon(target) {
                h_step = target - t;
                landing = Some(target);
            }
        }
        if h_step <= 1e-14 * t.abs().max(1.0) {
            return Err(SolveError::StepSizeUnderflow { t, h: h_step });
        }

        stepper.attempt(system, t, &state, h_step, &mut candidate);
        let err = error_norm(stepper.error_estimate(), &state, &candidate, settings);
        if !err.is_finite() {
            return Err(SolveError::NonFinite { t });
        }

        if err <= 1.0 {
            t = landing.unwrap_or(t + h_step);
            if (t1 - t).abs() <= time_epsilon(t1) {
                t = t1;
            }
            state.copy_from_slice(&candidate);
            cursor.offer(t, &state, &mut out);

            let factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            // A step shortened to hit a sample time says nothing about the
            // step size the problem allows.
            h = if h_step < h { h.max(h_step * factor) } else { h_step * factor };
        } else {
            rejected += 1;
            h = h_step * (SAFETY * err.powf(-exponent)).max(MIN_FACTOR);
        }
    }

    debug!(attempts, rejected, "adaptive integration statistics");
    Ok(out)
}

/// RMS of the local error scaled by `atol + rtol * max(|y|, |y_new|)`.
fn error_norm(error: &[f64], old: &[f64], new: &[f64], settings: &SolverSettings) -> f64 {
    let n = error.len();
    let sum: f64 = (0..n)
        .map(|i| {
            let scale = settings.atol + settings.rtol * old[i].abs().max(new[i].abs());
            let e = error[i] / scale;
            e * e
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// Fixed-step integration generic over the scalar type, sampled at `times`.
///
/// Each interval `[times[k], times[k + 1]]` is split into equal sub-steps no
/// longer than `dt`. Used wherever derivatives are pushed through a
/// simulation (dual-number gradients).
pub fn integrate_on_grid<T, S>(
    system: &S,
    u0: &[T],
    times: &[f64],
    dt: f64,
    method: Method,
) -> Result<Vec<Vec<T>>, SolveError>
where
    T: Scalar,
    S: DynamicalSystem<T>,
{
    if !(dt > 0.0) {
        return Err(SolveError::NonPositiveStep(dt));
    }
    if times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(SolveError::InvalidSaveat);
    }
    if method.is_adaptive() {
        return Err(SolveError::MethodMismatch {
            method,
            kind: SystemKind::Flow,
        });
    }

    let mut stepper: Stepper<T> = method.stepper(u0.len());
    let mut state = u0.to_vec();
    let mut samples = Vec::with_capacity(times.len());
    let Some(&first) = times.first() else {
        return Ok(samples);
    };
    samples.push(state.clone());

    let mut t = T::constant(first);
    for window in times.windows(2) {
        let span = window[1] - window[0];
        let substeps = (span / dt).ceil().max(1.0) as usize;
        let h = T::constant(span / substeps as f64);
        for _ in 0..substeps {
            stepper.step(system, &mut t, &mut state, h);
        }
        t = T::constant(window[1]);
        if state.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::NonFinite { t: window[1] });
        }
        samples.push(state.clone());
    }
    Ok(samples)
}
