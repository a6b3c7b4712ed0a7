//! Gradient-based minimisers with a per-iteration loss trace.
//!
//! Both optimizers evaluate the objective at the starting point first, so the
//! trace always begins with the loss of the initial parameters (iteration 0).
//! The callback sees every recorded `(iteration, loss, params)` and may stop
//! the run early with [`ControlFlow::Break`].

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimError {
    #[error("loss became non-finite at iteration {iteration}")]
    NonFiniteLoss { iteration: usize },
    #[error("gradient has {got} entries but there are {expected} parameters")]
    GradientDimension { expected: usize, got: usize },
}

/// Why an optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    IterationLimit,
    GradientTolerance,
    LineSearchFailed,
    Callback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub params: Vec<f64>,
    /// Loss at iterations `0..=iterations`.
    pub losses: Vec<f64>,
    pub iterations: usize,
    pub termination: Termination,
}

impl OptimizationResult {
    pub fn final_loss(&self) -> f64 {
        self.losses.last().copied().unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub iterations: usize,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            iterations: 200,
        }
    }
}

/// Settings for BFGS with Armijo backtracking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BfgsSettings {
    /// Convergence tolerance on the gradient norm.
    pub grad_tol: f64,
    pub max_iter: usize,
    /// Armijo condition parameter (sufficient decrease).
    pub armijo_c1: f64,
    /// Backtracking contraction factor.
    pub armijo_rho: f64,
    pub max_ls_iter: usize,
}

impl Default for BfgsSettings {
    fn default() -> Self {
        Self {
            grad_tol: 1e-6,
            max_iter: 100,
            armijo_c1: 1e-4,
            armijo_rho: 0.5,
            max_ls_iter: 40,
        }
    }
}

fn checked(
    iteration: usize,
    n: usize,
    evaluation: (f64, Vec<f64>),
) -> Result<(f64, Vec<f64>)> {
    let (loss, grad) = evaluation;
    if !loss.is_finite() {
        return Err(OptimError::NonFiniteLoss { iteration }.into());
    }
    if grad.len() != n {
        return Err(OptimError::GradientDimension {
            expected: n,
            got: grad.len(),
        }
        .into());
    }
    Ok((loss, grad))
}

/// Adam with bias-corrected moment estimates, run for a fixed budget.
pub fn minimize_adam<F, C>(
    mut objective: F,
    x0: &[f64],
    settings: &AdamSettings,
    mut callback: C,
) -> Result<OptimizationResult>
where
    F: FnMut(&[f64]) -> Result<(f64, Vec<f64>)>,
    C: FnMut(usize, f64, &[f64]) -> ControlFlow<()>,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    let mut m = vec![0.0; n];
    let mut v = vec![0.0; n];
    let mut losses = Vec::with_capacity(settings.iterations + 1);

    for iteration in 0..=settings.iterations {
        let (loss, grad) = checked(iteration, n, objective(&x)?)?;
        losses.push(loss);
        if callback(iteration, loss, &x).is_break() {
            return Ok(OptimizationResult {
                params: x,
                losses,
                iterations: iteration,
                termination: Termination::Callback,
            });
        }
        if iteration == settings.iterations {
            break;
        }

        let step = (iteration + 1) as i32;
        let bias1 = 1.0 - settings.beta1.powi(step);
        let bias2 = 1.0 - settings.beta2.powi(step);
        for i in 0..n {
            m[i] = settings.beta1 * m[i] + (1.0 - settings.beta1) * grad[i];
            v[i] = settings.beta2 * v[i] + (1.0 - settings.beta2) * grad[i] * grad[i];
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            x[i] -= settings.learning_rate * m_hat / (v_hat.sqrt() + settings.epsilon);
        }
    }

    debug!(iterations = settings.iterations, loss = losses.last().copied(), "adam finished");
    Ok(OptimizationResult {
        params: x,
        losses,
        iterations: settings.iterations,
        termination: Termination::IterationLimit,
    })
}

/// Backtracking line search satisfying the Armijo condition
/// `f(x + α·p) ≤ f(x) + c1·α·(∇f · p)`. Returns `(alpha, f_new, g_new)` or
/// `None` when no acceptable step is found. Objective errors at trial points
/// shrink the step like a non-finite loss does.
fn backtracking_armijo<F>(
    objective: &mut F,
    x: &DVector<f64>,
    p: &DVector<f64>,
    f_at_x: f64,
    grad_dot_p: f64,
    settings: &BfgsSettings,
) -> Option<(f64, f64, Vec<f64>)>
where
    F: FnMut(&[f64]) -> Result<(f64, Vec<f64>)>,
{
    let mut alpha = 1.0;
    for _ in 0..settings.max_ls_iter {
        let trial = x + p * alpha;
        // A trial point the objective cannot evaluate counts as a rejected step.
        match objective(trial.as_slice()) {
            Ok((f_new, g_new))
                if f_new.is_finite() && f_new <= f_at_x + settings.armijo_c1 * alpha * grad_dot_p =>
            {
                return Some((alpha, f_new, g_new));
            }
            Ok(_) => {}
            Err(err) => debug!(alpha, "objective failed at trial point: {err:#}"),
        }
        alpha *= settings.armijo_rho;
    }
    None
}

/// BFGS quasi-Newton minimisation with a dense inverse-Hessian estimate.
pub fn minimize_bfgs<F, C>(
    mut objective: F,
    x0: &[f64],
    settings: &BfgsSettings,
    mut callback: C,
) -> Result<OptimizationResult>
where
    F: FnMut(&[f64]) -> Result<(f64, Vec<f64>)>,
    C: FnMut(usize, f64, &[f64]) -> ControlFlow<()>,
{
    let n = x0.len();
    let mut x = DVector::from_column_slice(x0);
    let (mut fx, g0) = checked(0, n, objective(x.as_slice())?)?;
    let mut g = DVector::from_vec(g0);
    let mut h = DMatrix::<f64>::identity(n, n);
    let mut losses = vec![fx];

    let finish = |x: DVector<f64>,
                  losses: Vec<f64>,
                  iterations: usize,
                  termination: Termination|
     -> Result<OptimizationResult> {
        debug!(iterations, ?termination, "bfgs finished");
        Ok(OptimizationResult {
            params: x.as_slice().to_vec(),
            losses,
            iterations,
            termination,
        })
    };

    if callback(0, fx, x.as_slice()).is_break() {
        return finish(x, losses, 0, Termination::Callback);
    }

    for iter in 0..settings.max_iter {
        if g.norm() < settings.grad_tol {
            return finish(x, losses, iter, Termination::GradientTolerance);
        }

        // Search direction p = -H g; fall back to steepest descent.
        let mut p = -(&h * &g);
        let mut grad_dot_p = g.dot(&p);
        if grad_dot_p >= 0.0 {
            h = DMatrix::identity(n, n);
            p = -g.clone();
            grad_dot_p = -g.dot(&g);
        }

        let Some((alpha, f_new, g_new)) =
            backtracking_armijo(&mut objective, &x, &p, fx, grad_dot_p, settings)
        else {
            return finish(x, losses, iter, Termination::LineSearchFailed);
        };
        let (f_new, g_new) = checked(iter + 1, n, (f_new, g_new))?;
        let g_new = DVector::from_vec(g_new);

        let s = &p * alpha;
        let y = &g_new - &g;
        let ys = y.dot(&s);
        if ys > f64::EPSILON {
            let rho = 1.0 / ys;
            let hy = &h * &y;
            let factor = (1.0 + rho * y.dot(&hy)) * rho;
            h += &s * s.transpose() * factor - (&hy * s.transpose() + &s * hy.transpose()) * rho;
        }

        x += &s;
        fx = f_new;
        g = g_new;
        losses.push(fx);
        if callback(iter + 1, fx, x.as_slice()).is_break() {
            return finish(x, losses, iter + 1, Termination::Callback);
        }
    }

    finish(x, losses, settings.max_iter, Termination::IterationLimit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let f = (x[0] - 1.0).powi(2) + 4.0 * (x[1] + 2.0).powi(2);
        Ok((f, vec![2.0 * (x[0] - 1.0), 8.0 * (x[1] + 2.0)]))
    }

    fn rosenbrock(x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = vec![-2.0 * (1.0 - a) - 400.0 * a * (b - a * a), 200.0 * (b - a * a)];
        Ok((f, g))
    }

    fn no_stop(_: usize, _: f64, _: &[f64]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    #[test]
    fn adam_minimises_quadratic() {
        let settings = AdamSettings {
            learning_rate: 0.05,
            iterations: 2_000,
            ..AdamSettings::default()
        };
        let result = minimize_adam(quadratic, &[0.0, 0.0], &settings, no_stop).expect("adam");
        assert_eq!(result.losses.len(), 2_001);
        assert_eq!(result.losses[0], 17.0);
        assert!((result.params[0] - 1.0).abs() < 1e-2, "{:?}", result.params);
        assert!((result.params[1] + 2.0).abs() < 1e-2, "{:?}", result.params);
        assert_eq!(result.termination, Termination::IterationLimit);
    }

    #[test]
    fn bfgs_minimises_rosenbrock() {
        let settings = BfgsSettings {
            max_iter: 500,
            ..BfgsSettings::default()
        };
        let result = minimize_bfgs(rosenbrock, &[-1.2, 1.0], &settings, no_stop).expect("bfgs");
        assert_eq!(result.termination, Termination::GradientTolerance);
        assert!((result.params[0] - 1.0).abs() < 1e-4, "{:?}", result.params);
        assert!((result.params[1] - 1.0).abs() < 1e-4, "{:?}", result.params);
        assert_eq!(result.losses.len(), result.iterations + 1);
        assert!(result.losses.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn callback_can_stop_early() {
        let mut seen = Vec::new();
        let result = minimize_adam(
            quadratic,
            &[0.0, 0.0],
            &AdamSettings::default(),
            |iteration, loss, _| {
                seen.push((iteration, loss));
                if iteration == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .expect("adam");
        assert_eq!(result.termination, Termination::Callback);
        assert_eq!(result.losses.len(), 4);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].0, 0);
    }

    #[test]
    fn non_finite_loss_reports_iteration() {
        let mut calls = 0;
        let err = minimize_adam(
            |x: &[f64]| {
                calls += 1;
                let loss = if calls > 2 { f64::NAN } else { x[0] * x[0] };
                Ok((loss, vec![2.0 * x[0]]))
            },
            &[1.0],
            &AdamSettings::default(),
            no_stop,
        )
        .expect_err("should fail");
        assert_eq!(
            err.downcast_ref::<OptimError>(),
            Some(&OptimError::NonFiniteLoss { iteration: 2 })
        );
    }

    #[test]
    fn wrong_gradient_length_is_an_error() {
        let err = minimize_adam(
            |x: &[f64]| Ok((x[0] * x[0], vec![2.0 * x[0], 0.0])),
            &[1.0],
            &AdamSettings::default(),
            no_stop,
        )
        .expect_err("should fail");
        assert_eq!(
            err.downcast_ref::<OptimError>(),
            Some(&OptimError::GradientDimension { expected: 1, got: 2 })
        );
        let err = minimize_bfgs(
            |x: &[f64]| Ok((x[0] * x[0], vec![])),
            &[1.0],
            &BfgsSettings::default(),
            no_stop,
        )
        .expect_err("should fail");
        assert_eq!(
            err.downcast_ref::<OptimError>(),
            Some(&OptimError::GradientDimension { expected: 1, got: 0 })
        );
    }

    #[test]
    fn ascent_direction_ends_in_line_search_failure() {
        // The reported gradient has the wrong sign, so every step goes uphill.
        let result = minimize_bfgs(
            |x: &[f64]| Ok((x[0], vec![-1.0])),
            &[2.0],
            &BfgsSettings::default(),
            no_stop,
        )
        .expect("bfgs");
        assert_eq!(result.termination, Termination::LineSearchFailed);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.params, vec![2.0]);
        assert_eq!(result.losses, vec![2.0]);
    }

    #[test]
    fn bfgs_backtracks_past_failing_trial_points() {
        let result = minimize_bfgs(
            |x: &[f64]| {
                if x[0].abs() > 5.0 {
                    anyhow::bail!("state diverged at x = {}", x[0]);
                }
                Ok((10.0 * x[0] * x[0], vec![20.0 * x[0]]))
            },
            &[1.0],
            &BfgsSettings::default(),
            no_stop,
        )
        .expect("bfgs");
        assert_eq!(result.termination, Termination::GradientTolerance);
        assert!(result.params[0].abs() < 1e-6, "{:?}", result.params);
    }

    #[test]
    fn objective_error_at_the_start_is_propagated() {
        let result = minimize_bfgs(
            |_: &[f64]| -> Result<(f64, Vec<f64>)> { anyhow::bail!("cannot evaluate") },
            &[1.0],
            &BfgsSettings::default(),
            no_stop,
        );
        assert!(format!("{}", result.expect_err("should fail")).contains("cannot evaluate"));
    }
}
