//! Sparse identification of nonlinear dynamics.
//!
//! A [`Basis`] of candidate functions is evaluated on sampled states to form
//! the library matrix `Θ`. Sequentially thresholded least squares then finds
//! sparse coefficients `Ξ` with `dX/dt ≈ Θ Ξ`, giving a [`SparseModel`] that
//! can be printed, re-simulated and scored.

use crate::dataset::{compare_trajectories, Trajectory, TrajectoryComparison};
use crate::solve::{solve, OdeProblem, SolverSettings};
use crate::traits::{Scalar, VectorField};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// One candidate function of the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasisTerm {
    /// `∏ u_i^{e_i}`; all-zero exponents is the constant term.
    Monomial(Vec<u32>),
    Sin(usize),
    Cos(usize),
}

impl BasisTerm {
    pub fn evaluate<T: Scalar>(&self, u: &[T]) -> T {
        match self {
            BasisTerm::Monomial(exponents) => exponents
                .iter()
                .zip(u.iter())
                .filter(|(e, _)| **e > 0)
                .fold(T::one(), |acc, (&e, &x)| acc * x.powi(e as i32)),
            BasisTerm::Sin(i) => u[*i].sin(),
            BasisTerm::Cos(i) => u[*i].cos(),
        }
    }

    pub(crate) fn is_constant(&self) -> bool {
        matches!(self, BasisTerm::Monomial(e) if e.iter().all(|&k| k == 0))
    }

    pub fn label(&self, variables: &[String]) -> String {
        match self {
            BasisTerm::Monomial(exponents) => {
                let factors: Vec<String> = exponents
                    .iter()
                    .zip(variables.iter())
                    .filter(|(e, _)| **e > 0)
                    .map(|(&e, name)| {
                        if e == 1 {
                            name.clone()
                        } else {
                            format!("{name}^{e}")
                        }
                    })
                    .collect();
                if factors.is_empty() {
                    "1".to_string()
                } else {
                    factors.join("*")
                }
            }
            BasisTerm::Sin(i) => format!("sin({})", variables[*i]),
            BasisTerm::Cos(i) => format!("cos({})", variables[*i]),
        }
    }
}

/// Ordered candidate library over named state variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basis {
    pub variables: Vec<String>,
    pub terms: Vec<BasisTerm>,
}

impl Basis {
    /// All monomials of total degree `0..=degree`, graded then lexicographic
    /// (`1, x, y, x^2, x*y, y^2, ...`).
    pub fn polynomial(variables: &[&str], degree: u32) -> Self {
        let n = variables.len();
        let mut terms = Vec::new();
        for d in 0..=degree {
            let mut combo = Vec::with_capacity(d as usize);
            push_combinations(n, d as usize, 0, &mut combo, &mut terms);
        }
        Self {
            variables: variables.iter().map(|s| s.to_string()).collect(),
            terms,
        }
    }

    /// Appends `sin(u_i)` and `cos(u_i)` for every variable.
    pub fn with_trig(mut self) -> Self {
        for i in 0..self.variables.len() {
            self.terms.push(BasisTerm::Sin(i));
            self.terms.push(BasisTerm::Cos(i));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.label(&self.variables)).collect()
    }

    pub fn evaluate_into<T: Scalar>(&self, u: &[T], out: &mut [T]) {
        for (slot, term) in out.iter_mut().zip(self.terms.iter()) {
            *slot = term.evaluate(u);
        }
    }

    /// Library matrix `Θ` with one row per sample and one column per term.
    pub fn library_matrix(&self, states: &[Vec<f64>]) -> Result<DMatrix<f64>> {
        let n_vars = self.variables.len();
        if let Some(bad) = states.iter().find(|s| s.len() != n_vars) {
            bail!(
                "State has {} components but the basis has {} variables.",
                bad.len(),
                n_vars
            );
        }
        let mut theta = DMatrix::zeros(states.len(), self.len());
        let mut row = vec![0.0; self.len()];
        for (i, state) in states.iter().enumerate() {
            self.evaluate_into(state, &mut row);
            for (j, value) in row.iter().enumerate() {
                theta[(i, j)] = *value;
            }
        }
        Ok(theta)
    }
}

/// Emits exponent vectors for every multiset of `remaining` variable indices
/// drawn from `start..n`.
fn push_combinations(
    n: usize,
    remaining: usize,
    start: usize,
    combo: &mut Vec<usize>,
    out: &mut Vec<BasisTerm>,
) {
    if remaining == 0 {
        let mut exponents = vec![0u32; n];
        for &i in combo.iter() {
            exponents[i] += 1;
        }
        out.push(BasisTerm::Monomial(exponents));
        return;
    }
    for i in start..n {
        combo.push(i);
        push_combinations(n, remaining - 1, i, combo, out);
        combo.pop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StlsqSettings {
    /// Coefficients with magnitude below this are zeroed.
    pub threshold: f64,
    pub max_iterations: usize,
}

impl Default for StlsqSettings {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            max_iterations: 20,
        }
    }
}

/// Least-squares solution of `a x = b` via SVD.
fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let svd = a.clone().svd(true, true);
    svd.solve(b, 1e-12).map_err(|e| anyhow!("SVD solve failed: {e}"))
}

/// Sequentially thresholded least squares, one target column at a time.
/// Returns `Ξ` as an `n_terms × n_targets` matrix.
pub fn stlsq(theta: &DMatrix<f64>, targets: &DMatrix<f64>, settings: &StlsqSettings) -> Result<DMatrix<f64>> {
    if theta.nrows() != targets.nrows() {
        bail!(
            "Library has {} rows but targets have {}.",
            theta.nrows(),
            targets.nrows()
        );
    }
    if theta.nrows() == 0 || theta.ncols() == 0 {
        bail!("Library matrix is empty.");
    }
    if !(settings.threshold >= 0.0) {
        bail!("STLSQ threshold must be non-negative.");
    }
    if settings.max_iterations == 0 {
        bail!("STLSQ needs at least one iteration.");
    }

    let n_terms = theta.ncols();
    let mut xi = DMatrix::zeros(n_terms, targets.ncols());

    for col in 0..targets.ncols() {
        let b = targets.column(col).into_owned();
        let mut coefficients = least_squares(theta, &b)?;
        let mut active: Vec<usize> = (0..n_terms).collect();

        for iteration in 0..settings.max_iterations {
            let next_active: Vec<usize> = active
                .iter()
                .copied()
                .filter(|&j| coefficients[j].abs() >= settings.threshold)
                .collect();
            let converged = next_active == active && iteration > 0;
            active = next_active;

            coefficients.fill(0.0);
            if active.is_empty() {
                break;
            }
            let sub_theta = theta.select_columns(active.iter());
            let sub_coefficients = least_squares(&sub_theta, &b)?;
            for (k, &j) in active.iter().enumerate() {
                coefficients[j] = sub_coefficients[k];
            }
            if converged {
                break;
            }
        }
        debug!(target_column = col, active_terms = active.len(), "stlsq column fitted");
        xi.set_column(col, &coefficients);
    }

    Ok(xi)
}

/// How derivative targets are obtained from sampled data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeMethod {
    /// Evaluate the generating vector field on the samples.
    Ideal,
    /// Second-order finite differences on the sample times.
    FiniteDifference,
}

pub fn ideal_derivatives<F>(field: &F, params: &[f64], data: &Trajectory) -> Result<Vec<Vec<f64>>>
where
    F: VectorField<f64> + ?Sized,
{
    if params.len() != field.parameter_count() {
        bail!(
            "Parameter count mismatch. Expected {}, got {}.",
            field.parameter_count(),
            params.len()
        );
    }
    if data.dimension() != field.dimension() {
        bail!(
            "Trajectory dimension {} does not match the vector field ({}).",
            data.dimension(),
            field.dimension()
        );
    }
    Ok(data
        .t
        .iter()
        .zip(data.u.iter())
        .map(|(&t, u)| field.rhs_owned(u, params, t))
        .collect())
}

/// Second-order accurate derivative estimates on a possibly non-uniform grid:
/// three-point central differences inside, one-sided three-point stencils at
/// the ends.
pub fn finite_difference(data: &Trajectory) -> Result<Vec<Vec<f64>>> {
    let n = data.len();
    if n < 3 {
        bail!("Finite differences need at least three samples, got {n}.");
    }
    if data.t.windows(2).any(|w| !(w[1] > w[0])) {
        bail!("Sample times must be strictly increasing.");
    }
    let t = &data.t;
    let u = &data.u;
    let dim = data.dimension();
    let mut out = vec![vec![0.0; dim]; n];

    let (h1, h2) = (t[1] - t[0], t[2] - t[1]);
    let w = [
        -(2.0 * h1 + h2) / (h1 * (h1 + h2)),
        (h1 + h2) / (h1 * h2),
        -h1 / (h2 * (h1 + h2)),
    ];
    for j in 0..dim {
        out[0][j] = w[0] * u[0][j] + w[1] * u[1][j] + w[2] * u[2][j];
    }

    for i in 1..n - 1 {
        let (h1, h2) = (t[i] - t[i - 1], t[i + 1] - t[i]);
        let w = [
            -h2 / (h1 * (h1 + h2)),
            (h2 - h1) / (h1 * h2),
            h1 / (h2 * (h1 + h2)),
        ];
        for j in 0..dim {
            out[i][j] = w[0] * u[i - 1][j] + w[1] * u[i][j] + w[2] * u[i + 1][j];
        }
    }

    let (a, b) = (t[n - 1] - t[n - 2], t[n - 2] - t[n - 3]);
    let w = [
        (2.0 * a + b) / (a * (a + b)),
        -(a + b) / (a * b),
        a / (b * (a + b)),
    ];
    for j in 0..dim {
        out[n - 1][j] = w[0] * u[n - 1][j] + w[1] * u[n - 2][j] + w[2] * u[n - 3][j];
    }

    Ok(out)
}

/// A discovered model: `du_j/dt = Σ_k coefficients[j][k] · θ_k(u)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseModel {
    pub basis: Basis,
    /// One row per equation, one entry per basis term.
    pub coefficients: Vec<Vec<f64>>,
}

impl SparseModel {
    pub fn from_matrix(basis: Basis, xi: &DMatrix<f64>) -> Result<Self> {
        if xi.nrows() != basis.len() {
            bail!(
                "Coefficient matrix has {} rows but the basis has {} terms.",
                xi.nrows(),
                basis.len()
            );
        }
        let coefficients = (0..xi.ncols())
            .map(|j| xi.column(j).iter().copied().collect())
            .collect();
        Ok(Self { basis, coefficients })
    }

    pub fn active_terms(&self) -> usize {
        self.coefficients
            .iter()
            .map(|row| row.iter().filter(|c| **c != 0.0).count())
            .sum()
    }

    /// Coefficient of the term labelled `term` in the equation for
    /// `variable`, if both exist.
    pub fn coefficient(&self, variable: &str, term: &str) -> Option<f64> {
        let row = self.basis.variables.iter().position(|v| v == variable)?;
        let col = self.basis.labels().iter().position(|l| l == term)?;
        Some(self.coefficients[row][col])
    }

    /// Predicted derivatives at each state.
    pub fn predict(&self, states: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let theta = self.basis.library_matrix(states)?;
        Ok((0..theta.nrows())
            .map(|i| {
                self.coefficients
                    .iter()
                    .map(|row| row.iter().enumerate().map(|(k, c)| c * theta[(i, k)]).sum())
                    .collect()
            })
            .collect())
    }

    pub fn equations(&self) -> Vec<String> {
        let labels = self.basis.labels();
        self.basis
            .variables
            .iter()
            .zip(self.coefficients.iter())
            .map(|(name, row)| {
                let mut rhs = String::new();
                let terms = row.iter().zip(self.basis.terms.iter()).zip(labels.iter());
                for ((c, basis_term), label) in terms.filter(|((c, _), _)| **c != 0.0) {
                    let magnitude = format_coefficient(c.abs());
                    let term = if basis_term.is_constant() {
                        magnitude
                    } else {
                        format!("{magnitude} {label}")
                    };
                    if rhs.is_empty() {
                        rhs = if *c < 0.0 { format!("-{term}") } else { term };
                    } else {
                        let sign = if *c < 0.0 { '-' } else { '+' };
                        rhs.push_str(&format!(" {sign} {term}"));
                    }
                }
                if rhs.is_empty() {
                    rhs.push('0');
                }
                format!("d{name}/dt = {rhs}")
            })
            .collect()
    }
}

fn format_coefficient(value: f64) -> String {
    let text = format!("{value:.4}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

impl fmt::Display for SparseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.equations() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl<T: Scalar> VectorField<T> for SparseModel {
    fn dimension(&self) -> usize {
        self.basis.variables.len()
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn rhs(&self, du: &mut [T], u: &[T], _p: &[T], _t: T) {
        let theta: Vec<T> = self.basis.terms.iter().map(|term| term.evaluate(u)).collect();
        for (slot, row) in du.iter_mut().zip(self.coefficients.iter()) {
            *slot = row
                .iter()
                .zip(theta.iter())
                .filter(|(c, _)| **c != 0.0)
                .fold(T::zero(), |acc, (&c, &value)| acc + T::constant(c) * value);
        }
    }
}

/// Fits `derivatives ≈ Θ(states) Ξ` with STLSQ.
pub fn fit(
    basis: Basis,
    states: &[Vec<f64>],
    derivatives: &[Vec<f64>],
    settings: &StlsqSettings,
) -> Result<SparseModel> {
    if states.len() != derivatives.len() {
        bail!(
            "Got {} states but {} derivative samples.",
            states.len(),
            derivatives.len()
        );
    }
    let n_vars = basis.variables.len();
    if derivatives.iter().any(|d| d.len() != n_vars) {
        bail!("Derivative samples must have {n_vars} components.");
    }
    let theta = basis.library_matrix(states)?;
    let targets = DMatrix::from_fn(derivatives.len(), n_vars, |i, j| derivatives[i][j]);
    let xi = stlsq(&theta, &targets, settings)?;
    let model = SparseModel::from_matrix(basis, &xi)?;
    debug!(active_terms = model.active_terms(), "sparse model fitted");
    Ok(model)
}

/// Goodness-of-fit for one discovered equation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquationMetrics {
    pub variable: String,
    pub active_terms: usize,
    /// Euclidean norm of the residual.
    pub l2_error: f64,
    pub r_squared: f64,
    /// Corrected Akaike information criterion.
    pub aicc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub equations: Vec<EquationMetrics>,
    pub active_terms: usize,
}

pub fn fit_metrics(model: &SparseModel, states: &[Vec<f64>], derivatives: &[Vec<f64>]) -> Result<FitMetrics> {
    if states.len() != derivatives.len() {
        bail!("States and derivatives differ in length.");
    }
    if states.is_empty() {
        bail!("Cannot score a model on zero samples.");
    }
    let dim = model.basis.variables.len();
    if let Some(bad) = derivatives.iter().find(|d| d.len() != dim) {
        bail!(
            "Derivative sample has {} components but the model has {} variables.",
            bad.len(),
            dim
        );
    }
    let predicted = model.predict(states)?;
    let n = states.len();

    let equations = model
        .basis
        .variables
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let k = model.coefficients[j].iter().filter(|c| **c != 0.0).count();
            let mean = derivatives.iter().map(|d| d[j]).sum::<f64>() / n as f64;
            let mut rss = 0.0;
            let mut tss = 0.0;
            for (d, p) in derivatives.iter().zip(predicted.iter()) {
                rss += (d[j] - p[j]).powi(2);
                tss += (d[j] - mean).powi(2);
            }
            EquationMetrics {
                variable: name.clone(),
                active_terms: k,
                l2_error: rss.sqrt(),
                r_squared: r_squared(rss, tss),
                aicc: aicc(rss, n, k),
            }
        })
        .collect();

    Ok(FitMetrics {
        equations,
        active_terms: model.active_terms(),
    })
}

fn r_squared(rss: f64, tss: f64) -> f64 {
    if tss > 0.0 {
        1.0 - rss / tss
    } else if rss == 0.0 {
        1.0
    } else {
        0.0
    }
}

fn aicc(rss: f64, n: usize, k: usize) -> f64 {
    let n_f = n as f64;
    let k_f = k as f64;
    let aic = n_f * (rss.max(f64::MIN_POSITIVE) / n_f).ln() + 2.0 * k_f;
    if n > k + 1 {
        aic + 2.0 * k_f * (k_f + 1.0) / (n_f - k_f - 1.0)
    } else {
        f64::INFINITY
    }
}

/// Re-simulates `model` from the first sample of `reference`, sampled on the
/// same time grid.
pub fn simulate(model: &SparseModel, reference: &Trajectory, settings: &SolverSettings) -> Result<Trajectory> {
    let (Some(&t0), Some(&t1), Some(u0)) = (reference.t.first(), reference.t.last(), reference.u.first()) else {
        bail!("Reference trajectory is empty.");
    };
    let problem = OdeProblem::new(u0, (t0, t1), &[]);
    let settings = settings.clone().with_saveat(reference.t.clone());
    solve(model, &problem, &settings).context("Simulating the discovered model failed")
}

/// Model-discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SindyConfig {
    pub degree: u32,
    pub include_trig: bool,
    pub derivatives: DerivativeMethod,
    pub stlsq: StlsqSettings,
    /// Relative RMSE above which the re-simulated model is reported as diverging.
    pub divergence_warning: f64,
}

impl Default for SindyConfig {
    fn default() -> Self {
        Self {
            degree: 2,
            include_trig: false,
            derivatives: DerivativeMethod::Ideal,
            stlsq: StlsqSettings::default(),
            divergence_warning: 0.1,
        }
    }
}

/// Everything produced by one discovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub model: SparseModel,
    pub equations: Vec<String>,
    pub metrics: FitMetrics,
    pub simulated: Trajectory,
    pub comparison: TrajectoryComparison,
}

/// Fits a sparse model to `data` generated by `field` and compares its
/// re-simulation with the data.
pub fn discover<F>(
    field: &F,
    params: &[f64],
    variables: &[&str],
    data: &Trajectory,
    config: &SindyConfig,
    solver: &SolverSettings,
) -> Result<Discovery>
where
    F: VectorField<f64> + ?Sized,
{
    if variables.len() != data.dimension() {
        bail!(
            "Got {} variable names for {}-dimensional data.",
            variables.len(),
            data.dimension()
        );
    }
    let derivatives = match config.derivatives {
        DerivativeMethod::Ideal => ideal_derivatives(field, params, data)?,
        DerivativeMethod::FiniteDifference => finite_difference(data)?,
    };

    let mut basis = Basis::polynomial(variables, config.degree);
    if config.include_trig {
        basis = basis.with_trig();
    }
    let model = fit(basis, &data.u, &derivatives, &config.stlsq)?;
    let metrics = fit_metrics(&model, &data.u, &derivatives)?;
    let equations = model.equations();
    for line in &equations {
        info!("{line}");
    }

    let simulated = simulate(&model, data, solver)?;
    let comparison = compare_trajectories(data, &simulated)?;
    let scale = data
        .u
        .iter()
        .flat_map(|row| row.iter())
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt()
        / ((data.len() * data.dimension()).max(1) as f64).sqrt();
    if comparison.rmse > config.divergence_warning * scale.max(f64::MIN_POSITIVE) {
        warn!(
            rmse = comparison.rmse,
            max_abs_error = comparison.max_abs_error,
            "discovered model diverges from the data"
        );
    }

    Ok(Discovery {
        model,
        equations,
        metrics,
        simulated,
        comparison,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solve::Method;
    use crate::systems::{Lorenz, LotkaVolterra};

    fn lorenz_data() -> Trajectory {
        let problem = OdeProblem::new(&[-8.0, 8.0, 27.0], (0.0, 5.0), &Lorenz::PARAMS);
        solve(&Lorenz, &problem, &SolverSettings::fixed(Method::Rk4, 0.002)).expect("lorenz solve")
    }

    fn lotka_volterra_data(spacing: f64) -> Trajectory {
        let problem = OdeProblem::new(&LotkaVolterra::INITIAL_STATE, (0.0, 10.0), &LotkaVolterra::PARAMS);
        let saveat = crate::solve::time_grid(0.0, 10.0, spacing);
        solve(&LotkaVolterra, &problem, &SolverSettings::default().with_saveat(saveat)).expect("lv solve")
    }

    #[test]
    fn polynomial_basis_is_graded() {
        let basis = Basis::polynomial(&["x", "y"], 2);
        assert_eq!(basis.labels(), vec!["1", "x", "y", "x^2", "x*y", "y^2"]);
        assert_eq!(Basis::polynomial(&["x", "y", "z"], 2).len(), 10);
        let trig = Basis::polynomial(&["x"], 1).with_trig();
        assert_eq!(trig.labels(), vec!["1", "x", "sin(x)", "cos(x)"]);
        assert!(basis.terms[0].is_constant());
    }

    #[test]
    fn basis_terms_evaluate() {
        let basis = Basis::polynomial(&["x", "y"], 2);
        let mut out = vec![0.0; basis.len()];
        basis.evaluate_into(&[2.0, 3.0], &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
    }

    #[test]
    fn stlsq_recovers_sparse_linear_combination() {
        let theta = DMatrix::from_fn(50, 3, |i, j| ((i + 1) as f64 * (j as f64 + 0.7)).sin());
        let target = DMatrix::from_fn(50, 1, |i, _| 2.0 * theta[(i, 0)] - 0.5 * theta[(i, 2)]);
        let xi = stlsq(&theta, &target, &StlsqSettings::default()).expect("stlsq");
        assert!((xi[(0, 0)] - 2.0).abs() < 1e-10);
        assert_eq!(xi[(1, 0)], 0.0);
        assert!((xi[(2, 0)] + 0.5).abs() < 1e-10);
    }

    #[test]
    fn stlsq_rejects_mismatched_rows() {
        let theta = DMatrix::<f64>::zeros(4, 2);
        let target = DMatrix::<f64>::zeros(3, 1);
        assert!(stlsq(&theta, &target, &StlsqSettings::default()).is_err());
    }

    #[test]
    fn recovers_lorenz_from_ideal_derivatives() {
        let data = lorenz_data();
        let derivatives = ideal_derivatives(&Lorenz, &Lorenz::PARAMS, &data).expect("derivatives");
        let basis = Basis::polynomial(&["x", "y", "z"], 2);
        let model = fit(basis, &data.u, &derivatives, &StlsqSettings::default()).expect("fit");

        assert_eq!(model.active_terms(), 7, "{model}");
        let check = |var: &str, term: &str, expected: f64| {
            let c = model.coefficient(var, term).expect("term exists");
            assert!((c - expected).abs() < 1e-6, "{var} {term}: {c}");
        };
        check("x", "x", -10.0);
        check("x", "y", 10.0);
        check("y", "x", 28.0);
        check("y", "y", -1.0);
        check("y", "x*z", -1.0);
        check("z", "x*y", 1.0);
        check("z", "z", -8.0 / 3.0);

        let metrics = fit_metrics(&model, &data.u, &derivatives).expect("metrics");
        assert!(metrics.equations.iter().all(|e| e.r_squared > 0.999999));
    }

    #[test]
    fn finite_difference_is_exact_for_quadratics() {
        let times = [0.0, 0.1, 0.25, 0.3, 0.5, 0.9];
        let mut data = Trajectory::default();
        for &t in &times {
            data.push(t, &[t * t, 3.0 * t]);
        }
        let d = finite_difference(&data).expect("derivatives");
        for (i, &t) in times.iter().enumerate() {
            assert!((d[i][0] - 2.0 * t).abs() < 1e-10, "at {t}: {}", d[i][0]);
            assert!((d[i][1] - 3.0).abs() < 1e-10);
        }
        let mut short = Trajectory::default();
        short.push(0.0, &[0.0]);
        short.push(1.0, &[1.0]);
        assert!(finite_difference(&short).is_err());
    }

    #[test]
    fn equations_render_signed_terms() {
        let basis = Basis::polynomial(&["x", "y"], 2);
        let xi = DMatrix::from_row_slice(6, 2, &[
            0.0, 0.0,
            1.5, 0.0,
            0.0, -3.0,
            0.0, 0.0,
            -1.0, 1.0,
            0.0, 0.0,
        ]);
        let model = SparseModel::from_matrix(basis, &xi).expect("model");
        assert_eq!(model.equations(), vec!["dx/dt = 1.5 x - 1 x*y", "dy/dt = -3 y + 1 x*y"]);
        assert!(model.to_string().contains("dy/dt"));
    }

    #[test]
    fn constant_term_renders_without_a_label() {
        let basis = Basis::polynomial(&["x"], 1);
        let xi = DMatrix::from_row_slice(2, 1, &[-2.0, 0.5]);
        let model = SparseModel::from_matrix(basis, &xi).expect("model");
        assert_eq!(model.equations(), vec!["dx/dt = -2 + 0.5 x"]);
    }

    #[test]
    fn metrics_reject_short_derivative_rows() {
        let basis = Basis::polynomial(&["x", "y"], 1);
        let xi = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        let model = SparseModel::from_matrix(basis, &xi).expect("model");
        let states = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let err = fit_metrics(&model, &states, &[vec![1.0, 2.0], vec![3.0]]).expect_err("short row");
        assert!(format!("{err}").contains("1 components"), "{err}");
        let metrics = fit_metrics(&model, &states, &states).expect("metrics");
        assert!(metrics.equations.iter().all(|e| e.r_squared > 0.999999));
    }

    #[test]
    fn discovery_of_lotka_volterra_resimulates_closely() {
        let data = lotka_volterra_data(0.05);
        let discovery = discover(
            &LotkaVolterra,
            &LotkaVolterra::PARAMS,
            &["prey", "predator"],
            &data,
            &SindyConfig::default(),
            &SolverSettings::default(),
        )
        .expect("discovery");
        assert_eq!(discovery.model.active_terms(), 4, "{}", discovery.model);
        assert!(discovery.comparison.max_abs_error < 1e-3, "{:?}", discovery.comparison);
        assert_eq!(discovery.simulated.t, data.t);
    }

    #[test]
    fn resimulation_is_deterministic() {
        let data = lotka_volterra_data(0.05);
        let derivatives = ideal_derivatives(&LotkaVolterra, &LotkaVolterra::PARAMS, &data).expect("derivatives");
        let model = fit(
            Basis::polynomial(&["prey", "predator"], 2),
            &data.u,
            &derivatives,
            &StlsqSettings::default(),
        )
        .expect("fit");
        let a = simulate(&model, &data, &SolverSettings::default()).expect("simulate");
        let b = simulate(&model, &data, &SolverSettings::default()).expect("simulate");
        assert_eq!(a, b);
    }

    #[test]
    fn finite_difference_discovery_keeps_dominant_terms() {
        let data = lotka_volterra_data(0.01);
        let config = SindyConfig {
            derivatives: DerivativeMethod::FiniteDifference,
            ..SindyConfig::default()
        };
        let discovery = discover(
            &LotkaVolterra,
            &LotkaVolterra::PARAMS,
            &["prey", "predator"],
            &data,
            &config,
            &SolverSettings::default(),
        )
        .expect("discovery");
        let alpha = discovery.model.coefficient("prey", "prey").expect("term");
        assert!((alpha - 1.5).abs() < 0.1, "{}", discovery.model);
    }
}
