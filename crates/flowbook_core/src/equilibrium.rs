use crate::autodiff::{jacobian, DifferentiableSystem, Dual};
use crate::traits::{DynamicalSystem, SystemKind, VectorField};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: Complex<f64>,
    pub vector: Vec<Complex<f64>>,
}

/// Linear stability of a fixed point, judged from the Jacobian's spectrum
/// (real parts for flows, moduli relative to 1 for maps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Unstable,
    Saddle,
    NonHyperbolic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumResult {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Row-major Jacobian of the vector field (or map) at `state`.
    pub jacobian: Vec<f64>,
    pub eigenpairs: Vec<EigenPair>,
    pub stability: Stability,
}

/// Newton iteration for `f(x) = 0` (flows) or `f(x) = x` (maps), followed by
/// an eigen-decomposition of the Jacobian at the solution.
pub fn solve_equilibrium<F>(
    field: &F,
    params: &[f64],
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<EquilibriumResult>
where
    F: VectorField<f64> + VectorField<Dual> + ?Sized,
{
    let dim = VectorField::<f64>::dimension(field);
    if dim == 0 {
        bail!("System has zero dimension.");
    }
    if initial_guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            initial_guess.len()
        );
    }
    let expected_params = VectorField::<f64>::parameter_count(field);
    if params.len() != expected_params {
        bail!(
            "Parameter count mismatch. Expected {}, got {}.",
            expected_params,
            params.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let kind = VectorField::<f64>::kind(field);
    let system = DifferentiableSystem::new(field, params);
    let mut state = initial_guess.to_vec();
    let mut residual = vec![0.0; dim];
    evaluate_residual(&system, kind, &state, &mut residual);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    loop {
        if !residual_norm.is_finite() {
            bail!("Residual became non-finite after {} Newton steps.", iterations);
        }
        if residual_norm <= settings.tolerance {
            break;
        }

        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let jac = residual_jacobian(&system, kind, &state);
        let delta = solve_linear_system(dim, &jac, &residual)
            .context("Failed to solve linear system during Newton iteration.")?;

        for i in 0..dim {
            state[i] -= settings.damping * delta[i];
        }

        iterations += 1;
        evaluate_residual(&system, kind, &state, &mut residual);
        residual_norm = l2_norm(&residual);
    }

    let jac = jacobian(&system, 0.0, &state);
    let eigenpairs = compute_eigenpairs(dim, &jac)
        .context("Failed to compute eigenvalues/eigenvectors of Jacobian.")?;
    let stability = classify(kind, &eigenpairs);
    debug!(?state, iterations, ?stability, "equilibrium found");

    Ok(EquilibriumResult {
        state,
        residual_norm,
        iterations,
        jacobian: jac,
        eigenpairs,
        stability,
    })
}

fn evaluate_residual<S: DynamicalSystem<f64>>(system: &S, kind: SystemKind, state: &[f64], out: &mut [f64]) {
    system.apply(0.0, state, out);
    if kind == SystemKind::Map {
        for (o, s) in out.iter_mut().zip(state.iter()) {
            *o -= s;
        }
    }
}

fn residual_jacobian<S: DynamicalSystem<Dual>>(system: &S, kind: SystemKind, state: &[f64]) -> Vec<f64> {
    let dim = state.len();
    let mut jac = jacobian(system, 0.0, state);
    if kind == SystemKind::Map {
        for i in 0..dim {
            jac[i * dim + i] -= 1.0;
        }
    }
    jac
}

fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow!("Jacobian is singular."))
}

fn compute_eigenpairs(dim: usize, jacobian: &[f64]) -> Result<Vec<EigenPair>> {
    let matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for idx in 0..dim {
        let lambda = eigenvalues[idx];

        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        // The null vector of (J - λI) is the right singular vector of the
        // smallest singular value.
        let svd = SVD::new(shifted, true, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| anyhow!("Failed to compute eigenvector for eigenvalue index {}", idx))?;
        let smallest = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map_or(0, |(i, _)| i);
        let mut vector: Vec<Complex<f64>> = v_t.row(smallest).iter().map(|c| c.conj()).collect();
        normalize_complex_vector(&mut vector);

        pairs.push(EigenPair {
            value: lambda,
            vector,
        });
    }
    Ok(pairs)
}

fn classify(kind: SystemKind, eigenpairs: &[EigenPair]) -> Stability {
    const MARGIN: f64 = 1e-9;
    let growth: Vec<f64> = eigenpairs
        .iter()
        .map(|pair| match kind {
            SystemKind::Flow => pair.value.re,
            SystemKind::Map => pair.value.norm() - 1.0,
        })
        .collect();
    if growth.iter().any(|g| g.abs() <= MARGIN) {
        Stability::NonHyperbolic
    } else if growth.iter().all(|&g| g < 0.0) {
        Stability::Stable
    } else if growth.iter().all(|&g| g > 0.0) {
        Stability::Unstable
    } else {
        Stability::Saddle
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn normalize_complex_vector(vec: &mut [Complex<f64>]) {
    let norm = vec.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in vec {
            *entry /= norm;
        }
    }
}
