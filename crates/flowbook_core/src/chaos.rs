use crate::{
    autodiff::{DifferentiableSystem, Dual, TangentSystem},
    dataset::{Dataset, Trajectory},
    solve::Method,
    traits::{DynamicalSystem, Parameterized, Steppable, SystemKind, VectorField},
};
use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::QR;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixed-step evolution settings shared by the chaos estimators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyapunovSettings {
    pub method: Method,
    pub dt: f64,
    /// Steps accumulated into the estimate.
    pub steps: usize,
    /// Steps between re-orthonormalisations (or renormalisations).
    pub qr_stride: usize,
    /// Steps evolved and discarded before accumulating.
    pub transient_steps: usize,
}

impl Default for LyapunovSettings {
    fn default() -> Self {
        Self {
            method: Method::Tsit5,
            dt: 0.01,
            steps: 10_000,
            qr_stride: 1,
            transient_steps: 1_000,
        }
    }
}

impl LyapunovSettings {
    /// Settings for iterated maps: one iteration per step.
    pub fn for_map(steps: usize) -> Self {
        Self {
            method: Method::Discrete,
            dt: 1.0,
            steps,
            qr_stride: 1,
            transient_steps: 100,
        }
    }

    fn validate<F: VectorField<f64> + ?Sized>(
        &self,
        field: &F,
        params: &[f64],
        initial_state: &[f64],
    ) -> Result<()> {
        if initial_state.is_empty() {
            bail!("Initial state must have positive dimension.");
        }
        if initial_state.len() != field.dimension() {
            bail!(
                "Initial state dimension mismatch. Expected {}, got {}.",
                field.dimension(),
                initial_state.len()
            );
        }
        if params.len() != field.parameter_count() {
            bail!(
                "Parameter count mismatch. Expected {}, got {}.",
                field.parameter_count(),
                params.len()
            );
        }
        if self.steps == 0 {
            bail!("Lyapunov computation requires at least one integration step.");
        }
        if self.dt <= 0.0 {
            bail!("Step size dt must be positive.");
        }
        if self.qr_stride == 0 {
            bail!("qr_stride must be at least 1.");
        }
        if self.method.is_adaptive() {
            bail!("Chaos estimators need a fixed-step method, got {:?}.", self.method);
        }
        if (field.kind() == SystemKind::Map) != (self.method == Method::Discrete) {
            bail!("{:?} cannot evolve a {:?} system.", self.method, field.kind());
        }
        Ok(())
    }
}

/// Evolves `initial_state` through the transient and returns the state reached.
fn skip_transient<S: DynamicalSystem<f64>>(
    system: &S,
    settings: &LyapunovSettings,
    initial_state: &[f64],
) -> Result<(f64, Vec<f64>)> {
    let mut state = initial_state.to_vec();
    let mut t = 0.0;
    let mut stepper = settings.method.stepper::<f64>(state.len());
    for _ in 0..settings.transient_steps {
        stepper.step(system, &mut t, &mut state, settings.dt);
    }
    if state.iter().any(|v| !v.is_finite()) {
        bail!("State diverged during the transient.");
    }
    Ok((t, state))
}

/// Full Lyapunov spectrum via tangent-space evolution and periodic QR
/// re-orthonormalisation. Exponents are returned in the order of the QR
/// columns (descending for a well-converged run).
pub fn lyapunov_spectrum<F>(
    field: &F,
    params: &[f64],
    initial_state: &[f64],
    settings: &LyapunovSettings,
) -> Result<Vec<f64>>
where
    F: VectorField<f64> + VectorField<Dual> + ?Sized,
{
    settings.validate(field, params, initial_state)?;

    let system = DifferentiableSystem::new(field, params);
    let (mut t, start) = skip_transient(&system, settings, initial_state)?;

    let dim = start.len();
    let aug_dim = dim + dim * dim;
    let mut augmented_state = vec![0.0; aug_dim];
    augmented_state[..dim].copy_from_slice(&start);
    for i in 0..dim {
        augmented_state[dim + i * dim + i] = 1.0;
    }

    let tangent_system = TangentSystem::new(system, dim);
    let mut stepper = settings.method.stepper::<f64>(aug_dim);
    let mut accum = vec![0.0; dim];
    let mut since_last_qr = 0usize;
    let mut total_time = 0.0;

    for step in 1..=settings.steps {
        stepper.step(&tangent_system, &mut t, &mut augmented_state, settings.dt);
        since_last_qr += 1;
        total_time += settings.dt;

        if since_last_qr == settings.qr_stride || step == settings.steps {
            apply_qr(&mut augmented_state[dim..], dim, &mut accum)?;
            since_last_qr = 0;
        }
    }

    if total_time <= 0.0 {
        bail!("Total integration time is zero; cannot normalize exponents.");
    }

    for value in &mut accum {
        *value /= total_time;
    }
    debug!(exponents = ?accum, total_time, "lyapunov spectrum");

    Ok(accum)
}

fn apply_qr(phi_slice: &mut [f64], dim: usize, accum: &mut [f64]) -> Result<()> {
    if phi_slice.len() != dim * dim {
        bail!("Tangent matrix slice has incorrect size.");
    }
    let matrix = DMatrix::from_row_slice(dim, dim, phi_slice);
    let qr = QR::new(matrix);
    let (q, r) = qr.unpack();
    for i in 0..dim {
        let diag = r[(i, i)].abs();
        if diag <= f64::EPSILON {
            return Err(anyhow!(
                "Encountered near-singular R matrix during orthonormalization."
            ));
        }
        accum[i] += diag.ln();
    }
    // nalgebra is column-major; the tangent block is row-major.
    for i in 0..dim {
        for j in 0..dim {
            phi_slice[i * dim + j] = q[(i, j)];
        }
    }
    Ok(())
}

/// Largest Lyapunov exponent from the divergence of two nearby trajectories
/// (Benettin's method), renormalising the separation to `d0` every
/// `qr_stride` steps.
pub fn max_lyapunov<F>(
    field: &F,
    params: &[f64],
    initial_state: &[f64],
    settings: &LyapunovSettings,
    d0: f64,
) -> Result<f64>
where
    F: VectorField<f64> + ?Sized,
{
    settings.validate(field, params, initial_state)?;
    if !(d0 > 0.0) {
        bail!("Initial separation d0 must be positive.");
    }

    let system = Parameterized::new(field, params);
    let (t_start, start) = skip_transient(&system, settings, initial_state)?;
    let dim = start.len();

    let mut reference = start.clone();
    let mut perturbed = start;
    let offset = d0 / (dim as f64).sqrt();
    for value in &mut perturbed {
        *value += offset;
    }

    let mut ref_stepper = settings.method.stepper::<f64>(dim);
    let mut pert_stepper = settings.method.stepper::<f64>(dim);
    let (mut t_ref, mut t_pert) = (t_start, t_start);
    let mut log_sum = 0.0;
    let mut since_renorm = 0usize;
    let mut total_time = 0.0;

    for step in 1..=settings.steps {
        ref_stepper.step(&system, &mut t_ref, &mut reference, settings.dt);
        pert_stepper.step(&system, &mut t_pert, &mut perturbed, settings.dt);
        since_renorm += 1;
        total_time += settings.dt;

        if since_renorm == settings.qr_stride || step == settings.steps {
            let distance = reference
                .iter()
                .zip(perturbed.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            if !distance.is_finite() {
                bail!("Trajectory separation became non-finite.");
            }
            if distance <= 0.0 {
                bail!("Trajectories collapsed onto each other; increase d0.");
            }
            log_sum += (distance / d0).ln();
            let scale = d0 / distance;
            for (p, r) in perturbed.iter_mut().zip(reference.iter()) {
                *p = r + (*p - r) * scale;
            }
            since_renorm = 0;
        }
    }

    Ok(log_sum / total_time)
}

pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    if exponents.is_empty() {
        return 0.0;
    }
    let mut sorted = exponents.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut partial = 0.0;
    let mut k = 0usize;
    for (idx, &lambda) in sorted.iter().enumerate() {
        let new_sum = partial + lambda;
        if new_sum >= 0.0 {
            partial = new_sum;
            k = idx + 1;
        } else {
            if lambda.abs() <= f64::EPSILON {
                return k as f64;
            }
            return k as f64 + partial / lambda.abs();
        }
    }

    k as f64
}

/// Samples the attractor: discards `transient_steps`, then records every
/// `qr_stride`-th step for `steps` steps.
pub fn attractor_trajectory<F>(
    field: &F,
    params: &[f64],
    initial_state: &[f64],
    settings: &LyapunovSettings,
) -> Result<Trajectory>
where
    F: VectorField<f64> + ?Sized,
{
    settings.validate(field, params, initial_state)?;
    let system = Parameterized::new(field, params);
    let (mut t, mut state) = skip_transient(&system, settings, initial_state)?;
    let mut stepper = settings.method.stepper::<f64>(state.len());

    let mut out = Trajectory::with_capacity(settings.steps / settings.qr_stride + 1);
    out.push(t, &state);
    for step in 1..=settings.steps {
        stepper.step(&system, &mut t, &mut state, settings.dt);
        if step % settings.qr_stride == 0 {
            if state.iter().any(|v| !v.is_finite()) {
                bail!("State became non-finite at t = {t}.");
            }
            out.push(t, &state);
        }
    }
    Ok(out)
}

/// Convenience wrapper returning the sampled attractor as a point cloud.
pub fn attractor<F>(
    field: &F,
    params: &[f64],
    initial_state: &[f64],
    settings: &LyapunovSettings,
) -> Result<Dataset>
where
    F: VectorField<f64> + ?Sized,
{
    Ok(attractor_trajectory(field, params, initial_state, settings)?.to_dataset())
}

#[cfg(test)]
mod tests {
    use super::{apply_qr, attractor, kaplan_yorke, lyapunov_spectrum, max_lyapunov, LyapunovSettings};
    use crate::solve::Method;
    use crate::systems::{Henon, Lorenz, Rossler};
    use crate::traits::{Scalar, VectorField};
    use nalgebra::linalg::QR;
    use nalgebra::DMatrix;

    #[derive(Clone, Copy)]
    struct LinearSystem;

    impl<T: Scalar> VectorField<T> for LinearSystem {
        fn dimension(&self) -> usize {
            1
        }

        fn parameter_count(&self) -> usize {
            1
        }

        fn rhs(&self, du: &mut [T], u: &[T], p: &[T], _t: T) {
            du[0] = p[0] * u[0];
        }
    }

    struct LinearMap;

    impl<T: Scalar> VectorField<T> for LinearMap {
        fn dimension(&self) -> usize {
            1
        }

        fn parameter_count(&self) -> usize {
            1
        }

        fn rhs(&self, du: &mut [T], u: &[T], p: &[T], _t: T) {
            du[0] = p[0] * u[0];
        }

        fn kind(&self) -> crate::traits::SystemKind {
            crate::traits::SystemKind::Map
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn linear_settings(steps: usize) -> LyapunovSettings {
        LyapunovSettings {
            method: Method::Rk4,
            dt: 0.05,
            steps,
            qr_stride: 1,
            transient_steps: 0,
        }
    }

    #[test]
    fn lyapunov_spectrum_rejects_invalid_inputs() {
        let settings = linear_settings(10);
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[1.0], &[], &settings),
            "Initial state",
        );
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[1.0], &[1.0], &linear_settings(0)),
            "at least one integration step",
        );
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[1.0], &[1.0], &LyapunovSettings { dt: 0.0, ..settings }),
            "dt must be positive",
        );
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[1.0], &[1.0], &LyapunovSettings { qr_stride: 0, ..settings }),
            "qr_stride",
        );
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[1.0], &[1.0], &LyapunovSettings { method: Method::Dopri5, ..settings }),
            "fixed-step",
        );
        assert_err_contains(
            lyapunov_spectrum(&LinearSystem, &[], &[1.0], &settings),
            "Parameter count",
        );
    }

    #[test]
    fn lyapunov_spectrum_discrete_map_matches_log_growth() {
        let settings = LyapunovSettings {
            transient_steps: 0,
            ..LyapunovSettings::for_map(8)
        };
        let exponents = lyapunov_spectrum(&LinearMap, &[2.0], &[1.0], &settings)
            .expect("lyapunov exponents should compute");
        let expected = 2.0_f64.ln();
        assert!((exponents[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn lyapunov_spectrum_tracks_linear_rate() {
        let exponents = lyapunov_spectrum(&LinearSystem, &[-1.0], &[1.0], &linear_settings(100))
            .expect("lyapunov exponents should compute");
        assert!((exponents[0] + 1.0).abs() < 1e-2);
    }

    #[test]
    fn lorenz_spectrum_has_one_positive_exponent_and_correct_sum() {
        let settings = LyapunovSettings {
            steps: 20_000,
            ..LyapunovSettings::default()
        };
        let exponents = lyapunov_spectrum(&Lorenz, &Lorenz::PARAMS, &[1.0, 1.0, 1.0], &settings)
            .expect("lorenz spectrum");
        assert!(exponents[0] > 0.6 && exponents[0] < 1.2, "{exponents:?}");
        assert!(exponents[1].abs() < 0.1, "{exponents:?}");
        let trace = -(10.0 + 1.0 + 8.0 / 3.0);
        let sum: f64 = exponents.iter().sum();
        assert!((sum - trace).abs() < 0.05, "sum {sum}");
        let ky = kaplan_yorke(&exponents);
        assert!(ky > 2.0 && ky < 2.1, "kaplan-yorke {ky}");
    }

    #[test]
    fn rossler_spectrum_is_weakly_chaotic() {
        let settings = LyapunovSettings {
            steps: 50_000,
            ..LyapunovSettings::default()
        };
        let exponents = lyapunov_spectrum(&Rossler, &Rossler::PARAMS, &Rossler::INITIAL_STATE, &settings)
            .expect("rossler spectrum");
        // Reference spectrum at (0.2, 0.2, 5.7) is about (0.07, 0, -5.4).
        assert!(exponents[0] > 0.03 && exponents[0] < 0.12, "{exponents:?}");
        assert!(exponents[2] < -4.0, "{exponents:?}");
        let ky = kaplan_yorke(&exponents);
        assert!(ky > 1.95 && ky < 2.05, "kaplan-yorke {ky}");
    }

    #[test]
    fn max_lyapunov_agrees_with_spectrum_for_henon() {
        let settings = LyapunovSettings::for_map(20_000);
        let lambda = max_lyapunov(&Henon, &Henon::PARAMS, &[0.1, 0.1], &settings, 1e-9)
            .expect("max lyapunov");
        // Reference value for the Hénon map at (1.4, 0.3) is about 0.419.
        assert!((lambda - 0.42).abs() < 0.03, "lambda {lambda}");
    }

    #[test]
    fn max_lyapunov_rejects_non_positive_separation() {
        assert_err_contains(
            max_lyapunov(&LinearSystem, &[1.0], &[1.0], &linear_settings(10), 0.0),
            "d0",
        );
    }

    #[test]
    fn apply_qr_writes_q_row_major_and_accumulates_logs() {
        let dim = 2;
        let mut phi = vec![1.0, 2.0, 3.0, 4.0];
        let original = phi.clone();
        let mut accum = vec![0.0; dim];

        apply_qr(&mut phi, dim, &mut accum).expect("QR should succeed");

        let matrix = DMatrix::from_row_slice(dim, dim, &original);
        let qr = QR::new(matrix);
        let (q, r) = qr.unpack();

        for i in 0..dim {
            for j in 0..dim {
                assert!((phi[i * dim + j] - q[(i, j)]).abs() < 1e-12);
            }
            let expected = r[(i, i)].abs().ln();
            assert!((accum[i] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn apply_qr_rejects_near_singular_matrix() {
        let dim = 2;
        let mut phi = vec![0.0; dim * dim];
        let mut accum = vec![0.0; dim];

        assert_err_contains(
            apply_qr(&mut phi, dim, &mut accum),
            "near-singular R matrix",
        );
    }

    #[test]
    fn kaplan_yorke_handles_empty_and_partial_sum() {
        assert_eq!(kaplan_yorke(&[]), 0.0);
        let result = kaplan_yorke(&[0.1, 0.0, -1.0]);
        assert!((result - 2.1).abs() < 1e-12);
    }

    #[test]
    fn attractor_sampling_respects_stride() {
        let settings = LyapunovSettings {
            steps: 1_000,
            qr_stride: 10,
            transient_steps: 100,
            ..LyapunovSettings::default()
        };
        let cloud = attractor(&Lorenz, &Lorenz::PARAMS, &[1.0, 1.0, 1.0], &settings).expect("attractor");
        assert_eq!(cloud.len(), 101);
        assert_eq!(cloud.dimension, 3);
    }
}
