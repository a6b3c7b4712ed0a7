//! Hybrid (universal) differential equations: Lotka–Volterra with known
//! linear terms and a small neural network for the interaction terms.
//!
//! ```text
//! d prey/dt     =  α·prey     + NN(u; θ)[0]
//! d predator/dt = −γ·predator + NN(u; θ)[1]
//! ```
//!
//! The network parameters `θ` are the parameter vector of the vector field,
//! so the same generic integration code yields the loss in `f64` and its
//! directional derivatives in [`Dual`] numbers.

use crate::autodiff::Dual;
use crate::dataset::Trajectory;
use crate::optim::{minimize_adam, minimize_bfgs, AdamSettings, BfgsSettings, OptimizationResult, Termination};
use crate::solve::{integrate_on_grid, solve, time_grid, Method, OdeProblem, SolverSettings};
use crate::systems::LotkaVolterra;
use crate::traits::{Parameterized, Scalar, VectorField};
use anyhow::{bail, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tracing::info;

/// Fully connected network with `tanh` hidden layers and a linear output.
/// Parameters are one flat vector: for each layer, the weight matrix
/// (row-major, `out × in`) followed by the bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<usize>,
}

impl Mlp {
    pub fn new(layers: Vec<usize>) -> Result<Self> {
        if layers.len() < 2 {
            bail!("A network needs at least an input and an output layer.");
        }
        if layers.iter().any(|&n| n == 0) {
            bail!("Layer widths must be positive.");
        }
        Ok(Self { layers })
    }

    pub fn input_size(&self) -> usize {
        self.layers[0]
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1]
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.windows(2).map(|w| w[0] * w[1] + w[1]).sum()
    }

    pub fn forward<T: Scalar>(&self, params: &[T], input: &[T], out: &mut [T]) {
        let mut activation = input.to_vec();
        let mut offset = 0;
        let last = self.layers.len() - 2;
        for (layer, w) in self.layers.windows(2).enumerate() {
            let (n_in, n_out) = (w[0], w[1]);
            let weights = &params[offset..offset + n_in * n_out];
            let bias = &params[offset + n_in * n_out..offset + n_in * n_out + n_out];
            offset += n_in * n_out + n_out;

            let next: Vec<T> = (0..n_out)
                .map(|r| {
                    let z = weights[r * n_in..(r + 1) * n_in]
                        .iter()
                        .zip(activation.iter())
                        .fold(bias[r], |acc, (&wij, &a)| acc + wij * a);
                    if layer == last {
                        z
                    } else {
                        z.tanh()
                    }
                })
                .collect();
            activation = next;
        }
        out.copy_from_slice(&activation);
    }

    /// Glorot-uniform weights and zero biases; the output layer is scaled by
    /// `output_scale` so the untrained network starts close to zero.
    pub fn init_params(&self, seed: u64, output_scale: f64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(self.parameter_count());
        let last = self.layers.len() - 2;
        for (layer, w) in self.layers.windows(2).enumerate() {
            let (n_in, n_out) = (w[0], w[1]);
            let limit = (6.0 / (n_in + n_out) as f64).sqrt();
            let scale = if layer == last { output_scale } else { 1.0 };
            let dist = Uniform::new_inclusive(-limit, limit);
            params.extend((0..n_in * n_out).map(|_| scale * dist.sample(&mut rng)));
            params.extend(std::iter::repeat(0.0).take(n_out));
        }
        params
    }
}

/// Lotka–Volterra with the interaction terms replaced by a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridLotkaVolterra {
    pub alpha: f64,
    pub gamma: f64,
    pub network: Mlp,
}

impl HybridLotkaVolterra {
    pub fn new(alpha: f64, gamma: f64, hidden: &[usize]) -> Result<Self> {
        let mut layers = Vec::with_capacity(hidden.len() + 2);
        layers.push(2);
        layers.extend_from_slice(hidden);
        layers.push(2);
        Ok(Self {
            alpha,
            gamma,
            network: Mlp::new(layers)?,
        })
    }

    /// Network output alone: the learned interaction terms at `u`.
    pub fn interaction(&self, params: &[f64], u: &[f64]) -> Result<[f64; 2]> {
        if params.len() != self.network.parameter_count() {
            bail!(
                "Parameter count mismatch. Expected {}, got {}.",
                self.network.parameter_count(),
                params.len()
            );
        }
        if u.len() != 2 {
            bail!("State must have 2 components, got {}.", u.len());
        }
        let mut out = [0.0; 2];
        self.network.forward(params, u, &mut out);
        Ok(out)
    }
}

impl<T: Scalar> VectorField<T> for HybridLotkaVolterra {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }

    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], _t: T) {
        self.network.forward(p, u, du);
        du[0] = du[0] + T::constant(self.alpha) * u[0];
        du[1] = du[1] - T::constant(self.gamma) * u[1];
    }
}

/// Trajectory-matching objective for a hybrid model.
pub struct HybridLoss<'a> {
    pub model: &'a HybridLotkaVolterra,
    pub data: &'a Trajectory,
    pub dt: f64,
    pub method: Method,
}

impl<'a> HybridLoss<'a> {
    pub fn new(model: &'a HybridLotkaVolterra, data: &'a Trajectory, dt: f64, method: Method) -> Result<Self> {
        if data.len() < 2 {
            bail!("Training data needs at least two samples.");
        }
        if data.dimension() != 2 {
            bail!("Training data must be two-dimensional, got {}.", data.dimension());
        }
        Ok(Self {
            model,
            data,
            dt,
            method,
        })
    }

    /// Simulated states at the data times, starting from the first observation.
    pub fn predict<T: Scalar>(&self, params: &[T]) -> Result<Vec<Vec<T>>> {
        if params.len() != self.model.network.parameter_count() {
            bail!(
                "Parameter count mismatch. Expected {}, got {}.",
                self.model.network.parameter_count(),
                params.len()
            );
        }
        let u0: Vec<T> = self.data.u[0].iter().map(|&v| T::constant(v)).collect();
        let system = Parameterized::new(self.model, params);
        Ok(integrate_on_grid(&system, &u0, &self.data.t, self.dt, self.method)?)
    }

    /// Sum of squared differences between prediction and observations.
    pub fn evaluate<T: Scalar>(&self, params: &[T]) -> Result<T> {
        let prediction = self.predict(params)?;
        let mut loss = T::zero();
        for (predicted, observed) in prediction.iter().zip(self.data.u.iter()) {
            for (&p, &o) in predicted.iter().zip(observed.iter()) {
                let diff = p - T::constant(o);
                loss = loss + diff * diff;
            }
        }
        Ok(loss)
    }

    pub fn loss(&self, params: &[f64]) -> Result<f64> {
        self.evaluate(params)
    }

    /// Loss and its gradient, one dual-number pass per parameter.
    pub fn loss_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        let loss = self.loss(params)?;
        let mut gradient = Vec::with_capacity(params.len());
        for i in 0..params.len() {
            let seeded = Dual::seed(params, i);
            gradient.push(self.evaluate(&seeded)?.eps);
        }
        Ok((loss, gradient))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub hidden: Vec<usize>,
    pub tspan: (f64, f64),
    pub sample_spacing: f64,
    /// Noise magnitude relative to each component's mean absolute value.
    pub noise: f64,
    pub seed: u64,
    /// Integration sub-step for training simulations.
    pub dt: f64,
    pub method: Method,
    pub output_scale: f64,
    pub adam: AdamSettings,
    /// When set, BFGS continues from the Adam result.
    pub bfgs: Option<BfgsSettings>,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            hidden: vec![8],
            // About one predator-prey cycle.
            tspan: (0.0, 3.0),
            sample_spacing: 0.1,
            noise: 0.05,
            seed: 1234,
            dt: 0.05,
            method: Method::Rk4,
            output_scale: 0.1,
            adam: AdamSettings {
                learning_rate: 0.03,
                iterations: 1000,
                ..AdamSettings::default()
            },
            bfgs: Some(BfgsSettings {
                max_iter: 200,
                ..BfgsSettings::default()
            }),
        }
    }
}

/// Lotka–Volterra observations on a uniform grid with proportional
/// Gaussian noise.
pub fn synthetic_observations(config: &HybridConfig) -> Result<Trajectory> {
    let (t0, t1) = config.tspan;
    let problem = OdeProblem::new(&LotkaVolterra::INITIAL_STATE, config.tspan, &LotkaVolterra::PARAMS);
    let saveat = time_grid(t0, t1, config.sample_spacing);
    let truth = solve(&LotkaVolterra, &problem, &SolverSettings::default().with_saveat(saveat))
        .context("Simulating the reference Lotka–Volterra system failed")?;
    truth.with_noise(config.noise, config.seed)
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub model: HybridLotkaVolterra,
    pub initial_params: Vec<f64>,
    pub params: Vec<f64>,
    /// Concatenated loss trace of every optimizer stage; entry 0 is the loss
    /// of the initial parameters.
    pub losses: Vec<f64>,
    pub adam: Termination,
    pub bfgs: Option<Termination>,
}

impl TrainingResult {
    pub fn final_loss(&self) -> f64 {
        self.losses.last().copied().unwrap_or(f64::NAN)
    }
}

/// Trains a hybrid model on `data`. The callback sees the global iteration
/// index across both optimizer stages.
pub fn train<C>(config: &HybridConfig, data: &Trajectory, mut callback: C) -> Result<TrainingResult>
where
    C: FnMut(usize, f64, &[f64]) -> ControlFlow<()>,
{
    let [alpha, _, gamma, _] = LotkaVolterra::PARAMS;
    let model = HybridLotkaVolterra::new(alpha, gamma, &config.hidden)?;
    let initial_params = model.network.init_params(config.seed, config.output_scale);
    let objective = HybridLoss::new(&model, data, config.dt, config.method)?;

    info!(
        parameters = initial_params.len(),
        samples = data.len(),
        "training hybrid Lotka–Volterra model"
    );

    let adam = minimize_adam(
        |p: &[f64]| objective.loss_and_gradient(p),
        &initial_params,
        &config.adam,
        |iteration, loss, params| {
            if iteration % 50 == 0 {
                info!(iteration, loss, "adam");
            }
            callback(iteration, loss, params)
        },
    )?;
    let mut losses = adam.losses.clone();
    let mut params = adam.params.clone();

    let mut bfgs_termination = None;
    if let (Some(settings), Termination::IterationLimit) = (&config.bfgs, adam.termination) {
        let offset = adam.iterations;
        let bfgs: OptimizationResult = minimize_bfgs(
            |p: &[f64]| objective.loss_and_gradient(p),
            &params,
            settings,
            |iteration, loss, params| {
                // Iteration 0 of BFGS repeats the last Adam loss.
                if iteration == 0 {
                    return ControlFlow::Continue(());
                }
                if iteration % 10 == 0 {
                    info!(iteration = offset + iteration, loss, "bfgs");
                }
                callback(offset + iteration, loss, params)
            },
        )?;
        losses.extend_from_slice(&bfgs.losses[1..]);
        params = bfgs.params;
        bfgs_termination = Some(bfgs.termination);
    }

    info!(
        initial_loss = losses.first().copied(),
        final_loss = losses.last().copied(),
        "training finished"
    );
    Ok(TrainingResult {
        model,
        initial_params,
        params,
        losses,
        adam: adam.termination,
        bfgs: bfgs_termination,
    })
}

/// Learned versus true interaction terms, evaluated on observed states.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveredTerms {
    /// Per component: prey (`−β·prey·predator`), predator (`δ·prey·predator`).
    pub max_abs_error: [f64; 2],
    pub rmse: [f64; 2],
}

pub fn recovered_terms(model: &HybridLotkaVolterra, params: &[f64], states: &[Vec<f64>]) -> Result<RecoveredTerms> {
    if states.is_empty() {
        bail!("No states to compare on.");
    }
    let [_, beta, _, delta] = LotkaVolterra::PARAMS;
    let mut max_abs_error = [0.0_f64; 2];
    let mut sum_sq = [0.0_f64; 2];
    for u in states {
        let learned = model.interaction(params, u)?;
        let truth = [-beta * u[0] * u[1], delta * u[0] * u[1]];
        for k in 0..2 {
            let err = (learned[k] - truth[k]).abs();
            max_abs_error[k] = max_abs_error[k].max(err);
            sum_sq[k] += err * err;
        }
    }
    let n = states.len() as f64;
    Ok(RecoveredTerms {
        max_abs_error,
        rmse: [(sum_sq[0] / n).sqrt(), (sum_sq[1] / n).sqrt()],
    })
}
