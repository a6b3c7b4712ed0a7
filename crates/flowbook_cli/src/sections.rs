use crate::config::{ChaosSection, CustomSection, OdeSection, SindySection};
use anyhow::{bail, Context, Result};
use flowbook_core::autodiff::Dual;
use flowbook_core::chaos::{attractor_trajectory, kaplan_yorke, lyapunov_spectrum, max_lyapunov, LyapunovSettings};
use flowbook_core::dataset::{Trajectory, TrajectoryComparison};
use flowbook_core::entropy::{estimate_box_sizes, generalized_dimension, permutation_entropy, DimensionEstimate};
use flowbook_core::equation_engine::EquationSystem;
use flowbook_core::equilibrium::{solve_equilibrium, EquilibriumResult, NewtonSettings};
use flowbook_core::hybrid::{recovered_terms, synthetic_observations, train, HybridConfig, RecoveredTerms};
use flowbook_core::optim::Termination;
use flowbook_core::sindy::{discover, FitMetrics, SparseModel};
use flowbook_core::solve::{solve, time_grid, Method, OdeProblem, SolverSettings};
use flowbook_core::spectrum::power_spectrum;
use flowbook_core::systems::{Henon, Lorenz, LotkaVolterra};
use flowbook_core::traits::{SystemKind, VectorField};
use serde::Serialize;
use std::ops::ControlFlow;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub samples: usize,
    pub final_time: f64,
    pub final_state: Vec<f64>,
    /// Per-component `(min, max)` over the trajectory.
    pub bounds: Vec<(f64, f64)>,
    pub equilibria: Vec<EquilibriumResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttractorReport {
    pub spectrum: Vec<f64>,
    pub max_lyapunov: f64,
    pub kaplan_yorke: f64,
    pub dimensions: Vec<DimensionEstimate>,
    pub permutation_entropy: f64,
    pub dominant_frequency: Option<f64>,
    pub spectral_flatness: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChaosReport {
    pub lorenz: AttractorReport,
    pub henon: AttractorReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub equations: Vec<String>,
    pub model: SparseModel,
    pub metrics: FitMetrics,
    pub comparison: TrajectoryComparison,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub parameters: usize,
    pub iterations: usize,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub adam: Termination,
    pub bfgs: Option<Termination>,
    pub recovered: RecoveredTerms,
    pub losses: Vec<f64>,
}

pub fn lorenz(section: &OdeSection) -> Result<SimulationReport> {
    println!("== Lorenz system ==");
    let trajectory = simulate(&Lorenz, section).context("Lorenz simulation failed")?;
    let guesses = lorenz_guesses(&section.params);
    let report = summarize(&Lorenz, &section.params, &trajectory, &guesses)?;
    print_simulation(&["x", "y", "z"], &report);
    Ok(report)
}

pub fn lotka_volterra(section: &OdeSection) -> Result<SimulationReport> {
    println!("== Lotka–Volterra system ==");
    let trajectory = simulate(&LotkaVolterra, section).context("Lotka–Volterra simulation failed")?;
    let guesses = lotka_volterra_guesses(&section.params);
    let report = summarize(&LotkaVolterra, &section.params, &trajectory, &guesses)?;
    print_simulation(&["prey", "predator"], &report);
    Ok(report)
}

pub fn chaos(section: &ChaosSection, lorenz: &OdeSection) -> Result<ChaosReport> {
    println!("== Chaos analysis ==");
    let lorenz_report = analyze_attractor(&Lorenz, &lorenz.params, &lorenz.u0, &section.lorenz, section)
        .context("Lorenz attractor analysis failed")?;
    print_attractor("Lorenz", &lorenz_report);
    let henon_report = analyze_attractor(&Henon, &Henon::PARAMS, &Henon::INITIAL_STATE, &section.henon, section)
        .context("Hénon attractor analysis failed")?;
    print_attractor("Hénon", &henon_report);
    Ok(ChaosReport {
        lorenz: lorenz_report,
        henon: henon_report,
    })
}

pub fn sindy(section: &SindySection, system: &OdeSection) -> Result<DiscoveryReport> {
    println!("== Sparse identification (Lotka–Volterra) ==");
    let (t0, t1) = section.tspan;
    let problem = OdeProblem::new(&system.u0, section.tspan, &system.params);
    let settings = section.solver.clone().with_saveat(time_grid(t0, t1, section.sample_spacing));
    let mut data = solve(&LotkaVolterra, &problem, &settings).context("Generating discovery data failed")?;
    if section.noise > 0.0 {
        data = data.with_noise(section.noise, section.seed)?;
    }

    let discovery = discover(
        &LotkaVolterra,
        &system.params,
        &["x", "y"],
        &data,
        &section.discovery,
        &section.solver,
    )?;
    for line in &discovery.equations {
        println!("  {line}");
    }
    for eq in &discovery.metrics.equations {
        println!(
            "  {}: {} terms, R² = {:.6}, AICc = {:.2}",
            eq.variable, eq.active_terms, eq.r_squared, eq.aicc
        );
    }
    println!(
        "  re-simulation: max |error| = {:.3e}, RMSE = {:.3e}",
        discovery.comparison.max_abs_error, discovery.comparison.rmse
    );
    Ok(DiscoveryReport {
        equations: discovery.equations,
        model: discovery.model,
        metrics: discovery.metrics,
        comparison: discovery.comparison,
    })
}

pub fn hybrid(config: &HybridConfig) -> Result<TrainingReport> {
    println!("== Hybrid Lotka–Volterra training ==");
    let data = synthetic_observations(config)?;
    let result = train(config, &data, |_, _, _| ControlFlow::Continue(()))?;
    let recovered = recovered_terms(&result.model, &result.params, &data.u)?;
    let report = TrainingReport {
        parameters: result.params.len(),
        iterations: result.losses.len().saturating_sub(1),
        initial_loss: result.losses.first().copied().unwrap_or(f64::NAN),
        final_loss: result.final_loss(),
        adam: result.adam,
        bfgs: result.bfgs,
        recovered,
        losses: result.losses,
    };
    println!(
        "  {} parameters, {} iterations: loss {:.4e} -> {:.4e}",
        report.parameters, report.iterations, report.initial_loss, report.final_loss
    );
    println!("  Adam stopped: {:?}", report.adam);
    if let Some(bfgs) = report.bfgs {
        println!("  BFGS stopped: {bfgs:?}");
    }
    println!(
        "  interaction RMSE: prey {:.4e}, predator {:.4e}",
        recovered.rmse[0], recovered.rmse[1]
    );
    Ok(report)
}

pub fn custom(section: &CustomSection) -> Result<SimulationReport> {
    println!("== User-defined system ==");
    let variables: Vec<&str> = section.variables.iter().map(String::as_str).collect();
    let parameters: Vec<&str> = section.parameters.iter().map(String::as_str).collect();
    let equations: Vec<&str> = section.equations.iter().map(String::as_str).collect();
    let kind = if section.map { SystemKind::Map } else { SystemKind::Flow };
    let system = EquationSystem::compile(&variables, &parameters, &equations, kind)?;

    let mut problem = section.problem.clone();
    if section.map && problem.solver.method != Method::Discrete {
        warn!(method = ?problem.solver.method, "map systems are iterated; switching to the discrete stepper");
        problem.solver = SolverSettings::fixed(Method::Discrete, 1.0);
    }
    let trajectory = simulate(&system, &problem).context("Simulating the user-defined system failed")?;
    let guess = trajectory.final_state().map(<[f64]>::to_vec).unwrap_or_default();
    let report = summarize(&system, &problem.params, &trajectory, &[guess])?;
    print_simulation(&variables, &report);
    Ok(report)
}

fn simulate<F>(field: &F, section: &OdeSection) -> Result<Trajectory>
where
    F: VectorField<f64> + ?Sized,
{
    let problem = OdeProblem::new(&section.u0, section.tspan, &section.params);
    Ok(solve(field, &problem, &section.solver)?)
}

fn summarize<F>(field: &F, params: &[f64], trajectory: &Trajectory, guesses: &[Vec<f64>]) -> Result<SimulationReport>
where
    F: VectorField<f64> + VectorField<Dual> + ?Sized,
{
    let Some(final_state) = trajectory.final_state() else {
        bail!("Solver returned an empty trajectory.");
    };
    let mut equilibria: Vec<EquilibriumResult> = Vec::new();
    for guess in guesses {
        match solve_equilibrium(field, params, guess, NewtonSettings::default()) {
            Ok(found) => {
                let duplicate = equilibria.iter().any(|known| distance(&known.state, &found.state) < 1e-6);
                if !duplicate {
                    equilibria.push(found);
                }
            }
            Err(err) => warn!(?guess, "equilibrium search failed: {err:#}"),
        }
    }
    Ok(SimulationReport {
        samples: trajectory.len(),
        final_time: trajectory.t.last().copied().unwrap_or(f64::NAN),
        final_state: final_state.to_vec(),
        bounds: trajectory.to_dataset().bounds(),
        equilibria,
    })
}

fn analyze_attractor<F>(
    field: &F,
    params: &[f64],
    initial_state: &[f64],
    settings: &LyapunovSettings,
    section: &ChaosSection,
) -> Result<AttractorReport>
where
    F: VectorField<f64> + VectorField<Dual> + ?Sized,
{
    let spectrum = lyapunov_spectrum(field, params, initial_state, settings)?;
    let max_lyapunov = max_lyapunov(field, params, initial_state, settings, section.d0)?;
    let kaplan_yorke = kaplan_yorke(&spectrum);

    let trajectory = attractor_trajectory(field, params, initial_state, settings)?;
    if trajectory.len() < 2 {
        bail!("Attractor sample has fewer than two points.");
    }
    let dataset = trajectory.to_dataset();
    let box_sizes = estimate_box_sizes(&dataset, section.box_sizes)?;
    let dimensions = section
        .orders
        .iter()
        .map(|&q| generalized_dimension(q, &dataset, &box_sizes))
        .collect::<Result<Vec<_>>>()?;

    let series = trajectory.component(0);
    let permutation_entropy = permutation_entropy(&series, section.permutation_order, section.permutation_delay)?;
    let sample_dt = trajectory.t[1] - trajectory.t[0];
    let power = power_spectrum(&series, sample_dt)?;

    Ok(AttractorReport {
        spectrum,
        max_lyapunov,
        kaplan_yorke,
        dimensions,
        permutation_entropy,
        dominant_frequency: power.dominant_frequency(),
        spectral_flatness: power.flatness(),
    })
}

fn lorenz_guesses(params: &[f64]) -> Vec<Vec<f64>> {
    let mut guesses = vec![vec![0.0; 3]];
    if let [_, rho, beta] = params {
        if *rho > 1.0 {
            let c = (beta * (rho - 1.0)).sqrt();
            guesses.push(vec![c, c, rho - 1.0]);
            guesses.push(vec![-c, -c, rho - 1.0]);
        }
    }
    guesses
}

fn lotka_volterra_guesses(params: &[f64]) -> Vec<Vec<f64>> {
    let mut guesses = vec![vec![0.0; 2]];
    if let [alpha, beta, gamma, delta] = params {
        let coexistence = vec![gamma / delta, alpha / beta];
        if coexistence.iter().all(|v| v.is_finite()) {
            guesses.push(coexistence);
        }
    }
    guesses
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn format_vector(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

fn print_simulation(names: &[&str], report: &SimulationReport) {
    println!(
        "  {} samples, state at t = {:.3}: {}",
        report.samples,
        report.final_time,
        format_vector(&report.final_state)
    );
    for (name, (lo, hi)) in names.iter().zip(&report.bounds) {
        println!("  {name} in [{lo:.4}, {hi:.4}]");
    }
    for eq in &report.equilibria {
        println!("  fixed point {} is {:?}", format_vector(&eq.state), eq.stability);
    }
}

fn print_attractor(name: &str, report: &AttractorReport) {
    println!("  {name}: Lyapunov spectrum {}", format_vector(&report.spectrum));
    println!(
        "  {name}: max exponent {:.4}, Kaplan–Yorke dimension {:.4}",
        report.max_lyapunov, report.kaplan_yorke
    );
    for dim in &report.dimensions {
        println!("  {name}: D_{} = {:.4}", dim.q, dim.dimension);
    }
    println!(
        "  {name}: permutation entropy {:.4}, spectral flatness {:.4}",
        report.permutation_entropy, report.spectral_flatness
    );
}
