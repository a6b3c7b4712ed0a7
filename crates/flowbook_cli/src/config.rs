use anyhow::{Context, Result};
use flowbook_core::chaos::LyapunovSettings;
use flowbook_core::hybrid::HybridConfig;
use flowbook_core::sindy::SindyConfig;
use flowbook_core::solve::SolverSettings;
use flowbook_core::systems::{Lorenz, LotkaVolterra};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One simulated system: initial state, span, parameters and solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeSection {
    pub u0: Vec<f64>,
    pub tspan: (f64, f64),
    pub params: Vec<f64>,
    #[serde(default)]
    pub solver: SolverSettings,
}

impl OdeSection {
    fn lorenz() -> Self {
        Self {
            u0: Lorenz::INITIAL_STATE.to_vec(),
            tspan: (0.0, 100.0),
            params: Lorenz::PARAMS.to_vec(),
            solver: SolverSettings::default(),
        }
    }

    fn lotka_volterra() -> Self {
        Self {
            u0: LotkaVolterra::INITIAL_STATE.to_vec(),
            tspan: (0.0, 10.0),
            params: LotkaVolterra::PARAMS.to_vec(),
            solver: SolverSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosSection {
    pub lorenz: LyapunovSettings,
    pub henon: LyapunovSettings,
    /// Initial separation for the two-trajectory estimate.
    pub d0: f64,
    /// Rényi orders for the entropy and dimension estimates.
    pub orders: Vec<f64>,
    pub box_sizes: usize,
    pub permutation_order: usize,
    pub permutation_delay: usize,
}

impl Default for ChaosSection {
    fn default() -> Self {
        Self {
            lorenz: LyapunovSettings::default(),
            henon: LyapunovSettings::for_map(20_000),
            d0: 1e-9,
            orders: vec![0.0, 1.0, 2.0],
            box_sizes: 10,
            permutation_order: 4,
            permutation_delay: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SindySection {
    pub tspan: (f64, f64),
    pub sample_spacing: f64,
    /// Relative measurement noise added before fitting.
    pub noise: f64,
    pub seed: u64,
    pub discovery: SindyConfig,
    pub solver: SolverSettings,
}

impl Default for SindySection {
    fn default() -> Self {
        Self {
            tspan: (0.0, 10.0),
            sample_spacing: 0.05,
            noise: 0.0,
            seed: 42,
            discovery: SindyConfig::default(),
            solver: SolverSettings::default(),
        }
    }
}

/// A system written as equation strings, one per variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSection {
    pub variables: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
    pub equations: Vec<String>,
    /// Treat the equations as a map `x -> f(x)` instead of a flow.
    #[serde(default)]
    pub map: bool,
    #[serde(flatten)]
    pub problem: OdeSection,
}

/// Settings for every notebook section. Omitted sections take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookConfig {
    pub lorenz: OdeSection,
    pub lotka_volterra: OdeSection,
    pub chaos: ChaosSection,
    pub sindy: SindySection,
    pub hybrid: HybridConfig,
    pub custom: Option<CustomSection>,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            lorenz: OdeSection::lorenz(),
            lotka_volterra: OdeSection::lotka_volterra(),
            chaos: ChaosSection::default(),
            sindy: SindySection::default(),
            hybrid: HybridConfig::default(),
            custom: None,
        }
    }
}

impl NotebookConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
