//! flowbook: runs the dynamical-systems notebook sections from the command line.

mod config;
mod sections;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::NotebookConfig;
use sections::{ChaosReport, DiscoveryReport, SimulationReport, TrainingReport};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowbook", version, about = "ODE solving, chaos analysis, SINDy and hybrid training walkthrough")]
struct Cli {
    /// JSON file with section settings; omitted sections use defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write the section results to this JSON file
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Simulate the Lorenz system and locate its fixed points
    Lorenz,
    /// Simulate the Lotka–Volterra system and locate its fixed points
    LotkaVolterra,
    /// Lyapunov exponents, entropies and dimensions of the Lorenz and Hénon attractors
    Chaos,
    /// Recover the Lotka–Volterra equations by sparse regression
    Sindy,
    /// Train the neural interaction terms of a hybrid Lotka–Volterra model
    Hybrid,
    /// Solve the system given in the `custom` config section
    Equations,
    /// Run every section in order
    All,
}

#[derive(Debug, Default, Serialize)]
struct NotebookReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    lorenz: Option<SimulationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lotka_volterra: Option<SimulationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chaos: Option<ChaosReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sindy: Option<DiscoveryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hybrid: Option<TrainingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom: Option<SimulationReport>,
}

fn run(command: Commands, config: &NotebookConfig) -> Result<NotebookReport> {
    let all = command == Commands::All;
    let mut report = NotebookReport::default();

    if all || command == Commands::Lorenz {
        report.lorenz = Some(sections::lorenz(&config.lorenz)?);
    }
    if all || command == Commands::LotkaVolterra {
        report.lotka_volterra = Some(sections::lotka_volterra(&config.lotka_volterra)?);
    }
    if all || command == Commands::Chaos {
        report.chaos = Some(sections::chaos(&config.chaos, &config.lorenz)?);
    }
    if all || command == Commands::Sindy {
        report.sindy = Some(sections::sindy(&config.sindy, &config.lotka_volterra)?);
    }
    if all || command == Commands::Hybrid {
        report.hybrid = Some(sections::hybrid(&config.hybrid)?);
    }
    match (&config.custom, command) {
        (Some(custom), Commands::Equations | Commands::All) => {
            report.custom = Some(sections::custom(custom)?);
        }
        (None, Commands::Equations) => bail!("The config has no `custom` section to solve."),
        _ => {}
    }
    Ok(report)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = NotebookConfig::load(cli.config.as_deref())?;
    let report = run(cli.command, &config)?;

    if let Some(path) = cli.output {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize results")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "results written");
    }
    Ok(())
}
