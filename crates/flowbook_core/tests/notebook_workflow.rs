use flowbook_core::chaos::{attractor, kaplan_yorke, lyapunov_spectrum, max_lyapunov, LyapunovSettings};
use flowbook_core::entropy::{estimate_box_sizes, generalized_dimension};
use flowbook_core::hybrid::{synthetic_observations, train, HybridConfig, HybridLoss, HybridLotkaVolterra};
use flowbook_core::optim::{AdamSettings, BfgsSettings, Termination};
use flowbook_core::sindy::{discover, SindyConfig};
use flowbook_core::solve::{solve, time_grid, OdeProblem, SolverSettings};
use flowbook_core::systems::{Lorenz, LotkaVolterra};
use flowbook_core::traits::VectorField;
use std::ops::ControlFlow;

#[test]
fn vector_fields_match_reference_values() {
    let mut du = [0.0; 3];
    Lorenz.rhs(&mut du, &[1.0, 5.0, 10.0], &Lorenz::PARAMS, 0.0);
    assert!((du[0] - 40.0).abs() < 1e-12);
    assert!((du[1] - 13.0).abs() < 1e-12);
    assert!((du[2] - (5.0 - 80.0 / 3.0)).abs() < 1e-12);

    let du = LotkaVolterra.rhs_owned(&[1.0, 1.0], &LotkaVolterra::PARAMS, 0.0);
    assert_eq!(du, vec![0.5, -2.0]);
}

#[test]
fn lorenz_simulation_feeds_chaos_analysis() {
    let problem = OdeProblem::new(&Lorenz::INITIAL_STATE, (0.0, 20.0), &Lorenz::PARAMS);
    let trajectory = solve(&Lorenz, &problem, &SolverSettings::default()).expect("lorenz solve");
    assert_eq!(trajectory.t.last().copied(), Some(20.0));
    let start = trajectory.final_state().expect("final state").to_vec();

    let settings = LyapunovSettings {
        steps: 20_000,
        ..LyapunovSettings::default()
    };
    let spectrum = lyapunov_spectrum(&Lorenz, &Lorenz::PARAMS, &start, &settings).expect("spectrum");
    assert!(spectrum[0] > 0.6, "{spectrum:?}");
    let lambda = max_lyapunov(&Lorenz, &Lorenz::PARAMS, &start, &settings, 1e-9).expect("max exponent");
    assert!(lambda > 0.6 && lambda < 1.2, "lambda {lambda}");
    let ky = kaplan_yorke(&spectrum);
    assert!(ky > 2.0 && ky < 2.1, "kaplan-yorke {ky}");

    let cloud = attractor(&Lorenz, &Lorenz::PARAMS, &start, &settings).expect("attractor");
    let sizes = estimate_box_sizes(&cloud, 8).expect("box sizes");
    let d0 = generalized_dimension(0.0, &cloud, &sizes).expect("capacity dimension");
    assert!(d0.dimension > 1.4 && d0.dimension < 2.6, "{d0:?}");
}

#[test]
fn lotka_volterra_discovery_recovers_the_generating_model() {
    let problem = OdeProblem::new(&LotkaVolterra::INITIAL_STATE, (0.0, 10.0), &LotkaVolterra::PARAMS);
    let settings = SolverSettings::default().with_saveat(time_grid(0.0, 10.0, 0.05));
    let data = solve(&LotkaVolterra, &problem, &settings).expect("lv solve");

    let discovery = discover(
        &LotkaVolterra,
        &LotkaVolterra::PARAMS,
        &["x", "y"],
        &data,
        &SindyConfig::default(),
        &SolverSettings::default(),
    )
    .expect("discovery");

    let [alpha, beta, gamma, delta] = LotkaVolterra::PARAMS;
    let model = &discovery.model;
    for (var, term, expected) in [("x", "x", alpha), ("x", "x*y", -beta), ("y", "y", -gamma), ("y", "x*y", delta)] {
        let c = model.coefficient(var, term).expect("term");
        assert!((c - expected).abs() < 1e-6, "{var} {term}: {c}");
    }
    assert_eq!(model.active_terms(), 4);
    assert!(discovery.comparison.max_abs_error < 1e-3);
}

#[test]
fn short_hybrid_run_trains_with_adam_then_bfgs() {
    let config = HybridConfig {
        hidden: vec![3],
        tspan: (0.0, 2.0),
        noise: 0.0,
        adam: AdamSettings {
            learning_rate: 0.02,
            iterations: 20,
            ..AdamSettings::default()
        },
        bfgs: Some(BfgsSettings {
            max_iter: 10,
            ..BfgsSettings::default()
        }),
        ..HybridConfig::default()
    };
    let data = synthetic_observations(&config).expect("observations");

    let mut seen = Vec::new();
    let result = train(&config, &data, |iteration, loss, _| {
        seen.push((iteration, loss));
        ControlFlow::Continue(())
    })
    .expect("training");

    assert_eq!(result.adam, Termination::IterationLimit);
    assert!(result.bfgs.is_some());
    assert_eq!(seen.len(), result.losses.len());
    assert!(seen.iter().enumerate().all(|(i, (iteration, _))| *iteration == i));
    assert!(result.final_loss() < result.losses[0]);

    let [alpha, _, gamma, _] = LotkaVolterra::PARAMS;
    let model = HybridLotkaVolterra::new(alpha, gamma, &config.hidden).expect("model");
    let loss = HybridLoss::new(&model, &data, config.dt, config.method).expect("loss");
    let initial = loss.loss(&result.initial_params).expect("initial loss");
    assert!((initial - result.losses[0]).abs() < 1e-12);
}
