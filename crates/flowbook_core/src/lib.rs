pub mod autodiff;
pub mod chaos;
pub mod dataset;
pub mod entropy;
pub mod equation_engine;
pub mod equilibrium;
pub mod hybrid;
pub mod optim;
pub mod sindy;
pub mod solve;
pub mod solvers;
pub mod spectrum;
pub mod systems;
/// The `flowbook_core` crate is the numerical engine behind the flowbook
/// notebook runner. Everything is generic over a scalar type, so a vector
/// field written once drives plain integration (`f64`) as well as Jacobians
/// and training gradients (dual numbers).
///
/// Key components:
/// - **Traits**: `Scalar`, `VectorField` (parameterised right-hand sides), `DynamicalSystem` and `Steppable` (stepping).
/// - **Solvers**: RK4, Tsitouras 5 and adaptive Dormand–Prince behind `solve`, plus a discrete-map stepper.
/// - **Chaos**: Lyapunov spectrum, maximal exponent, Kaplan–Yorke dimension, entropies and fractal dimensions, power spectra, fixed points.
/// - **SINDy**: candidate bases, STLSQ and discovered-model re-simulation.
/// - **Hybrid**: a neural network inside Lotka–Volterra, trained with Adam and BFGS on dual-number gradients.
/// - **Equation Engine**: a bytecode VM for systems given as strings.
pub mod traits;
