use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our dynamical systems.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts an `f64` literal into the scalar type (derivative parts are zero).
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }

    /// The real (primal) part of the scalar.
    fn value(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Whether a system is a continuous flow or an iterated map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Flow,
    Map,
}

/// Right-hand side `du = f(u, p, t)` of a parameterised system.
///
/// Implementations are written once, generically over [`Scalar`], so the same
/// definition drives plain integration (`f64`) and derivative propagation
/// (`Dual`).
pub trait VectorField<T: Scalar> {
    /// Length of the state vector.
    fn dimension(&self) -> usize;

    /// Length of the parameter vector consumed by `rhs`.
    fn parameter_count(&self) -> usize;

    /// Writes the rate of change (or next iterate, for maps) into `du`.
    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], t: T);

    fn kind(&self) -> SystemKind {
        SystemKind::Flow
    }

    /// Out-of-place evaluation of [`VectorField::rhs`].
    fn rhs_owned(&self, u: &[T], p: &[T], t: T) -> Vec<T> {
        let mut du = vec![T::zero(); self.dimension()];
        self.rhs(&mut du, u, p, t);
        du
    }
}

/// Represents a dynamical system (Flow or Map).
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field (flow) or map function.
    /// x: current state
    /// t: current time
    /// out: buffer to write the result (dx/dt or x_{n+1})
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A vector field with its parameter vector bound, ready for stepping.
pub struct Parameterized<'a, F: ?Sized, T> {
    pub field: &'a F,
    pub params: &'a [T],
}

impl<'a, F: ?Sized, T> Parameterized<'a, F, T> {
    pub fn new(field: &'a F, params: &'a [T]) -> Self {
        Self { field, params }
    }
}

impl<'a, F, T> DynamicalSystem<T> for Parameterized<'a, F, T>
where
    T: Scalar,
    F: VectorField<T> + ?Sized,
{
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        self.field.rhs(out, x, self.params, t);
    }
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}
