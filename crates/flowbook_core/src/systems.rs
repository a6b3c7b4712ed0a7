//! Classic systems used throughout the walkthrough.
//!
//! Each system comes as a pair of free functions (an out-of-place form that
//! returns a fresh derivative and an in-place form that writes into a caller
//! buffer) plus a unit struct implementing [`VectorField`] for use with the
//! solvers and analysis routines.

use crate::traits::{Scalar, SystemKind, VectorField};

/// Lorenz '63: `p = (σ, ρ, β)`.
pub fn lorenz<T: Scalar>(u: &[T], p: &[T], _t: T) -> [T; 3] {
    let (x, y, z) = (u[0], u[1], u[2]);
    let (sigma, rho, beta) = (p[0], p[1], p[2]);
    [sigma * (y - x), x * (rho - z) - y, x * y - beta * z]
}

pub fn lorenz_mut<T: Scalar>(du: &mut [T], u: &[T], p: &[T], _t: T) {
    du[0] = p[0] * (u[1] - u[0]);
    du[1] = u[0] * (p[1] - u[2]) - u[1];
    du[2] = u[0] * u[1] - p[2] * u[2];
}

/// Lotka–Volterra predator–prey: `u = (prey, predator)`, `p = (α, β, γ, δ)`.
pub fn lotka_volterra<T: Scalar>(u: &[T], p: &[T], _t: T) -> [T; 2] {
    let (prey, predator) = (u[0], u[1]);
    let (alpha, beta, gamma, delta) = (p[0], p[1], p[2], p[3]);
    [
        alpha * prey - beta * prey * predator,
        -gamma * predator + delta * prey * predator,
    ]
}

pub fn lotka_volterra_mut<T: Scalar>(du: &mut [T], u: &[T], p: &[T], _t: T) {
    du[0] = p[0] * u[0] - p[1] * u[0] * u[1];
    du[1] = -p[2] * u[1] + p[3] * u[0] * u[1];
}

/// Rössler attractor: `p = (a, b, c)`.
pub fn rossler_mut<T: Scalar>(du: &mut [T], u: &[T], p: &[T], _t: T) {
    du[0] = -u[1] - u[2];
    du[1] = u[0] + p[0] * u[1];
    du[2] = p[1] + u[2] * (u[0] - p[2]);
}

/// Hénon map: `x' = 1 - a x^2 + y`, `y' = b x`.
pub fn henon_mut<T: Scalar>(next: &mut [T], u: &[T], p: &[T], _n: T) {
    next[0] = T::one() - p[0] * u[0] * u[0] + u[1];
    next[1] = p[1] * u[0];
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lorenz;

impl Lorenz {
    pub const PARAMS: [f64; 3] = [10.0, 28.0, 8.0 / 3.0];
    pub const INITIAL_STATE: [f64; 3] = [1.0, 0.0, 0.0];
}

impl<T: Scalar> VectorField<T> for Lorenz {
    fn dimension(&self) -> usize {
        3
    }

    fn parameter_count(&self) -> usize {
        3
    }

    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], t: T) {
        lorenz_mut(du, u, p, t);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LotkaVolterra;

impl LotkaVolterra {
    pub const PARAMS: [f64; 4] = [1.5, 1.0, 3.0, 1.0];
    pub const INITIAL_STATE: [f64; 2] = [1.0, 1.0];
}

impl<T: Scalar> VectorField<T> for LotkaVolterra {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_count(&self) -> usize {
        4
    }

    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], t: T) {
        lotka_volterra_mut(du, u, p, t);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rossler;

impl Rossler {
    pub const PARAMS: [f64; 3] = [0.2, 0.2, 5.7];
    pub const INITIAL_STATE: [f64; 3] = [1.0, 1.0, 1.0];
}

impl<T: Scalar> VectorField<T> for Rossler {
    fn dimension(&self) -> usize {
        3
    }

    fn parameter_count(&self) -> usize {
        3
    }

    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], t: T) {
        rossler_mut(du, u, p, t);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Henon;

impl Henon {
    pub const PARAMS: [f64; 2] = [1.4, 0.3];
    pub const INITIAL_STATE: [f64; 2] = [0.0, 0.0];
}

impl<T: Scalar> VectorField<T> for Henon {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_count(&self) -> usize {
        2
    }

    fn rhs(&self, du: &mut [T], u: &[T], p: &[T], t: T) {
        henon_mut(du, u, p, t);
    }

    fn kind(&self) -> SystemKind {
        SystemKind::Map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    const EPS: f64 = 1e-12;

    #[test]
    fn lorenz_matches_closed_form_at_reference_point() {
        let u = [1.0, 5.0, 10.0];
        let du = lorenz(&u, &Lorenz::PARAMS, 0.0);
        let beta = 8.0 / 3.0;
        assert!((du[0] - 10.0 * (5.0 - 1.0)).abs() < EPS);
        assert!((du[1] - (1.0 * (28.0 - 10.0) - 5.0)).abs() < EPS);
        assert!((du[2] - (1.0 * 5.0 - beta * 10.0)).abs() < EPS);
    }

    #[test]
    fn lotka_volterra_matches_closed_form_at_reference_point() {
        let du = lotka_volterra(&[1.0, 1.0], &LotkaVolterra::PARAMS, 0.0);
        assert!((du[0] - 0.5).abs() < EPS);
        assert!((du[1] + 2.0).abs() < EPS);
    }

    #[test]
    fn in_place_and_out_of_place_agree() {
        let states = [[1.0, 5.0, 10.0], [-3.2, 0.4, 17.5], [0.0, 0.0, 0.0]];
        for u in states {
            let pure = lorenz(&u, &Lorenz::PARAMS, 0.3);
            let mut buf = [0.0; 3];
            lorenz_mut(&mut buf, &u, &Lorenz::PARAMS, 0.3);
            assert_eq!(pure, buf);
        }

        let pure = lotka_volterra(&[0.7, 2.1], &LotkaVolterra::PARAMS, 1.0);
        let mut buf = [0.0; 2];
        lotka_volterra_mut(&mut buf, &[0.7, 2.1], &LotkaVolterra::PARAMS, 1.0);
        assert_eq!(pure, buf);
    }

    #[test]
    fn rhs_owned_uses_in_place_definition() {
        let owned = VectorField::<f64>::rhs_owned(&Lorenz, &[1.0, 5.0, 10.0], &Lorenz::PARAMS, 0.0);
        assert_eq!(owned, lorenz(&[1.0, 5.0, 10.0], &Lorenz::PARAMS, 0.0).to_vec());
    }

    #[test]
    fn generic_definition_propagates_derivatives() {
        // d(du0)/dx = -sigma for Lorenz.
        let u = [Dual::new(1.0, 1.0), Dual::new(5.0, 0.0), Dual::new(10.0, 0.0)];
        let p: Vec<Dual> = Lorenz::PARAMS.iter().map(|&v| Dual::new(v, 0.0)).collect();
        let du = lorenz(&u, &p, Dual::new(0.0, 0.0));
        assert!((du[0].eps + 10.0).abs() < EPS);
        assert!((du[1].eps - (28.0 - 10.0)).abs() < EPS);
        assert!((du[2].eps - 5.0).abs() < EPS);
    }

    #[test]
    fn henon_is_a_map() {
        assert_eq!(VectorField::<f64>::kind(&Henon), SystemKind::Map);
        let next = VectorField::<f64>::rhs_owned(&Henon, &[0.0, 0.0], &Henon::PARAMS, 0.0);
        assert_eq!(next, vec![1.0, 0.0]);
    }

    #[test]
    fn rossler_rhs_at_reference_point() {
        let du = VectorField::<f64>::rhs_owned(&Rossler, &[1.0, 2.0, 3.0], &Rossler::PARAMS, 0.0);
        assert!((du[0] + 5.0).abs() < EPS);
        assert!((du[1] - 1.4).abs() < EPS);
        assert!((du[2] - (0.2 + 3.0 * (1.0 - 5.7))).abs() < EPS);
    }
}
