use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Coefficients of an explicit Runge–Kutta method.
///
/// `a` holds the strictly lower-triangular rows (row `i` has `i` entries).
/// `b_err` is `b - b̂` for embedded pairs and drives adaptive step control.
#[derive(Debug)]
pub struct Tableau {
    pub name: &'static str,
    pub order: usize,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    pub b_err: Option<&'static [f64]>,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

/// Classic Runge-Kutta 4th Order
pub static RK4_TABLEAU: Tableau = Tableau {
    name: "rk4",
    order: 4,
    c: &[0.0, 0.5, 0.5, 1.0],
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    b_err: None,
};

/// Tsitouras 5/4, used here as a fixed-step fifth-order scheme.
pub static TSIT5_TABLEAU: Tableau = Tableau {
    name: "tsit5",
    order: 5,
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
        &[
            5.325864828439257,
            -11.748883564062828,
            7.4955393428898365,
            -0.09249506636175525,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.028269050394068383,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
    ],
    b_err: None,
};

/// Dormand–Prince 5(4). The seventh stage is evaluated at the new point and
/// only contributes to the error estimate.
pub static DOPRI5_TABLEAU: Tableau = Tableau {
    name: "dopri5",
    order: 5,
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    b_err: Some(&[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ]),
};

/// Explicit Runge–Kutta stepper with preallocated stage buffers.
pub struct RungeKutta<T: Scalar> {
    tableau: &'static Tableau,
    k: Vec<Vec<T>>,
    tmp: Vec<T>,
    next: Vec<T>,
    error: Vec<T>,
}

impl<T: Scalar> RungeKutta<T> {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![T::zero(); dim]; tableau.stages()],
            tmp: vec![T::zero(); dim],
            next: vec![T::zero(); dim],
            error: vec![T::zero(); dim],
        }
    }

    pub fn rk4(dim: usize) -> Self {
        Self::new(&RK4_TABLEAU, dim)
    }

    pub fn tsit5(dim: usize) -> Self {
        Self::new(&TSIT5_TABLEAU, dim)
    }

    pub fn dopri5(dim: usize) -> Self {
        Self::new(&DOPRI5_TABLEAU, dim)
    }

    pub fn tableau(&self) -> &'static Tableau {
        self.tableau
    }

    /// Embedded error estimate from the last call to [`RungeKutta::attempt`].
    pub fn error_estimate(&self) -> &[T] {
        &self.error
    }

    /// Computes a trial step from `(t, state)` into `out` without committing it.
    /// For tableaus with an embedded pair the local error is kept in
    /// [`RungeKutta::error_estimate`].
    pub fn attempt(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: T,
        state: &[T],
        dt: T,
        out: &mut [T],
    ) {
        let tab = self.tableau;
        let n = state.len();

        for stage in 0..tab.stages() {
            for i in 0..n {
                let mut incr = T::zero();
                for (j, &a) in tab.a[stage].iter().enumerate() {
                    if a != 0.0 {
                        incr = incr + T::constant(a) * self.k[j][i];
                    }
                }
                self.tmp[i] = state[i] + dt * incr;
            }
            let stage_t = t + T::constant(tab.c[stage]) * dt;
            system.apply(stage_t, &self.tmp, &mut self.k[stage]);
        }

        for i in 0..n {
            let mut incr = T::zero();
            for (j, &b) in tab.b.iter().enumerate() {
                if b != 0.0 {
                    incr = incr + T::constant(b) * self.k[j][i];
                }
            }
            out[i] = state[i] + dt * incr;
        }

        if let Some(b_err) = tab.b_err {
            for i in 0..n {
                let mut incr = T::zero();
                for (j, &e) in b_err.iter().enumerate() {
                    incr = incr + T::constant(e) * self.k[j][i];
                }
                self.error[i] = dt * incr;
            }
        }
    }
}

impl<T: Scalar> Steppable<T> for RungeKutta<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let mut next = std::mem::take(&mut self.next);
        self.attempt(system, *t, state, dt, &mut next);
        state.copy_from_slice(&next);
        self.next = next;
        *t = *t + dt;
    }
}

/// Discrete Map Stepper
/// Just evaluates x_{n+1} = f(x_n).
/// dt is treated as 1 iteration regardless of value, but we track t as t + dt.
pub struct DiscreteMap<T: Scalar> {
    tmp: Vec<T>,
}

impl<T: Scalar> DiscreteMap<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for DiscreteMap<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        system.apply(*t, state, &mut self.tmp);
        state.copy_from_slice(&self.tmp);
        *t = *t + dt;
    }
}

/// Runtime-selected stepper over `T`.
pub enum Stepper<T: Scalar> {
    RungeKutta(RungeKutta<T>),
    Discrete(DiscreteMap<T>),
}

impl<T: Scalar> Steppable<T> for Stepper<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        match self {
            Stepper::RungeKutta(s) => s.step(system, t, state, dt),
            Stepper::Discrete(s) => s.step(system, t, state, dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl<T: Scalar> DynamicalSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = -x[0];
        }
    }

    fn integrate(tableau: &'static Tableau, dt: f64) -> f64 {
        let mut stepper = RungeKutta::<f64>::new(tableau, 1);
        let mut t = 0.0;
        let mut state = [1.0];
        let steps = (1.0 / dt).round() as usize;
        for _ in 0..steps {
            stepper.step(&Decay, &mut t, &mut state, dt);
        }
        assert!((t - 1.0).abs() < 1e-12);
        state[0]
    }

    fn observed_order(tableau: &'static Tableau) -> f64 {
        let exact = (-1.0_f64).exp();
        let coarse = (integrate(tableau, 0.1) - exact).abs();
        let fine = (integrate(tableau, 0.05) - exact).abs();
        (coarse / fine).log2()
    }

    #[test]
    fn tableau_rows_are_consistent() {
        for tab in [&RK4_TABLEAU, &TSIT5_TABLEAU, &DOPRI5_TABLEAU] {
            assert_eq!(tab.a.len(), tab.stages());
            assert_eq!(tab.b.len(), tab.stages());
            for (i, row) in tab.a.iter().enumerate() {
                assert_eq!(row.len(), i, "{} row {}", tab.name, i);
                let sum: f64 = row.iter().sum();
                assert!((sum - tab.c[i]).abs() < 1e-12, "{} row {}", tab.name, i);
            }
            let b_sum: f64 = tab.b.iter().sum();
            assert!((b_sum - 1.0).abs() < 1e-12, "{}", tab.name);
        }
    }

    #[test]
    fn rk4_converges_at_fourth_order() {
        let order = observed_order(&RK4_TABLEAU);
        assert!((order - 4.0).abs() < 0.3, "order {order}");
    }

    #[test]
    fn dopri5_fixed_step_is_high_order() {
        let order = observed_order(&DOPRI5_TABLEAU);
        assert!(order > 4.6, "order {order}");
    }

    #[test]
    fn tsit5_is_accurate() {
        let exact = (-1.0_f64).exp();
        assert!((integrate(&TSIT5_TABLEAU, 0.1) - exact).abs() < 1e-6);
    }

    #[test]
    fn dopri5_error_estimate_is_small_for_smooth_problem() {
        let mut stepper = RungeKutta::<f64>::dopri5(1);
        let mut out = [0.0];
        stepper.attempt(&Decay, 0.0, &[1.0], 0.1, &mut out);
        assert!(stepper.error_estimate()[0].abs() < 1e-6);
        assert!((out[0] - (-0.1_f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn discrete_map_iterates() {
        let mut stepper = DiscreteMap::<f64>::new(1);
        let mut t = 0.0;
        let mut state = [2.0];
        stepper.step(&Decay, &mut t, &mut state, 1.0);
        stepper.step(&Decay, &mut t, &mut state, 1.0);
        assert_eq!(state[0], 2.0);
        assert_eq!(t, 2.0);
    }
}
