use crate::traits::{DynamicalSystem, VectorField};
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::f64::consts::{LN_10, LN_2};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// A value with no derivative component.
    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// The `index`-th basis direction of a seeded vector: `eps = 1` at
    /// `index`, zero elsewhere.
    pub fn seed(values: &[f64], index: usize) -> Vec<Dual> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Self::new(v, if i == index { 1.0 } else { 0.0 }))
            .collect()
    }

    /// Applies the chain rule for a unary function with derivative `slope`.
    fn chain(self, val: f64, slope: f64) -> Self {
        if self.eps == 0.0 {
            return Self::constant(val);
        }
        Self::new(val, slope * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod m) = 1 almost everywhere.
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan() || self.eps.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite() || self.eps.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite() && self.eps.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        self.chain(self.val.abs(), if self.val >= 0.0 { 1.0 } else { -1.0 })
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        self.chain(self.val.powi(n), (n as f64) * self.val.powi(n - 1))
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x)); the ln term only matters when y carries a derivative.
        let val_pow = self.val.powf(n.val);
        let d_base = if self.eps == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0) * self.eps
        };
        let d_exp = if n.eps == 0.0 {
            0.0
        } else {
            val_pow * self.val.ln() * n.eps
        };
        Self::new(val_pow, d_base + d_exp)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * LN_10))
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

/// Dense row-major Jacobian `J[i * n + j] = ∂f_i/∂x_j` of `system` at `(t, x)`,
/// one dual-number sweep per column.
pub fn jacobian<S>(system: &S, t: f64, x: &[f64]) -> Vec<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let n = x.len();
    let mut jacobian = vec![0.0; n * n];
    let mut dual_out = vec![Dual::zero(); n];
    let t_dual = Dual::constant(t);

    for j in 0..n {
        let dual_x = Dual::seed(x, j);
        system.apply(t_dual, &dual_x, &mut dual_out);
        for i in 0..n {
            jacobian[i * n + j] = dual_out[i].eps;
        }
    }
    jacobian
}

/// A vector field bound to one parameter vector, evaluable both in `f64` and
/// in dual numbers (for Jacobians with respect to the state).
pub struct DifferentiableSystem<'a, F: ?Sized> {
    pub field: &'a F,
    pub params: Vec<f64>,
    dual_params: Vec<Dual>,
}

impl<'a, F: ?Sized> DifferentiableSystem<'a, F> {
    pub fn new(field: &'a F, params: &[f64]) -> Self {
        Self {
            field,
            params: params.to_vec(),
            dual_params: params.iter().map(|&p| Dual::constant(p)).collect(),
        }
    }
}

impl<'a, F> DynamicalSystem<f64> for DifferentiableSystem<'a, F>
where
    F: VectorField<f64> + ?Sized,
{
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.field.rhs(out, x, &self.params, t);
    }
}

impl<'a, F> DynamicalSystem<Dual> for DifferentiableSystem<'a, F>
where
    F: VectorField<Dual> + ?Sized,
{
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn apply(&self, t: Dual, x: &[Dual], out: &mut [Dual]) {
        self.field.rhs(out, x, &self.dual_params, t);
    }
}

/// Extends a system with its variational equation `Φ' = J(x) Φ`.
///
/// The augmented state is `[x, Φ]` with `Φ` stored row-major (`n × n`).
pub struct TangentSystem<S> {
    pub inner: S,
    pub dimension: usize,
}

impl<S> TangentSystem<S> {
    pub fn new(inner: S, dim: usize) -> Self {
        Self {
            inner,
            dimension: dim,
        }
    }
}

impl<S> DynamicalSystem<f64> for TangentSystem<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    fn dimension(&self) -> usize {
        let n = self.dimension;
        n + n * n
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        self.inner.apply(t, &x[0..n], &mut out[0..n]);

        let jac = jacobian(&self.inner, t, &x[0..n]);

        // (J * Phi)[i, j]
        let phi = &x[n..];
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += jac[i * n + k] * phi[k * n + j];
                }
                out[n + i * n + j] = sum;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::{Lorenz, LotkaVolterra};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn finite_difference(f: impl Fn(f64) -> f64, x: f64) -> f64 {
        let h = 1e-6;
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    #[test]
    fn elementary_functions_match_finite_differences() {
        let x = 0.37;
        let cases: [(fn(Dual) -> Dual, fn(f64) -> f64); 9] = [
            (|d: Dual| d.tanh(), |v: f64| v.tanh()),
            (|d: Dual| d.sinh(), |v: f64| v.sinh()),
            (|d: Dual| d.atan(), |v: f64| v.atan()),
            (|d: Dual| d.asin(), |v: f64| v.asin()),
            (|d: Dual| d.log10(), |v: f64| v.log10()),
            (|d: Dual| d.exp2(), |v: f64| v.exp2()),
            (|d: Dual| d.cbrt(), |v: f64| v.cbrt()),
            (|d: Dual| d.powi(3), |v: f64| v.powi(3)),
            (|d: Dual| d.powf(Dual::constant(2.5)), |v: f64| v.powf(2.5)),
        ];
        for (dual_fn, real_fn) in cases {
            let result = dual_fn(Dual::new(x, 1.0));
            let expected = finite_difference(real_fn, x);
            assert!(
                (result.eps - expected).abs() < 1e-6,
                "derivative mismatch: {} vs {}",
                result.eps,
                expected
            );
            assert!(close(result.val, real_fn(x)));
        }
    }

    #[test]
    fn powf_of_zero_base_with_constant_exponent_is_finite() {
        let result = Dual::new(0.0, 0.0).powf(Dual::constant(2.0));
        assert!(result.eps.is_finite());
    }

    #[test]
    fn jacobian_of_lorenz_matches_analytic() {
        let system = DifferentiableSystem::new(&Lorenz, &Lorenz::PARAMS);
        let (x, y, z) = (1.0, 5.0, 10.0);
        let jac = jacobian(&system, 0.0, &[x, y, z]);
        let expected = [
            -10.0, 10.0, 0.0, //
            28.0 - z, -1.0, -x, //
            y, x, -8.0 / 3.0,
        ];
        for (a, b) in jac.iter().zip(expected.iter()) {
            assert!(close(*a, *b), "{a} vs {b}");
        }
    }

    #[test]
    fn tangent_system_propagates_identity_as_jacobian() {
        let system = DifferentiableSystem::new(&LotkaVolterra, &LotkaVolterra::PARAMS);
        let tangent = TangentSystem::new(system, 2);
        let x = [1.0, 2.0, 1.0, 0.0, 0.0, 1.0];
        let mut out = [0.0; 6];
        tangent.apply(0.0, &x, &mut out);
        let jac = jacobian(&tangent.inner, 0.0, &x[..2]);
        assert_eq!(&out[2..], jac.as_slice());
        assert!(close(out[0], 1.5 - 2.0));
    }
}
