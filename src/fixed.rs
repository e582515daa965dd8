//! Signed 18.14 fixed-point arithmetic (§9 design notes): a deterministic
//! alternative to `f32`/`f64` for contexts that need bit-identical results
//! across platforms (profiler deltas, test assertions).

use std::ops::{Add, Div, Mul, Neg, Sub};

const FRAC_BITS: i32 = 14;
const FRAC_SCALE: i64 = 1 << FRAC_BITS;

/// `Q18.14` signed fixed-point number backed by an `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed18_14(i32);

impl Fixed18_14 {
    pub const ZERO: Self = Fixed18_14(0);
    pub const ONE: Self = Fixed18_14(FRAC_SCALE as i32);

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Fixed18_14(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn from_int(v: i32) -> Self {
        Fixed18_14(v.wrapping_shl(FRAC_BITS as u32))
    }

    pub fn from_f64(v: f64) -> Self {
        Fixed18_14((v * FRAC_SCALE as f64).round() as i32)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / FRAC_SCALE as f64
    }

    pub fn to_int_trunc(self) -> i32 {
        self.0 >> FRAC_BITS
    }
}

impl Add for Fixed18_14 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Fixed18_14(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Fixed18_14 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Fixed18_14(self.0.wrapping_sub(rhs.0))
    }
}

impl Neg for Fixed18_14 {
    type Output = Self;
    fn neg(self) -> Self {
        Fixed18_14(-self.0)
    }
}

impl Mul for Fixed18_14 {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let product = (self.0 as i64 * rhs.0 as i64) >> FRAC_BITS;
        Fixed18_14(product as i32)
    }
}

impl Div for Fixed18_14 {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let numerator = (self.0 as i64) << FRAC_BITS;
        Fixed18_14((numerator / rhs.0 as i64) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_f64() {
        let v = Fixed18_14::from_f64(3.5);
        assert!((v.to_f64() - 3.5).abs() < 1e-4);
    }

    #[test]
    fn integer_arithmetic_is_exact() {
        let a = Fixed18_14::from_int(3);
        let b = Fixed18_14::from_int(4);
        assert_eq!((a + b).to_int_trunc(), 7);
        assert_eq!((b - a).to_int_trunc(), 1);
    }

    #[test]
    fn multiply_and_divide_are_inverse_ish() {
        let a = Fixed18_14::from_f64(2.5);
        let b = Fixed18_14::from_f64(4.0);
        let product = a * b;
        assert!((product.to_f64() - 10.0).abs() < 1e-2);
        let quotient = product / b;
        assert!((quotient.to_f64() - 2.5).abs() < 1e-2);
    }
}
