//! Fixed-width integers over BDD bits.
//!
//! A bitvector is a sequence of Boolean functions, most significant bit
//! first. [`BddInteger`] is bound to literal variables of the manager, so a
//! satisfying assignment of those variables spells out a value.
//! [`MutableBddInteger`] holds arbitrary bit functions, e.g. the result of
//! [`MutableBddInteger::add`].
//!
//! Values are passed around as raw `u64` bit patterns. For signed vectors the
//! pattern is read as two's complement by the ordering predicates and by
//! [`BitVector::signed_value_satisfying`].

use std::collections::HashMap;

use log::debug;

use crate::bdd::Bdd;
use crate::error::{Error, Result};
use crate::pairing::Pairing;
use crate::reference::Ref;
use crate::types::Var;

/// Operations shared by every bitvector flavor.
pub trait BitVector {
    /// Bit functions, index 0 is the most significant bit.
    fn bits(&self) -> &[Ref];

    fn is_signed(&self) -> bool;

    fn width(&self) -> usize {
        self.bits().len()
    }

    /// Largest raw value representable in this width.
    fn max_value(&self) -> u64 {
        max_value(self.width())
    }

    fn check_value(&self, value: u64) -> Result<()> {
        if value > self.max_value() {
            return Err(Error::ValueOutOfRange {
                value,
                width: self.width(),
            });
        }
        Ok(())
    }

    /// Predicate `self == value`.
    fn equals_value(&self, bdd: &Bdd, value: u64) -> Result<Ref> {
        self.check_value(value)?;
        Ok(equals_bits(bdd, self.bits(), value))
    }

    /// Predicate `lo <= self <= hi` over raw bit patterns.
    ///
    /// An empty range (`lo > hi`) is ZERO.
    fn range(&self, bdd: &Bdd, lo: u64, hi: u64) -> Result<Ref> {
        self.check_value(lo)?;
        self.check_value(hi)?;
        if lo > hi {
            return Ok(bdd.zero());
        }
        let ge = compare(bdd, self.bits(), lo, false, Ordering::Geq);
        let le = compare(bdd, self.bits(), hi, false, Ordering::Leq);
        Ok(bdd.apply_and(ge, le))
    }

    /// Predicate `self <= value`, two's complement when signed.
    fn leq(&self, bdd: &Bdd, value: u64) -> Result<Ref> {
        self.check_value(value)?;
        Ok(compare(bdd, self.bits(), value, self.is_signed(), Ordering::Leq))
    }

    /// Predicate `self >= value`, two's complement when signed.
    fn geq(&self, bdd: &Bdd, value: u64) -> Result<Ref> {
        self.check_value(value)?;
        Ok(compare(bdd, self.bits(), value, self.is_signed(), Ordering::Geq))
    }

    /// Value of the bits under an explicit assignment (unassigned reads as false).
    fn value_under(&self, bdd: &Bdd, assignment: &HashMap<Var, bool>) -> u64 {
        self.bits()
            .iter()
            .fold(0, |acc, &bit| (acc << 1) | bdd.eval(bit, assignment) as u64)
    }

    /// Value spelled by one satisfying assignment of `f`, `None` if `f` is ZERO.
    ///
    /// Only the bits of this vector are decoded; `f` may constrain other
    /// variables too.
    fn value_satisfying(&self, bdd: &Bdd, f: Ref) -> Option<u64> {
        let assignment = bdd.one_sat_assignment(f)?;
        Some(self.value_under(bdd, &assignment))
    }

    /// Like [`value_satisfying`](Self::value_satisfying), sign-extended when signed.
    fn signed_value_satisfying(&self, bdd: &Bdd, f: Ref) -> Option<i64> {
        let raw = self.value_satisfying(bdd, f)?;
        Some(sign_extend(raw, self.width(), self.is_signed()))
    }

    /// Up to `limit` distinct values of this vector allowed by `f`.
    fn values_satisfying(&self, bdd: &Bdd, f: Ref, limit: usize) -> Vec<u64> {
        let mut values = Vec::new();
        let mut rest = f;
        while values.len() < limit {
            let Some(value) = self.value_satisfying(bdd, rest) else {
                break;
            };
            values.push(value);
            rest = bdd.apply_diff(rest, equals_bits(bdd, self.bits(), value));
        }
        values
    }

    /// Strict decode: every bit must be fixed by `cube`.
    fn value_from_full_assignment(&self, bdd: &Bdd, cube: Ref) -> Result<u64> {
        if bdd.is_zero(cube) {
            return Err(Error::PartialAssignment {
                what: "unsatisfiable assignment".to_string(),
            });
        }
        let mut value = 0;
        for (i, &bit) in self.bits().iter().enumerate() {
            let b = if bdd.is_implies(cube, bit) {
                1
            } else if bdd.is_implies(cube, -bit) {
                0
            } else {
                return Err(Error::PartialAssignment {
                    what: format!("bit {} of a {}-bit vector", i, self.width()),
                });
            };
            value = (value << 1) | b;
        }
        Ok(value)
    }
}

pub(crate) fn max_value(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

fn sign_extend(raw: u64, width: usize, signed: bool) -> i64 {
    if !signed || width == 0 || width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

fn bit_of(value: u64, width: usize, i: usize) -> bool {
    (value >> (width - 1 - i)) & 1 == 1
}

fn equals_bits(bdd: &Bdd, bits: &[Ref], value: u64) -> Ref {
    let w = bits.len();
    bdd.apply_and_many(
        bits.iter()
            .enumerate()
            .map(|(i, &bit)| if bit_of(value, w, i) { bit } else { -bit }),
    )
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Ordering {
    Leq,
    Geq,
}

/// Comparison circuit against a constant, built from the LSB up.
///
/// With `flip_msb` the sign bits of both sides are inverted, which turns the
/// unsigned comparison into a two's-complement one.
fn compare(bdd: &Bdd, bits: &[Ref], value: u64, flip_msb: bool, ord: Ordering) -> Ref {
    let w = bits.len();
    let mut res = bdd.one();
    for i in (0..w).rev() {
        let (mut x, mut v) = (bits[i], bit_of(value, w, i));
        if flip_msb && i == 0 {
            x = -x;
            v = !v;
        }
        res = match (ord, v) {
            (Ordering::Leq, true) => bdd.apply_or(-x, res),
            (Ordering::Leq, false) => bdd.apply_and(-x, res),
            (Ordering::Geq, true) => bdd.apply_and(x, res),
            (Ordering::Geq, false) => bdd.apply_or(x, res),
        };
    }
    res
}

/// Bitvector bound to literal variables.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BddInteger {
    vars: Vec<Var>,
    bits: Vec<Ref>,
    signed: bool,
}

impl BddInteger {
    pub fn from_vars(bdd: &Bdd, vars: Vec<Var>, signed: bool) -> Self {
        let bits = vars.iter().map(|&v| bdd.mk_var(v)).collect();
        Self { vars, bits, signed }
    }

    /// Bind `width` consecutive variables starting at variable id `start`.
    pub fn from_index(bdd: &Bdd, width: usize, start: u32, signed: bool) -> Self {
        let vars = (0..width as u32).map(|i| Var::new(start + i)).collect();
        Self::from_vars(bdd, vars, signed)
    }

    /// Bind `width` freshly allocated variables.
    pub fn allocate(bdd: &Bdd, width: usize, signed: bool) -> Self {
        Self::from_vars(bdd, bdd.allocate_vars(width), signed)
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Pairing renaming this vector's variables to `other`'s.
    pub fn pairing_to(&self, other: &BddInteger) -> Result<Pairing> {
        self.check_width(other)?;
        Ok(Pairing::from_vars(&self.vars, &other.vars))
    }

    /// Pairing exchanging this vector's variables with `other`'s.
    pub fn swap_pairing(&self, other: &BddInteger) -> Result<Pairing> {
        self.check_width(other)?;
        Ok(Pairing::swap(&self.vars, &other.vars))
    }

    /// `∃ self. f`
    pub fn exists_vars(&self, bdd: &Bdd, f: Ref) -> Ref {
        bdd.exists(f, &self.vars)
    }

    pub fn to_mutable(&self) -> MutableBddInteger {
        MutableBddInteger {
            bits: self.bits.clone(),
            signed: self.signed,
        }
    }

    fn check_width(&self, other: &impl BitVector) -> Result<()> {
        if self.width() != other.width() {
            return Err(Error::WidthMismatch {
                left: self.width(),
                right: other.width(),
            });
        }
        Ok(())
    }
}

impl BitVector for BddInteger {
    fn bits(&self) -> &[Ref] {
        &self.bits
    }

    fn is_signed(&self) -> bool {
        self.signed
    }
}

/// Bitvector over arbitrary bit functions.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MutableBddInteger {
    bits: Vec<Ref>,
    signed: bool,
}

impl MutableBddInteger {
    pub fn from_bits(bits: Vec<Ref>, signed: bool) -> Self {
        Self { bits, signed }
    }

    /// Constant vector: every bit is a terminal.
    pub fn from_value(bdd: &Bdd, width: usize, value: u64) -> Result<Self> {
        if value > max_value(width) {
            return Err(Error::ValueOutOfRange { value, width });
        }
        let bits = (0..width).map(|i| bdd.constant(bit_of(value, width, i))).collect();
        Ok(Self { bits, signed: false })
    }

    /// Ripple-carry sum modulo `2^width`.
    ///
    /// The result's bits are functions of the operands' bits; constrain the
    /// operands and the sum together to relate them.
    pub fn add(&self, bdd: &Bdd, other: &impl BitVector) -> Result<MutableBddInteger> {
        if self.width() != other.width() {
            return Err(Error::WidthMismatch {
                left: self.width(),
                right: other.width(),
            });
        }
        debug!("add({} bits)", self.width());

        let mut sum = vec![bdd.zero(); self.width()];
        let mut carry = bdd.zero();
        for i in (0..self.width()).rev() {
            let (x, y) = (self.bits[i], other.bits()[i]);
            let x_xor_y = bdd.apply_xor(x, y);
            sum[i] = bdd.apply_xor(x_xor_y, carry);
            carry = bdd.apply_or(bdd.apply_and(x, y), bdd.apply_and(carry, x_xor_y));
        }
        Ok(MutableBddInteger {
            bits: sum,
            signed: self.signed,
        })
    }

    pub fn set_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }
}

impl BitVector for MutableBddInteger {
    fn bits(&self) -> &[Ref] {
        &self.bits
    }

    fn is_signed(&self) -> bool {
        self.signed
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_equals_value() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 4, false);

        let f = x.equals_value(&bdd, 0b1010).unwrap();
        assert_eq!(f, bdd.mk_cube([1, -2, 3, -4]));
        assert_eq!(x.value_satisfying(&bdd, f), Some(0b1010));
        assert_eq!(x.value_from_full_assignment(&bdd, f), Ok(0b1010));

        assert_eq!(
            x.equals_value(&bdd, 16),
            Err(Error::ValueOutOfRange { value: 16, width: 4 })
        );
    }

    #[test]
    fn test_range_bounds() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 5, false);

        assert_eq!(x.range(&bdd, 7, 3).unwrap(), bdd.zero());
        assert_eq!(x.range(&bdd, 0, 31).unwrap(), bdd.one());
        assert!(x.range(&bdd, 0, 32).is_err());
    }

    #[test]
    fn test_range_matches_equalities() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 5, false);

        for (lo, hi) in [(0, 0), (3, 17), (12, 31), (5, 5), (1, 30)] {
            let expected = bdd.apply_or_many((lo..=hi).map(|v| x.equals_value(&bdd, v).unwrap()));
            assert_eq!(x.range(&bdd, lo, hi).unwrap(), expected, "range [{}, {}]", lo, hi);
        }
    }

    #[test]
    fn test_signed_comparisons() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 4, true);

        // x <= -1 (0b1111) holds exactly for the negative values -8..=-1
        let neg = x.leq(&bdd, 0b1111).unwrap();
        assert_eq!(neg, x.range(&bdd, 8, 15).unwrap());
        assert_eq!(x.signed_value_satisfying(&bdd, neg), Some(-8));

        // x >= 0 holds exactly for 0..=7
        let non_neg = x.geq(&bdd, 0).unwrap();
        assert_eq!(non_neg, x.range(&bdd, 0, 7).unwrap());

        let y = BddInteger::allocate(&bdd, 4, false);
        assert_eq!(y.leq(&bdd, 0b1111).unwrap(), bdd.one());
        assert_eq!(y.geq(&bdd, 3).unwrap(), y.range(&bdd, 3, 15).unwrap());
    }

    #[test]
    fn test_values_satisfying() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 6, false);
        let f = x.range(&bdd, 10, 14).unwrap();

        let mut values = x.values_satisfying(&bdd, f, 100);
        values.sort();
        assert_eq!(values, vec![10, 11, 12, 13, 14]);
        assert_eq!(x.values_satisfying(&bdd, f, 2).len(), 2);
        assert!(x.values_satisfying(&bdd, bdd.zero(), 10).is_empty());
    }

    #[test]
    fn test_partial_assignment() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 3, false);
        let f = x.range(&bdd, 2, 3).unwrap();

        assert!(matches!(
            x.value_from_full_assignment(&bdd, f),
            Err(Error::PartialAssignment { .. })
        ));
        assert!(x.value_from_full_assignment(&bdd, bdd.zero()).is_err());
    }

    #[test]
    fn test_add_one_wraps() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 5, false);
        let one = MutableBddInteger::from_value(&bdd, 5, 1).unwrap();
        let y = x.to_mutable().add(&bdd, &one).unwrap();

        let x0 = x.equals_value(&bdd, 0).unwrap();
        let x31 = x.equals_value(&bdd, 31).unwrap();
        let y1 = y.equals_value(&bdd, 1).unwrap();
        let y0 = y.equals_value(&bdd, 0).unwrap();

        assert!(bdd.intersects(x0, y1));
        assert!(bdd.intersects(x31, y0));
        assert!(!bdd.intersects(x0, y0));
        assert_eq!(bdd.apply_and(y0, bdd.one()), x31);

        // The sum introduces no variables of its own.
        assert_eq!(bdd.num_vars(), 5);
    }

    #[test]
    fn test_add_constants() {
        let bdd = Bdd::default();
        let a = MutableBddInteger::from_value(&bdd, 8, 200).unwrap();
        let b = MutableBddInteger::from_value(&bdd, 8, 100).unwrap();
        let c = a.add(&bdd, &b).unwrap();
        assert_eq!(c.value_satisfying(&bdd, bdd.one()), Some(44));

        let d = MutableBddInteger::from_value(&bdd, 4, 1).unwrap();
        assert_eq!(
            a.add(&bdd, &d),
            Err(Error::WidthMismatch { left: 8, right: 4 })
        );
        assert!(MutableBddInteger::from_value(&bdd, 4, 16).is_err());
    }

    #[test]
    fn test_swap_pairing() {
        let bdd = Bdd::default();
        let x = BddInteger::allocate(&bdd, 3, false);
        let y = BddInteger::allocate(&bdd, 3, false);

        let f = bdd.apply_and(x.equals_value(&bdd, 5).unwrap(), y.equals_value(&bdd, 2).unwrap());
        let g = bdd.replace(f, &x.swap_pairing(&y).unwrap());
        assert_eq!(x.value_satisfying(&bdd, g), Some(2));
        assert_eq!(y.value_satisfying(&bdd, g), Some(5));

        let h = bdd.replace(x.equals_value(&bdd, 6).unwrap(), &x.pairing_to(&y).unwrap());
        assert_eq!(h, y.equals_value(&bdd, 6).unwrap());
        assert_eq!(x.exists_vars(&bdd, f), y.equals_value(&bdd, 2).unwrap());
    }

    #[test]
    fn test_from_index() {
        let bdd = Bdd::default();
        bdd.allocate_vars(8);
        let x = BddInteger::from_index(&bdd, 4, 3, false);
        assert_eq!(x.vars(), &[Var::new(3), Var::new(4), Var::new(5), Var::new(6)]);
    }
}
