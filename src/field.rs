//! Modular arithmetic over the prime field recorded in a circuit header.
//!
//! The modulus is carried by an explicit [`Field`] context derived from the
//! owning circuit; it is never a process-wide global. All values are
//! non-negative residues in `[0, p)`.

use crate::errors::EquivError;
use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_traits::{One, Zero};

/// Arithmetic context for ℤ/pℤ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
  p: BigUint,
}

impl Field {
  /// Create a context for the given modulus.
  ///
  /// The modulus is assumed prime; this is not checked. A composite modulus
  /// surfaces later as [`EquivError::DivisionByZero`] when a non-invertible
  /// element is inverted.
  pub fn new(p: BigUint) -> Self {
    assert!(!p.is_zero(), "field modulus must be nonzero");
    Field { p }
  }

  /// The modulus `p`.
  pub fn modulus(&self) -> &BigUint {
    &self.p
  }

  /// Reduce an arbitrary value into `[0, p)`.
  pub fn reduce(&self, a: &BigUint) -> BigUint {
    a % &self.p
  }

  /// `a + b mod p`.
  pub fn add(&self, a: &BigUint, b: &BigUint) -> BigUint {
    (a + b) % &self.p
  }

  /// `a - b mod p`.
  pub fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
    ((a % &self.p) + &self.p - (b % &self.p)) % &self.p
  }

  /// `-a mod p`.
  pub fn neg(&self, a: &BigUint) -> BigUint {
    let a = a % &self.p;
    if a.is_zero() { a } else { &self.p - a }
  }

  /// `a * b mod p`.
  pub fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
    (a * b) % &self.p
  }

  /// `a^-1 mod p` via the extended Euclidean algorithm.
  ///
  /// Fails with [`EquivError::DivisionByZero`] on `inv(0)` or when `a` is not
  /// coprime with the modulus.
  pub fn inv(&self, a: &BigUint) -> Result<BigUint, EquivError> {
    let a = a % &self.p;
    if a.is_zero() {
      return Err(EquivError::DivisionByZero);
    }
    let p_int = BigInt::from(self.p.clone());
    let gcd = BigInt::from(a).extended_gcd(&p_int);
    if !gcd.gcd.is_one() {
      return Err(EquivError::DivisionByZero);
    }
    let residue = gcd.x.mod_floor(&p_int);
    Ok(residue.to_biguint().expect("mod_floor residue is non-negative"))
  }

  /// `a / b mod p`, computed as `a * b^-1`.
  pub fn div(&self, a: &BigUint, b: &BigUint) -> Result<BigUint, EquivError> {
    Ok(self.mul(a, &self.inv(b)?))
  }
}
