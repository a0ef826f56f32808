//! Per-constraint canonicalization.
//!
//! Two constraints are the same up to rescaling iff there exist nonzero
//! scalars `α, β` with `(α·A, β·B, αβ·C) ≡ (A', B', C')`, possibly after
//! swapping `A` and `B`. Normalization strips the permitted rescalings by
//! selecting canonical scalars, then resolves the `A`/`B` order. The scalar
//! selection may be ambiguous (the zero-sum path of [`division_norm`]
//! returns a tie-set), so a constraint normalizes to a *set* of canonical
//! forms; set equality is the equivalence test.

use crate::{
  errors::EquivError,
  field::Field,
  r1cs::{Constraint, LinearForm},
};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A canonical representative of a constraint under the permitted
/// rescalings. Terms are sorted by ascending coefficient, ties broken by
/// ascending signal id, purely for bytewise determinism.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NormalForm {
  /// Canonical `A` terms as `(signal, coefficient)` pairs
  pub a: Vec<(usize, BigUint)>,
  /// Canonical `B` terms
  pub b: Vec<(usize, BigUint)>,
  /// Canonical `C` terms
  pub c: Vec<(usize, BigUint)>,
}

/// One rescaling candidate before the `A`/`B` ordering decision.
#[derive(Clone, Debug)]
pub(crate) struct ScaledCandidate {
  pub(crate) a: LinearForm,
  pub(crate) b: LinearForm,
  pub(crate) c: LinearForm,
}

/// The canonical scalar selector: deterministic and invariant under common
/// rescaling of `values`.
///
/// When the values do not sum to zero, a single multiplier is returned:
/// `min_i(Σ/v_i) · Σ^{-1}`. When they do, the distinct-value set is
/// repeatedly narrowed to the numerators of its least-frequent pairwise
/// quotient until stable, and the inverses of the surviving block are all
/// returned as equally canonical multipliers (the block is a set of roots
/// of unity up to a common factor, so no single choice is factor-agnostic).
pub fn division_norm(
  values: &[BigUint],
  field: &Field,
) -> Result<BTreeSet<BigUint>, EquivError> {
  if values.is_empty() {
    return Ok(BTreeSet::from([BigUint::one()]));
  }
  let sum = values
    .iter()
    .fold(BigUint::zero(), |acc, v| field.add(&acc, v));

  if !sum.is_zero() {
    let quotients = values
      .iter()
      .map(|v| field.div(&sum, v))
      .collect::<Result<Vec<_>, _>>()?;
    let min_q = quotients.into_iter().min().expect("values is nonempty");
    return Ok(BTreeSet::from([field.mul(&min_q, &field.inv(&sum)?)]));
  }

  let mut block: BTreeSet<BigUint> = values.iter().cloned().collect();
  while block.len() > 1 {
    // frequency and numerator set of every pairwise quotient in the block
    let mut quotients: BTreeMap<BigUint, (usize, BTreeSet<BigUint>)> = BTreeMap::new();
    for u in &block {
      for v in &block {
        if u != v {
          let q = field.div(u, v)?;
          let entry = quotients.entry(q).or_default();
          entry.0 += 1;
          entry.1.insert(u.clone());
        }
      }
    }
    let min_count = quotients.values().map(|(n, _)| *n).min().expect("block has pairs");
    let max_count = quotients.values().map(|(n, _)| *n).max().expect("block has pairs");
    if min_count == max_count {
      // every quotient equally frequent: the block is stable
      break;
    }
    let numerators = quotients
      .into_iter()
      .find_map(|(_, (n, numerators))| (n == min_count).then_some(numerators))
      .expect("some quotient attains the minimum");
    if numerators == block {
      break;
    }
    block = numerators;
  }
  block.iter().map(|u| field.inv(u)).collect()
}

/// The canonical multiplier set for one linear form: the inverse of the
/// constant-wire coefficient when signal 0 is present, the
/// [`division_norm`] selection otherwise.
fn scalar_set(form: &LinearForm, field: &Field) -> Result<BTreeSet<BigUint>, EquivError> {
  if form.is_empty() {
    return Ok(BTreeSet::from([BigUint::one()]));
  }
  if let Some(c0) = form.get(0) {
    return Ok(BTreeSet::from([field.inv(c0)?]));
  }
  division_norm(&form.sorted_coeffs(), field)
}

/// All rescaling candidates of a constraint, before the `A`/`B` ordering
/// decision.
///
/// For a quadratic constraint the scalars `α` and `β` come from `A` and `B`
/// and `C` is scaled by `αβ`. When `A` or `B` is empty the quadratic side is
/// inert, so every nonempty part is normalized by its own multiplier set
/// independently.
pub(crate) fn scaling_candidates(
  cons: &Constraint,
  field: &Field,
) -> Result<Vec<ScaledCandidate>, EquivError> {
  let mut out = Vec::new();
  if cons.is_quadratic() {
    let alphas = scalar_set(&cons.a, field)?;
    let betas = scalar_set(&cons.b, field)?;
    for alpha in &alphas {
      for beta in &betas {
        out.push(ScaledCandidate {
          a: cons.a.scaled(alpha, field),
          b: cons.b.scaled(beta, field),
          c: cons.c.scaled(&field.mul(alpha, beta), field),
        });
      }
    }
  } else {
    let alphas = scalar_set(&cons.a, field)?;
    let betas = scalar_set(&cons.b, field)?;
    let gammas = scalar_set(&cons.c, field)?;
    for alpha in &alphas {
      for beta in &betas {
        for gamma in &gammas {
          out.push(ScaledCandidate {
            a: cons.a.scaled(alpha, field),
            b: cons.b.scaled(beta, field),
            c: cons.c.scaled(gamma, field),
          });
        }
      }
    }
  }
  Ok(out)
}

/// The normalization set of a constraint: one [`NormalForm`] per surviving
/// scalar choice and part ordering.
///
/// After rescaling, the part whose coefficient multiset compares
/// lexicographically smaller becomes canonical-`A`; when the two multisets
/// coincide the constraint has the `A`↔`B` symmetry and both orderings are
/// kept.
pub fn normalize(
  cons: &Constraint,
  field: &Field,
) -> Result<BTreeSet<NormalForm>, EquivError> {
  let mut out = BTreeSet::new();
  for cand in scaling_candidates(cons, field)? {
    let a = cand.a.canonical_terms();
    let b = cand.b.canonical_terms();
    let c = cand.c.canonical_terms();
    let a_coeffs: Vec<&BigUint> = a.iter().map(|(_, coeff)| coeff).collect();
    let b_coeffs: Vec<&BigUint> = b.iter().map(|(_, coeff)| coeff).collect();
    match a_coeffs.cmp(&b_coeffs) {
      std::cmp::Ordering::Less => {
        out.insert(NormalForm { a, b, c });
      }
      std::cmp::Ordering::Greater => {
        out.insert(NormalForm { a: b, b: a, c });
      }
      std::cmp::Ordering::Equal => {
        out.insert(NormalForm {
          a: a.clone(),
          b: b.clone(),
          c: c.clone(),
        });
        out.insert(NormalForm { a: b, b: a, c });
      }
    }
  }
  Ok(out)
}
