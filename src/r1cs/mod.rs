//! This module defines R1CS related types: sparse linear forms, constraints,
//! and the in-memory circuit produced by the codec.
use crate::{errors::EquivError, field::Field};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::Serialize;
use std::collections::BTreeSet;

mod codec;
pub use codec::{parse_r1cs, parse_r1cs_bytes, write_r1cs, write_r1cs_bytes};

/// The structural role of a signal, derived from its position in the header
/// ranges. Signal 0 is the field constant `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SignalRole {
  /// Signal 0, the constant-one wire
  Constant,
  /// A public output wire
  Output,
  /// A public or private input wire
  Input,
  /// An internal wire
  Internal,
}

/// A sparse linear form: a mapping from signal id to a nonzero coefficient.
///
/// Term order is preserved from the source (file or shuffler) so that the
/// writer can round-trip byte-exactly; it carries no meaning otherwise, and
/// equality is set equality.
#[derive(Clone, Debug, Default)]
pub struct LinearForm {
  terms: Vec<(usize, BigUint)>,
}

impl LinearForm {
  /// An empty linear form.
  pub fn new() -> Self {
    LinearForm { terms: Vec::new() }
  }

  /// Build a form from `(signal, coefficient)` pairs, preserving their order.
  ///
  /// Callers must supply unique signals and nonzero coefficients; the codec
  /// and the normalizer both uphold this.
  pub fn from_terms(terms: Vec<(usize, BigUint)>) -> Self {
    debug_assert!(
      {
        let mut seen = BTreeSet::new();
        terms.iter().all(|(s, c)| seen.insert(*s) && !c.is_zero())
      },
      "linear form terms must have unique signals and nonzero coefficients"
    );
    LinearForm { terms }
  }

  /// The coefficient of `signal`, if present.
  pub fn get(&self, signal: usize) -> Option<&BigUint> {
    self
      .terms
      .iter()
      .find(|(s, _)| *s == signal)
      .map(|(_, c)| c)
  }

  /// Whether `signal` carries a nonzero coefficient.
  pub fn contains(&self, signal: usize) -> bool {
    self.get(signal).is_some()
  }

  /// Number of terms.
  pub fn len(&self) -> usize {
    self.terms.len()
  }

  /// Whether the form has no terms.
  pub fn is_empty(&self) -> bool {
    self.terms.is_empty()
  }

  /// Iterate over `(signal, coefficient)` pairs in stored order.
  pub fn iter(&self) -> impl Iterator<Item = &(usize, BigUint)> {
    self.terms.iter()
  }

  /// Iterate over the signal ids in stored order.
  pub fn signals(&self) -> impl Iterator<Item = usize> + '_ {
    self.terms.iter().map(|(s, _)| *s)
  }

  /// The coefficient multiset in ascending order.
  pub fn sorted_coeffs(&self) -> Vec<BigUint> {
    let mut coeffs: Vec<BigUint> = self.terms.iter().map(|(_, c)| c.clone()).collect();
    coeffs.sort();
    coeffs
  }

  /// Terms sorted by ascending coefficient, ties broken by ascending signal id.
  pub fn canonical_terms(&self) -> Vec<(usize, BigUint)> {
    let mut terms = self.terms.clone();
    terms.sort_by(|(s1, c1), (s2, c2)| c1.cmp(c2).then(s1.cmp(s2)));
    terms
  }

  /// Multiply every coefficient by the nonzero scalar `k`.
  pub fn scaled(&self, k: &BigUint, field: &Field) -> LinearForm {
    LinearForm {
      terms: self
        .terms
        .iter()
        .map(|(s, c)| (*s, field.mul(c, k)))
        .collect(),
    }
  }

  /// Relabel every signal through `map` (indexed by old signal id).
  pub fn map_signals(&self, map: &[usize]) -> LinearForm {
    LinearForm {
      terms: self.terms.iter().map(|(s, c)| (map[*s], c.clone())).collect(),
    }
  }

  pub(crate) fn terms_mut(&mut self) -> &mut Vec<(usize, BigUint)> {
    &mut self.terms
  }
}

impl PartialEq for LinearForm {
  fn eq(&self, other: &Self) -> bool {
    if self.terms.len() != other.terms.len() {
      return false;
    }
    let key = |form: &LinearForm| {
      let mut terms = form.terms.clone();
      terms.sort_by(|(s1, _), (s2, _)| s1.cmp(s2));
      terms
    };
    key(self) == key(other)
  }
}

impl Eq for LinearForm {}

/// A single constraint `⟨A, s⟩ · ⟨B, s⟩ = ⟨C, s⟩` over the wire vector `s`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
  /// The `A` linear form
  pub a: LinearForm,
  /// The `B` linear form
  pub b: LinearForm,
  /// The `C` linear form
  pub c: LinearForm,
}

impl Constraint {
  /// Build a constraint from its three linear forms.
  pub fn new(a: LinearForm, b: LinearForm, c: LinearForm) -> Self {
    Constraint { a, b, c }
  }

  /// Whether both multiplicand forms are nonempty.
  ///
  /// A constraint with an empty `A` or `B` degenerates to the linear equation
  /// `⟨C, s⟩ = 0`.
  pub fn is_quadratic(&self) -> bool {
    !self.a.is_empty() && !self.b.is_empty()
  }

  /// The set of signals appearing anywhere in the constraint.
  pub fn signals(&self) -> BTreeSet<usize> {
    self
      .a
      .signals()
      .chain(self.b.signals())
      .chain(self.c.signals())
      .collect()
  }

  /// Relabel every signal through `map` (indexed by old signal id).
  pub fn map_signals(&self, map: &[usize]) -> Constraint {
    Constraint {
      a: self.a.map_signals(map),
      b: self.b.map_signals(map),
      c: self.c.map_signals(map),
    }
  }
}

/// Header data of an R1CS file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitHeader {
  /// The field modulus
  pub prime: BigUint,
  /// Width of a serialized coefficient, in bytes
  pub field_size: usize,
  /// Total wire count, including the constant wire
  pub n_wires: usize,
  /// Number of public outputs
  pub n_pub_out: usize,
  /// Number of public inputs
  pub n_pub_in: usize,
  /// Number of private inputs
  pub n_prv_in: usize,
  /// Number of labels recorded by the compiler
  pub n_labels: u64,
  /// Number of constraints
  pub n_constraints: usize,
}

/// The section kinds of the R1CS container, in the order they were read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
  /// Field and count metadata
  Header,
  /// The constraint list
  Constraints,
  /// The optional wire-to-label map
  Labels,
}

/// An in-memory circuit: header, ordered constraints, and the optional
/// wire-to-label map used only for human-readable output.
///
/// Circuits are produced by the codec or by the shuffler and are treated as
/// immutable by the analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Circuit {
  /// The file header
  pub header: CircuitHeader,
  /// The ordered constraint list
  pub constraints: Vec<Constraint>,
  /// Label ids per wire, when the file carries a signal section
  pub labels: Option<Vec<i64>>,
  /// Section order observed by the parser, replayed by the writer
  pub section_order: Vec<SectionKind>,
}

impl Circuit {
  /// Build a circuit with the default section order.
  pub fn new(
    header: CircuitHeader,
    constraints: Vec<Constraint>,
    labels: Option<Vec<i64>>,
  ) -> Self {
    let mut section_order = vec![SectionKind::Header, SectionKind::Constraints];
    if labels.is_some() {
      section_order.push(SectionKind::Labels);
    }
    Circuit {
      header,
      constraints,
      labels,
      section_order,
    }
  }

  /// The arithmetic context for this circuit's field.
  pub fn field(&self) -> Field {
    Field::new(self.header.prime.clone())
  }

  /// The role of `signal` under the header ranges.
  pub fn role(&self, signal: usize) -> SignalRole {
    let outputs_end = self.header.n_pub_out;
    let inputs_end = outputs_end + self.header.n_pub_in + self.header.n_prv_in;
    if signal == 0 {
      SignalRole::Constant
    } else if signal <= outputs_end {
      SignalRole::Output
    } else if signal <= inputs_end {
      SignalRole::Input
    } else {
      SignalRole::Internal
    }
  }

  /// Check the structural invariants: the constraint count matches the
  /// header, every referenced signal lies in `[0, n_wires)`, every stored
  /// coefficient lies in `[1, p-1]`, and the label map (if present) covers
  /// every wire.
  pub fn validate(&self) -> Result<(), EquivError> {
    let malformed = |reason: String| EquivError::MalformedFile { reason };

    if self.constraints.len() != self.header.n_constraints {
      return Err(malformed(format!(
        "constraint count {} disagrees with header {}",
        self.constraints.len(),
        self.header.n_constraints
      )));
    }
    let io_wires = 1 + self.header.n_pub_out + self.header.n_pub_in + self.header.n_prv_in;
    if self.header.n_wires < io_wires {
      return Err(malformed(format!(
        "wire count {} is smaller than the declared i/o wires {io_wires}",
        self.header.n_wires
      )));
    }
    for (i, cons) in self.constraints.iter().enumerate() {
      for (part, form) in [("A", &cons.a), ("B", &cons.b), ("C", &cons.c)] {
        for (signal, coeff) in form.iter() {
          if *signal >= self.header.n_wires {
            return Err(malformed(format!(
              "constraint {i} part {part} references signal {signal} \
               outside [0, {})",
              self.header.n_wires
            )));
          }
          if coeff.is_zero() || *coeff >= self.header.prime {
            return Err(malformed(format!(
              "constraint {i} part {part} stores a coefficient outside [1, p-1]"
            )));
          }
        }
      }
    }
    if let Some(labels) = &self.labels {
      if labels.len() != self.header.n_wires {
        return Err(malformed(format!(
          "label section covers {} wires, expected {}",
          labels.len(),
          self.header.n_wires
        )));
      }
    }
    Ok(())
  }
}
