//! Weisfeiler–Lehman color refinement over the bipartite signal/constraint
//! graph.
//!
//! Signals start colored by role; constraints start colored by their
//! normalization set with signal identities erased. Each round recolors
//! constraints from the current signal colors and signals from the multiset
//! of `(constraint color, part membership)` pairs they touch. Every new
//! color folds in the previous one, so the partitions can only split; the
//! fixed point is detected by class-count stability.
//!
//! Colors are SHA3-256 digests of bincode-serialized canonical values. The
//! full 32-byte digest is kept as the color, and the decider replays the
//! final bijection against the real constraints, so a hash collision cannot
//! produce a false `Equivalent`.

use crate::{
  errors::EquivError,
  normalize::{ScaledCandidate, scaling_candidates},
  r1cs::Circuit,
};
use bincode::Options;
use itertools::Itertools;
use num_bigint::BigUint;
use rayon::prelude::*;
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info_span, warn};

/// Environment knob overriding the refinement round bound.
pub const MAX_ROUNDS_ENV: &str = "R1CS_MAX_ROUNDS";

/// A refinement color. Equal colors mean "indistinguishable so far"; the
/// color value itself is comparable across circuits refined in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Color([u8; 32]);

impl Color {
  fn of<T: Serialize>(value: &T) -> Color {
    let mut hasher = Sha3_256::new();
    let config = bincode::DefaultOptions::new()
      .with_little_endian()
      .with_fixint_encoding();
    config
      .serialize_into(&mut hasher, value)
      .expect("serialization into a hasher cannot fail");
    Color(hasher.finalize().into())
  }

  /// Hex rendering for diagnostic output.
  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

// part-membership codes folded into signal colors; 1..3 encode canonical
// A/B membership under the ordered regime, 4 encodes "exactly one of A/B"
// when the two parts are indistinguishable
const IN_CANONICAL_A: u8 = 1;
const IN_CANONICAL_B: u8 = 2;
const IN_ONE_OF_AB: u8 = 4;

type RoleCode = (u8, bool);
type ColoredTerms = Vec<(Color, BigUint)>;

struct ConstraintRound {
  color: Color,
  // per signal: the sorted role codes it takes across candidates
  roles: Vec<(usize, Vec<RoleCode>)>,
}

/// The stable coloring of one circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refinement {
  /// Final color per signal id
  pub signal_colors: Vec<Color>,
  /// Final color per constraint index
  pub constraint_colors: Vec<Color>,
  /// Rounds executed to reach the fixed point
  pub rounds: usize,
}

/// Stepwise refinement state for one circuit.
///
/// The decider drives two refiners in lockstep so that the color values of
/// both circuits pass through the same number of hashing rounds and stay
/// comparable.
pub struct Refiner<'a> {
  circuit: &'a Circuit,
  candidates: Vec<Vec<ScaledCandidate>>,
  sig_colors: Vec<Color>,
  cons_colors: Vec<Color>,
  n_sig_classes: usize,
  n_cons_classes: usize,
  stable: bool,
  round: usize,
}

impl<'a> Refiner<'a> {
  /// Set up round 0: role colors for signals, signal-erased normalization
  /// colors for constraints.
  pub fn new(circuit: &'a Circuit) -> Result<Self, EquivError> {
    let field = circuit.field();
    let candidates = circuit
      .constraints
      .iter()
      .map(|cons| scaling_candidates(cons, &field))
      .collect::<Result<Vec<_>, _>>()?;

    let sig_colors: Vec<Color> = (0..circuit.header.n_wires)
      .map(|s| Color::of(&circuit.role(s)))
      .collect();

    // all signals indistinguishable except the constant wire
    let markers: Vec<Color> = (0..circuit.header.n_wires)
      .map(|s| Color::of(&(s == 0)))
      .collect();
    let cons_colors: Vec<Color> = candidates
      .par_iter()
      .map(|cands| color_constraint(cands, None, &markers).color)
      .collect();

    let n_sig_classes = distinct(&sig_colors);
    let n_cons_classes = distinct(&cons_colors);
    Ok(Refiner {
      circuit,
      candidates,
      sig_colors,
      cons_colors,
      n_sig_classes,
      n_cons_classes,
      stable: false,
      round: 0,
    })
  }

  /// Run one refinement round: constraints first from the current signal
  /// colors, then signals from the new constraint colors.
  pub fn step(&mut self) {
    let cons_rounds: Vec<ConstraintRound> = self
      .candidates
      .par_iter()
      .enumerate()
      .map(|(i, cands)| color_constraint(cands, Some(self.cons_colors[i]), &self.sig_colors))
      .collect();

    let mut entries: Vec<Vec<(Color, Vec<RoleCode>)>> =
      vec![Vec::new(); self.circuit.header.n_wires];
    for cr in &cons_rounds {
      for (signal, roles) in &cr.roles {
        entries[*signal].push((cr.color, roles.clone()));
      }
    }
    let new_sig_colors: Vec<Color> = entries
      .into_par_iter()
      .enumerate()
      .map(|(s, mut list)| {
        list.sort();
        Color::of(&(self.sig_colors[s], list))
      })
      .collect();

    self.cons_colors = cons_rounds.into_iter().map(|cr| cr.color).collect();
    self.sig_colors = new_sig_colors;
    self.round += 1;

    let n_sig = distinct(&self.sig_colors);
    let n_cons = distinct(&self.cons_colors);
    // colors fold in their predecessors, so classes only ever split and
    // equal counts imply an unchanged partition
    self.stable = n_sig == self.n_sig_classes && n_cons == self.n_cons_classes;
    debug!(
      round = self.round,
      signal_classes = n_sig,
      constraint_classes = n_cons,
      stable = self.stable,
      "refinement round"
    );
    self.n_sig_classes = n_sig;
    self.n_cons_classes = n_cons;
  }

  /// Whether the last round left both partitions unchanged.
  pub fn is_stable(&self) -> bool {
    self.stable
  }

  /// Rounds executed so far.
  pub fn round(&self) -> usize {
    self.round
  }

  /// Current signal colors, indexed by signal id.
  pub fn signal_colors(&self) -> &[Color] {
    &self.sig_colors
  }

  /// Current constraint colors, indexed by constraint index.
  pub fn constraint_colors(&self) -> &[Color] {
    &self.cons_colors
  }

  /// Number of distinct signal colors.
  pub fn n_signal_classes(&self) -> usize {
    self.n_sig_classes
  }

  /// Number of distinct constraint colors.
  pub fn n_constraint_classes(&self) -> usize {
    self.n_cons_classes
  }

  pub(crate) fn candidates_of(&self, cons_index: usize) -> &[ScaledCandidate] {
    &self.candidates[cons_index]
  }

  /// Consume the refiner into its final coloring.
  pub fn into_refinement(self) -> Refinement {
    Refinement {
      signal_colors: self.sig_colors,
      constraint_colors: self.cons_colors,
      rounds: self.round,
    }
  }
}

fn distinct(colors: &[Color]) -> usize {
  colors.iter().unique().count()
}

fn color_terms(form: &crate::r1cs::LinearForm, sig_colors: &[Color]) -> ColoredTerms {
  let mut terms: ColoredTerms = form
    .iter()
    .map(|(s, c)| (sig_colors[*s], c.clone()))
    .collect();
  terms.sort();
  terms
}

fn color_constraint(
  cands: &[ScaledCandidate],
  prev: Option<Color>,
  sig_colors: &[Color],
) -> ConstraintRound {
  let mut forms: BTreeSet<(ColoredTerms, ColoredTerms, ColoredTerms)> = BTreeSet::new();
  let mut roles: BTreeMap<usize, BTreeSet<RoleCode>> = BTreeMap::new();

  for cand in cands {
    let colored_a = color_terms(&cand.a, sig_colors);
    let colored_b = color_terms(&cand.b, sig_colors);
    let colored_c = color_terms(&cand.c, sig_colors);
    let ordering = colored_a.cmp(&colored_b);
    let unordered = ordering == std::cmp::Ordering::Equal;
    let swapped = ordering == std::cmp::Ordering::Greater;

    let signals: BTreeSet<usize> = cand
      .a
      .signals()
      .chain(cand.b.signals())
      .chain(cand.c.signals())
      .collect();
    for s in signals {
      let in_a = cand.a.contains(s);
      let in_b = cand.b.contains(s);
      let in_c = cand.c.contains(s);
      let ab_code = if unordered {
        if in_a && in_b {
          IN_CANONICAL_A | IN_CANONICAL_B
        } else if in_a || in_b {
          IN_ONE_OF_AB
        } else {
          0
        }
      } else {
        let (in_canon_a, in_canon_b) = if swapped { (in_b, in_a) } else { (in_a, in_b) };
        (if in_canon_a { IN_CANONICAL_A } else { 0 })
          | (if in_canon_b { IN_CANONICAL_B } else { 0 })
      };
      roles.entry(s).or_default().insert((ab_code, in_c));
    }

    if swapped {
      forms.insert((colored_b, colored_a, colored_c));
    } else {
      forms.insert((colored_a, colored_b, colored_c));
    }
  }

  ConstraintRound {
    color: Color::of(&(prev, &forms)),
    roles: roles
      .into_iter()
      .map(|(s, codes)| (s, codes.into_iter().collect()))
      .collect(),
  }
}

/// The round bound: `R1CS_MAX_ROUNDS` when set and parseable, otherwise
/// `n_wires + n_constraints + 1`, which always suffices because every
/// non-final round splits at least one class.
pub fn max_rounds_for(circuit: &Circuit) -> usize {
  let default = circuit.header.n_wires + circuit.header.n_constraints + 1;
  match std::env::var(MAX_ROUNDS_ENV) {
    Ok(raw) => raw.parse().unwrap_or_else(|_| {
      warn!(value = %raw, "ignoring unparseable {MAX_ROUNDS_ENV}");
      default
    }),
    Err(_) => default,
  }
}

/// Refine a single circuit to its stable coloring.
pub fn refine(circuit: &Circuit) -> Result<Refinement, EquivError> {
  refine_with_bound(circuit, max_rounds_for(circuit))
}

/// Refine with an explicit round bound.
pub fn refine_with_bound(
  circuit: &Circuit,
  max_rounds: usize,
) -> Result<Refinement, EquivError> {
  let span = info_span!("refine", n_wires = circuit.header.n_wires);
  let _enter = span.enter();
  let mut refiner = Refiner::new(circuit)?;
  while !refiner.is_stable() {
    if refiner.round() >= max_rounds {
      return Err(EquivError::RefinementNonTermination {
        rounds: refiner.round(),
      });
    }
    refiner.step();
  }
  Ok(refiner.into_refinement())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::r1cs::{
    Constraint,
    test_support::{circuit_p7, form, sample_circuit},
  };

  #[test]
  fn test_refinement_terminates_and_is_deterministic() {
    let circ = sample_circuit();
    let first = refine(&circ).unwrap();
    let second = refine(&circ).unwrap();
    assert_eq!(first.signal_colors, second.signal_colors);
    assert_eq!(first.constraint_colors, second.constraint_colors);
    assert_eq!(first.rounds, second.rounds);
  }

  #[test]
  fn test_class_counts_are_monotone() {
    let circ = sample_circuit();
    let mut refiner = Refiner::new(&circ).unwrap();
    let mut prev = (refiner.n_signal_classes(), refiner.n_constraint_classes());
    for _ in 0..max_rounds_for(&circ) {
      if refiner.is_stable() {
        break;
      }
      refiner.step();
      let cur = (refiner.n_signal_classes(), refiner.n_constraint_classes());
      assert!(cur.0 >= prev.0 && cur.1 >= prev.1);
      prev = cur;
    }
    assert!(refiner.is_stable());
  }

  #[test]
  fn test_sample_circuit_fully_separates() {
    let circ = sample_circuit();
    let refinement = refine(&circ).unwrap();
    assert_eq!(distinct(&refinement.signal_colors), circ.header.n_wires);
    assert_eq!(
      distinct(&refinement.constraint_colors),
      circ.constraints.len()
    );
  }

  #[test]
  fn test_structural_automorphism_keeps_classes_merged() {
    // 1·3 + 1·4 times 1·5 + 1·6, output 7: signals 3/4 and 5/6 are
    // interchangeable (all internal wires), so their classes never split
    let circ = circuit_p7(
      8,
      vec![Constraint::new(
        form(&[(4, 1), (5, 1)]),
        form(&[(6, 1), (7, 1)]),
        form(&[(3, 1)]),
      )],
    );
    let refinement = refine(&circ).unwrap();
    assert_eq!(refinement.signal_colors[4], refinement.signal_colors[5]);
    assert_eq!(refinement.signal_colors[6], refinement.signal_colors[7]);
    // A and B have equal colored multisets, so even the two pairs merge
    assert_eq!(refinement.signal_colors[4], refinement.signal_colors[6]);
    assert_ne!(refinement.signal_colors[3], refinement.signal_colors[4]);
  }

  #[test]
  fn test_coefficient_change_separates_constraints() {
    let base = circuit_p7(
      6,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 1)]),
      )],
    );
    let changed = circuit_p7(
      6,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 2)]),
      )],
    );
    let lhs = refine(&base).unwrap();
    let rhs = refine(&changed).unwrap();
    // lockstep comparison: both converge in the same number of rounds here
    assert_eq!(lhs.rounds, rhs.rounds);
    assert_ne!(lhs.constraint_colors[0], rhs.constraint_colors[0]);
  }

  #[test]
  fn test_zero_bound_reports_nontermination() {
    let circ = sample_circuit();
    assert_eq!(
      refine_with_bound(&circ, 0),
      Err(EquivError::RefinementNonTermination { rounds: 0 })
    );
  }

  #[test]
  fn test_empty_circuit_converges_immediately() {
    let circ = circuit_p7(4, vec![]);
    let refinement = refine(&circ).unwrap();
    assert_eq!(refinement.rounds, 1);
    // roles only: constant, output, two inputs... wires 0..4 are
    // constant/output/input/input, so three classes survive
    assert_eq!(distinct(&refinement.signal_colors), 3);
  }
}
