//! Seeded, structure-preserving circuit shuffling.
//!
//! The shuffler deep-copies a circuit and applies transformations under
//! which the equivalence relation is invariant: bucket-wise signal
//! relabeling, per-constraint rescaling of `A` and `C`, constraint and term
//! reordering, and the `A`↔`B` swap. It exists to synthesize
//! guaranteed-equivalent circuit pairs for stress-testing the decider, and
//! backs the `shuffle` CLI command.

use crate::r1cs::{Circuit, Constraint};
use num_bigint::BigUint;
use num_traits::Zero;
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use rand_core::SeedableRng;

/// Which transformations to apply. Everything is on by default.
#[derive(Clone, Copy, Debug)]
pub struct ShuffleOptions {
  /// Rescale each constraint by a random `α ∈ [1, 2^10)` applied to `A` and `C`
  pub rescale: bool,
  /// Permute signal ids within the output, input, and internal buckets
  pub permute_signals: bool,
  /// Permute the constraint order
  pub permute_constraints: bool,
  /// Permute the term order inside every linear form
  pub permute_terms: bool,
  /// Swap `A` and `B` with probability one half
  pub swap_parts: bool,
}

impl Default for ShuffleOptions {
  fn default() -> Self {
    ShuffleOptions {
      rescale: true,
      permute_signals: true,
      permute_constraints: true,
      permute_terms: true,
      swap_parts: true,
    }
  }
}

/// The permutations a shuffle applied, so tests can invert them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleTrace {
  /// New signal id per old signal id
  pub signal_perm: Vec<usize>,
  /// New constraint index per old constraint index
  pub constraint_perm: Vec<usize>,
}

/// Produce an equivalent shuffled copy of `circ` from the given seed.
pub fn shuffle(circ: &Circuit, seed: u64, opts: &ShuffleOptions) -> (Circuit, ShuffleTrace) {
  let mut rng = StdRng::seed_from_u64(seed);
  let field = circ.field();
  let header = circ.header.clone();

  let mut signal_perm: Vec<usize> = (0..header.n_wires).collect();
  if opts.permute_signals {
    let outputs_end = 1 + header.n_pub_out;
    let inputs_end = outputs_end + header.n_pub_in + header.n_prv_in;
    signal_perm[1..outputs_end].shuffle(&mut rng);
    signal_perm[outputs_end..inputs_end].shuffle(&mut rng);
    signal_perm[inputs_end..].shuffle(&mut rng);
  }

  let mut constraints: Vec<Constraint> = circ
    .constraints
    .iter()
    .map(|cons| cons.map_signals(&signal_perm))
    .collect();

  for cons in &mut constraints {
    if opts.rescale {
      // α·A · B = α·C preserves the equation; α drawn from [1, 2^10) can
      // still reduce to zero in a tiny field, so redraw until it does not
      let mut alpha = field.reduce(&BigUint::from(rng.gen_range(1u64..1024)));
      while alpha.is_zero() {
        alpha = field.reduce(&BigUint::from(rng.gen_range(1u64..1024)));
      }
      cons.a = cons.a.scaled(&alpha, &field);
      cons.c = cons.c.scaled(&alpha, &field);
    }
    if opts.swap_parts && rng.gen_bool(0.5) {
      std::mem::swap(&mut cons.a, &mut cons.b);
    }
    if opts.permute_terms {
      cons.a.terms_mut().shuffle(&mut rng);
      cons.b.terms_mut().shuffle(&mut rng);
      cons.c.terms_mut().shuffle(&mut rng);
    }
  }

  let mut constraint_perm: Vec<usize> = (0..constraints.len()).collect();
  if opts.permute_constraints {
    constraint_perm.shuffle(&mut rng);
  }
  let mut placed: Vec<(usize, Constraint)> = constraint_perm
    .iter()
    .copied()
    .zip(constraints)
    .collect();
  placed.sort_by_key(|(new_index, _)| *new_index);
  let constraints: Vec<Constraint> = placed.into_iter().map(|(_, cons)| cons).collect();

  let labels = circ.labels.as_ref().map(|labels| {
    let mut relabeled = vec![0i64; labels.len()];
    for (old, &label) in labels.iter().enumerate() {
      relabeled[signal_perm[old]] = label;
    }
    relabeled
  });

  let shuffled = Circuit::new(header, constraints, labels);
  (
    shuffled,
    ShuffleTrace {
      signal_perm,
      constraint_perm,
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    equiv::{Verdict, compare},
    r1cs::test_support::sample_circuit,
  };
  use proptest::prelude::*;

  #[test]
  fn test_all_transforms_off_is_a_deep_copy() {
    let circ = sample_circuit();
    let opts = ShuffleOptions {
      rescale: false,
      permute_signals: false,
      permute_constraints: false,
      permute_terms: false,
      swap_parts: false,
    };
    let (shuffled, trace) = shuffle(&circ, 17, &opts);
    assert_eq!(shuffled, circ);
    assert_eq!(trace.signal_perm, (0..6).collect::<Vec<_>>());
    assert_eq!(trace.constraint_perm, vec![0, 1]);
  }

  #[test]
  fn test_signal_permutation_respects_buckets() {
    let circ = sample_circuit();
    for seed in 0..20 {
      let (_, trace) = shuffle(&circ, seed, &ShuffleOptions::default());
      let perm = &trace.signal_perm;
      assert_eq!(perm[0], 0);
      assert_eq!(perm[1], 1); // the only output can go nowhere else
      assert!(perm[2] >= 2 && perm[2] <= 3);
      assert!(perm[3] >= 2 && perm[3] <= 3);
      assert!(perm[4] >= 4 && perm[5] >= 4);
    }
  }

  #[test]
  fn test_header_and_labels_follow_the_shuffle() {
    let mut circ = sample_circuit();
    circ.labels = Some(vec![100, 101, 102, 103, 104, 105]);
    circ.section_order.push(crate::r1cs::SectionKind::Labels);
    let (shuffled, trace) = shuffle(&circ, 3, &ShuffleOptions::default());
    assert_eq!(shuffled.header, circ.header);
    let labels = shuffled.labels.unwrap();
    for old in 0..6 {
      assert_eq!(labels[trace.signal_perm[old]], 100 + old as i64);
    }
  }

  #[test]
  fn test_shuffle_is_deterministic_per_seed() {
    let circ = sample_circuit();
    let lhs = shuffle(&circ, 42, &ShuffleOptions::default());
    let rhs = shuffle(&circ, 42, &ShuffleOptions::default());
    assert_eq!(lhs.0, rhs.0);
    assert_eq!(lhs.1, rhs.1);
    let other = shuffle(&circ, 43, &ShuffleOptions::default());
    // different seeds almost surely shuffle differently
    assert!(other.0 != lhs.0 || other.1 != lhs.1);
  }

  proptest! {
    #[test]
    fn prop_shuffle_preserves_equivalence(seed in 0u64..1024) {
      let circ = sample_circuit();
      let (shuffled, trace) = shuffle(&circ, seed, &ShuffleOptions::default());
      match compare(&circ, &shuffled).unwrap() {
        Verdict::Equivalent { signal_map, constraint_map } => {
          // the recovered bijection inverts the shuffle exactly
          prop_assert_eq!(signal_map, trace.signal_perm);
          prop_assert_eq!(constraint_map, trace.constraint_perm);
        }
        other => prop_assert!(false, "expected Equivalent, got {:?}", other),
      }
    }
  }
}
