//! The equivalence decider.
//!
//! Both circuits are refined in lockstep, their color partitions aligned by
//! value, and the bijections read off wherever classes are singletons. When
//! classes keep more than one member, per-constraint pairing options are
//! enumerated and every forced pairing is propagated through a union-find
//! over signal-pairing variables; whatever ambiguity survives propagation is
//! surfaced intact, never guessed.

use crate::{
  errors::EquivError,
  fingerprint::{Color, Refiner, max_rounds_for},
  normalize::{ScaledCandidate, normalize},
  r1cs::Circuit,
  unionfind::{PairingForest, UnionOutcome},
};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info_span};

/// Signals sharing one coefficient signature within a constraint pair. Any
/// bijection from the left list onto the right list is admissible for this
/// group.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SignatureGroup {
  /// Left-circuit signals with this signature
  pub l_signals: Vec<usize>,
  /// Right-circuit signals with this signature
  pub r_signals: Vec<usize>,
}

/// One admissible way to pair the signals of two constraints: a family of
/// signature groups covering both supports.
pub type PairingOption = Vec<SignatureGroup>;

/// Residual ambiguity for one aligned constraint class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResidualEntry {
  /// Left-circuit constraint indices in the class
  pub l_constraints: Vec<usize>,
  /// Right-circuit constraint indices in the class
  pub r_constraints: Vec<usize>,
  /// Surviving pairing options per `(left, right)` candidate pair
  pub options: Vec<((usize, usize), Vec<PairingOption>)>,
}

/// Outcome of comparing two circuits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Verdict {
  /// The circuits are equivalent under the returned bijections.
  Equivalent {
    /// Right-circuit signal per left-circuit signal id
    signal_map: Vec<usize>,
    /// Right-circuit constraint per left-circuit constraint index
    constraint_map: Vec<usize>,
  },
  /// The circuits differ structurally; no bijection exists.
  StructurallyDifferent {
    /// The invariant that failed
    reason: String,
  },
  /// Refinement converged but some classes stayed ambiguous; the residual
  /// is handed to downstream solvers untouched.
  AmbiguousResidual {
    /// The signal classes that stayed unresolved
    reason: String,
    /// The ambiguous constraint classes with their pairing options
    residual: Vec<ResidualEntry>,
  },
}

fn different(reason: impl Into<String>) -> Verdict {
  Verdict::StructurallyDifferent {
    reason: reason.into(),
  }
}

/// Decide whether two circuits are equivalent up to signal relabeling and
/// per-constraint rescaling.
pub fn compare(l: &Circuit, r: &Circuit) -> Result<Verdict, EquivError> {
  let span = info_span!(
    "compare",
    l_constraints = l.header.n_constraints,
    r_constraints = r.header.n_constraints
  );
  let _enter = span.enter();

  if let Some(verdict) = check_headers(l, r) {
    return Ok(verdict);
  }

  // lockstep refinement keeps the color values of both sides comparable
  let max_rounds = max_rounds_for(l).max(max_rounds_for(r));
  let mut rl = Refiner::new(l)?;
  let mut rr = Refiner::new(r)?;
  while !(rl.is_stable() && rr.is_stable()) {
    if rl.round() >= max_rounds {
      return Err(EquivError::RefinementNonTermination { rounds: rl.round() });
    }
    rl.step();
    rr.step();
  }
  debug!(rounds = rl.round(), "refinement fixed point");

  let l_cons_classes = classes(rl.constraint_colors());
  let r_cons_classes = classes(rr.constraint_colors());
  if !aligned(&l_cons_classes, &r_cons_classes) {
    return Ok(different("constraint color mismatch"));
  }
  let l_sig_classes = classes(rl.signal_colors());
  let r_sig_classes = classes(rr.signal_colors());
  if !aligned(&l_sig_classes, &r_sig_classes) {
    return Ok(different("signal color mismatch"));
  }

  let mut forest = PairingForest::new(l.header.n_wires, r.header.n_wires);
  for (color, ls) in &l_sig_classes {
    if ls.len() == 1 {
      // singleton classes are color-forced
      let rs = &r_sig_classes[color];
      forest.union_pair(ls[0], rs[0]);
    }
  }

  let mut l_match: Vec<Option<usize>> = vec![None; l.constraints.len()];
  let mut r_match: Vec<Option<usize>> = vec![None; r.constraints.len()];
  for (color, ls) in &l_cons_classes {
    if ls.len() == 1 {
      let rs = &r_cons_classes[color];
      l_match[ls[0]] = Some(rs[0]);
      r_match[rs[0]] = Some(ls[0]);
    }
  }

  let mut option_cache: BTreeMap<(usize, usize), Vec<PairingOption>> = BTreeMap::new();
  let mut options_for = |cl: usize, cr: usize| {
    option_cache
      .entry((cl, cr))
      .or_insert_with(|| {
        single_cons_options(
          rl.candidates_of(cl),
          rr.candidates_of(cr),
          rl.signal_colors(),
          rr.signal_colors(),
        )
      })
      .clone()
  };

  // propagate forced pairings to a fixed point
  loop {
    let mut changed = false;

    for cl in 0..l_match.len() {
      let Some(cr) = l_match[cl] else { continue };
      let filtered = filter_options(&options_for(cl, cr), &mut forest);
      if filtered.is_empty() {
        return Ok(different(format!(
          "no consistent signal pairing for constraints {cl} and {cr}"
        )));
      }
      if filtered.len() == 1 {
        match apply_option(&filtered[0], &mut forest) {
          Ok(applied) => changed |= applied,
          Err(reason) => return Ok(different(reason)),
        }
      }
    }

    for (color, ls) in &l_cons_classes {
      let rs = &r_cons_classes[color];
      if ls.len() <= 1 {
        continue;
      }
      for &cl in ls {
        if l_match[cl].is_some() {
          continue;
        }
        let viable: Vec<usize> = rs
          .iter()
          .copied()
          .filter(|&cr| {
            r_match[cr].is_none()
              && !filter_options(&options_for(cl, cr), &mut forest).is_empty()
          })
          .collect();
        match viable.as_slice() {
          [] => {
            return Ok(different(format!(
              "no viable partner for constraint {cl}"
            )));
          }
          [cr] => {
            l_match[cl] = Some(*cr);
            r_match[*cr] = Some(cl);
            changed = true;
          }
          _ => {}
        }
      }
    }

    if !changed {
      break;
    }
  }

  // signals outside every constraint are structure-free: pair aligned
  // classes in index order
  let incidence = signal_incidence(l);
  for (color, ls) in &l_sig_classes {
    if ls.len() > 1 && ls.iter().all(|&s| incidence[s] == 0) {
      let rs = &r_sig_classes[color];
      for (&ls_i, &rs_i) in ls.iter().zip(rs.iter()) {
        if forest.union_pair(ls_i, rs_i) == UnionOutcome::Conflict {
          return Ok(different(format!(
            "conflicting pairing for unused signal {ls_i}"
          )));
        }
      }
    }
  }

  let signal_map: Option<Vec<usize>> = (0..l.header.n_wires)
    .map(|s| forest.partner_of_left(s))
    .collect();
  let constraint_map: Option<Vec<usize>> = l_match.iter().copied().collect();

  if let (Some(signal_map), Some(constraint_map)) = (signal_map, constraint_map) {
    // replay every constraint through the signal map as a collision guard
    let field = l.field();
    for (cl, cons) in l.constraints.iter().enumerate() {
      let mapped = cons.map_signals(&signal_map);
      let partner = &r.constraints[constraint_map[cl]];
      if normalize(&mapped, &field)? != normalize(partner, &field)? {
        return Ok(different(format!(
          "constraint replay mismatch at left constraint {cl}"
        )));
      }
    }
    return Ok(Verdict::Equivalent {
      signal_map,
      constraint_map,
    });
  }

  // surface the residual: constraint classes that stayed ambiguous, or
  // matched pairs whose pairing options keep interchangeable signals
  let mut residual = Vec::new();
  for (color, ls) in &l_cons_classes {
    let rs = &r_cons_classes[color];
    let mut options = Vec::new();
    for &cl in ls {
      match l_match[cl] {
        Some(cr) => {
          let filtered = filter_options(&options_for(cl, cr), &mut forest);
          if filtered
            .iter()
            .any(|opt| has_unresolved_group(opt, &mut forest))
          {
            options.push(((cl, cr), filtered));
          }
        }
        None => {
          for &cr in rs {
            if r_match[cr].is_none() {
              let filtered = filter_options(&options_for(cl, cr), &mut forest);
              options.push(((cl, cr), filtered));
            }
          }
        }
      }
    }
    if !options.is_empty() {
      residual.push(ResidualEntry {
        l_constraints: ls.clone(),
        r_constraints: rs.clone(),
        options,
      });
    }
  }
  let unresolved: Vec<Vec<usize>> = l_sig_classes
    .values()
    .filter(|ls| {
      ls.len() > 1 && ls.iter().any(|&s| forest.partner_of_left(s).is_none())
    })
    .cloned()
    .collect();
  Ok(Verdict::AmbiguousResidual {
    reason: format!("unresolved signal classes: {unresolved:?}"),
    residual,
  })
}

fn check_headers(l: &Circuit, r: &Circuit) -> Option<Verdict> {
  if l.header.prime != r.header.prime {
    return Some(different("header mismatch: field modulus"));
  }
  let fields = [
    ("nPubOut", l.header.n_pub_out, r.header.n_pub_out),
    ("nPubIn", l.header.n_pub_in, r.header.n_pub_in),
    ("nPrvIn", l.header.n_prv_in, r.header.n_prv_in),
    ("nConstraints", l.header.n_constraints, r.header.n_constraints),
  ];
  for (name, lv, rv) in fields {
    if lv != rv {
      return Some(different(format!("header mismatch: {name} {lv} vs {rv}")));
    }
  }
  None
}

fn classes(colors: &[Color]) -> BTreeMap<Color, Vec<usize>> {
  let mut map: BTreeMap<Color, Vec<usize>> = BTreeMap::new();
  for (i, color) in colors.iter().enumerate() {
    map.entry(*color).or_default().push(i);
  }
  map
}

fn aligned(lc: &BTreeMap<Color, Vec<usize>>, rc: &BTreeMap<Color, Vec<usize>>) -> bool {
  lc.len() == rc.len()
    && lc
      .iter()
      .all(|(color, ls)| rc.get(color).is_some_and(|rs| rs.len() == ls.len()))
}

fn signal_incidence(circ: &Circuit) -> Vec<usize> {
  let mut incidence = vec![0usize; circ.header.n_wires];
  for cons in &circ.constraints {
    for s in cons.signals() {
      incidence[s] += 1;
    }
  }
  incidence
}

type Signature = (Color, Option<BigUint>, Option<BigUint>, Option<BigUint>);

/// All ways the signals of two same-colored constraints can be paired:
/// signals are grouped by their coefficient signature across the parts
/// (under both part orientations), and any family of per-group bijections
/// that covers both supports is admissible.
pub(crate) fn single_cons_options(
  l_cands: &[ScaledCandidate],
  r_cands: &[ScaledCandidate],
  l_colors: &[Color],
  r_colors: &[Color],
) -> Vec<PairingOption> {
  let mut out: BTreeSet<PairingOption> = BTreeSet::new();
  for lc in l_cands {
    for rc in r_cands {
      for swap in [false, true] {
        if let Some(option) = match_candidates(lc, rc, swap, l_colors, r_colors) {
          out.insert(option);
        }
      }
    }
  }
  out.into_iter().collect()
}

fn match_candidates(
  lc: &ScaledCandidate,
  rc: &ScaledCandidate,
  swap: bool,
  l_colors: &[Color],
  r_colors: &[Color],
) -> Option<PairingOption> {
  let mut groups: BTreeMap<Signature, SignatureGroup> = BTreeMap::new();
  let l_signals: BTreeSet<usize> = lc
    .a
    .signals()
    .chain(lc.b.signals())
    .chain(lc.c.signals())
    .collect();
  for s in l_signals {
    let sig = (
      l_colors[s],
      lc.a.get(s).cloned(),
      lc.b.get(s).cloned(),
      lc.c.get(s).cloned(),
    );
    groups.entry(sig).or_default().l_signals.push(s);
  }
  let r_signals: BTreeSet<usize> = rc
    .a
    .signals()
    .chain(rc.b.signals())
    .chain(rc.c.signals())
    .collect();
  for s in r_signals {
    let (part_a, part_b) = if swap {
      (rc.b.get(s), rc.a.get(s))
    } else {
      (rc.a.get(s), rc.b.get(s))
    };
    let sig = (
      r_colors[s],
      part_a.cloned(),
      part_b.cloned(),
      rc.c.get(s).cloned(),
    );
    groups.entry(sig).or_default().r_signals.push(s);
  }
  let option: PairingOption = groups.into_values().collect();
  option
    .iter()
    .all(|g| g.l_signals.len() == g.r_signals.len())
    .then_some(option)
}

fn group_consistent(group: &SignatureGroup, forest: &mut PairingForest) -> bool {
  group.l_signals.iter().all(|&s| {
    forest
      .partner_of_left(s)
      .is_none_or(|r| group.r_signals.contains(&r))
  }) && group.r_signals.iter().all(|&s| {
    forest
      .partner_of_right(s)
      .is_none_or(|l| group.l_signals.contains(&l))
  })
}

fn filter_options(
  options: &[PairingOption],
  forest: &mut PairingForest,
) -> Vec<PairingOption> {
  options
    .iter()
    .filter(|opt| opt.iter().all(|g| group_consistent(g, forest)))
    .cloned()
    .collect()
}

fn unresolved_members(
  group: &SignatureGroup,
  forest: &mut PairingForest,
) -> (Vec<usize>, Vec<usize>) {
  let l: Vec<usize> = group
    .l_signals
    .iter()
    .copied()
    .filter(|&s| forest.partner_of_left(s).is_none())
    .collect();
  let r: Vec<usize> = group
    .r_signals
    .iter()
    .copied()
    .filter(|&s| forest.partner_of_right(s).is_none())
    .collect();
  (l, r)
}

fn has_unresolved_group(option: &PairingOption, forest: &mut PairingForest) -> bool {
  option
    .iter()
    .any(|g| !unresolved_members(g, forest).0.is_empty())
}

/// Apply the forced (singleton) groups of the only surviving option.
fn apply_option(option: &PairingOption, forest: &mut PairingForest) -> Result<bool, String> {
  let mut changed = false;
  for group in option {
    let (un_l, un_r) = unresolved_members(group, forest);
    if un_l.len() == 1 && un_r.len() == 1 {
      match forest.union_pair(un_l[0], un_r[0]) {
        UnionOutcome::Merged => changed = true,
        UnionOutcome::AlreadyPaired => {}
        UnionOutcome::Conflict => {
          return Err(format!(
            "conflicting signal pairing {} vs {}",
            un_l[0], un_r[0]
          ));
        }
      }
    }
  }
  Ok(changed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::r1cs::{
    Constraint, LinearForm,
    test_support::{circuit_p7, circuit_p7_plain, form, sample_circuit},
  };

  fn assert_equivalent_identity(verdict: &Verdict, n_wires: usize, n_cons: usize) {
    match verdict {
      Verdict::Equivalent {
        signal_map,
        constraint_map,
      } => {
        assert_eq!(signal_map, &(0..n_wires).collect::<Vec<_>>());
        assert_eq!(constraint_map, &(0..n_cons).collect::<Vec<_>>());
      }
      other => panic!("expected Equivalent, got {other:?}"),
    }
  }

  #[test]
  fn test_identical_circuits_are_equivalent() {
    let circ = sample_circuit();
    let verdict = compare(&circ, &circ).unwrap();
    assert_equivalent_identity(&verdict, 6, 2);
  }

  #[test]
  fn test_swap_and_rescale_is_equivalent() {
    // A·B = C against (3B)·A = 3C over p = 7
    let l = circuit_p7(
      4,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 1)]),
      )],
    );
    let r = circuit_p7(
      4,
      vec![Constraint::new(
        form(&[(2, 3)]),
        form(&[(1, 1)]),
        form(&[(3, 3)]),
      )],
    );
    let verdict = compare(&l, &r).unwrap();
    assert_equivalent_identity(&verdict, 4, 1);
  }

  #[test]
  fn test_relabeled_internal_signals_recovered() {
    let l = sample_circuit();
    // swap internal wires 4 and 5
    let perm = vec![0, 1, 2, 3, 5, 4];
    let mut r = l.clone();
    r.constraints = l
      .constraints
      .iter()
      .map(|cons| cons.map_signals(&perm))
      .collect();
    match compare(&l, &r).unwrap() {
      Verdict::Equivalent { signal_map, .. } => assert_eq!(signal_map, perm),
      other => panic!("expected Equivalent, got {other:?}"),
    }
  }

  #[test]
  fn test_mutated_coefficient_is_detected() {
    let l = circuit_p7(
      4,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 1)]),
      )],
    );
    let r = circuit_p7(
      4,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 2)]),
      )],
    );
    assert_eq!(
      compare(&l, &r).unwrap(),
      Verdict::StructurallyDifferent {
        reason: "constraint color mismatch".to_string()
      }
    );
  }

  #[test]
  fn test_header_mismatch_is_structural() {
    let l = circuit_p7(4, vec![]);
    let mut r = circuit_p7(4, vec![]);
    r.header.n_pub_out = 2;
    r.header.n_pub_in = 0;
    match compare(&l, &r).unwrap() {
      Verdict::StructurallyDifferent { reason } => {
        assert!(reason.contains("header mismatch"), "reason: {reason}");
      }
      other => panic!("expected StructurallyDifferent, got {other:?}"),
    }
  }

  #[test]
  fn test_empty_circuits_equivalent_with_identity_maps() {
    let l = circuit_p7(4, vec![]);
    let verdict = compare(&l, &l.clone()).unwrap();
    assert_equivalent_identity(&verdict, 4, 0);
  }

  #[test]
  fn test_symmetric_circuit_surfaces_residual() {
    // (s1 + s2)(s3 + s4) = s5 has the automorphism 1↔2, 3↔4 (and the whole
    // A↔B swap), so refinement cannot separate those wires
    let make = || {
      circuit_p7_plain(
        6,
        vec![Constraint::new(
          form(&[(1, 1), (2, 1)]),
          form(&[(3, 1), (4, 1)]),
          form(&[(5, 1)]),
        )],
      )
    };
    match compare(&make(), &make()).unwrap() {
      Verdict::AmbiguousResidual { reason, residual } => {
        assert!(reason.contains('1') && reason.contains('4'), "reason: {reason}");
        assert_eq!(residual.len(), 1);
        let (_, options) = &residual[0].options[0];
        // the interchangeable groups {1,2} and {3,4} survive in the options
        assert!(options.iter().any(|opt| {
          opt
            .iter()
            .any(|g| g.l_signals == vec![1, 2] || g.l_signals == vec![3, 4])
        }));
      }
      other => panic!("expected AmbiguousResidual, got {other:?}"),
    }
  }

  #[test]
  fn test_shared_wire_separates_interchangeable_signals() {
    // wires 4 and 5 look interchangeable in the first constraint alone, but
    // wire 4 also appears squared in the second, which splits their classes
    let make = |flip: bool| {
      let (x, y) = if flip { (5, 4) } else { (4, 5) };
      circuit_p7_plain(
        7,
        vec![
          Constraint::new(form(&[(1, 1)]), form(&[(x, 1), (y, 1)]), form(&[(2, 1)])),
          Constraint::new(form(&[(x, 1)]), form(&[(x, 1)]), form(&[(6, 1)])),
        ],
      )
    };
    let l = make(false);
    let r = make(true);
    match compare(&l, &r).unwrap() {
      Verdict::Equivalent { signal_map, .. } => {
        assert_eq!(signal_map, vec![0, 1, 2, 3, 5, 4, 6]);
      }
      other => panic!("expected Equivalent, got {other:?}"),
    }
  }

  #[test]
  fn test_different_field_is_structural() {
    let l = circuit_p7(4, vec![]);
    let mut r = circuit_p7(4, vec![]);
    r.header.prime = num_bigint::BigUint::from(11u64);
    assert_eq!(
      compare(&l, &r).unwrap(),
      Verdict::StructurallyDifferent {
        reason: "header mismatch: field modulus".to_string()
      }
    );
  }

  #[test]
  fn test_single_cons_options_groups_by_coefficient() {
    let circ = circuit_p7_plain(
      6,
      vec![Constraint::new(
        form(&[(1, 1), (2, 1)]),
        form(&[(3, 1), (4, 1)]),
        form(&[(5, 1)]),
      )],
    );
    let refinement = crate::fingerprint::refine(&circ).unwrap();
    let refiner = Refiner::new(&circ).unwrap();
    let options = single_cons_options(
      refiner.candidates_of(0),
      refiner.candidates_of(0),
      &refinement.signal_colors,
      &refinement.signal_colors,
    );
    // the identity orientation and the A↔B swap both survive
    assert_eq!(options.len(), 2);
    for option in &options {
      for group in option {
        assert_eq!(group.l_signals.len(), group.r_signals.len());
      }
    }
  }

  #[test]
  fn test_unused_wires_do_not_block_equivalence() {
    // wires 4 and 5 appear in no constraint
    let circ = circuit_p7(
      6,
      vec![Constraint::new(
        form(&[(1, 1)]),
        form(&[(2, 1)]),
        form(&[(3, 1)]),
      )],
    );
    let verdict = compare(&circ, &circ.clone()).unwrap();
    assert_equivalent_identity(&verdict, 6, 1);
  }

  #[test]
  fn test_linear_constraint_circuits() {
    let make = |coeff: u64| {
      circuit_p7(
        4,
        vec![Constraint::new(
          LinearForm::new(),
          LinearForm::new(),
          form(&[(0, coeff), (2, 1), (3, 3)]),
        )],
      )
    };
    // rescaling the whole C form is permitted
    let l = make(2);
    let mut r = make(2);
    let rescaled = r.constraints[0].c.scaled(&num_bigint::BigUint::from(3u64), &r.field());
    r.constraints[0].c = rescaled;
    match compare(&l, &r).unwrap() {
      Verdict::Equivalent { signal_map, .. } => assert_eq!(signal_map, vec![0, 1, 2, 3]),
      other => panic!("expected Equivalent, got {other:?}"),
    }
  }
}
