//! This library decides whether two arithmetic circuits in the R1CS binary
//! format are structurally equivalent: identical up to a bijective
//! relabeling of signals and constant rescaling of individual constraints.
//!
//! The pipeline is built from a binary codec ([`r1cs`]), explicit modular
//! arithmetic ([`field`]), a constraint-normalization algebra that strips
//! the permitted rescalings ([`normalize`]), Weisfeiler–Lehman fingerprint
//! refinement over the bipartite signal/constraint graph ([`fingerprint`]),
//! and a decider that aligns the refined partitions and reads off witness
//! bijections ([`equiv`]). The seeded [`shuffle`] module synthesizes
//! guaranteed-equivalent circuit pairs for stress-testing.
#![deny(
  warnings,
  unused,
  future_incompatible,
  nonstandard_style,
  rust_2018_idioms,
  missing_docs
)]
#![allow(non_snake_case)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::type_complexity)]
#![forbid(unsafe_code)]

// private modules
mod unionfind;

// public modules
pub mod equiv;
pub mod errors;
pub mod field;
pub mod fingerprint;
pub mod normalize;
pub mod r1cs;
pub mod shuffle;
