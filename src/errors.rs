//! This module defines errors returned by the library.
use thiserror::Error;

/// Errors returned by the equivalence pipeline.
///
/// Outcomes of the decision procedure itself (equivalent, structurally
/// different, ambiguous) are not errors; they are returned as
/// [`crate::equiv::Verdict`] values. An `EquivError` always aborts the
/// pipeline.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EquivError {
  /// returned if the input file fails magic, version, or section-layout checks
  #[error("MalformedFile: {reason}")]
  MalformedFile {
    /// The layout check that failed
    reason: String,
  },
  /// returned if the file declares a field wider than the supported bignum width
  #[error("UnsupportedField: field size {field_size} exceeds maximum {max}")]
  UnsupportedField {
    /// The field size declared by the file, in bytes
    field_size: usize,
    /// The maximum field size supported, in bytes
    max: usize,
  },
  /// returned when attempting to invert zero during normalization
  #[error("DivisionByZero")]
  DivisionByZero,
  /// returned when refinement fails to reach a fixed point within the round bound
  #[error("RefinementNonTermination: no fixed point after {rounds} rounds")]
  RefinementNonTermination {
    /// The number of rounds executed before giving up
    rounds: usize,
  },
  /// returned when reading or writing a circuit file fails
  #[error("IoError: {reason}")]
  IoError {
    /// The underlying I/O failure
    reason: String,
  },
}

impl From<std::io::Error> for EquivError {
  fn from(err: std::io::Error) -> Self {
    EquivError::IoError {
      reason: err.to_string(),
    }
  }
}
