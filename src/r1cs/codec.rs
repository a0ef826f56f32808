//! Reader and writer for the section-tagged R1CS binary container.
//!
//! The on-disk format is little-endian throughout: a 4-byte magic `r1cs`,
//! a version word, a section count, then `(type, size, payload)` sections.
//! Section payloads are parsed against their declared sizes; any
//! disagreement is a [`EquivError::MalformedFile`]. The writer emits
//! sections in the order recorded by the parser and backfills each size
//! field from the serialized payload, which makes `write(parse(b)) == b`
//! for well-formed inputs.

use crate::{
  errors::EquivError,
  r1cs::{Circuit, CircuitHeader, Constraint, LinearForm, SectionKind},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_bigint::BigUint;
use num_traits::Zero;
use std::{io::Cursor, path::Path};
use tracing::{info_span, warn};

const MAGIC: [u8; 4] = *b"r1cs";
const VERSION: i32 = 1;

const SECTION_HEADER: i32 = 1;
const SECTION_CONSTRAINTS: i32 = 2;
const SECTION_LABELS: i32 = 3;

/// Widest supported field, in bytes (BN254 and every other ≤ 256-bit prime).
pub const MAX_FIELD_SIZE: usize = 32;

fn malformed(reason: impl Into<String>) -> EquivError {
  EquivError::MalformedFile {
    reason: reason.into(),
  }
}

/// Parse an R1CS file from disk.
pub fn parse_r1cs(path: &Path) -> Result<Circuit, EquivError> {
  let span = info_span!("parse_r1cs", path = %path.display());
  let _enter = span.enter();
  let bytes = std::fs::read(path)?;
  parse_r1cs_bytes(&bytes)
}

/// Parse an R1CS file from an in-memory byte string.
pub fn parse_r1cs_bytes(bytes: &[u8]) -> Result<Circuit, EquivError> {
  let mut rd = Cursor::new(bytes);

  let mut magic = [0u8; 4];
  read_exact(&mut rd, &mut magic)?;
  if magic != MAGIC {
    return Err(malformed("bad magic"));
  }
  let version = read_i32(&mut rd)?;
  if version != VERSION {
    return Err(malformed(format!("unsupported version {version}")));
  }
  let n_sections = read_i32(&mut rd)?;
  if n_sections < 0 {
    return Err(malformed("negative section count"));
  }

  // Index all sections before parsing: the constraint section may precede
  // the header, and coefficients cannot be read without the field size.
  let mut sections: Vec<(i32, usize, usize)> = Vec::with_capacity(n_sections as usize);
  for _ in 0..n_sections {
    let stype = read_i32(&mut rd)?;
    let ssize = read_i64(&mut rd)?;
    if ssize < 0 {
      return Err(malformed(format!("negative size for section type {stype}")));
    }
    let offset = rd.position() as usize;
    let ssize = ssize as usize;
    if offset + ssize > bytes.len() {
      return Err(malformed(format!("section type {stype} overruns the file")));
    }
    if sections.iter().any(|(t, _, _)| *t == stype) {
      return Err(malformed(format!("duplicate section type {stype}")));
    }
    if !matches!(stype, SECTION_HEADER | SECTION_CONSTRAINTS | SECTION_LABELS) {
      return Err(malformed(format!("unexpected section type {stype}")));
    }
    sections.push((stype, offset, ssize));
    rd.set_position((offset + ssize) as u64);
  }
  if rd.position() as usize != bytes.len() {
    return Err(malformed("trailing bytes after the final section"));
  }

  let find = |stype: i32| {
    sections
      .iter()
      .find(|(t, _, _)| *t == stype)
      .map(|(_, offset, size)| (*offset, *size))
  };

  let (header_offset, header_size) =
    find(SECTION_HEADER).ok_or_else(|| malformed("missing header section"))?;
  let header = parse_header(&bytes[header_offset..header_offset + header_size])?;

  let constraints = match find(SECTION_CONSTRAINTS) {
    Some((offset, size)) => parse_constraints(&bytes[offset..offset + size], &header)?,
    None if header.n_constraints == 0 => Vec::new(),
    None => return Err(malformed("missing constraint section")),
  };

  let labels = match find(SECTION_LABELS) {
    Some((offset, size)) => Some(parse_labels(&bytes[offset..offset + size], &header)?),
    None => None,
  };

  let section_order = sections
    .iter()
    .map(|(stype, _, _)| match *stype {
      SECTION_HEADER => SectionKind::Header,
      SECTION_CONSTRAINTS => SectionKind::Constraints,
      _ => SectionKind::Labels,
    })
    .collect();

  let circ = Circuit {
    header,
    constraints,
    labels,
    section_order,
  };
  circ.validate()?;
  Ok(circ)
}

fn parse_header(payload: &[u8]) -> Result<CircuitHeader, EquivError> {
  let mut rd = Cursor::new(payload);
  let field_size = read_u32(&mut rd)? as usize;
  if field_size > MAX_FIELD_SIZE {
    return Err(EquivError::UnsupportedField {
      field_size,
      max: MAX_FIELD_SIZE,
    });
  }
  if payload.len() != 6 * 4 + 8 + field_size {
    return Err(malformed("header section size mismatch"));
  }
  let mut prime_bytes = vec![0u8; field_size];
  read_exact(&mut rd, &mut prime_bytes)?;
  let prime = BigUint::from_bytes_le(&prime_bytes);
  if prime.is_zero() {
    return Err(malformed("zero field modulus"));
  }
  Ok(CircuitHeader {
    prime,
    field_size,
    n_wires: read_u32(&mut rd)? as usize,
    n_pub_out: read_u32(&mut rd)? as usize,
    n_pub_in: read_u32(&mut rd)? as usize,
    n_prv_in: read_u32(&mut rd)? as usize,
    n_labels: read_u64(&mut rd)?,
    n_constraints: read_u32(&mut rd)? as usize,
  })
}

fn parse_constraints(
  payload: &[u8],
  header: &CircuitHeader,
) -> Result<Vec<Constraint>, EquivError> {
  let mut rd = Cursor::new(payload);
  let mut constraints = Vec::with_capacity(header.n_constraints);
  for i in 0..header.n_constraints {
    let a = parse_form(&mut rd, header, i)?;
    let b = parse_form(&mut rd, header, i)?;
    let c = parse_form(&mut rd, header, i)?;
    constraints.push(Constraint::new(a, b, c));
  }
  if rd.position() as usize != payload.len() {
    return Err(malformed("constraint section size mismatch"));
  }
  Ok(constraints)
}

fn parse_form(
  rd: &mut Cursor<&[u8]>,
  header: &CircuitHeader,
  cons_index: usize,
) -> Result<LinearForm, EquivError> {
  let n_terms = read_u32(rd)? as usize;
  let mut terms: Vec<(usize, BigUint)> = Vec::with_capacity(n_terms);
  for _ in 0..n_terms {
    let signal = read_i32(rd)?;
    if signal < 0 {
      return Err(malformed(format!(
        "constraint {cons_index} references negative signal {signal}"
      )));
    }
    let signal = signal as usize;
    let mut coeff_bytes = vec![0u8; header.field_size];
    read_exact(rd, &mut coeff_bytes)?;
    let mut coeff = BigUint::from_bytes_le(&coeff_bytes);
    if coeff >= header.prime {
      warn!(
        constraint = cons_index,
        signal, "coefficient exceeds the field modulus; reducing"
      );
      coeff %= &header.prime;
    }
    if coeff.is_zero() {
      warn!(
        constraint = cons_index,
        signal, "dropping explicit zero coefficient"
      );
      continue;
    }
    if terms.iter().any(|(s, _)| *s == signal) {
      return Err(malformed(format!(
        "constraint {cons_index} repeats signal {signal} within a linear form"
      )));
    }
    terms.push((signal, coeff));
  }
  Ok(LinearForm::from_terms(terms))
}

fn parse_labels(payload: &[u8], header: &CircuitHeader) -> Result<Vec<i64>, EquivError> {
  if payload.len() != header.n_wires * 8 {
    return Err(malformed("signal section size mismatch"));
  }
  let mut rd = Cursor::new(payload);
  (0..header.n_wires).map(|_| read_i64(&mut rd)).collect()
}

/// Write a circuit to disk in the R1CS container format.
pub fn write_r1cs(circ: &Circuit, path: &Path) -> Result<(), EquivError> {
  let bytes = write_r1cs_bytes(circ)?;
  std::fs::write(path, bytes)?;
  Ok(())
}

/// Serialize a circuit to an R1CS byte string.
pub fn write_r1cs_bytes(circ: &Circuit) -> Result<Vec<u8>, EquivError> {
  let mut out = Vec::new();
  out.extend_from_slice(&MAGIC);
  write_i32(&mut out, VERSION);
  write_i32(&mut out, circ.section_order.len() as i32);
  for kind in &circ.section_order {
    let (stype, payload) = match kind {
      SectionKind::Header => (SECTION_HEADER, header_payload(&circ.header)?),
      SectionKind::Constraints => (SECTION_CONSTRAINTS, constraints_payload(circ)?),
      SectionKind::Labels => (SECTION_LABELS, labels_payload(circ)?),
    };
    write_i32(&mut out, stype);
    write_i64(&mut out, payload.len() as i64);
    out.extend_from_slice(&payload);
  }
  Ok(out)
}

fn header_payload(header: &CircuitHeader) -> Result<Vec<u8>, EquivError> {
  let mut out = Vec::new();
  write_u32(&mut out, header.field_size as u32);
  out.extend_from_slice(&coeff_bytes(&header.prime, header.field_size)?);
  write_u32(&mut out, header.n_wires as u32);
  write_u32(&mut out, header.n_pub_out as u32);
  write_u32(&mut out, header.n_pub_in as u32);
  write_u32(&mut out, header.n_prv_in as u32);
  write_u64(&mut out, header.n_labels);
  write_u32(&mut out, header.n_constraints as u32);
  Ok(out)
}

fn constraints_payload(circ: &Circuit) -> Result<Vec<u8>, EquivError> {
  let mut out = Vec::new();
  for cons in &circ.constraints {
    for form in [&cons.a, &cons.b, &cons.c] {
      write_u32(&mut out, form.len() as u32);
      for (signal, coeff) in form.iter() {
        write_i32(&mut out, *signal as i32);
        out.extend_from_slice(&coeff_bytes(coeff, circ.header.field_size)?);
      }
    }
  }
  Ok(out)
}

fn labels_payload(circ: &Circuit) -> Result<Vec<u8>, EquivError> {
  let labels = circ
    .labels
    .as_ref()
    .ok_or_else(|| malformed("signal section requested but no labels are present"))?;
  let mut out = Vec::new();
  for label in labels {
    write_i64(&mut out, *label);
  }
  Ok(out)
}

fn coeff_bytes(value: &BigUint, field_size: usize) -> Result<Vec<u8>, EquivError> {
  let mut bytes = value.to_bytes_le();
  if bytes.len() > field_size {
    return Err(malformed(format!(
      "value needs {} bytes, field size is {field_size}",
      bytes.len()
    )));
  }
  bytes.resize(field_size, 0);
  Ok(bytes)
}

// Truncation while a section is being decoded is a layout error, not an I/O
// error, so the byteorder failures are mapped here rather than via From.
fn read_exact(rd: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), EquivError> {
  std::io::Read::read_exact(rd, buf).map_err(|_| malformed("unexpected end of file"))
}

fn read_i32(rd: &mut Cursor<&[u8]>) -> Result<i32, EquivError> {
  rd.read_i32::<LittleEndian>()
    .map_err(|_| malformed("unexpected end of file"))
}

fn read_u32(rd: &mut Cursor<&[u8]>) -> Result<u32, EquivError> {
  rd.read_u32::<LittleEndian>()
    .map_err(|_| malformed("unexpected end of file"))
}

fn read_i64(rd: &mut Cursor<&[u8]>) -> Result<i64, EquivError> {
  rd.read_i64::<LittleEndian>()
    .map_err(|_| malformed("unexpected end of file"))
}

fn read_u64(rd: &mut Cursor<&[u8]>) -> Result<u64, EquivError> {
  rd.read_u64::<LittleEndian>()
    .map_err(|_| malformed("unexpected end of file"))
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
  out
    .write_i32::<LittleEndian>(value)
    .expect("writing to a Vec cannot fail");
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
  out
    .write_u32::<LittleEndian>(value)
    .expect("writing to a Vec cannot fail");
}

fn write_i64(out: &mut Vec<u8>, value: i64) {
  out
    .write_i64::<LittleEndian>(value)
    .expect("writing to a Vec cannot fail");
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
  out
    .write_u64::<LittleEndian>(value)
    .expect("writing to a Vec cannot fail");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::r1cs::test_support::sample_circuit;
  use proptest::prelude::*;
  use rand::{Rng, rngs::StdRng, seq::SliceRandom};
  use rand_core::SeedableRng;

  fn random_circuit(rng: &mut StdRng) -> Circuit {
    let (prime, field_size) = if rng.gen_bool(0.5) {
      (BigUint::from(97u64), 1)
    } else {
      (
        BigUint::parse_bytes(
          b"21888242871839275222246405745257275088548364400416034343698204186575808495617",
          10,
        )
        .unwrap(),
        32,
      )
    };
    let n_pub_out = rng.gen_range(0..2);
    let n_pub_in = rng.gen_range(0..2);
    let n_prv_in = rng.gen_range(0..2);
    let io_wires = 1 + n_pub_out + n_pub_in + n_prv_in;
    let n_wires = io_wires + rng.gen_range(1..5);

    let random_form = |rng: &mut StdRng| {
      let mut signals: Vec<usize> = (0..n_wires).collect();
      signals.shuffle(rng);
      signals.truncate(rng.gen_range(0..4));
      LinearForm::from_terms(
        signals
          .into_iter()
          .map(|s| (s, (BigUint::from(rng.r#gen::<u64>()) % (&prime - 1u32)) + 1u32))
          .collect(),
      )
    };
    let constraints: Vec<Constraint> = (0..rng.gen_range(0..5))
      .map(|_| Constraint::new(random_form(rng), random_form(rng), random_form(rng)))
      .collect();

    let header = CircuitHeader {
      prime,
      field_size,
      n_wires,
      n_pub_out,
      n_pub_in,
      n_prv_in,
      n_labels: n_wires as u64,
      n_constraints: constraints.len(),
    };
    let labels = rng
      .gen_bool(0.5)
      .then(|| (0..n_wires as i64).map(|w| w * 10).collect::<Vec<i64>>());
    Circuit::new(header, constraints, labels)
  }

  proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_round_trip_random_circuits(seed in any::<u64>()) {
      let mut rng = StdRng::seed_from_u64(seed);
      let circ = random_circuit(&mut rng);
      let bytes = write_r1cs_bytes(&circ).unwrap();
      let parsed = parse_r1cs_bytes(&bytes).unwrap();
      prop_assert_eq!(&parsed, &circ);
      prop_assert_eq!(write_r1cs_bytes(&parsed).unwrap(), bytes);
    }
  }

  #[test]
  fn test_round_trip_bytes() {
    let circ = sample_circuit();
    let bytes = write_r1cs_bytes(&circ).unwrap();
    let parsed = parse_r1cs_bytes(&bytes).unwrap();
    assert_eq!(parsed, circ);
    assert_eq!(write_r1cs_bytes(&parsed).unwrap(), bytes);
  }

  #[test]
  fn test_round_trip_preserves_section_order() {
    let mut circ = sample_circuit();
    circ.labels = Some(vec![0, 10, 20, 30, 40, 50]);
    circ.section_order = vec![
      SectionKind::Labels,
      SectionKind::Header,
      SectionKind::Constraints,
    ];
    let bytes = write_r1cs_bytes(&circ).unwrap();
    let parsed = parse_r1cs_bytes(&bytes).unwrap();
    assert_eq!(parsed.section_order, circ.section_order);
    assert_eq!(write_r1cs_bytes(&parsed).unwrap(), bytes);
  }

  #[test]
  fn test_round_trip_file() {
    let circ = sample_circuit();
    let path = std::env::temp_dir().join("r1cs_equiv_codec_round_trip.r1cs");
    write_r1cs(&circ, &path).unwrap();
    let parsed = parse_r1cs(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(parsed, circ);
  }

  #[test]
  fn test_bad_magic() {
    let mut bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    bytes[0] = b'x';
    assert!(matches!(
      parse_r1cs_bytes(&bytes),
      Err(EquivError::MalformedFile { .. })
    ));
  }

  #[test]
  fn test_bad_version() {
    let mut bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    bytes[4] = 2;
    assert!(matches!(
      parse_r1cs_bytes(&bytes),
      Err(EquivError::MalformedFile { .. })
    ));
  }

  #[test]
  fn test_section_size_disagrees_with_payload() {
    let mut bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    // first section is the header: shrink its declared size by one
    bytes[16] = bytes[16].wrapping_sub(1);
    assert!(matches!(
      parse_r1cs_bytes(&bytes),
      Err(EquivError::MalformedFile { .. })
    ));
  }

  #[test]
  fn test_truncated_file() {
    let bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    let truncated = &bytes[..bytes.len() - 3];
    assert!(matches!(
      parse_r1cs_bytes(truncated),
      Err(EquivError::MalformedFile { .. })
    ));
  }

  #[test]
  fn test_trailing_garbage() {
    let mut bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    bytes.extend_from_slice(&[0, 1, 2]);
    assert!(matches!(
      parse_r1cs_bytes(&bytes),
      Err(EquivError::MalformedFile { .. })
    ));
  }

  #[test]
  fn test_unsupported_field_size() {
    let mut circ = sample_circuit();
    circ.header.field_size = 48;
    let bytes = write_r1cs_bytes(&circ).unwrap();
    assert_eq!(
      parse_r1cs_bytes(&bytes),
      Err(EquivError::UnsupportedField {
        field_size: 48,
        max: MAX_FIELD_SIZE
      })
    );
  }

  #[test]
  fn test_unreduced_coefficient_is_reduced_on_ingest() {
    let bytes = write_r1cs_bytes(&sample_circuit()).unwrap();
    // constraint section starts after the 12-byte preamble, the 12-byte
    // header tag, and the 33-byte header payload; its first coefficient sits
    // 12 (tag) + 4 (term count) + 4 (signal) bytes further in
    let coeff_offset = 12 + 12 + 33 + 12 + 4 + 4;
    let mut bytes = bytes;
    assert_eq!(bytes[coeff_offset], 1);
    bytes[coeff_offset] = 9; // 9 mod 7 = 2
    let parsed = parse_r1cs_bytes(&bytes).unwrap();
    assert_eq!(
      parsed.constraints[0].a.get(1),
      Some(&BigUint::from(2u64))
    );
  }
}
