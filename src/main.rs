use clap::{Parser, Subcommand};
use r1cs_equiv::{
  equiv::{Verdict, compare},
  errors::EquivError,
  fingerprint::refine,
  r1cs::{parse_r1cs, write_r1cs},
  shuffle::{ShuffleOptions, shuffle},
};
use serde_json::json;
use std::{collections::BTreeMap, path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
  name = "r1cs-equiv",
  version,
  about = "Structural equivalence checking for R1CS circuits",
  long_about = None
)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Compare two circuits and print the verdict as JSON
  Compare {
    /// Left (reference) circuit file
    left: PathBuf,
    /// Right (candidate) circuit file
    right: PathBuf,
  },
  /// Write a shuffled, guaranteed-equivalent copy of a circuit
  Shuffle {
    /// Input circuit file
    input: PathBuf,
    /// Output circuit file
    output: PathBuf,
    /// RNG seed
    #[arg(long)]
    seed: u64,
    /// Keep every constraint's scaling
    #[arg(long = "no-rescale")]
    no_rescale: bool,
    /// Keep signal ids
    #[arg(long = "no-perm-sig")]
    no_perm_sig: bool,
    /// Keep the constraint order
    #[arg(long = "no-perm-cons")]
    no_perm_cons: bool,
    /// Keep the term order inside linear forms
    #[arg(long = "no-perm-terms")]
    no_perm_terms: bool,
  },
  /// Dump the final refinement colors of a circuit
  Fingerprint {
    /// Circuit file
    file: PathBuf,
  },
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_target(false)
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  match run(Cli::parse()) {
    Ok(code) => code,
    Err(err) => {
      eprintln!("error: {err}");
      ExitCode::from(1)
    }
  }
}

fn run(cli: Cli) -> Result<ExitCode, EquivError> {
  match cli.command {
    Commands::Compare { left, right } => {
      let l = parse_r1cs(&left)?;
      let r = parse_r1cs(&right)?;
      let verdict = compare(&l, &r)?;
      let (code, payload) = render_verdict(&verdict);
      println!(
        "{}",
        serde_json::to_string_pretty(&payload).expect("verdict JSON cannot fail")
      );
      Ok(ExitCode::from(code))
    }
    Commands::Shuffle {
      input,
      output,
      seed,
      no_rescale,
      no_perm_sig,
      no_perm_cons,
      no_perm_terms,
    } => {
      let circ = parse_r1cs(&input)?;
      let opts = ShuffleOptions {
        rescale: !no_rescale,
        permute_signals: !no_perm_sig,
        permute_constraints: !no_perm_cons,
        permute_terms: !no_perm_terms,
        swap_parts: true,
      };
      let (shuffled, _) = shuffle(&circ, seed, &opts);
      write_r1cs(&shuffled, &output)?;
      Ok(ExitCode::SUCCESS)
    }
    Commands::Fingerprint { file } => {
      let circ = parse_r1cs(&file)?;
      let refinement = refine(&circ)?;
      println!("rounds: {}", refinement.rounds);
      println!("signals:");
      for (i, color) in refinement.signal_colors.iter().enumerate() {
        println!("  {i}: {}", color.to_hex());
      }
      println!("constraints:");
      for (i, color) in refinement.constraint_colors.iter().enumerate() {
        println!("  {i}: {}", color.to_hex());
      }
      println!("signal classes:");
      for (color, count) in class_sizes(refinement.signal_colors.iter().map(|c| c.to_hex())) {
        println!("  {color}: {count}");
      }
      println!("constraint classes:");
      for (color, count) in class_sizes(refinement.constraint_colors.iter().map(|c| c.to_hex()))
      {
        println!("  {color}: {count}");
      }
      Ok(ExitCode::SUCCESS)
    }
  }
}

fn class_sizes(colors: impl Iterator<Item = String>) -> BTreeMap<String, usize> {
  let mut sizes = BTreeMap::new();
  for color in colors {
    *sizes.entry(color).or_insert(0) += 1;
  }
  sizes
}

fn render_verdict(verdict: &Verdict) -> (u8, serde_json::Value) {
  match verdict {
    Verdict::Equivalent {
      signal_map,
      constraint_map,
    } => (
      0,
      json!({
        "result": "equivalent",
        "signal_map": signal_map,
        "constraint_map": constraint_map,
      }),
    ),
    Verdict::StructurallyDifferent { reason } => (
      2,
      json!({
        "result": "structurally_different",
        "signal_map": null,
        "constraint_map": null,
        "reason": reason,
      }),
    ),
    Verdict::AmbiguousResidual { reason, residual } => (
      3,
      json!({
        "result": "ambiguous_residual",
        "signal_map": null,
        "constraint_map": null,
        "reason": reason,
        "residual": residual,
      }),
    ),
  }
}
