//! Plain-text chain-length lists and time-series tables.
//!
//! Chain-length files hold one positive DP per line. Time series are written
//! as whitespace-separated columns with a `#` header line.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::engine::RunReport;
use crate::error::SimError;
use crate::report::{ConversionPoint, MolecularWeightPoint, Snapshot, SnapshotTrigger};

pub const CONVERSION_SERIES_FILE: &str = "conversion.out";
pub const MOLECULAR_WEIGHT_SERIES_FILE: &str = "molecular_weight.out";

pub fn write_chain_lengths<W: Write>(mut out: W, lengths: &[u64]) -> io::Result<()> {
    for dp in lengths {
        writeln!(out, "{dp}")?;
    }
    out.flush()
}

/// Parses a chain-length list. Any whitespace separates entries; every entry
/// must be a positive integer.
pub fn parse_chain_lengths(text: &str) -> Result<Vec<u64>, SimError> {
    text.split_whitespace()
        .enumerate()
        .map(|(idx, token)| match token.parse::<u64>() {
            Ok(0) => Err(SimError::Parse(format!("entry {idx} is zero"))),
            Ok(dp) => Ok(dp),
            Err(e) => Err(SimError::Parse(format!("entry {idx} ({token:?}): {e}"))),
        })
        .collect()
}

/// `all_chain_conv_{percent}.out` for a conversion fraction.
pub fn checkpoint_file_name(conversion: f64) -> String {
    format!("all_chain_conv_{}.out", format_number(conversion * 100.0))
}

/// `all_chain_dp_{target}.out` for a target DP.
pub fn target_file_name(target: f64) -> String {
    format!("all_chain_dp_{}.out", format_number(target))
}

/// File name for a snapshot's chain-length list, if its trigger has one.
pub fn snapshot_file_name(snapshot: &Snapshot) -> Option<String> {
    match snapshot.trigger {
        SnapshotTrigger::Target(target) => Some(target_file_name(target)),
        SnapshotTrigger::Conversion(conversion) => Some(checkpoint_file_name(conversion)),
        SnapshotTrigger::Final => Some("all_chain_final.out".to_owned()),
        SnapshotTrigger::Requested => None,
    }
}

pub fn write_conversion_series<W: Write>(mut out: W, points: &[ConversionPoint]) -> io::Result<()> {
    writeln!(out, "# time conversion")?;
    for p in points {
        writeln!(out, "{} {}", p.time, p.conversion)?;
    }
    out.flush()
}

pub fn write_molecular_weight_series<W: Write>(
    mut out: W,
    points: &[MolecularWeightPoint],
) -> io::Result<()> {
    writeln!(out, "# time mn mw")?;
    for p in points {
        writeln!(out, "{} {} {}", p.time, p.mn, p.mw)?;
    }
    out.flush()
}

/// Writes one chain-length file per snapshot plus both time series into
/// `dir`, creating it if needed. Returns the written paths.
pub fn write_run_outputs(dir: &Path, report: &RunReport) -> Result<Vec<PathBuf>, SimError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(report.snapshots.len() + 2);
    for snapshot in &report.snapshots {
        let Some(name) = snapshot_file_name(snapshot) else {
            continue;
        };
        let path = dir.join(name);
        write_chain_lengths(BufWriter::new(File::create(&path)?), &snapshot.chain_lengths)?;
        written.push(path);
    }
    let path = dir.join(CONVERSION_SERIES_FILE);
    write_conversion_series(BufWriter::new(File::create(&path)?), &report.series.conversion)?;
    written.push(path);
    let path = dir.join(MOLECULAR_WEIGHT_SERIES_FILE);
    write_molecular_weight_series(
        BufWriter::new(File::create(&path)?),
        &report.series.molecular_weight,
    )?;
    written.push(path);
    debug!(dir = %dir.display(), files = written.len(), "Run outputs written");
    Ok(written)
}

// Integral values print without a fractional part: 50.0 -> "50".
fn format_number(value: f64) -> String {
    let rounded = value.round();
    if (value - rounded).abs() < 1e-9 {
        format!("{}", rounded as i64)
    } else {
        format!("{value}")
    }
}
