//! Printed tables and TSV plot artifacts.

use crate::fit::{CoefRow, Estimate, FitSummary};
use crate::margins::{CellMean, DidContrast, SexGap};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write TSV artifact: {0}")]
    Csv(#[from] csv::Error),
}

/// Prints the full analysis summary: model metadata, coefficient table,
/// per-year sex gaps, the average gap, and the difference-in-differences line.
pub fn print_summary(
    fit: &FitSummary,
    coefficients: &[CoefRow],
    gaps: &[SexGap],
    average_gap: &Estimate,
    did: &DidContrast,
) {
    println!(
        "Survey-weighted linear model: totexp ~ sex * year ({} obs, {} strata, {} PSUs, {:.0} design df)",
        fit.n_obs, fit.n_strata, fit.n_psus, fit.df
    );
    println!();
    println!(
        "{:<24} {:>12} {:>12} {:>12} {:>12}",
        "term", "estimate", "std.err", "2.5 %", "97.5 %"
    );
    for row in coefficients {
        println!(
            "{:<24} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
            row.term, row.estimate, row.se, row.lo, row.hi
        );
    }

    println!();
    println!("Marginal effect of sex (female - male) by year:");
    println!(
        "{:<8} {:>12} {:>12} {:>12} {:>12}",
        "year", "estimate", "std.err", "2.5 %", "97.5 %"
    );
    for gap in gaps {
        println!(
            "{:<8} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
            gap.year, gap.estimate.value, gap.estimate.se, gap.estimate.lo, gap.estimate.hi
        );
    }

    println!();
    println!(
        "Average marginal effect of sex: {:.2} (se {:.2}, 95% CI {:.2} to {:.2})",
        average_gap.value, average_gap.se, average_gap.lo, average_gap.hi
    );
    println!(
        "Sex-gap change {} -> {}: {:.2} (se {:.2}, 95% CI {:.2} to {:.2})",
        did.from, did.to, did.estimate.value, did.estimate.se, did.estimate.lo, did.estimate.hi
    );
}

/// Writes the coefficient table as a tab-separated artifact.
pub fn write_coefficients_tsv(path: &Path, rows: &[CoefRow]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["term", "estimate", "se", "ci_lo", "ci_hi"])?;
    for row in rows {
        writer.write_record([
            row.term.clone(),
            format!("{:.6}", row.estimate),
            format!("{:.6}", row.se),
            format!("{:.6}", row.lo),
            format!("{:.6}", row.hi),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the fitted-mean prediction grid, the data behind the chart.
pub fn write_cell_means_tsv(path: &Path, cells: &[CellMean]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["year", "sex", "estimate", "se", "ci_lo", "ci_hi"])?;
    for cell in cells {
        writer.write_record([
            cell.year.to_string(),
            cell.sex.label().to_string(),
            format!("{:.6}", cell.estimate.value),
            format!("{:.6}", cell.estimate.se),
            format!("{:.6}", cell.estimate.lo),
            format!("{:.6}", cell.estimate.hi),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the per-year marginal effect of sex.
pub fn write_sex_gaps_tsv(path: &Path, gaps: &[SexGap]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["year", "estimate", "se", "ci_lo", "ci_hi"])?;
    for gap in gaps {
        writer.write_record([
            gap.year.to_string(),
            format!("{:.6}", gap.estimate.value),
            format!("{:.6}", gap.estimate.se),
            format!("{:.6}", gap.estimate.lo),
            format!("{:.6}", gap.estimate.hi),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, ReportError> {
    let writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    Ok(writer)
}
