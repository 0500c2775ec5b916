// ========================================================================================
//
//                            THE PIPELINE ORCHESTRATOR
//
// ========================================================================================
//
// This binary conducts the one-shot analysis pipeline: fetch the provider
// extracts, normalize and pool them, merge the linkage file, build the survey
// design, fit the expenditure model, and report tables, artifacts, and the
// optional terminal chart. Each phase fully materializes its output before
// the next begins; on any error the run aborts with a non-zero exit code.

use clap::Parser;
use mepspool::chart;
use mepspool::config::{JoinPolicy, LonelyPsuPolicy, RunConfig};
use mepspool::design::{self, DesignOptions, SurveyDesign};
use mepspool::extract::{self, YearlyExtract};
use mepspool::fetch;
use mepspool::fit;
use mepspool::margins;
use mepspool::pooling;
use mepspool::report;
use rayon::prelude::*;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

/// Confidence level used for every reported interval.
const CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Parser, Debug)]
#[clap(
    name = "mepspool",
    version,
    about = "Pools MEPS full-year files and fits survey-weighted expenditure models."
)]
struct Args {
    /// Optional TOML configuration file; flags below override its values.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Survey years to pool, comma separated.
    #[clap(long, value_delimiter = ',')]
    years: Option<Vec<u16>>,

    /// Directory where provider extracts are cached between runs.
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// Base URL of the data provider.
    #[clap(long)]
    base_url: Option<String>,

    /// Never touch the network; every extract must already be cached.
    #[clap(long)]
    offline: bool,

    /// Policy for pooled rows with no linkage match.
    #[clap(long, value_enum)]
    join_policy: Option<JoinPolicy>,

    /// Policy for single-PSU strata during variance estimation.
    #[clap(long, value_enum)]
    lonely_psu: Option<LonelyPsuPolicy>,

    /// Directory receiving the TSV report artifacts.
    #[clap(long)]
    out_dir: Option<PathBuf>,

    /// Render the fitted-means chart in the terminal after the tables.
    #[clap(long)]
    chart: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();
    let config = resolve_config(args)?;

    // --- Phase 1: Fetch ---
    eprintln!("> Pooling survey years: {:?}", config.years);
    let files = fetch::resolve_and_fetch(
        &config.years,
        &config.cache_dir,
        &config.base_url,
        config.offline,
    )?;

    // --- Phase 2: Normalize (per-year extracts are independent) ---
    eprintln!("> Normalizing {} yearly extracts...", files.yearly.len());
    let extracts: Vec<YearlyExtract> = files
        .yearly
        .par_iter()
        .map(|(year, path)| extract::load_yearly_extract(path, *year))
        .collect::<Result<_, _>>()?;
    let linkage = extract::load_linkage_extract(&files.linkage)?;

    // --- Phase 3: Pool and merge ---
    let pooled = pooling::pool_extracts(&extracts)?;
    eprintln!(
        "> Pooled table: {} rows across {} years.",
        pooled.frame.height(),
        pooled.years.len()
    );
    let merged = pooling::merge_linkage(pooled, &linkage, config.join_policy)?;
    if merged.dropped_unmatched > 0 {
        eprintln!(
            "> Dropped {} pooled rows without a linkage match.",
            merged.dropped_unmatched
        );
    }

    // --- Phase 4: Encode and build the survey design ---
    let data = design::encode_analysis_data(&merged)?;
    let survey = SurveyDesign::new(
        data,
        DesignOptions {
            lonely_psu: config.lonely_psu,
        },
    )?;
    eprintln!(
        "> Survey design: {} rows, {} strata, {} PSUs ({:.0} design df).",
        survey.n(),
        survey.n_strata(),
        survey.n_psus(),
        survey.degrees_of_freedom()
    );

    // --- Phase 5: Fit and marginal effects ---
    eprintln!("> Fitting totexp ~ sex * year...");
    let fitted = fit::fit_expenditure_model(&survey)?;
    let coefficients = fitted.coef_table(CONFIDENCE_LEVEL);
    let cells = margins::predicted_cell_means(&fitted, CONFIDENCE_LEVEL);
    let gaps = margins::sex_gap_by_year(&fitted, CONFIDENCE_LEVEL);
    let average_gap = margins::average_sex_gap(&fitted, &survey, CONFIDENCE_LEVEL);
    let levels = fitted.layout.year_levels();
    let did = margins::difference_in_differences(
        &fitted,
        levels[0],
        levels[levels.len() - 1],
        CONFIDENCE_LEVEL,
    )?;

    // --- Phase 6: Report ---
    println!();
    report::print_summary(&fitted, &coefficients, &gaps, &average_gap, &did);

    fs::create_dir_all(&config.out_dir)?;
    report::write_coefficients_tsv(&config.out_dir.join("coefficients.tsv"), &coefficients)?;
    report::write_cell_means_tsv(&config.out_dir.join("predicted_means.tsv"), &cells)?;
    report::write_sex_gaps_tsv(&config.out_dir.join("sex_gap_by_year.tsv"), &gaps)?;
    eprintln!("> Wrote TSV artifacts to {}", config.out_dir.display());

    // --- Phase 7: Chart ---
    if config.chart {
        chart::render_means_chart(&cells)?;
    }

    eprintln!("\nDone in {:.2?}.", start_time.elapsed());
    Ok(())
}

/// Loads the optional TOML config and layers the command-line flags on top.
fn resolve_config(args: Args) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_toml_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(years) = args.years {
        config.years = years;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if args.offline {
        config.offline = true;
    }
    if let Some(join_policy) = args.join_policy {
        config.join_policy = join_policy;
    }
    if let Some(lonely_psu) = args.lonely_psu {
        config.lonely_psu = lonely_psu;
    }
    if let Some(out_dir) = args.out_dir {
        config.out_dir = out_dir;
    }
    if args.chart {
        config.chart = true;
    }
    config.normalize()?;
    Ok(config)
}
