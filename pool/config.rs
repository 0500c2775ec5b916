//! Run configuration: an explicit object threaded into the pipeline stages,
//! loadable from a TOML file with every field overridable on the command line.

use clap::ValueEnum;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What to do with pooled rows that have no match in the linkage extract.
///
/// The survey design requires complete stratum/PSU fields, so the default is
/// to fail fast rather than carry nulls into design construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Abort the pipeline, naming the number of unmatched keys.
    Fail,
    /// Retain unmatched rows with null stratum/PSU (the original left-join
    /// behavior). Design construction will still reject them.
    KeepNull,
    /// Discard unmatched rows, recording how many were dropped.
    Drop,
}

/// How the variance engine treats a stratum containing a single PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LonelyPsuPolicy {
    /// Reject the design at construction time.
    Fail,
    /// Center the lonely PSU total at the grand mean of all PSU totals.
    Adjust,
    /// Treat the lonely stratum as a certainty unit contributing no variance.
    Certainty,
}

/// The full configuration of one pipeline run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Survey years to pool. Each must have a known full-year file identifier.
    pub years: Vec<u16>,
    /// Directory where provider extracts are cached between runs.
    pub cache_dir: PathBuf,
    /// Base URL of the data provider; extracts are fetched as `<id>.csv.gz`.
    pub base_url: String,
    /// Never touch the network; every required extract must already be cached.
    pub offline: bool,
    pub join_policy: JoinPolicy,
    pub lonely_psu: LonelyPsuPolicy,
    /// Directory receiving the TSV report artifacts.
    pub out_dir: PathBuf,
    /// Render the fitted-means chart in the terminal after the tables.
    pub chart: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            years: vec![2016, 2017, 2018, 2019, 2020, 2021],
            cache_dir: PathBuf::from("meps_cache"),
            base_url: "https://meps.ahrq.gov/data_files/pufs".to_string(),
            offline: false,
            join_policy: JoinPolicy::Fail,
            lonely_psu: LonelyPsuPolicy::Fail,
            out_dir: PathBuf::from("."),
            chart: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config file '{path}': {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("No survey years configured; at least one pooled year is required.")]
    NoYears,
}

impl RunConfig {
    /// Loads a configuration from a TOML file. Unknown keys are rejected so a
    /// typo cannot silently fall back to a default.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Sorts and deduplicates the pooled years and checks the set is non-empty.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.years.sort_unstable();
        self.years.dedup();
        if self.years.is_empty() {
            return Err(ConfigError::NoYears);
        }
        Ok(())
    }
}
