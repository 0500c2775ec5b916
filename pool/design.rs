//! # Factor Encoding and Survey Design Construction
//!
//! Converts the merged table into the typed arrays the statistical core
//! consumes, then binds them with the sampling structure into an immutable
//! `SurveyDesign`. Out-of-domain category codes are data-quality errors and
//! abort the pipeline; they are never silently dropped or recoded.

use crate::config::LonelyPsuPolicy;
use crate::pooling::MergedTable;
use ndarray::Array1;
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Respondent sex, decoded from the documented source codes 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub const LEVELS: [Sex; 2] = [Sex::Male, Sex::Female];

    pub fn label(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
        }
    }
}

/// Typed column arrays extracted from the merged table, validated and ready
/// for model fitting.
#[derive(Debug)]
pub struct AnalysisData {
    pub totexp: Array1<f64>,
    pub poolwt: Array1<f64>,
    pub sex: Vec<Sex>,
    pub year: Vec<u16>,
    pub stratum: Vec<i64>,
    pub psu: Vec<i64>,
    /// The pooled year set, ascending; the domain of the year factor.
    pub years: Vec<u16>,
}

/// Explicit configuration for design construction and variance estimation.
/// Passed by value; there is no library-global option state.
#[derive(Debug, Clone, Copy)]
pub struct DesignOptions {
    pub lonely_psu: LonelyPsuPolicy,
}

/// A comprehensive error type for encoding and design-construction failures.
#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error(
        "{0} rows are missing the pooled stratum/PSU fields. The survey design requires complete sampling-structure fields; re-run with --join-policy drop or repair the linkage extract."
    )]
    MissingDesignFields(usize),
    #[error(
        "Sex code {value} at row {row} is outside the documented domain {{1, 2}}. This is a data-quality error in the source extract."
    )]
    InvalidSexCode { value: i64, row: usize },
    #[error(
        "Survey year {value} at row {row} is outside the pooled year set {years:?}. This indicates a pipeline defect upstream of encoding."
    )]
    YearOutOfDomain {
        value: i64,
        row: usize,
        years: Vec<u16>,
    },
    #[error("Pooled weight at row {row} is {value}; weights must be finite and non-negative.")]
    InvalidWeight { value: f64, row: usize },
    #[error(
        "Stratum {0} contains a single PSU. Variance estimation cannot proceed under the fail policy; choose the adjust or certainty lonely-PSU policy instead."
    )]
    LonelyPsu(i64),
    #[error("The survey design is empty; no rows survived pooling and merging.")]
    EmptyDesign,
}

/// Extracts and validates the typed analysis columns from the merged table.
pub fn encode_analysis_data(merged: &MergedTable) -> Result<AnalysisData, DesignError> {
    let frame = &merged.frame;
    if frame.height() == 0 {
        return Err(DesignError::EmptyDesign);
    }

    // Null stratum/PSU can only arrive via JoinPolicy::KeepNull; the design
    // cannot accept them.
    let missing = frame
        .column("stra9621")?
        .null_count()
        .max(frame.column("psu9621")?.null_count());
    if missing > 0 {
        return Err(DesignError::MissingDesignFields(missing));
    }

    let sex_codes = int_values(frame, "sex")?;
    let year_codes = int_values(frame, "year")?;
    let stratum = int_values(frame, "stra9621")?;
    let psu = int_values(frame, "psu9621")?;
    let totexp = float_values(frame, "totexp")?;
    let poolwt = float_values(frame, "poolwt")?;

    let mut sex = Vec::with_capacity(sex_codes.len());
    for (row, &code) in sex_codes.iter().enumerate() {
        sex.push(match code {
            1 => Sex::Male,
            2 => Sex::Female,
            value => return Err(DesignError::InvalidSexCode { value, row }),
        });
    }

    let mut years = merged.years.clone();
    years.sort_unstable();
    let mut year = Vec::with_capacity(year_codes.len());
    for (row, &value) in year_codes.iter().enumerate() {
        let known = u16::try_from(value)
            .ok()
            .filter(|y| years.contains(y))
            .ok_or(DesignError::YearOutOfDomain {
                value,
                row,
                years: years.clone(),
            })?;
        year.push(known);
    }

    for (row, &value) in poolwt.iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(DesignError::InvalidWeight { value, row });
        }
    }

    Ok(AnalysisData {
        totexp: Array1::from_vec(totexp),
        poolwt: Array1::from_vec(poolwt),
        sex,
        year,
        stratum,
        psu,
        years,
    })
}

/// The immutable survey-design descriptor: analysis columns bound to the
/// sampling structure (PSUs nested within strata) and the pooled weights.
/// Consumed uniformly by all downstream statistical operations and never
/// mutated after construction.
#[derive(Debug)]
pub struct SurveyDesign {
    data: AnalysisData,
    options: DesignOptions,
    /// PSU count per stratum, keyed by stratum id.
    strata: BTreeMap<i64, usize>,
    n_psus: usize,
}

impl SurveyDesign {
    /// Validates the analysis columns and computes the cluster structure.
    ///
    /// Under `LonelyPsuPolicy::Fail`, any single-PSU stratum is rejected
    /// here rather than surfacing later as a degenerate variance term.
    pub fn new(data: AnalysisData, options: DesignOptions) -> Result<Self, DesignError> {
        if data.totexp.is_empty() {
            return Err(DesignError::EmptyDesign);
        }
        for (row, &value) in data.poolwt.iter().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(DesignError::InvalidWeight { value, row });
            }
        }

        let mut clusters: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (&stratum, &psu) in data.stratum.iter().zip(&data.psu) {
            clusters.entry(stratum).or_default().insert(psu);
        }

        let mut strata = BTreeMap::new();
        let mut n_psus = 0usize;
        for (stratum, psus) in &clusters {
            if psus.len() < 2 && options.lonely_psu == LonelyPsuPolicy::Fail {
                return Err(DesignError::LonelyPsu(*stratum));
            }
            n_psus += psus.len();
            strata.insert(*stratum, psus.len());
        }

        log::info!(
            "Survey design: {} rows, {} strata, {} PSUs.",
            data.totexp.len(),
            strata.len(),
            n_psus
        );
        Ok(Self {
            data,
            options,
            strata,
            n_psus,
        })
    }

    pub fn data(&self) -> &AnalysisData {
        &self.data
    }

    pub fn options(&self) -> DesignOptions {
        self.options
    }

    pub fn n(&self) -> usize {
        self.data.totexp.len()
    }

    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn n_psus(&self) -> usize {
        self.n_psus
    }

    /// Design degrees of freedom: PSUs minus strata.
    pub fn degrees_of_freedom(&self) -> f64 {
        (self.n_psus - self.strata.len()) as f64
    }
}

fn float_values(frame: &DataFrame, name: &str) -> Result<Vec<f64>, DesignError> {
    let values = frame
        .column(name)?
        .cast(&DataType::Float64)?
        .f64()?
        .rechunk()
        .into_no_null_iter()
        .collect();
    Ok(values)
}

fn int_values(frame: &DataFrame, name: &str) -> Result<Vec<i64>, DesignError> {
    let values = frame
        .column(name)?
        .cast(&DataType::Int64)?
        .i64()?
        .rechunk()
        .into_no_null_iter()
        .collect();
    Ok(values)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    fn merged_fixture(sex: Vec<i64>, year: Vec<i32>, stratum: Vec<i64>, psu: Vec<i64>) -> MergedTable {
        let n = sex.len();
        let frame = DataFrame::new(vec![
            Column::new(
                "dupersid".into(),
                (0..n).map(|i| format!("R{i}")).collect::<Vec<_>>(),
            ),
            Column::new("panel".into(), vec![21i64; n]),
            Column::new("sex".into(), sex),
            Column::new("totexp".into(), vec![250.0f64; n]),
            Column::new("poolwt".into(), vec![2.5f64; n]),
            Column::new("year".into(), year),
            Column::new("stra9621".into(), stratum),
            Column::new("psu9621".into(), psu),
        ])
        .unwrap();
        MergedTable {
            frame,
            years: vec![2016, 2017],
            dropped_unmatched: 0,
        }
    }

    #[test]
    fn encodes_sex_and_year_factors() {
        let merged = merged_fixture(
            vec![1, 2, 2, 1],
            vec![2016, 2016, 2017, 2017],
            vec![1, 1, 2, 2],
            vec![1, 2, 1, 2],
        );
        let data = encode_analysis_data(&merged).unwrap();
        assert_eq!(data.sex, vec![Sex::Male, Sex::Female, Sex::Female, Sex::Male]);
        assert_eq!(data.year, vec![2016, 2016, 2017, 2017]);
        assert_eq!(data.years, vec![2016, 2017]);
    }

    #[test]
    fn out_of_domain_sex_code_is_fatal() {
        let merged = merged_fixture(
            vec![1, 3],
            vec![2016, 2016],
            vec![1, 1],
            vec![1, 2],
        );
        let err = encode_analysis_data(&merged).unwrap_err();
        assert!(matches!(
            err,
            DesignError::InvalidSexCode { value: 3, row: 1 }
        ));
    }

    #[test]
    fn out_of_domain_year_is_fatal() {
        let merged = merged_fixture(
            vec![1, 2],
            vec![2016, 2015],
            vec![1, 1],
            vec![1, 2],
        );
        let err = encode_analysis_data(&merged).unwrap_err();
        assert!(matches!(
            err,
            DesignError::YearOutOfDomain { value: 2015, row: 1, .. }
        ));
    }

    #[test]
    fn null_design_fields_are_fatal() {
        let merged = merged_fixture(
            vec![1, 2],
            vec![2016, 2016],
            vec![1, 1],
            vec![1, 2],
        );
        // punch a null into stra9621 the way an unmatched left join would
        let MergedTable {
            frame,
            years,
            dropped_unmatched,
        } = merged;
        let frame = frame
            .lazy()
            .with_column(
                when(col("dupersid").eq(lit("R1")))
                    .then(lit(NULL))
                    .otherwise(col("stra9621"))
                    .alias("stra9621"),
            )
            .collect()
            .unwrap();
        let merged = MergedTable {
            frame,
            years,
            dropped_unmatched,
        };
        let err = encode_analysis_data(&merged).unwrap_err();
        assert!(matches!(err, DesignError::MissingDesignFields(1)));
    }

    #[test]
    fn lonely_psu_rejected_under_fail_policy() {
        let merged = merged_fixture(
            vec![1, 2, 1],
            vec![2016, 2016, 2017],
            vec![1, 1, 2],
            vec![1, 2, 1],
        );
        let data = encode_analysis_data(&merged).unwrap();
        let err = SurveyDesign::new(
            data,
            DesignOptions {
                lonely_psu: LonelyPsuPolicy::Fail,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DesignError::LonelyPsu(2)));
    }

    #[test]
    fn lonely_psu_tolerated_under_adjust_policy() {
        let merged = merged_fixture(
            vec![1, 2, 1],
            vec![2016, 2016, 2017],
            vec![1, 1, 2],
            vec![1, 2, 1],
        );
        let data = encode_analysis_data(&merged).unwrap();
        let design = SurveyDesign::new(
            data,
            DesignOptions {
                lonely_psu: LonelyPsuPolicy::Adjust,
            },
        )
        .unwrap();
        assert_eq!(design.n(), 3);
        assert_eq!(design.n_strata(), 2);
        assert_eq!(design.n_psus(), 3);
        assert_eq!(design.degrees_of_freedom(), 1.0);
    }

    #[test]
    fn cluster_structure_counts_psus_within_strata() {
        let merged = merged_fixture(
            vec![1, 2, 1, 2],
            vec![2016, 2016, 2017, 2017],
            vec![1, 1, 2, 2],
            vec![1, 2, 1, 2],
        );
        let data = encode_analysis_data(&merged).unwrap();
        let design = SurveyDesign::new(
            data,
            DesignOptions {
                lonely_psu: LonelyPsuPolicy::Fail,
            },
        )
        .unwrap();
        assert_eq!(design.n_strata(), 2);
        assert_eq!(design.n_psus(), 4);
        assert_eq!(design.degrees_of_freedom(), 2.0);
    }
}
