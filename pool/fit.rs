//! # Survey-Weighted Regression
//!
//! Fits the single model this pipeline exists for: total expenditure on sex,
//! survey year, and their interaction, weighted by the pooled sampling
//! weight. The linear-algebra solves are delegated to the LAPACK-backed
//! `ndarray-linalg` stack; this module only assembles the weighted
//! cross-products and the Taylor-linearized (stratified cluster sandwich)
//! covariance from PSU-level score totals.

use crate::config::LonelyPsuPolicy;
use crate::design::{Sex, SurveyDesign};
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, Solve};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;
use thiserror::Error;

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "A linear system solve failed. The weighted cross-product matrix may be singular. Error: {0}"
    )]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
    #[error(
        "The {sex} x {year} cell contains no observations; the interaction model is not identifiable."
    )]
    EmptyCell { sex: &'static str, year: u16 },
    #[error("Survey year {0} is not a level of the fitted year factor.")]
    UnknownYearLevel(u16),
    #[error(
        "Variance estimation requires at least one design degree of freedom; PSUs minus strata was {0}."
    )]
    NoDegreesOfFreedom(f64),
    #[error(
        "Stratum {0} holds a single PSU but the design was built under the fail policy; this indicates an inconsistent design descriptor."
    )]
    LonelyStratum(i64),
}

/// The fixed model structure `totexp ~ sex * year`, dummy-coded with male and
/// the first pooled year as reference levels. Term names follow the
/// conventional `sexfemale:year2017` style so the printed table reads like
/// any other regression output.
#[derive(Debug, Clone)]
pub struct TermLayout {
    year_levels: Vec<u16>,
}

impl TermLayout {
    /// `year_levels` must be the ascending pooled year set.
    pub fn new(year_levels: Vec<u16>) -> Self {
        Self { year_levels }
    }

    pub fn year_levels(&self) -> &[u16] {
        &self.year_levels
    }

    /// Total number of model terms: intercept, sex, k-1 year dummies and
    /// k-1 interactions.
    pub fn n_terms(&self) -> usize {
        2 * self.year_levels.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = vec!["(Intercept)".to_string(), "sexfemale".to_string()];
        for &year in &self.year_levels[1..] {
            names.push(format!("year{year}"));
        }
        for &year in &self.year_levels[1..] {
            names.push(format!("sexfemale:year{year}"));
        }
        names
    }

    /// The design row for one (sex, year) cell, or `None` for a year outside
    /// the factor's levels.
    pub fn row(&self, sex: Sex, year: u16) -> Option<Array1<f64>> {
        let position = self.year_levels.iter().position(|&y| y == year)?;
        let k = self.year_levels.len();
        let mut row = Array1::zeros(self.n_terms());
        let female = if sex == Sex::Female { 1.0 } else { 0.0 };
        row[0] = 1.0;
        row[1] = female;
        if position > 0 {
            row[1 + position] = 1.0;
            row[k + position] = female;
        }
        Some(row)
    }
}

/// A point estimate with its delta-method standard error and t interval.
#[derive(Debug, Clone, Copy)]
pub struct Estimate {
    pub value: f64,
    pub se: f64,
    pub lo: f64,
    pub hi: f64,
}

/// One row of the printed coefficient table.
#[derive(Debug, Clone)]
pub struct CoefRow {
    pub term: String,
    pub estimate: f64,
    pub se: f64,
    pub lo: f64,
    pub hi: f64,
}

/// The fitted model: coefficients, design-based covariance, and the design
/// metadata needed to interpret both.
#[derive(Debug)]
pub struct FitSummary {
    pub layout: TermLayout,
    pub beta: Array1<f64>,
    pub cov: Array2<f64>,
    /// Design degrees of freedom (PSUs minus strata), used for t intervals.
    pub df: f64,
    pub n_obs: usize,
    pub n_strata: usize,
    pub n_psus: usize,
}

impl FitSummary {
    /// The coefficient table at the given confidence level.
    pub fn coef_table(&self, level: f64) -> Vec<CoefRow> {
        let t = t_critical(self.df, level);
        self.layout
            .names()
            .into_iter()
            .enumerate()
            .map(|(j, term)| {
                let estimate = self.beta[j];
                let se = self.cov[[j, j]].max(0.0).sqrt();
                CoefRow {
                    term,
                    estimate,
                    se,
                    lo: estimate - t * se,
                    hi: estimate + t * se,
                }
            })
            .collect()
    }

    /// Estimate, standard error and t interval for the linear contrast `c'b`.
    pub fn linear_contrast(&self, contrast: &Array1<f64>, level: f64) -> Estimate {
        let value = contrast.dot(&self.beta);
        let se = contrast.dot(&self.cov.dot(contrast)).max(0.0).sqrt();
        let t = t_critical(self.df, level);
        Estimate {
            value,
            se,
            lo: value - t * se,
            hi: value + t * se,
        }
    }
}

/// Two-sided Student-t critical value at the given confidence level.
pub(crate) fn t_critical(df: f64, level: f64) -> f64 {
    let tail = 0.5 + level / 2.0;
    match StudentsT::new(0.0, 1.0, df.max(1.0)) {
        Ok(dist) => dist.inverse_cdf(tail),
        Err(_) => f64::NAN,
    }
}

/// Fits `totexp ~ sex * year` against the survey design.
///
/// Point estimates solve the weighted normal equations `(X'WX)b = X'Wy` via
/// the external solver. The covariance is the stratified cluster sandwich:
/// weighted score residuals `w_i e_i x_i` are totaled per PSU, centered
/// within each stratum, and scaled by `n_h / (n_h - 1)`.
pub fn fit_expenditure_model(design: &SurveyDesign) -> Result<FitSummary, FitError> {
    let data = design.data();
    let layout = TermLayout::new(data.years.clone());
    let n = data.totexp.len();
    let p = layout.n_terms();

    // Every sex-by-year cell must be populated or the interaction terms are
    // not identifiable.
    let mut cell_counts: BTreeMap<(u16, Sex), usize> = BTreeMap::new();
    for i in 0..n {
        *cell_counts.entry((data.year[i], data.sex[i])).or_insert(0) += 1;
    }
    for (&year, &sex) in layout
        .year_levels()
        .iter()
        .cartesian_product(Sex::LEVELS.iter())
    {
        if !cell_counts.contains_key(&(year, sex)) {
            return Err(FitError::EmptyCell {
                sex: sex.label(),
                year,
            });
        }
    }

    let mut x = Array2::zeros((n, p));
    for i in 0..n {
        let row = layout
            .row(data.sex[i], data.year[i])
            .ok_or(FitError::UnknownYearLevel(data.year[i]))?;
        x.row_mut(i).assign(&row);
    }

    // Form the weighted design matrix (sqrt(W)X) and weighted response.
    let sqrt_w = data.poolwt.mapv(f64::sqrt);
    let wx = &x * &sqrt_w.view().insert_axis(Axis(1));
    let wy = &sqrt_w * &data.totexp;
    let xtwx = wx.t().dot(&wx);
    let xtwy = wx.t().dot(&wy);

    let beta = xtwx
        .solve(&xtwy)
        .map_err(FitError::LinearSystemSolveFailed)?;
    let bread = xtwx.inv().map_err(FitError::LinearSystemSolveFailed)?;

    let df = design.degrees_of_freedom();
    if df < 1.0 {
        return Err(FitError::NoDegreesOfFreedom(df));
    }

    // Weighted score residuals totaled per (stratum, PSU).
    let residuals = &data.totexp - &x.dot(&beta);
    let mut psu_totals: BTreeMap<(i64, i64), Array1<f64>> = BTreeMap::new();
    for i in 0..n {
        let mut score = x.row(i).to_owned();
        score *= data.poolwt[i] * residuals[i];
        let key = (data.stratum[i], data.psu[i]);
        if let Some(total) = psu_totals.get_mut(&key) {
            *total += &score;
        } else {
            psu_totals.insert(key, score);
        }
    }

    let mut strata_totals: BTreeMap<i64, Vec<Array1<f64>>> = BTreeMap::new();
    for ((stratum, _psu), total) in psu_totals {
        strata_totals.entry(stratum).or_default().push(total);
    }

    // Grand mean of PSU totals, the centering point for lonely strata under
    // the adjust policy.
    let n_psus = design.n_psus();
    let mut grand_mean = Array1::<f64>::zeros(p);
    for totals in strata_totals.values() {
        for total in totals {
            grand_mean += total;
        }
    }
    grand_mean /= n_psus as f64;

    let mut meat = Array2::<f64>::zeros((p, p));
    for (&stratum, totals) in &strata_totals {
        let n_h = totals.len();
        if n_h == 1 {
            match design.options().lonely_psu {
                LonelyPsuPolicy::Fail => return Err(FitError::LonelyStratum(stratum)),
                LonelyPsuPolicy::Certainty => continue,
                LonelyPsuPolicy::Adjust => {
                    let deviation = &totals[0] - &grand_mean;
                    meat += &outer(&deviation);
                }
            }
            continue;
        }
        let mut stratum_mean = Array1::<f64>::zeros(p);
        for total in totals {
            stratum_mean += total;
        }
        stratum_mean /= n_h as f64;

        let scale = n_h as f64 / (n_h as f64 - 1.0);
        for total in totals {
            let deviation = total - &stratum_mean;
            meat += &(outer(&deviation) * scale);
        }
    }

    let cov = bread.dot(&meat).dot(&bread);

    log::info!(
        "Fitted {} terms on {} observations ({} strata, {} PSUs, {} design df).",
        p,
        n,
        design.n_strata(),
        n_psus,
        df
    );
    Ok(FitSummary {
        layout,
        beta,
        cov,
        df,
        n_obs: n,
        n_strata: design.n_strata(),
        n_psus,
    })
}

fn outer(v: &Array1<f64>) -> Array2<f64> {
    let column = v.view().insert_axis(Axis(1));
    let row = v.view().insert_axis(Axis(0));
    column.dot(&row)
}
