//! Marginal effects and prediction grids.
//!
//! The model is linear in its parameters, so every quantity here is an exact
//! linear contrast `c'b` with a delta-method standard error `sqrt(c'Sc)`.
//! Nothing is differentiated numerically.

use crate::design::{Sex, SurveyDesign};
use crate::fit::{Estimate, FitError, FitSummary};
use ndarray::Array1;

/// Fitted mean expenditure for one (sex, year) cell.
#[derive(Debug, Clone)]
pub struct CellMean {
    pub sex: Sex,
    pub year: u16,
    pub estimate: Estimate,
}

/// The female minus male fitted difference at one survey year: the marginal
/// effect of sex at that year.
#[derive(Debug, Clone)]
pub struct SexGap {
    pub year: u16,
    pub estimate: Estimate,
}

/// The change in the sex gap between two survey years.
#[derive(Debug, Clone)]
pub struct DidContrast {
    pub from: u16,
    pub to: u16,
    pub estimate: Estimate,
}

/// The full prediction grid: fitted means for every (sex, year) cell,
/// year-major with male before female.
pub fn predicted_cell_means(fit: &FitSummary, level: f64) -> Vec<CellMean> {
    let mut cells = Vec::with_capacity(2 * fit.layout.year_levels().len());
    for &year in fit.layout.year_levels() {
        for sex in Sex::LEVELS {
            if let Some(row) = fit.layout.row(sex, year) {
                cells.push(CellMean {
                    sex,
                    year,
                    estimate: fit.linear_contrast(&row, level),
                });
            }
        }
    }
    cells
}

/// The marginal effect of sex at every pooled year.
pub fn sex_gap_by_year(fit: &FitSummary, level: f64) -> Vec<SexGap> {
    fit.layout
        .year_levels()
        .iter()
        .filter_map(|&year| {
            let contrast = gap_contrast(fit, year)?;
            Some(SexGap {
                year,
                estimate: fit.linear_contrast(&contrast, level),
            })
        })
        .collect()
}

/// The average marginal effect of sex: per-year sex gaps averaged with the
/// pooled-weight share of each year.
pub fn average_sex_gap(fit: &FitSummary, design: &SurveyDesign, level: f64) -> Estimate {
    let years = fit.layout.year_levels();
    let data = design.data();

    let mut shares = vec![0.0f64; years.len()];
    let mut total = 0.0f64;
    for i in 0..data.totexp.len() {
        if let Some(position) = years.iter().position(|&y| y == data.year[i]) {
            shares[position] += data.poolwt[i];
            total += data.poolwt[i];
        }
    }

    let mut contrast = Array1::<f64>::zeros(fit.layout.n_terms());
    for (position, &year) in years.iter().enumerate() {
        if let Some(gap) = gap_contrast(fit, year) {
            contrast += &(gap * (shares[position] / total));
        }
    }
    fit.linear_contrast(&contrast, level)
}

/// The difference-in-differences contrast: how much the sex gap moved between
/// `from` and `to`. For `from` equal to the reference year this is exactly
/// the `sexfemale:year{to}` interaction coefficient.
pub fn difference_in_differences(
    fit: &FitSummary,
    from: u16,
    to: u16,
    level: f64,
) -> Result<DidContrast, FitError> {
    let gap_from = gap_contrast(fit, from).ok_or(FitError::UnknownYearLevel(from))?;
    let gap_to = gap_contrast(fit, to).ok_or(FitError::UnknownYearLevel(to))?;
    let contrast = gap_to - gap_from;
    Ok(DidContrast {
        from,
        to,
        estimate: fit.linear_contrast(&contrast, level),
    })
}

/// The female minus male contrast vector at one year.
fn gap_contrast(fit: &FitSummary, year: u16) -> Option<Array1<f64>> {
    let female = fit.layout.row(Sex::Female, year)?;
    let male = fit.layout.row(Sex::Male, year)?;
    Some(female - male)
}
