//! # Extract Loading and Normalization
//!
//! This module is the exclusive entry point for provider data. It reads the
//! yearly full-year consolidated extracts and the pooled-linkage extract,
//! validates them against the expected schema, and normalizes each one to a
//! fixed canonical projection with canonical dtypes.
//!
//! - Strict schema: the year-suffixed expenditure and weight fields must be
//!   present under their documented names. Their absence means the provider
//!   schema drifted, and that is surfaced immediately, never defaulted.
//! - User-centric errors: failures name the offending column and file so the
//!   problem can be traced to the source extract.

use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A normalized yearly extract: one row per respondent, canonical schema
/// `dupersid, panel, varstr, varpsu, sex, totexp, perwt, year`.
#[derive(Debug)]
pub struct YearlyExtract {
    pub frame: DataFrame,
    pub year: u16,
}

/// The pooled-linkage extract: one row per (dupersid, panel), carrying the
/// pooled variance-estimation stratum and PSU.
#[derive(Debug)]
pub struct LinkageExtract {
    pub frame: DataFrame,
}

/// A comprehensive error type for all extract loading and validation failures.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{column}' was not found in '{file}'. The provider schema may have drifted; check the release notes for this extract."
    )]
    ColumnNotFound { column: String, file: String },
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Every projected field must be complete."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'."
    )]
    NonFiniteValuesFound(String),
    #[error("Extract '{0}' contains no data rows.")]
    EmptyExtract(String),
}

/// Loads and normalizes one full-year consolidated extract.
///
/// Every column name is lowercased, the year-suffixed `totexp{yy}` and
/// `perwt{yy}f` fields are renamed to their canonical names, the frame is
/// projected to the fixed 7-field schema, and a literal `year` column is
/// stamped on. The row count is preserved exactly.
pub fn load_yearly_extract(path: &Path, year: u16) -> Result<YearlyExtract, ExtractError> {
    let mut df = read_provider_csv(path)?;
    lowercase_columns(&mut df)?;

    let n = df.height();
    if n == 0 {
        return Err(ExtractError::EmptyExtract(path.display().to_string()));
    }

    let yy = year % 100;
    let totexp_source = format!("totexp{yy:02}");
    let perwt_source = format!("perwt{yy:02}f");
    require_columns(
        &df,
        &[
            "dupersid",
            "panel",
            "varstr",
            "varpsu",
            "sex",
            &totexp_source,
            &perwt_source,
        ],
        path,
    )?;

    let columns = vec![
        string_column(&df, "dupersid", "dupersid")?,
        int_column(&df, "panel", "panel")?,
        int_column(&df, "varstr", "varstr")?,
        int_column(&df, "varpsu", "varpsu")?,
        int_column(&df, "sex", "sex")?,
        float_column(&df, &totexp_source, "totexp")?,
        float_column(&df, &perwt_source, "perwt")?,
        Column::new("year".into(), vec![year as i32; n]),
    ];
    let frame = DataFrame::new(columns)?;

    log::info!(
        "Normalized {} extract: {} rows, weight field '{}'.",
        year,
        frame.height(),
        perwt_source
    );
    Ok(YearlyExtract { frame, year })
}

/// Loads and normalizes the pooled-linkage extract, projecting the composite
/// key and the pooled stratum/PSU fields.
pub fn load_linkage_extract(path: &Path) -> Result<LinkageExtract, ExtractError> {
    let mut df = read_provider_csv(path)?;
    lowercase_columns(&mut df)?;

    if df.height() == 0 {
        return Err(ExtractError::EmptyExtract(path.display().to_string()));
    }
    require_columns(&df, &["dupersid", "panel", "stra9621", "psu9621"], path)?;

    let columns = vec![
        string_column(&df, "dupersid", "dupersid")?,
        int_column(&df, "panel", "panel")?,
        int_column(&df, "stra9621", "stra9621")?,
        int_column(&df, "psu9621", "psu9621")?,
    ];
    Ok(LinkageExtract {
        frame: DataFrame::new(columns)?,
    })
}

fn read_provider_csv(path: &Path) -> Result<DataFrame, ExtractError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;
    Ok(df)
}

/// Lowercases every column name in place. Yearly releases are inconsistent
/// about header case, so normalization happens before any lookup.
fn lowercase_columns(df: &mut DataFrame) -> Result<(), ExtractError> {
    let lowered: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_lowercase())
        .collect();
    df.set_column_names(lowered)?;
    Ok(())
}

fn require_columns(df: &DataFrame, required: &[&str], path: &Path) -> Result<(), ExtractError> {
    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for column in required {
        if !present.contains(*column) {
            return Err(ExtractError::ColumnNotFound {
                column: column.to_string(),
                file: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Extracts a numeric column as `f64`, renaming it to its canonical name.
fn float_column(df: &DataFrame, source: &str, canonical: &str) -> Result<Column, ExtractError> {
    let series = df.column(source)?;
    if series.null_count() > 0 {
        return Err(ExtractError::MissingValuesFound(source.to_string()));
    }
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| ExtractError::ColumnWrongType {
            column_name: source.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(ExtractError::ColumnWrongType {
            column_name: source.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }
    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExtractError::NonFiniteValuesFound(source.to_string()));
    }
    Ok(Column::new(canonical.into(), values))
}

/// Extracts an integer-coded column as `i64`, renaming it to its canonical name.
fn int_column(df: &DataFrame, source: &str, canonical: &str) -> Result<Column, ExtractError> {
    let series = df.column(source)?;
    if series.null_count() > 0 {
        return Err(ExtractError::MissingValuesFound(source.to_string()));
    }
    let casted = series
        .cast(&DataType::Int64)
        .map_err(|_| ExtractError::ColumnWrongType {
            column_name: source.to_string(),
            expected_type: "i64 (integer code)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(ExtractError::ColumnWrongType {
            column_name: source.to_string(),
            expected_type: "i64 (integer code)",
            found_type: format!("{:?}", series.dtype()),
        });
    }
    let values: Vec<i64> = casted.i64()?.rechunk().into_no_null_iter().collect();
    Ok(Column::new(canonical.into(), values))
}

/// Extracts an identifier column as strings, renaming it to its canonical name.
/// Identifiers are kept textual so leading zeros survive the round trip.
fn string_column(df: &DataFrame, source: &str, canonical: &str) -> Result<Column, ExtractError> {
    let series = df.column(source)?;
    if series.null_count() > 0 {
        return Err(ExtractError::MissingValuesFound(source.to_string()));
    }
    let casted = series
        .cast(&DataType::String)
        .map_err(|_| ExtractError::ColumnWrongType {
            column_name: source.to_string(),
            expected_type: "string identifier",
            found_type: format!("{:?}", series.dtype()),
        })?;
    let values: Vec<String> = casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect();
    Ok(Column::new(canonical.into(), values))
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// A robust helper to create a temporary CSV file for testing.
    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    const FYC_2016_HEADER: &str = "DUPERSID,PANEL,VARSTR,VARPSU,SEX,TOTEXP16,PERWT16F,RACEV1X";

    fn fyc_2016_content() -> String {
        let mut rows = vec![FYC_2016_HEADER.to_string()];
        rows.push("2320134101,21,1001,1,1,1250.0,5489.2,1".to_string());
        rows.push("2320134102,21,1001,2,2,310.5,6120.0,2".to_string());
        rows.push("2329876501,22,1002,1,2,0.0,4410.8,1".to_string());
        rows.join("\n")
    }

    #[test]
    fn normalizes_renames_and_stamps_year() {
        let file = create_test_csv(&fyc_2016_content()).unwrap();
        let extract = load_yearly_extract(file.path(), 2016).unwrap();

        // projection/rename never drops rows
        assert_eq!(extract.frame.height(), 3);
        assert_eq!(extract.year, 2016);
        let names: Vec<String> = extract
            .frame
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["dupersid", "panel", "varstr", "varpsu", "sex", "totexp", "perwt", "year"]
        );

        let totexp: Vec<f64> = extract
            .frame
            .column("totexp")
            .unwrap()
            .f64()
            .unwrap()
            .rechunk()
            .into_no_null_iter()
            .collect();
        assert_abs_diff_eq!(totexp[0], 1250.0, epsilon = 1e-9);
        assert_abs_diff_eq!(totexp[1], 310.5, epsilon = 1e-9);

        let year: Vec<i64> = extract
            .frame
            .column("year")
            .unwrap()
            .cast(&DataType::Int64)
            .unwrap()
            .i64()
            .unwrap()
            .rechunk()
            .into_no_null_iter()
            .collect();
        assert!(year.iter().all(|&y| y == 2016));
    }

    #[test]
    fn identifiers_stay_textual() {
        let content = format!(
            "{}\n{}",
            FYC_2016_HEADER, "0020134101,21,1001,1,1,10.0,100.0,1"
        );
        let file = create_test_csv(&content).unwrap();
        let extract = load_yearly_extract(file.path(), 2016).unwrap();
        let id = extract
            .frame
            .column("dupersid")
            .unwrap()
            .str()
            .unwrap()
            .get(0)
            .unwrap()
            .to_string();
        // dupersid parses as numeric in some releases; the normalizer must not
        // let the cast eat leading zeros
        assert!(id.ends_with("20134101"));
    }

    #[test]
    fn schema_drift_is_fatal() {
        // a 2017-style extract presented as 2016: the year-suffixed fields
        // will not be found
        let header = "DUPERSID,PANEL,VARSTR,VARPSU,SEX,TOTEXP17,PERWT17F";
        let content = format!("{}\n{}", header, "2320134101,21,1001,1,1,1250.0,5489.2");
        let file = create_test_csv(&content).unwrap();
        let err = load_yearly_extract(file.path(), 2016).unwrap_err();
        match err {
            ExtractError::ColumnNotFound { column, .. } => assert_eq!(column, "totexp16"),
            other => panic!("Expected ColumnNotFound(totexp16), got {:?}", other),
        }
    }

    #[test]
    fn missing_values_are_fatal() {
        let content = format!(
            "{}\n{}\n{}",
            FYC_2016_HEADER,
            "2320134101,21,1001,1,1,1250.0,5489.2,1",
            "2320134102,21,1001,2,2,,6120.0,2"
        );
        let file = create_test_csv(&content).unwrap();
        let err = load_yearly_extract(file.path(), 2016).unwrap_err();
        match err {
            ExtractError::MissingValuesFound(column) => assert_eq!(column, "totexp16"),
            other => panic!("Expected MissingValuesFound(totexp16), got {:?}", other),
        }
    }

    #[test]
    fn non_numeric_expenditure_is_fatal() {
        let content = format!(
            "{}\n{}",
            FYC_2016_HEADER, "2320134101,21,1001,1,1,not_a_number,5489.2,1"
        );
        let file = create_test_csv(&content).unwrap();
        let err = load_yearly_extract(file.path(), 2016).unwrap_err();
        match err {
            ExtractError::ColumnWrongType { column_name, .. } => {
                assert_eq!(column_name, "totexp16")
            }
            other => panic!("Expected ColumnWrongType(totexp16), got {:?}", other),
        }
    }

    #[test]
    fn empty_extract_is_fatal() {
        let file = create_test_csv(FYC_2016_HEADER).unwrap();
        let err = load_yearly_extract(file.path(), 2016).unwrap_err();
        assert!(matches!(err, ExtractError::EmptyExtract(_)));
    }

    #[test]
    fn loads_linkage_extract() {
        let content = "DUPERSID,PANEL,STRA9621,PSU9621\n2320134101,21,1001,1\n2320134102,21,1001,2";
        let file = create_test_csv(content).unwrap();
        let linkage = load_linkage_extract(file.path()).unwrap();
        assert_eq!(linkage.frame.height(), 2);
        let names: Vec<String> = linkage
            .frame
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, vec!["dupersid", "panel", "stra9621", "psu9621"]);
    }

    #[test]
    fn linkage_requires_pooled_design_fields() {
        let content = "DUPERSID,PANEL,VARSTR,VARPSU\n2320134101,21,1001,1";
        let file = create_test_csv(content).unwrap();
        let err = load_linkage_extract(file.path()).unwrap_err();
        match err {
            ExtractError::ColumnNotFound { column, .. } => assert_eq!(column, "stra9621"),
            other => panic!("Expected ColumnNotFound(stra9621), got {:?}", other),
        }
    }
}
