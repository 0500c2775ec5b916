//! Pooling of normalized yearly extracts and the linkage merge.
//!
//! The pooled weight divides each person weight by the number of extracts
//! actually pooled, so the divisor can never drift away from the pooled-year
//! list. Row-count postconditions are checked after both the union and the
//! join; a violation means a pipeline defect, not a data problem.

use crate::config::JoinPolicy;
use crate::extract::{LinkageExtract, YearlyExtract};
use polars::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

/// The union of all normalized yearly extracts, annotated with the pooled
/// weight column `poolwt`.
#[derive(Debug)]
pub struct PooledTable {
    pub frame: DataFrame,
    /// Pooled survey years, ascending.
    pub years: Vec<u16>,
}

/// The pooled table left-joined with the linkage extract.
#[derive(Debug)]
pub struct MergedTable {
    pub frame: DataFrame,
    pub years: Vec<u16>,
    /// Rows discarded under `JoinPolicy::Drop`; zero under the other policies.
    pub dropped_unmatched: usize,
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("No extracts were supplied to the pooler; at least one survey year is required.")]
    NoExtracts,
    #[error("Survey year {0} appears more than once in the pooled extract sequence.")]
    DuplicateYear(u16),
    #[error("Pooled table has {found} rows but the normalized extracts held {expected} in total.")]
    RowCountMismatch { expected: usize, found: usize },
    #[error(
        "The linkage extract contains {0} duplicated (dupersid, panel) keys. A left join against duplicated keys would multiply pooled rows and silently corrupt every downstream estimate."
    )]
    DuplicateLinkageKeys(usize),
    #[error(
        "{0} pooled rows have no match in the linkage extract. Use an explicit join policy (keep-null or drop) to override."
    )]
    UnmatchedKeys(usize),
    #[error(
        "Left join changed the row count from {expected} to {found}; the merged table no longer maps one-to-one onto the pooled table."
    )]
    JoinRowCountChanged { expected: usize, found: usize },
}

/// Unions the normalized extracts and derives the pooled sampling weight.
///
/// The divisor is the count of extracts pooled, so `poolwt = perwt / k`.
/// Postcondition: pooled row count equals the sum of the input row counts.
pub fn pool_extracts(extracts: &[YearlyExtract]) -> Result<PooledTable, PoolError> {
    if extracts.is_empty() {
        return Err(PoolError::NoExtracts);
    }
    let mut seen_years = HashSet::new();
    for extract in extracts {
        if !seen_years.insert(extract.year) {
            return Err(PoolError::DuplicateYear(extract.year));
        }
    }

    let expected: usize = extracts.iter().map(|e| e.frame.height()).sum();
    let mut pooled = extracts[0].frame.clone();
    for extract in &extracts[1..] {
        pooled = pooled.vstack(&extract.frame)?;
    }

    let divisor = extracts.len() as f64;
    let poolwt: Vec<f64> = pooled
        .column("perwt")?
        .f64()?
        .rechunk()
        .into_no_null_iter()
        .map(|w| w / divisor)
        .collect();
    pooled.with_column(Column::new("poolwt".into(), poolwt))?;

    if pooled.height() != expected {
        return Err(PoolError::RowCountMismatch {
            expected,
            found: pooled.height(),
        });
    }

    log::info!(
        "Pooled {} extracts into {} rows (weight divisor {}).",
        extracts.len(),
        pooled.height(),
        divisor
    );
    Ok(PooledTable {
        frame: pooled,
        years: extracts.iter().map(|e| e.year).collect(),
    })
}

/// Left-joins the pooled table against the linkage extract on the composite
/// key (dupersid, panel), attaching the pooled stratum and PSU fields.
///
/// Duplicated linkage keys are always fatal. Unmatched pooled rows are
/// handled according to `policy`.
pub fn merge_linkage(
    pooled: PooledTable,
    linkage: &LinkageExtract,
    policy: JoinPolicy,
) -> Result<MergedTable, PoolError> {
    let duplicates = count_duplicate_keys(&linkage.frame)?;
    if duplicates > 0 {
        return Err(PoolError::DuplicateLinkageKeys(duplicates));
    }

    let expected = pooled.frame.height();
    let merged = pooled
        .frame
        .lazy()
        .join(
            linkage.frame.clone().lazy(),
            [col("dupersid"), col("panel")],
            [col("dupersid"), col("panel")],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;

    if merged.height() != expected {
        return Err(PoolError::JoinRowCountChanged {
            expected,
            found: merged.height(),
        });
    }

    let unmatched = merged.column("stra9621")?.null_count();
    let (frame, dropped_unmatched) = match policy {
        JoinPolicy::Fail if unmatched > 0 => return Err(PoolError::UnmatchedKeys(unmatched)),
        JoinPolicy::Fail => (merged, 0),
        JoinPolicy::KeepNull => {
            if unmatched > 0 {
                log::warn!(
                    "{unmatched} pooled rows have no linkage match; stratum/PSU left null."
                );
            }
            (merged, 0)
        }
        JoinPolicy::Drop => {
            if unmatched > 0 {
                let kept = merged
                    .lazy()
                    .filter(col("stra9621").is_not_null())
                    .collect()?;
                log::warn!("Dropped {unmatched} pooled rows with no linkage match.");
                (kept, unmatched)
            } else {
                (merged, 0)
            }
        }
    };

    Ok(MergedTable {
        frame,
        years: pooled.years,
        dropped_unmatched,
    })
}

/// Counts (dupersid, panel) keys appearing more than once in the linkage
/// extract. Each extra occurrence counts once.
fn count_duplicate_keys(linkage: &DataFrame) -> Result<usize, PoolError> {
    let ids = linkage.column("dupersid")?.str()?;
    let panels = linkage.column("panel")?.i64()?;

    let mut seen: HashSet<(String, i64)> = HashSet::with_capacity(linkage.height());
    let mut duplicates = 0usize;
    for (id, panel) in ids.into_iter().zip(panels.into_iter()) {
        let key = (
            id.unwrap_or_default().to_string(),
            panel.unwrap_or_default(),
        );
        if !seen.insert(key) {
            duplicates += 1;
        }
    }
    Ok(duplicates)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn yearly(year: u16, ids: &[&str], weights: &[f64]) -> YearlyExtract {
        let n = ids.len();
        let frame = DataFrame::new(vec![
            Column::new(
                "dupersid".into(),
                ids.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            ),
            Column::new("panel".into(), vec![21i64; n]),
            Column::new("varstr".into(), vec![1001i64; n]),
            Column::new("varpsu".into(), vec![1i64; n]),
            Column::new("sex".into(), vec![1i64; n]),
            Column::new("totexp".into(), vec![100.0f64; n]),
            Column::new("perwt".into(), weights.to_vec()),
            Column::new("year".into(), vec![year as i32; n]),
        ])
        .unwrap();
        YearlyExtract { frame, year }
    }

    fn linkage(keys: &[(&str, i64)]) -> LinkageExtract {
        let frame = DataFrame::new(vec![
            Column::new(
                "dupersid".into(),
                keys.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>(),
            ),
            Column::new(
                "panel".into(),
                keys.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
            ),
            Column::new("stra9621".into(), vec![2001i64; keys.len()]),
            Column::new("psu9621".into(), vec![1i64; keys.len()]),
        ])
        .unwrap();
        LinkageExtract { frame }
    }

    fn pooled_weights(table: &PooledTable) -> Vec<f64> {
        table
            .frame
            .column("poolwt")
            .unwrap()
            .f64()
            .unwrap()
            .rechunk()
            .into_no_null_iter()
            .collect()
    }

    #[test]
    fn pooling_unions_rows_and_divides_weights() {
        let extracts = vec![
            yearly(2016, &["A", "B"], &[12.0, 18.0]),
            yearly(2017, &["C"], &[30.0]),
            yearly(2018, &["D"], &[6.0]),
        ];
        let pooled = pool_extracts(&extracts).unwrap();
        assert_eq!(pooled.frame.height(), 4);
        assert_eq!(pooled.years, vec![2016, 2017, 2018]);

        let weights = pooled_weights(&pooled);
        assert_abs_diff_eq!(weights[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[1], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[2], 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[3], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn pooling_rejects_duplicate_years() {
        let extracts = vec![
            yearly(2016, &["A"], &[1.0]),
            yearly(2016, &["B"], &[1.0]),
        ];
        assert!(matches!(
            pool_extracts(&extracts),
            Err(PoolError::DuplicateYear(2016))
        ));
    }

    #[test]
    fn pooling_rejects_an_empty_sequence() {
        assert!(matches!(pool_extracts(&[]), Err(PoolError::NoExtracts)));
    }

    #[test]
    fn merge_attaches_pooled_design_fields() {
        let pooled = pool_extracts(&[yearly(2016, &["A", "B"], &[10.0, 20.0])]).unwrap();
        let link = linkage(&[("A", 21), ("B", 21)]);
        let merged = merge_linkage(pooled, &link, JoinPolicy::Fail).unwrap();

        // left join never drops rows
        assert_eq!(merged.frame.height(), 2);
        assert_eq!(merged.dropped_unmatched, 0);
        assert_eq!(merged.frame.column("stra9621").unwrap().null_count(), 0);
        assert_eq!(merged.frame.column("psu9621").unwrap().null_count(), 0);
    }

    #[test]
    fn merge_fails_fast_on_unmatched_keys_by_default() {
        let pooled = pool_extracts(&[yearly(2016, &["A", "B"], &[10.0, 20.0])]).unwrap();
        let link = linkage(&[("A", 21)]);
        let err = merge_linkage(pooled, &link, JoinPolicy::Fail).unwrap_err();
        assert!(matches!(err, PoolError::UnmatchedKeys(1)));
    }

    #[test]
    fn merge_keep_null_retains_unmatched_rows() {
        let pooled = pool_extracts(&[yearly(2016, &["A", "B"], &[10.0, 20.0])]).unwrap();
        let link = linkage(&[("A", 21)]);
        let merged = merge_linkage(pooled, &link, JoinPolicy::KeepNull).unwrap();
        assert_eq!(merged.frame.height(), 2);
        assert_eq!(merged.frame.column("stra9621").unwrap().null_count(), 1);
    }

    #[test]
    fn merge_drop_discards_unmatched_rows() {
        let pooled = pool_extracts(&[yearly(2016, &["A", "B"], &[10.0, 20.0])]).unwrap();
        let link = linkage(&[("A", 21)]);
        let merged = merge_linkage(pooled, &link, JoinPolicy::Drop).unwrap();
        assert_eq!(merged.frame.height(), 1);
        assert_eq!(merged.dropped_unmatched, 1);
        assert_eq!(merged.frame.column("stra9621").unwrap().null_count(), 0);
    }

    #[test]
    fn merge_rejects_duplicate_linkage_keys() {
        let pooled = pool_extracts(&[yearly(2016, &["A"], &[10.0])]).unwrap();
        let link = linkage(&[("A", 21), ("A", 21)]);
        let err = merge_linkage(pooled, &link, JoinPolicy::Fail).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateLinkageKeys(1)));
    }

    #[test]
    fn panel_disambiguates_the_composite_key() {
        // same dupersid in two panels must not collide
        let frame = DataFrame::new(vec![
            Column::new("dupersid".into(), vec!["A".to_string(), "A".to_string()]),
            Column::new("panel".into(), vec![21i64, 22i64]),
            Column::new("varstr".into(), vec![1001i64; 2]),
            Column::new("varpsu".into(), vec![1i64; 2]),
            Column::new("sex".into(), vec![1i64; 2]),
            Column::new("totexp".into(), vec![100.0f64; 2]),
            Column::new("perwt".into(), vec![10.0f64, 20.0]),
            Column::new("year".into(), vec![2016i32; 2]),
        ])
        .unwrap();
        let extract = YearlyExtract { frame, year: 2016 };
        let pooled = pool_extracts(&[extract]).unwrap();
        let link = linkage(&[("A", 21), ("A", 22)]);
        let merged = merge_linkage(pooled, &link, JoinPolicy::Fail).unwrap();
        assert_eq!(merged.frame.height(), 2);
        assert_eq!(merged.frame.column("stra9621").unwrap().null_count(), 0);
    }
}
