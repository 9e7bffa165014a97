//! Result table persistence and console rendering of a ranking.

use crate::circularity::CircularityError;
use crate::selection::FitResult;
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use csv::{ReaderBuilder, WriterBuilder};
use std::path::Path;

pub const FEATURES_COLUMN: &str = "Features";
pub const DEVIANCE_COLUMN: &str = "Deviance Explained";
pub const EDF_COLUMN: &str = "Effective Degrees of Freedom";

/// One row of a persisted result table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub features: Vec<String>,
    pub deviance_explained_pct: i64,
    pub effective_dof: f64,
}

impl<M> From<&FitResult<M>> for ResultRow {
    fn from(result: &FitResult<M>) -> Self {
        Self {
            features: result.combination.clone(),
            deviance_explained_pct: result.deviance_explained_pct,
            effective_dof: result.effective_dof,
        }
    }
}

/// Writes one row per combination in rank order. The feature list is stored
/// as a JSON array string.
pub fn write_result_table<M>(path: &Path, ranking: &[FitResult<M>]) -> Result<(), CircularityError> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;
    wtr.write_record([FEATURES_COLUMN, DEVIANCE_COLUMN, EDF_COLUMN])?;
    for result in ranking {
        wtr.write_record([
            serde_json::to_string(&result.combination)?,
            result.deviance_explained_pct.to_string(),
            format!("{:.12}", result.effective_dof),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_result_table(path: &Path) -> Result<Vec<ResultRow>, CircularityError> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = rdr.headers()?.clone();
    let column = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            CircularityError::InvalidInput(format!("result table is missing column '{name}'"))
        })
    };
    let features_idx = column(FEATURES_COLUMN)?;
    let deviance_idx = column(DEVIANCE_COLUMN)?;
    let edf_idx = column(EDF_COLUMN)?;

    let mut rows = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        let field = |idx: usize| {
            record.get(idx).ok_or_else(|| {
                CircularityError::InvalidInput(format!("result table row {} is truncated", i + 1))
            })
        };
        let features: Vec<String> = serde_json::from_str(field(features_idx)?)?;
        let deviance_explained_pct = field(deviance_idx)?.parse::<i64>().map_err(|e| {
            CircularityError::InvalidInput(format!("row {}: bad deviance explained: {e}", i + 1))
        })?;
        let effective_dof = field(edf_idx)?.parse::<f64>().map_err(|e| {
            CircularityError::InvalidInput(format!("row {}: bad effective dof: {e}", i + 1))
        })?;
        rows.push(ResultRow {
            features,
            deviance_explained_pct,
            effective_dof,
        });
    }
    Ok(rows)
}

/// Console table of a ranking, best first.
pub fn ranking_table<M>(ranking: &[FitResult<M>]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Rank", FEATURES_COLUMN, DEVIANCE_COLUMN, EDF_COLUMN]);
    for (rank, result) in ranking.iter().enumerate() {
        table.add_row(Row::from(vec![
            Cell::new(rank + 1),
            Cell::new(result.combination.join(", ")),
            Cell::new(format!("{}%", result.deviance_explained_pct)),
            Cell::new(format!("{:.3}", result.effective_dof)),
        ]));
    }
    table
}
