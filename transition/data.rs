//! # Data Loading Module
//!
//! Entry point for user-provided tables. Reads the performance table (one row
//! per entity and reporting period) and the origination table (one row per
//! entity, carrying the tier covariate), then inner-joins them on entity id
//! into `Observation`s.
//!
//! Every column is read as text and converted here, so sentinel strings in the
//! status column never break schema inference. Malformed rows are dropped and
//! counted rather than failing the run.

use crate::types::Observation;
use ahash::AHashMap;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Header names of the input tables. Defaults follow the Freddie Mac
/// single-family loan-level dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColumnNames {
    pub entity_id: String,
    pub period: String,
    pub status: String,
    /// Origination column binarized into the tier.
    pub tier_covariate: String,
    /// Extra continuous performance columns fed to the classifier.
    pub covariates: Vec<String>,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            entity_id: "Loan Sequence Number".to_string(),
            period: "Monthly Reporting Period".to_string(),
            status: "Current Loan Delinquency Status".to_string(),
            tier_covariate: "Credit Score".to_string(),
            covariates: Vec::new(),
        }
    }
}

/// Settings for the `[input]` section of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputSettings {
    pub columns: ColumnNames,
    pub delimiter: char,
    /// Keep only the first `row_limit` rows of each table.
    pub row_limit: Option<usize>,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            columns: ColumnNames::default(),
            delimiter: ',',
            row_limit: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{column}' was not found in '{path}'. Please check spelling and case."
    )]
    ColumnNotFound { column: String, path: String },
    #[error("The delimiter {0:?} is not a single-byte ASCII character.")]
    InvalidDelimiter(char),
    #[error("Input file '{0}' contains no data rows.")]
    EmptyTable(String),
    #[error("No performance row matched an origination row on entity id.")]
    EmptyJoin,
}

/// Joined observations plus the bookkeeping of what was dropped on the way.
#[derive(Debug, Clone)]
pub struct LoadedObservations {
    pub observations: Vec<Observation>,
    pub covariate_names: Vec<String>,
    /// Performance rows without an entity id or with an unparsable period.
    pub malformed_rows: usize,
    /// Performance rows whose entity has no origination row.
    pub unmatched_rows: usize,
    /// Performance rows whose entity has a missing or non-numeric tier covariate.
    pub missing_tier_rows: usize,
    /// Origination rows ignored because their entity id was already seen.
    pub duplicate_origination_rows: usize,
}

fn read_table(path: &Path, settings: &InputSettings) -> Result<DataFrame, DataError> {
    if !settings.delimiter.is_ascii() {
        return Err(DataError::InvalidDelimiter(settings.delimiter));
    }
    let separator = settings.delimiter as u8;

    println!("Loading data from '{}'", path.display());
    // Schema inference over zero rows reads every column as a string.
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_n_rows(settings.row_limit)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }
    println!("Read {} rows from '{}'.", df.height(), path.display());
    Ok(df)
}

fn require_columns(df: &DataFrame, required: &[&str], path: &Path) -> Result<(), DataError> {
    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for column in required {
        if !present.contains(*column) {
            return Err(DataError::ColumnNotFound {
                column: column.to_string(),
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Trimmed text values; blanks become `None`.
fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|v| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .collect())
}

/// Numeric values; anything that does not parse becomes `NaN`.
fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let stripped = text_column(df, name)?;
    Ok(stripped
        .into_iter()
        .map(|v| v.and_then(|s| s.parse::<f64>().ok()).unwrap_or(f64::NAN))
        .collect())
}

fn integer_column(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, DataError> {
    let stripped = text_column(df, name)?;
    Ok(stripped
        .into_iter()
        .map(|v| v.and_then(|s| s.parse::<i64>().ok()))
        .collect())
}

/// Reads both tables and joins them into observations.
pub fn load_observations(
    performance_path: &Path,
    origination_path: &Path,
    settings: &InputSettings,
) -> Result<LoadedObservations, DataError> {
    let names = &settings.columns;

    let origination = read_table(origination_path, settings)?;
    require_columns(
        &origination,
        &[names.entity_id.as_str(), names.tier_covariate.as_str()],
        origination_path,
    )?;
    let origination_ids = text_column(&origination, &names.entity_id)?;
    let tier_values = float_column(&origination, &names.tier_covariate)?;

    let mut tier_by_entity: AHashMap<String, f64> = AHashMap::with_capacity(origination_ids.len());
    let mut duplicate_origination_rows = 0;
    for (id, tier) in origination_ids.into_iter().zip(tier_values) {
        let Some(id) = id else { continue };
        if tier_by_entity.contains_key(&id) {
            duplicate_origination_rows += 1;
        } else {
            tier_by_entity.insert(id, tier);
        }
    }
    if duplicate_origination_rows > 0 {
        log::warn!(
            "{} origination rows repeat an earlier entity id; the first occurrence was kept",
            duplicate_origination_rows
        );
    }

    let performance = read_table(performance_path, settings)?;
    let mut required = vec![
        names.entity_id.as_str(),
        names.period.as_str(),
        names.status.as_str(),
    ];
    required.extend(names.covariates.iter().map(String::as_str));
    require_columns(&performance, &required, performance_path)?;

    let ids = text_column(&performance, &names.entity_id)?;
    let periods = integer_column(&performance, &names.period)?;
    let statuses = text_column(&performance, &names.status)?;
    let covariate_columns = names
        .covariates
        .iter()
        .map(|name| float_column(&performance, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut observations = Vec::with_capacity(ids.len());
    let mut malformed_rows = 0;
    let mut unmatched_rows = 0;
    let mut missing_tier_rows = 0;
    for (row, ((id, period), status)) in ids.into_iter().zip(periods).zip(statuses).enumerate() {
        let (Some(entity_id), Some(period)) = (id, period) else {
            malformed_rows += 1;
            continue;
        };
        let Some(&tier_covariate) = tier_by_entity.get(&entity_id) else {
            unmatched_rows += 1;
            continue;
        };
        if !tier_covariate.is_finite() {
            missing_tier_rows += 1;
            continue;
        }
        observations.push(Observation {
            entity_id,
            period,
            raw_status: status,
            tier_covariate,
            covariates: covariate_columns.iter().map(|col| col[row]).collect(),
        });
    }

    if malformed_rows > 0 {
        log::warn!(
            "Dropped {} performance rows with a missing entity id or unparsable period",
            malformed_rows
        );
    }
    if unmatched_rows > 0 {
        log::info!(
            "Dropped {} performance rows with no matching origination row",
            unmatched_rows
        );
    }
    if missing_tier_rows > 0 {
        log::info!(
            "Dropped {} performance rows whose entity lacks a usable '{}'",
            missing_tier_rows,
            names.tier_covariate
        );
    }
    if observations.is_empty() {
        return Err(DataError::EmptyJoin);
    }
    log::info!(
        "Joined {} observations across {} origination entities",
        observations.len(),
        tier_by_entity.len()
    );

    Ok(LoadedObservations {
        observations,
        covariate_names: names.covariates.clone(),
        malformed_rows,
        unmatched_rows,
        missing_tier_rows,
        duplicate_origination_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_table(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn short_columns() -> InputSettings {
        InputSettings {
            columns: ColumnNames {
                entity_id: "id".to_string(),
                period: "period".to_string(),
                status: "status".to_string(),
                tier_covariate: "score".to_string(),
                covariates: vec!["upb".to_string()],
            },
            ..InputSettings::default()
        }
    }

    #[test]
    fn joins_tables_and_keeps_raw_status_text() {
        let perf = write_table(
            "id,period,status,upb\n\
             A,202001,0,100.5\n\
             A,202002,RA,99.0\n\
             A,202003,,98.0\n\
             B,202001,3,50\n",
        );
        let orig = write_table("id,score\nA,720\nB,\n");
        let loaded = load_observations(perf.path(), orig.path(), &short_columns()).unwrap();

        assert_eq!(loaded.observations.len(), 3);
        assert_eq!(loaded.missing_tier_rows, 1);
        assert_eq!(loaded.covariate_names, vec!["upb".to_string()]);
        let a = &loaded.observations[0];
        assert_eq!(a.entity_id, "A");
        assert_eq!(a.period, 202001);
        assert_eq!(a.raw_status.as_deref(), Some("0"));
        assert_eq!(a.tier_covariate, 720.0);
        assert_eq!(a.covariates, vec![100.5]);

        assert_eq!(loaded.observations[1].raw_status.as_deref(), Some("RA"));
        assert_eq!(loaded.observations[2].raw_status, None);
        assert!(loaded.observations.iter().all(|o| o.entity_id == "A"));
    }

    #[test]
    fn drops_and_counts_unusable_rows() {
        let perf = write_table(
            "id,period,status,upb\n\
             A,202001,0,1\n\
             ,202002,0,1\n\
             A,notaperiod,0,1\n\
             Z,202001,0,1\n",
        );
        let orig = write_table("id,score\nA,650\nA,800\n");
        let loaded = load_observations(perf.path(), orig.path(), &short_columns()).unwrap();

        assert_eq!(loaded.observations.len(), 1);
        assert_eq!(loaded.malformed_rows, 2);
        assert_eq!(loaded.unmatched_rows, 1);
        assert_eq!(loaded.duplicate_origination_rows, 1);
        assert_eq!(loaded.observations[0].tier_covariate, 650.0);
    }

    #[test]
    fn row_limit_and_delimiter_are_honoured() {
        let perf = write_table("id;period;status;upb\nA;1;0;1\nA;2;1;1\nA;3;0;1\n");
        let orig = write_table("id;score\nA;700\n");
        let settings = InputSettings {
            delimiter: ';',
            row_limit: Some(2),
            ..short_columns()
        };
        let loaded = load_observations(perf.path(), orig.path(), &settings).unwrap();
        assert_eq!(loaded.observations.len(), 2);
    }

    #[test]
    fn missing_column_is_named() {
        let perf = write_table("id,period,status\nA,1,0\n");
        let orig = write_table("id,score\nA,700\n");
        match load_observations(perf.path(), orig.path(), &short_columns()) {
            Err(DataError::ColumnNotFound { column, .. }) => assert_eq!(column, "upb"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn disjoint_tables_fail_to_join() {
        let perf = write_table("id,period,status,upb\nA,1,0,1\n");
        let orig = write_table("id,score\nB,700\n");
        assert!(matches!(
            load_observations(perf.path(), orig.path(), &short_columns()),
            Err(DataError::EmptyJoin)
        ));
    }

    #[test]
    fn non_ascii_delimiter_is_rejected() {
        let perf = write_table("id,period,status,upb\nA,1,0,1\n");
        let orig = write_table("id,score\nA,700\n");
        let settings = InputSettings {
            delimiter: '§',
            ..short_columns()
        };
        assert!(matches!(
            load_observations(perf.path(), orig.path(), &settings),
            Err(DataError::InvalidDelimiter('§'))
        ));
    }
}
