//! # Run Artifacts
//!
//! Per partition `name`, a run writes two headerless comma-separated matrices:
//! `{name}_predict.csv` (test rows × next-state classes) and
//! `{name}_transition.csv` (classes × classes). One `report.toml` summarizes
//! the whole run.

use crate::classifier::FitSummary;
use crate::metrics::CalibrationReport;
use crate::pipeline::{PartitionOutcome, PipelineOutcome};
use crate::reclassify::StatusSummary;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REPORT_FILE_NAME: &str = "report.toml";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to read or write artifact: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to parse TOML report: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Matrix file '{path}' is malformed: {reason}")]
    MalformedMatrix { path: String, reason: String },
}

/// Writes `matrix` without a header, one row per line, floats in shortest
/// round-trip form.
pub fn write_matrix_csv(path: &Path, matrix: ArrayView2<f64>) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut buffer = ryu::Buffer::new();
    let mut record: Vec<String> = Vec::with_capacity(matrix.ncols());
    for row in matrix.rows() {
        record.clear();
        record.extend(row.iter().map(|&v| buffer.format(v).to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a matrix written by [`write_matrix_csv`].
pub fn read_matrix_csv(path: &Path) -> Result<Array2<f64>, ExportError> {
    let malformed = |reason: String| ExportError::MalformedMatrix {
        path: path.display().to_string(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut values = Vec::new();
    let mut rows = 0;
    let mut cols = 0;
    // Ragged rows are rejected by the reader itself.
    for record in reader.records() {
        let record = record?;
        cols = record.len();
        for field in record.iter() {
            let value = field
                .trim()
                .parse::<f64>()
                .map_err(|_| malformed(format!("'{}' is not a number", field)))?;
            values.push(value);
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| malformed(e.to_string()))
}

/// Per-partition section of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub name: String,
    pub train_rows: usize,
    pub test_rows: usize,
    pub unseen_states: Vec<usize>,
    pub row_support: Vec<usize>,
    pub transition_matrix: Vec<Vec<f64>>,
    pub fit: FitSummary,
    pub calibration: CalibrationReport,
}

impl From<&PartitionOutcome> for PartitionReport {
    fn from(outcome: &PartitionOutcome) -> Self {
        Self {
            name: outcome.name.clone(),
            train_rows: outcome.train_rows,
            test_rows: outcome.test_rows,
            unseen_states: outcome.transition.unseen_states.clone(),
            row_support: outcome.transition.row_support.clone(),
            transition_matrix: outcome.transition.to_rows(),
            fit: outcome.fit.clone(),
            calibration: outcome.calibration.clone(),
        }
    }
}

/// Human-readable summary of a whole run, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub retained_max: u32,
    pub collapsed: bool,
    pub states: Vec<u32>,
    pub observations: usize,
    pub reclassify_dropped_rows: usize,
    pub pairs: usize,
    pub encode_dropped_rows: usize,
    pub train_entities: usize,
    pub test_entities: usize,
    pub status_summary: StatusSummary,
    pub partitions: Vec<PartitionReport>,
}

impl From<&PipelineOutcome> for RunReport {
    fn from(outcome: &PipelineOutcome) -> Self {
        Self {
            retained_max: outcome.retained_max,
            collapsed: outcome.collapsed,
            states: outcome.states.clone(),
            observations: outcome.observations,
            reclassify_dropped_rows: outcome.reclassify_dropped_rows,
            pairs: outcome.pairs,
            encode_dropped_rows: outcome.encode_dropped_rows,
            train_entities: outcome.train_entities,
            test_entities: outcome.test_entities,
            status_summary: outcome.status_summary.clone(),
            partitions: outcome.partitions.iter().map(PartitionReport::from).collect(),
        }
    }
}

impl RunReport {
    pub fn save(&self, path: &Path) -> Result<(), ExportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ExportError> {
        let toml_string = fs::read_to_string(path)?;
        let report = toml::from_str(&toml_string)?;
        Ok(report)
    }
}

/// Paths written by [`write_artifacts`].
#[derive(Debug, Clone, Default)]
pub struct WrittenArtifacts {
    pub prediction_files: Vec<PathBuf>,
    pub transition_files: Vec<PathBuf>,
    pub report: PathBuf,
}

/// Writes every partition's matrices plus the run report into `out_dir`,
/// creating the directory when needed.
pub fn write_artifacts(
    outcome: &PipelineOutcome,
    out_dir: &Path,
) -> Result<WrittenArtifacts, ExportError> {
    fs::create_dir_all(out_dir)?;
    let mut written = WrittenArtifacts::default();

    for partition in &outcome.partitions {
        let predict = out_dir.join(format!("{}_predict.csv", partition.name));
        write_matrix_csv(&predict, partition.probabilities.view())?;
        written.prediction_files.push(predict);

        let transition = out_dir.join(format!("{}_transition.csv", partition.name));
        write_matrix_csv(&transition, partition.transition.matrix.view())?;
        written.transition_files.push(transition);
    }

    written.report = out_dir.join(REPORT_FILE_NAME);
    RunReport::from(outcome).save(&written.report)?;
    log::info!(
        "Wrote {} partition artifacts and the run report to '{}'",
        outcome.partitions.len(),
        out_dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn matrices_are_written_without_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let m = array![[0.25, 0.75], [1.0, 0.0]];
        write_matrix_csv(&path, m.view()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "0.25,0.75\n1.0,0.0\n");
        assert_eq!(read_matrix_csv(&path).unwrap(), m);
    }

    #[test]
    fn shortest_round_trip_formatting_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.csv");
        let m = array![[1.0 / 3.0, 2.0 / 3.0]];
        write_matrix_csv(&path, m.view()).unwrap();
        let back = read_matrix_csv(&path).unwrap();
        assert_abs_diff_eq!(back[[0, 0]], 1.0 / 3.0, epsilon = 0.0);
        assert_abs_diff_eq!(back[[0, 1]], 2.0 / 3.0, epsilon = 0.0);
    }

    #[test]
    fn ragged_matrix_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "1,2\n3\n").unwrap();
        assert!(matches!(
            read_matrix_csv(&path),
            Err(ExportError::CsvError(_))
        ));

        fs::write(&path, "1,x\n").unwrap();
        assert!(matches!(
            read_matrix_csv(&path),
            Err(ExportError::MalformedMatrix { .. })
        ));
    }
}
