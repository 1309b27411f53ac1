//! # Feature Encoding
//!
//! Turns transition pairs into the dense matrices the classifier consumes.
//!
//! - Covariates are standardized with the mean and sample standard deviation of
//!   the whole working dataset. These statistics are computed before the
//!   train/test split, so test rows influence the scaling applied to training
//!   rows. This is a known limitation and is kept deliberately.
//! - `current_state` and `next_state` share one state vocabulary and are
//!   expanded into two one-hot blocks of equal width. The pipeline passes the
//!   full reclassified state space, so a state nobody occupies still owns a
//!   column. Columns are addressed through [`OneHotSchema`], never by name.

use crate::types::{Tier, TransitionPair};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("No transition pairs are left to encode.")]
    EmptyInput,
    #[error(
        "Pair {row} carries {found} covariates, but {expected} covariate columns were configured."
    )]
    CovariateWidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Pair {row} has state {state}, which is outside the state space {states:?}.")]
    StateOutsideSchema {
        row: usize,
        state: u32,
        states: Vec<u32>,
    },
}

/// Which state column a one-hot block encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    Current,
    Next,
}

/// Typed column map for the two one-hot blocks.
///
/// Layout: `[current_0 .. current_{n-1}, next_0 .. next_{n-1}]`, where class
/// `i` is the `i`-th smallest state value in the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OneHotSchema {
    states: Vec<u32>,
}

impl OneHotSchema {
    /// Fits the shared vocabulary over both state columns.
    pub fn fit(pairs: &[TransitionPair]) -> Self {
        let states: BTreeSet<u32> = pairs
            .iter()
            .flat_map(|p| [p.current_state, p.next_state])
            .collect();
        Self {
            states: states.into_iter().collect(),
        }
    }

    pub fn from_states(states: impl IntoIterator<Item = u32>) -> Self {
        let states: BTreeSet<u32> = states.into_iter().collect();
        Self {
            states: states.into_iter().collect(),
        }
    }

    /// Number of classes, i.e. the width of one block.
    pub fn num_classes(&self) -> usize {
        self.states.len()
    }

    /// State value for every class index, ascending.
    pub fn states(&self) -> &[u32] {
        &self.states
    }

    pub fn class_of(&self, state: u32) -> Option<usize> {
        self.states.binary_search(&state).ok()
    }

    pub fn state_of(&self, class: usize) -> Option<u32> {
        self.states.get(class).copied()
    }

    pub fn block(&self, field: StateField) -> Range<usize> {
        let n = self.num_classes();
        match field {
            StateField::Current => 0..n,
            StateField::Next => n..2 * n,
        }
    }

    /// Absolute column of `(field, state)` in the combined one-hot matrix.
    pub fn column(&self, field: StateField, state: u32) -> Option<usize> {
        self.class_of(state).map(|class| self.block(field).start + class)
    }
}

/// Per-column standardization statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standardizer {
    pub names: Vec<String>,
    pub means: Vec<f64>,
    /// Divisor actually applied; `1.0` for a degenerate column.
    pub scales: Vec<f64>,
}

impl Standardizer {
    /// Mean and sample (n-1) standard deviation of every column.
    pub fn fit(names: &[String], columns: ArrayView2<f64>) -> Self {
        let n = columns.nrows();
        let mut means = Vec::with_capacity(columns.ncols());
        let mut scales = Vec::with_capacity(columns.ncols());

        for (name, column) in names.iter().zip(columns.axis_iter(Axis(1))) {
            let mean = if n == 0 { 0.0 } else { column.sum() / n as f64 };
            let scale = if n < 2 {
                None
            } else {
                let variance =
                    column.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                let sd = variance.sqrt();
                (sd > 0.0 && sd.is_finite()).then_some(sd)
            };
            let scale = scale.unwrap_or_else(|| {
                log::warn!(
                    "Covariate '{}' has no usable standard deviation over {} rows; centering only",
                    name,
                    n
                );
                1.0
            });
            means.push(mean);
            scales.push(scale);
        }

        Self {
            names: names.to_vec(),
            means,
            scales,
        }
    }

    pub fn transform(&self, columns: ArrayView2<f64>) -> Array2<f64> {
        let mut out = columns.to_owned();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, scale) = (self.means[j], self.scales[j]);
            column.mapv_inplace(|v| (v - mean) / scale);
        }
        out
    }
}

/// Fully encoded working dataset. Row `i` in every field refers to the same pair.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    pub entity_ids: Vec<String>,
    pub tiers: Vec<Tier>,
    /// `[current block | next block]`, see [`OneHotSchema`].
    pub one_hot: Array2<f64>,
    /// Standardized covariates, one column per configured covariate.
    pub covariates: Array2<f64>,
    pub schema: OneHotSchema,
    pub standardizer: Standardizer,
    /// Pairs dropped for a missing covariate.
    pub dropped_rows: usize,
}

impl EncodedDataset {
    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    pub fn state_block(&self, field: StateField) -> ArrayView2<'_, f64> {
        self.one_hot.slice(s![.., self.schema.block(field)])
    }

    /// Classifier inputs for the selected rows: the current-state block, the
    /// tier indicator, and optionally the standardized covariates.
    pub fn features(&self, rows: &[usize], include_covariates: bool) -> Array2<f64> {
        let current = self.state_block(StateField::Current).select(Axis(0), rows);
        let tier = Array1::from_iter(rows.iter().map(|&r| self.tiers[r].as_feature()))
            .insert_axis(Axis(1));

        let mut width = current.ncols() + 1;
        if include_covariates {
            width += self.covariates.ncols();
        }
        let mut out = Array2::zeros((rows.len(), width));
        out.slice_mut(s![.., ..current.ncols()]).assign(&current);
        out.slice_mut(s![.., current.ncols()..current.ncols() + 1])
            .assign(&tier);
        if include_covariates {
            let covariates = self.covariates.select(Axis(0), rows);
            out.slice_mut(s![.., current.ncols() + 1..]).assign(&covariates);
        }
        out
    }

    /// One-hot next-state labels for the selected rows.
    pub fn labels(&self, rows: &[usize]) -> Array2<f64> {
        self.state_block(StateField::Next).select(Axis(0), rows)
    }
}

/// Encodes pairs into an [`EncodedDataset`] over the states the complete
/// rows actually use.
pub fn encode(
    pairs: &[TransitionPair],
    covariate_names: &[String],
) -> Result<EncodedDataset, EncodeError> {
    let (complete, dropped_rows) = complete_rows(pairs, covariate_names)?;
    let schema = OneHotSchema::from_states(
        complete
            .iter()
            .flat_map(|p| [p.current_state, p.next_state]),
    );
    encode_rows(&complete, dropped_rows, covariate_names, schema)
}

/// Encodes pairs against a fixed vocabulary. States in `schema` that no pair
/// uses keep an all-zero column; a pair state outside it is an error.
pub fn encode_with_schema(
    pairs: &[TransitionPair],
    covariate_names: &[String],
    schema: OneHotSchema,
) -> Result<EncodedDataset, EncodeError> {
    let (complete, dropped_rows) = complete_rows(pairs, covariate_names)?;
    encode_rows(&complete, dropped_rows, covariate_names, schema)
}

/// Checks covariate widths and keeps the rows with finite covariates.
fn complete_rows<'a>(
    pairs: &'a [TransitionPair],
    covariate_names: &[String],
) -> Result<(Vec<&'a TransitionPair>, usize), EncodeError> {
    for (row, pair) in pairs.iter().enumerate() {
        if pair.covariates.len() != covariate_names.len() {
            return Err(EncodeError::CovariateWidthMismatch {
                row,
                expected: covariate_names.len(),
                found: pair.covariates.len(),
            });
        }
    }

    let complete: Vec<&TransitionPair> = pairs
        .iter()
        .filter(|p| p.covariates.iter().all(|v| v.is_finite()))
        .collect();
    let dropped_rows = pairs.len() - complete.len();
    if dropped_rows > 0 {
        log::info!("Dropped {} pairs with missing covariates", dropped_rows);
    }
    if complete.is_empty() {
        return Err(EncodeError::EmptyInput);
    }
    Ok((complete, dropped_rows))
}

fn encode_rows(
    complete: &[&TransitionPair],
    dropped_rows: usize,
    covariate_names: &[String],
    schema: OneHotSchema,
) -> Result<EncodedDataset, EncodeError> {
    let n = complete.len();
    let classes = schema.num_classes();

    let mut one_hot = Array2::zeros((n, 2 * classes));
    for (row, pair) in complete.iter().enumerate() {
        for (field, state) in [
            (StateField::Current, pair.current_state),
            (StateField::Next, pair.next_state),
        ] {
            let col = schema
                .column(field, state)
                .ok_or_else(|| EncodeError::StateOutsideSchema {
                    row,
                    state,
                    states: schema.states().to_vec(),
                })?;
            one_hot[[row, col]] = 1.0;
        }
    }

    let raw = Array2::from_shape_fn((n, covariate_names.len()), |(i, j)| {
        complete[i].covariates[j]
    });
    let standardizer = Standardizer::fit(covariate_names, raw.view());
    let covariates = standardizer.transform(raw.view());

    log::info!(
        "Encoded {} pairs over states {:?} with {} covariates",
        n,
        schema.states(),
        covariate_names.len()
    );

    Ok(EncodedDataset {
        entity_ids: complete.iter().map(|p| p.entity_id.clone()).collect(),
        tiers: complete.iter().map(|p| p.tier).collect(),
        one_hot,
        covariates,
        schema,
        standardizer,
        dropped_rows,
    })
}
