//! Aggregation of per-row predicted distributions into a from × to matrix.
//!
//! Row `i` of the matrix is the normalized sum of the predicted next-state
//! distributions of every test row whose current state is class `i`. A class
//! with no test rows keeps an all-zero row: its sum is replaced by one before
//! dividing, so the row is left untouched.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("Got {states} current states but {rows} predicted distributions.")]
    LengthMismatch { states: usize, rows: usize },
    #[error("Current state class {class} is outside the {classes}-class state space.")]
    StateOutOfRange { class: usize, classes: usize },
    #[error("Row {row} of the current-state block is not one-hot.")]
    NotOneHot { row: usize },
}

/// Normalized transition matrix plus how much evidence backs each row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionMatrix {
    pub matrix: Array2<f64>,
    /// Number of test rows aggregated into each from-state row.
    pub row_support: Vec<usize>,
    /// From-state classes with no test rows; their matrix rows are all zero.
    pub unseen_states: Vec<usize>,
}

impl TransitionMatrix {
    pub fn num_classes(&self) -> usize {
        self.matrix.nrows()
    }

    /// Matrix as nested rows, for serialization into the run report.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.matrix.rows().into_iter().map(|r| r.to_vec()).collect()
    }

    /// Renders the matrix with from-states down the side and to-states across
    /// the top. Class `i` is labelled `states[i]`; unseen rows are marked.
    pub fn table(&self, states: &[u32]) -> String {
        let label = |class: usize| {
            states
                .get(class)
                .map_or_else(|| format!("#{class}"), u32::to_string)
        };
        let mut out = String::new();
        out.push_str(&format!("{:>10}", "from \\ to"));
        for class in 0..self.matrix.ncols() {
            out.push_str(&format!(" {:>8}", label(class)));
        }
        out.push('\n');
        for (class, row) in self.matrix.rows().into_iter().enumerate() {
            out.push_str(&format!("{:>10}", label(class)));
            for value in row {
                out.push_str(&format!(" {value:>8.4}"));
            }
            if self.unseen_states.contains(&class) {
                out.push_str("  (no test rows)");
            }
            out.push('\n');
        }
        out
    }
}

/// Index of the single `1.0` in a one-hot row.
fn hot_index(row: ArrayView1<f64>) -> Option<usize> {
    let mut hot = row.iter().enumerate().filter(|&(_, &v)| v == 1.0);
    let first = hot.next().map(|(i, _)| i)?;
    let rest_zero = row
        .iter()
        .enumerate()
        .all(|(i, &v)| i == first || v == 0.0);
    rest_zero.then_some(first)
}

/// Decodes a one-hot current-state block back to class indices.
///
/// The arg-max is only well defined when every row holds exactly one hot entry,
/// so anything else is rejected.
pub fn decode_states(block: ArrayView2<f64>) -> Result<Vec<usize>, TransitionError> {
    block
        .rows()
        .into_iter()
        .enumerate()
        .map(|(row, values)| hot_index(values).ok_or(TransitionError::NotOneHot { row }))
        .collect()
}

/// Builds the matrix from decoded current states and predicted distributions.
/// The side length always equals the number of predicted classes.
pub fn build_transition_matrix(
    current_states: &[usize],
    probabilities: ArrayView2<f64>,
) -> Result<TransitionMatrix, TransitionError> {
    if current_states.len() != probabilities.nrows() {
        return Err(TransitionError::LengthMismatch {
            states: current_states.len(),
            rows: probabilities.nrows(),
        });
    }

    let classes = probabilities.ncols();
    let mut matrix = Array2::<f64>::zeros((classes, classes));
    let mut row_support = vec![0usize; classes];
    for (&from, distribution) in current_states.iter().zip(probabilities.rows()) {
        if from >= classes {
            return Err(TransitionError::StateOutOfRange {
                class: from,
                classes,
            });
        }
        let mut target = matrix.row_mut(from);
        target += &distribution;
        row_support[from] += 1;
    }

    for mut row in matrix.rows_mut() {
        let total = row.sum();
        let divisor = if total == 0.0 { 1.0 } else { total };
        row.mapv_inplace(|v| v / divisor);
    }

    let unseen_states: Vec<usize> = row_support
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count == 0)
        .map(|(class, _)| class)
        .collect();
    if !unseen_states.is_empty() {
        log::warn!(
            "States {:?} never occur as a current state in this test partition; their transition rows are all zero",
            unseen_states
        );
    }

    Ok(TransitionMatrix {
        matrix,
        row_support,
        unseen_states,
    })
}
