//! Record types shared by every pipeline stage.
//!
//! Each stage consumes one of these as an immutable slice and produces the next
//! one as a fresh `Vec`. Nothing here is ever mutated after construction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entity-period record as it arrives from the joined input tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity_id: String,
    /// Orderable reporting period, e.g. `202003` for March 2020.
    pub period: i64,
    /// Raw ordinal status text. `None` when the cell was empty; may also hold
    /// the non-numeric "unknown" sentinel, which the reclassifier filters out.
    pub raw_status: Option<String>,
    /// Continuous risk covariate (e.g. credit score). NaN when missing.
    pub tier_covariate: f64,
    /// Extra continuous covariates, in the order of the configured column list.
    /// NaN marks a missing cell.
    pub covariates: Vec<f64>,
}

/// Binary risk tier derived from the continuous tier covariate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Covariate at or below the cutoff.
    Low,
    /// Covariate strictly above the cutoff.
    High,
}

impl Tier {
    pub fn index(self) -> u8 {
        match self {
            Tier::Low => 0,
            Tier::High => 1,
        }
    }

    /// The tier indicator as it enters the feature matrix.
    pub fn as_feature(self) -> f64 {
        f64::from(self.index())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// An observation after status collapsing and tier binarization.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclassifiedObservation {
    pub entity_id: String,
    pub period: i64,
    /// Delinquency state in `0..=K+1`.
    pub state: u32,
    pub tier: Tier,
    pub covariates: Vec<f64>,
}

/// A current/next state pair for one entity and two consecutive periods.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPair {
    pub entity_id: String,
    /// Period of the observation that supplied `current_state`.
    pub period: i64,
    pub current_state: u32,
    pub next_state: u32,
    pub tier: Tier,
    /// Covariates of the current-period observation.
    pub covariates: Vec<f64>,
}
