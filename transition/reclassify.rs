//! # Status Reclassification
//!
//! Collapses the long tail of the ordinal delinquency code into a bounded state
//! space and binarizes the tier covariate.
//!
//! The cut point `K` is the largest observed code whose cumulative frequency
//! ratio is still at or below the configured threshold. Codes `0..=K` are kept
//! verbatim; every code above `K` becomes `K + 1`. The cut is chosen once over
//! the whole working dataset, before any train/test split.

use crate::types::{Observation, ReclassifiedObservation, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Settings for the `[reclassify]` section of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReclassifySettings {
    /// Cumulative-frequency coverage that the retained codes must not exceed.
    pub threshold: f64,
    /// Status text meaning "unknown / not applicable" (e.g. `RA` for REO
    /// acquisition). Rows carrying it never reach numeric parsing.
    pub sentinel: String,
    /// Tier covariate values at or below this cutoff map to `Tier::Low`.
    pub tier_cutoff: f64,
}

impl Default for ReclassifySettings {
    fn default() -> Self {
        Self {
            threshold: 0.995,
            sentinel: "RA".to_string(),
            tier_cutoff: 700.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReclassifyError {
    #[error("Cumulative-frequency threshold must lie in (0, 1], got {0}.")]
    InvalidThreshold(f64),
    #[error(
        "No observations with a usable status and tier covariate remain after filtering; nothing to reclassify."
    )]
    EmptyInput,
    #[error(
        "Status '{value}' for entity '{entity_id}' is not a non-negative integer. Sentinel statuses must be filtered before reclassification; check the configured sentinel."
    )]
    NonNumericStatus { entity_id: String, value: String },
}

/// One line of the frequency table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrequency {
    pub code: u32,
    pub frequency: usize,
    pub cumulative_ratio: f64,
}

/// Frequency table of raw status codes, ascending by code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub rows: Vec<StatusFrequency>,
}

impl StatusSummary {
    /// Builds the table from already-parsed codes.
    pub fn from_codes(codes: &[u32]) -> Self {
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for &code in codes {
            *counts.entry(code).or_insert(0) += 1;
        }

        let total = codes.len();
        let mut running = 0usize;
        let rows = counts
            .into_iter()
            .map(|(code, frequency)| {
                running += frequency;
                StatusFrequency {
                    code,
                    frequency,
                    cumulative_ratio: running as f64 / total as f64,
                }
            })
            .collect();

        Self { total, rows }
    }

    pub fn max_code(&self) -> Option<u32> {
        self.rows.last().map(|row| row.code)
    }

    /// Largest code whose cumulative ratio is `<= threshold`.
    ///
    /// When even the smallest code already exceeds the threshold, the smallest
    /// code is returned so that at least one state is retained verbatim.
    pub fn retained_max(&self, threshold: f64) -> Option<u32> {
        self.rows
            .iter()
            .filter(|row| row.cumulative_ratio <= threshold)
            .map(|row| row.code)
            .max()
            .or_else(|| self.rows.first().map(|row| row.code))
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Delinquency Status | Frequency | Cumulative Ratio")?;
        writeln!(f, "{}", "-".repeat(50))?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<18} | {:<9} | {:.4}",
                row.code, row.frequency, row.cumulative_ratio
            )?;
        }
        Ok(())
    }
}

/// Output of [`reclassify`].
#[derive(Debug, Clone)]
pub struct Reclassification {
    pub observations: Vec<ReclassifiedObservation>,
    /// The cut point `K`.
    pub retained_max: u32,
    /// True when at least one code was folded into `K + 1`.
    pub collapsed: bool,
    pub summary: StatusSummary,
    /// Rows removed for a missing status, the sentinel, or a missing tier covariate.
    pub dropped_rows: usize,
}

impl Reclassification {
    /// Every state value that can occur after reclassification.
    pub fn state_space(&self) -> Vec<u32> {
        let top = if self.collapsed {
            self.retained_max + 1
        } else {
            self.retained_max
        };
        (0..=top).collect()
    }
}

/// Folds a code above `retained_max` into the overflow bucket.
pub fn collapse_code(code: u32, retained_max: u32) -> u32 {
    if code <= retained_max {
        code
    } else {
        retained_max + 1
    }
}

pub fn binarize_tier(value: f64, cutoff: f64) -> Tier {
    if value <= cutoff { Tier::Low } else { Tier::High }
}

/// Runs the full reclassification over the joined observations.
pub fn reclassify(
    observations: &[Observation],
    settings: &ReclassifySettings,
) -> Result<Reclassification, ReclassifyError> {
    if !(settings.threshold > 0.0 && settings.threshold <= 1.0) {
        return Err(ReclassifyError::InvalidThreshold(settings.threshold));
    }

    // Filter first: the sentinel is non-numeric and must never reach parsing.
    let usable: Vec<(&Observation, &str)> = observations
        .iter()
        .filter(|obs| obs.tier_covariate.is_finite())
        .filter_map(|obs| {
            let status = obs.raw_status.as_deref()?.trim();
            if status.is_empty() || status == settings.sentinel {
                None
            } else {
                Some((obs, status))
            }
        })
        .collect();
    let dropped_rows = observations.len() - usable.len();

    if usable.is_empty() {
        return Err(ReclassifyError::EmptyInput);
    }

    let codes = usable
        .iter()
        .map(|(obs, status)| {
            status
                .parse::<u32>()
                .map_err(|_| ReclassifyError::NonNumericStatus {
                    entity_id: obs.entity_id.clone(),
                    value: status.to_string(),
                })
        })
        .collect::<Result<Vec<u32>, _>>()?;

    let summary = StatusSummary::from_codes(&codes);
    let retained_max = summary
        .retained_max(settings.threshold)
        .ok_or(ReclassifyError::EmptyInput)?;
    let collapsed = summary.max_code().is_some_and(|max| max > retained_max);

    log::info!(
        "Reclassified {} observations (dropped {}): retaining codes 0..={}{}",
        usable.len(),
        dropped_rows,
        retained_max,
        if collapsed {
            format!(", codes above collapse into {}", retained_max + 1)
        } else {
            String::from(", no collapsing needed")
        }
    );

    let reclassified = usable
        .iter()
        .zip(codes.iter())
        .map(|((obs, _), &code)| ReclassifiedObservation {
            entity_id: obs.entity_id.clone(),
            period: obs.period,
            state: collapse_code(code, retained_max),
            tier: binarize_tier(obs.tier_covariate, settings.tier_cutoff),
            covariates: obs.covariates.clone(),
        })
        .collect();

    Ok(Reclassification {
        observations: reclassified,
        retained_max,
        collapsed,
        summary,
        dropped_rows,
    })
}
