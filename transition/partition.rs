//! Entity-level train/test splitting and tier partitions.
//!
//! The split is drawn over distinct entity ids, never over rows, so every pair
//! of one entity lands on the same side. Tier partitions are pure row filters
//! applied after the split.

use crate::encode::EncodedDataset;
use crate::types::Tier;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Settings for the `[split]` section of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplitSettings {
    /// Fraction of entities assigned to the test side.
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            test_fraction: 0.3,
            seed: 42,
        }
    }
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Test fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidFraction(f64),
    #[error("At least two distinct entities are required for a train/test split, found {0}.")]
    TooFewEntities(usize),
}

/// Which tier rows a partition keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierFilter {
    All,
    Only(Tier),
}

impl TierFilter {
    pub fn accepts(self, tier: Tier) -> bool {
        match self {
            TierFilter::All => true,
            TierFilter::Only(wanted) => wanted == tier,
        }
    }
}

impl fmt::Display for TierFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierFilter::All => write!(f, "all tiers"),
            TierFilter::Only(tier) => write!(f, "tier {}", tier),
        }
    }
}

/// A named partition to fit and evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub name: String,
    pub tier: TierFilter,
}

impl PartitionSpec {
    pub fn new(name: impl Into<String>, tier: TierFilter) -> Self {
        Self {
            name: name.into(),
            tier,
        }
    }

    /// Pooled population followed by one partition per tier.
    pub fn standard() -> Vec<PartitionSpec> {
        vec![
            PartitionSpec::new("all", TierFilter::All),
            PartitionSpec::new("tier_0", TierFilter::Only(Tier::Low)),
            PartitionSpec::new("tier_1", TierFilter::Only(Tier::High)),
        ]
    }
}

/// Disjoint entity sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySplit {
    pub train: BTreeSet<String>,
    pub test: BTreeSet<String>,
}

/// Shuffles the sorted distinct ids with a seeded RNG and takes the first
/// `ceil(test_fraction * n)` as the test side.
pub fn split_entities<'a>(
    entity_ids: impl IntoIterator<Item = &'a str>,
    settings: &SplitSettings,
) -> Result<EntitySplit, PartitionError> {
    let fraction = settings.test_fraction;
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(PartitionError::InvalidFraction(fraction));
    }

    let distinct: BTreeSet<&str> = entity_ids.into_iter().collect();
    let n = distinct.len();
    if n < 2 {
        return Err(PartitionError::TooFewEntities(n));
    }

    let mut ids: Vec<&str> = distinct.into_iter().collect();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    ids.shuffle(&mut rng);

    // Keep both sides non-empty.
    let n_test = ((fraction * n as f64).ceil() as usize).clamp(1, n - 1);
    let test = ids[..n_test].iter().map(|s| s.to_string()).collect();
    let train = ids[n_test..].iter().map(|s| s.to_string()).collect();

    log::info!(
        "Split {} entities into {} train and {} test (seed {})",
        n,
        n - n_test,
        n_test,
        settings.seed
    );
    Ok(EntitySplit { train, test })
}

/// Row indices of one partition on both sides of the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub spec: PartitionSpec,
    pub train_rows: Vec<usize>,
    pub test_rows: Vec<usize>,
}

/// Materializes every spec as row-index lists into `dataset`.
pub fn materialize(
    dataset: &EncodedDataset,
    split: &EntitySplit,
    specs: &[PartitionSpec],
) -> Vec<Partition> {
    specs
        .iter()
        .map(|spec| {
            let mut train_rows = Vec::new();
            let mut test_rows = Vec::new();
            for (row, (entity, &tier)) in dataset
                .entity_ids
                .iter()
                .zip(dataset.tiers.iter())
                .enumerate()
            {
                if !spec.tier.accepts(tier) {
                    continue;
                }
                if split.test.contains(entity) {
                    test_rows.push(row);
                } else if split.train.contains(entity) {
                    train_rows.push(row);
                }
            }
            log::debug!(
                "Partition '{}' ({}): {} train rows, {} test rows",
                spec.name,
                spec.tier,
                train_rows.len(),
                test_rows.len()
            );
            Partition {
                spec: spec.clone(),
                train_rows,
                test_rows,
            }
        })
        .collect()
}
