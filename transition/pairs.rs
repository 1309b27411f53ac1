//! Temporal pairing of consecutive observations.
//!
//! Observations are ordered by `(entity_id, period)` and each one is paired with
//! the next row of the same entity, whatever the calendar gap between them. The
//! last observation of an entity has no successor and yields no pair.

use crate::types::{ReclassifiedObservation, TransitionPair};
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PairError {
    #[error(
        "Entity '{entity_id}' has more than one observation for period {period}; each (entity, period) must be unique."
    )]
    DuplicateObservation { entity_id: String, period: i64 },
}

/// Builds current/next state pairs. The result does not depend on the input
/// row order.
pub fn build_pairs(
    observations: &[ReclassifiedObservation],
) -> Result<Vec<TransitionPair>, PairError> {
    let ordered = observations
        .iter()
        .sorted_by(|a, b| {
            a.entity_id
                .cmp(&b.entity_id)
                .then_with(|| a.period.cmp(&b.period))
        })
        .chunk_by(|obs| obs.entity_id.clone());

    let mut pairs = Vec::with_capacity(observations.len());
    let mut entities = 0usize;
    for (_, run) in &ordered {
        entities += 1;
        let run: Vec<&ReclassifiedObservation> = run.collect();
        for window in run.windows(2) {
            let (current, next) = (window[0], window[1]);
            if current.period == next.period {
                return Err(PairError::DuplicateObservation {
                    entity_id: current.entity_id.clone(),
                    period: current.period,
                });
            }
            pairs.push(TransitionPair {
                entity_id: current.entity_id.clone(),
                period: current.period,
                current_state: current.state,
                next_state: next.state,
                tier: current.tier,
                covariates: current.covariates.clone(),
            });
        }
    }

    log::info!(
        "Built {} transition pairs from {} observations across {} entities",
        pairs.len(),
        observations.len(),
        entities
    );
    Ok(pairs)
}
