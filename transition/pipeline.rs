//! # Pipeline Orchestration
//!
//! Runs the stages in order: reclassify, pair, encode, split, then one
//! fit-predict-evaluate pass per configured partition. Every partition goes
//! through the same [`evaluate_partition`] function; the partitions differ only
//! in the rows they select.

use crate::classifier::{
    ClassifierError, FitStatus, FitSummary, MlpClassifier, ProbabilisticClassifier,
};
use crate::config::{ConfigError, PipelineConfig};
use crate::data::{DataError, load_observations};
use crate::encode::{
    EncodeError, EncodedDataset, OneHotSchema, StateField, encode_with_schema,
};
use crate::metrics::{CalibrationReport, MetricsError, ScoringSettings};
use crate::pairs::{PairError, build_pairs};
use crate::partition::{Partition, PartitionError, materialize, split_entities};
use crate::reclassify::{ReclassifyError, StatusSummary, reclassify};
use crate::transition_matrix::{
    TransitionError, TransitionMatrix, build_transition_matrix, decode_states,
};
use crate::types::Observation;
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;

/// Failure inside a single partition's fit-predict-evaluate pass.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data loading failed: {0}")]
    Data(#[from] DataError),
    #[error("Reclassification failed: {0}")]
    Reclassify(#[from] ReclassifyError),
    #[error("Pair building failed: {0}")]
    Pairs(#[from] PairError),
    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("Train/test split failed: {0}")]
    Split(#[from] PartitionError),
    #[error("Partition '{partition}' failed: {source}")]
    Partition {
        partition: String,
        #[source]
        source: StageError,
    },
}

/// Results of one partition.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub name: String,
    pub train_rows: usize,
    pub test_rows: usize,
    pub fit: FitSummary,
    /// Test rows × classes predicted next-state distributions.
    pub probabilities: Array2<f64>,
    /// One-hot true next states of the test rows.
    pub truth: Array2<f64>,
    pub transition: TransitionMatrix,
    pub calibration: CalibrationReport,
}

/// Run-wide bookkeeping plus every partition's outcome.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// The cut point `K`.
    pub retained_max: u32,
    pub collapsed: bool,
    pub status_summary: StatusSummary,
    /// Reclassified state space `0..=K` (or `0..=K+1` when collapsed); class
    /// `i` of every matrix is state `i`.
    pub states: Vec<u32>,
    pub observations: usize,
    pub reclassify_dropped_rows: usize,
    pub pairs: usize,
    pub encode_dropped_rows: usize,
    pub train_entities: usize,
    pub test_entities: usize,
    pub partitions: Vec<PartitionOutcome>,
}

/// Fits a fresh classifier on one partition's training rows and evaluates it on
/// its test rows.
pub fn evaluate_partition<C: ProbabilisticClassifier>(
    dataset: &EncodedDataset,
    partition: &Partition,
    mut classifier: C,
    include_covariates: bool,
    scoring: &ScoringSettings,
) -> Result<PartitionOutcome, StageError> {
    let name = &partition.spec.name;
    log::info!(
        "Fitting partition '{}' ({}) on {} rows",
        name,
        partition.spec.tier,
        partition.train_rows.len()
    );

    let x_train = dataset.features(&partition.train_rows, include_covariates);
    let y_train = dataset.labels(&partition.train_rows);
    let fit = classifier.fit(x_train.view(), y_train.view())?;
    match fit.status {
        FitStatus::Converged => log::info!(
            "Partition '{}' converged after {} epochs (loss {:.6})",
            name,
            fit.epochs,
            fit.final_loss
        ),
        FitStatus::MaxIterationsReached => log::warn!(
            "Partition '{}' stopped at the iteration limit ({} epochs, loss {:.6})",
            name,
            fit.epochs,
            fit.final_loss
        ),
    }

    let x_test = dataset.features(&partition.test_rows, include_covariates);
    let probabilities = classifier.predict_proba(x_test.view())?;
    let truth = dataset.labels(&partition.test_rows);

    let current_block = dataset
        .state_block(StateField::Current)
        .select(Axis(0), &partition.test_rows);
    let current_states = decode_states(current_block.view())?;
    let transition = build_transition_matrix(&current_states, probabilities.view())?;

    let calibration = CalibrationReport::evaluate(
        probabilities.view(),
        truth.view(),
        dataset.schema.states(),
        scoring,
    )?;

    Ok(PartitionOutcome {
        name: name.clone(),
        train_rows: partition.train_rows.len(),
        test_rows: partition.test_rows.len(),
        fit,
        probabilities,
        truth,
        transition,
        calibration,
    })
}

/// Runs every stage with classifiers built by `make_classifier`, one per
/// partition.
pub fn run_pipeline_with<F, C>(
    observations: &[Observation],
    covariate_names: &[String],
    config: &PipelineConfig,
    make_classifier: F,
) -> Result<PipelineOutcome, PipelineError>
where
    F: Fn() -> C + Sync,
    C: ProbabilisticClassifier + Send,
{
    config.validate()?;

    let reclassified = reclassify(observations, &config.reclassify)?;
    let pairs = build_pairs(&reclassified.observations)?;
    let schema = OneHotSchema::from_states(reclassified.state_space());
    let dataset = encode_with_schema(&pairs, covariate_names, schema)?;
    let split = split_entities(
        dataset.entity_ids.iter().map(String::as_str),
        &config.split,
    )?;
    let partitions = materialize(&dataset, &split, &config.partitions);

    let run_one = |partition: &Partition| {
        evaluate_partition(
            &dataset,
            partition,
            make_classifier(),
            config.include_covariates,
            &config.scoring,
        )
        .map_err(|source| PipelineError::Partition {
            partition: partition.spec.name.clone(),
            source,
        })
    };
    let outcomes = if config.parallel {
        partitions.par_iter().map(run_one).collect::<Result<Vec<_>, _>>()?
    } else {
        partitions.iter().map(run_one).collect::<Result<Vec<_>, _>>()?
    };

    Ok(PipelineOutcome {
        retained_max: reclassified.retained_max,
        collapsed: reclassified.collapsed,
        status_summary: reclassified.summary,
        states: dataset.schema.states().to_vec(),
        observations: observations.len(),
        reclassify_dropped_rows: reclassified.dropped_rows,
        pairs: pairs.len(),
        encode_dropped_rows: dataset.dropped_rows,
        train_entities: split.train.len(),
        test_entities: split.test.len(),
        partitions: outcomes,
    })
}

/// Runs every stage with the configured [`MlpClassifier`].
pub fn run_pipeline(
    observations: &[Observation],
    covariate_names: &[String],
    config: &PipelineConfig,
) -> Result<PipelineOutcome, PipelineError> {
    run_pipeline_with(observations, covariate_names, config, || {
        MlpClassifier::new(config.classifier.clone())
    })
}

/// Loads both tables, then runs the pipeline on them.
pub fn run_from_files(
    performance: &Path,
    origination: &Path,
    config: &PipelineConfig,
) -> Result<PipelineOutcome, PipelineError> {
    let loaded = load_observations(performance, origination, &config.input)?;
    run_pipeline(&loaded.observations, &loaded.covariate_names, config)
}
