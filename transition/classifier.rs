//! # Transition Classifier
//!
//! The pipeline only depends on [`ProbabilisticClassifier`]: fit on a feature
//! matrix and a one-hot label matrix, then return one probability distribution
//! per input row.
//!
//! [`MlpClassifier`] is the shipped implementation: a feed-forward network with
//! ReLU hidden layers and a softmax output, trained by mini-batch SGD with
//! momentum on the L2-penalized cross-entropy. Under the `Adaptive` schedule the
//! learning rate is divided by five whenever the epoch loss plateaus, and
//! training ends once the rate drops below `1e-6`. Every run is bounded by
//! `max_iter` epochs. All randomness (weight initialisation, batch shuffling)
//! flows from one seeded `StdRng`, so identical inputs give identical fits.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest learning rate the adaptive schedule will decay to.
const MIN_ADAPTIVE_LEARNING_RATE: f64 = 1e-6;
/// Probability floor inside the log-loss.
const PROBABILITY_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Insufficient data: cannot {operation} on {rows} rows.")]
    InsufficientData { operation: &'static str, rows: usize },
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("The classifier must be fitted before it can predict.")]
    NotFitted,
    #[error("Invalid classifier configuration: {0}")]
    InvalidConfig(String),
    #[error("Training diverged: the loss became non-finite at epoch {epoch}.")]
    Diverged { epoch: usize },
}

/// Fit/predict-probability contract of the transition classifier.
pub trait ProbabilisticClassifier {
    /// Trains on `x` (rows × features) against one-hot `y` (rows × classes).
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>)
    -> Result<FitSummary, ClassifierError>;

    /// Returns a rows × classes matrix whose rows each sum to one.
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError>;
}

/// How training ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// The loss plateaued (and, for `Adaptive`, the rate decayed to its floor).
    Converged,
    /// `max_iter` epochs ran without meeting the stopping rule.
    MaxIterationsReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: FitStatus,
    pub epochs: usize,
    pub final_loss: f64,
    pub final_learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    /// Fixed rate; a loss plateau ends training.
    Constant,
    /// Divide the rate by 5 on every plateau; stop once it falls below 1e-6.
    Adaptive,
}

/// Hyperparameters, shared by every partition's model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub hidden_layer_sizes: Vec<usize>,
    pub learning_rate_init: f64,
    pub schedule: LearningRateSchedule,
    pub momentum: f64,
    /// L2 penalty strength.
    pub alpha: f64,
    pub batch_size: usize,
    pub max_iter: usize,
    /// Minimum loss improvement that resets the plateau counter.
    pub tol: f64,
    /// Epochs without improvement tolerated before a plateau is declared.
    pub n_iter_no_change: usize,
    pub seed: u64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_layer_sizes: vec![10, 10, 10],
            learning_rate_init: 1e-4,
            schedule: LearningRateSchedule::Adaptive,
            momentum: 0.9,
            alpha: 1e-4,
            batch_size: 200,
            max_iter: 5000,
            tol: 1e-4,
            n_iter_no_change: 10,
            seed: 1,
        }
    }
}

impl MlpConfig {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.hidden_layer_sizes.iter().any(|&width| width == 0) {
            return Err(ClassifierError::InvalidConfig(
                "hidden layer sizes must be positive".to_string(),
            ));
        }
        if !(self.learning_rate_init > 0.0 && self.learning_rate_init.is_finite()) {
            return Err(ClassifierError::InvalidConfig(format!(
                "learning_rate_init must be positive, got {}",
                self.learning_rate_init
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ClassifierError::InvalidConfig(format!(
                "momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.alpha < 0.0 {
            return Err(ClassifierError::InvalidConfig(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        if self.batch_size == 0 || self.max_iter == 0 {
            return Err(ClassifierError::InvalidConfig(
                "batch_size and max_iter must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One dense layer. `weights` is fan_in × fan_out.
#[derive(Debug, Clone)]
struct Layer {
    weights: Array2<f64>,
    biases: Array1<f64>,
}

/// Multilayer perceptron classifier.
#[derive(Debug, Clone)]
pub struct MlpClassifier {
    config: MlpConfig,
    layers: Vec<Layer>,
}

impl MlpClassifier {
    pub fn new(config: MlpConfig) -> Self {
        Self {
            config,
            layers: Vec::new(),
        }
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Glorot-uniform initialisation for every layer in `sizes`.
    fn initialise(sizes: &[usize], rng: &mut StdRng) -> Vec<Layer> {
        sizes
            .windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                Layer {
                    weights: Array2::from_shape_simple_fn((fan_in, fan_out), || {
                        dist.sample(&mut *rng)
                    }),
                    biases: Array1::from_shape_simple_fn(fan_out, || dist.sample(&mut *rng)),
                }
            })
            .collect()
    }

    /// Forward pass returning the activation of every layer, input first.
    fn forward(layers: &[Layer], x: ArrayView2<f64>) -> Vec<Array2<f64>> {
        let mut activations = Vec::with_capacity(layers.len() + 1);
        activations.push(x.to_owned());
        for (i, layer) in layers.iter().enumerate() {
            let mut z = activations[i].dot(&layer.weights) + &layer.biases;
            if i + 1 == layers.len() {
                softmax_inplace(&mut z);
            } else {
                z.mapv_inplace(|v| v.max(0.0));
            }
            activations.push(z);
        }
        activations
    }

    /// Penalized cross-entropy and parameter gradients for one batch.
    fn loss_and_gradients(
        layers: &[Layer],
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        alpha: f64,
    ) -> (f64, Vec<(Array2<f64>, Array1<f64>)>) {
        let n = x.nrows() as f64;
        let activations = Self::forward(layers, x);
        let output = &activations[layers.len()];

        let log_loss = -y
            .iter()
            .zip(output.iter())
            .map(|(&t, &p)| t * p.max(PROBABILITY_FLOOR).ln())
            .sum::<f64>()
            / n;
        let penalty = layers.iter().map(|l| l.weights.mapv(|w| w * w).sum()).sum::<f64>();
        let loss = log_loss + 0.5 * alpha * penalty / n;

        let mut gradients = Vec::with_capacity(layers.len());
        // Softmax + cross-entropy: dL/dz = (p - y) / n.
        let mut delta = (output - &y) / n;
        for i in (0..layers.len()).rev() {
            let grad_w = activations[i].t().dot(&delta) + &(&layers[i].weights * (alpha / n));
            let grad_b = delta.sum_axis(Axis(0));
            gradients.push((grad_w, grad_b));
            if i > 0 {
                let mut upstream = delta.dot(&layers[i].weights.t());
                upstream.zip_mut_with(&activations[i], |d, &a| {
                    if a <= 0.0 {
                        *d = 0.0;
                    }
                });
                delta = upstream;
            }
        }
        gradients.reverse();
        (loss, gradients)
    }
}

impl ProbabilisticClassifier for MlpClassifier {
    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
    ) -> Result<FitSummary, ClassifierError> {
        self.config.validate()?;
        let n = x.nrows();
        if n == 0 {
            return Err(ClassifierError::InsufficientData {
                operation: "fit",
                rows: 0,
            });
        }
        if y.nrows() != n {
            return Err(ClassifierError::ShapeMismatch(format!(
                "features have {} rows but labels have {}",
                n,
                y.nrows()
            )));
        }
        if y.ncols() == 0 || x.ncols() == 0 {
            return Err(ClassifierError::ShapeMismatch(format!(
                "features ({}) and classes ({}) must both be non-empty",
                x.ncols(),
                y.ncols()
            )));
        }

        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut sizes = Vec::with_capacity(config.hidden_layer_sizes.len() + 2);
        sizes.push(x.ncols());
        sizes.extend_from_slice(&config.hidden_layer_sizes);
        sizes.push(y.ncols());
        let mut layers = Self::initialise(&sizes, &mut rng);
        let mut velocities: Vec<(Array2<f64>, Array1<f64>)> = layers
            .iter()
            .map(|l| (Array2::zeros(l.weights.raw_dim()), Array1::zeros(l.biases.len())))
            .collect();

        let batch_size = config.batch_size.min(n);
        let mut indices: Vec<usize> = (0..n).collect();
        let mut learning_rate = config.learning_rate_init;
        let mut best_loss = f64::INFINITY;
        let mut no_improvement = 0usize;
        let mut epoch_loss = f64::NAN;
        let mut status = FitStatus::MaxIterationsReached;
        let mut epochs = 0usize;

        log::debug!(
            "Fitting MLP {:?} on {} rows, lr {:.2e}, max_iter {}",
            sizes,
            n,
            learning_rate,
            config.max_iter
        );

        for epoch in 1..=config.max_iter {
            epochs = epoch;
            indices.shuffle(&mut rng);
            let mut accumulated = 0.0;
            for batch in indices.chunks(batch_size) {
                let xb = x.select(Axis(0), batch);
                let yb = y.select(Axis(0), batch);
                let (loss, gradients) =
                    Self::loss_and_gradients(&layers, xb.view(), yb.view(), config.alpha);
                accumulated += loss * batch.len() as f64;

                for ((layer, velocity), (grad_w, grad_b)) in
                    layers.iter_mut().zip(velocities.iter_mut()).zip(gradients)
                {
                    velocity.0 = &velocity.0 * config.momentum - &(grad_w * learning_rate);
                    velocity.1 = &velocity.1 * config.momentum - &(grad_b * learning_rate);
                    layer.weights += &velocity.0;
                    layer.biases += &velocity.1;
                }
            }
            epoch_loss = accumulated / n as f64;
            if !epoch_loss.is_finite() {
                return Err(ClassifierError::Diverged { epoch });
            }

            if epoch_loss > best_loss - config.tol {
                no_improvement += 1;
            } else {
                no_improvement = 0;
            }
            best_loss = best_loss.min(epoch_loss);

            if no_improvement > config.n_iter_no_change {
                let can_decay = learning_rate / 5.0 >= MIN_ADAPTIVE_LEARNING_RATE;
                match config.schedule {
                    LearningRateSchedule::Adaptive if can_decay => {
                        learning_rate /= 5.0;
                        no_improvement = 0;
                        log::debug!(
                            "Epoch {epoch}: loss plateau, learning rate now {learning_rate:.2e}"
                        );
                    }
                    _ => {
                        status = FitStatus::Converged;
                        break;
                    }
                }
            }
        }

        match status {
            FitStatus::Converged => log::info!(
                "MLP converged after {} epochs, loss {:.6}",
                epochs,
                epoch_loss
            ),
            FitStatus::MaxIterationsReached => log::warn!(
                "MLP stopped at max_iter = {} without converging, loss {:.6}",
                config.max_iter,
                epoch_loss
            ),
        }

        self.layers = layers;
        Ok(FitSummary {
            status,
            epochs,
            final_loss: epoch_loss,
            final_learning_rate: learning_rate,
        })
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
        let first = self.layers.first().ok_or(ClassifierError::NotFitted)?;
        if x.nrows() == 0 {
            return Err(ClassifierError::InsufficientData {
                operation: "predict",
                rows: 0,
            });
        }
        if x.ncols() != first.weights.nrows() {
            return Err(ClassifierError::ShapeMismatch(format!(
                "model was fitted on {} features, got {}",
                first.weights.nrows(),
                x.ncols()
            )));
        }
        let mut activations = Self::forward(&self.layers, x);
        activations.pop().ok_or(ClassifierError::NotFitted)
    }
}

/// Row-wise softmax with max subtraction.
fn softmax_inplace(z: &mut Array2<f64>) {
    for mut row in z.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quick_config() -> MlpConfig {
        MlpConfig {
            hidden_layer_sizes: vec![8, 8],
            learning_rate_init: 0.05,
            batch_size: 32,
            max_iter: 400,
            ..MlpConfig::default()
        }
    }

    /// Deterministic chain: state i always moves to (i + 1) mod 3.
    fn cyclic_dataset(repeats: usize) -> (Array2<f64>, Array2<f64>) {
        let mut x = Array2::zeros((3 * repeats, 4));
        let mut y = Array2::zeros((3 * repeats, 3));
        for r in 0..repeats {
            for state in 0..3 {
                let row = 3 * r + state;
                x[[row, state]] = 1.0;
                x[[row, 3]] = (r % 2) as f64;
                y[[row, (state + 1) % 3]] = 1.0;
            }
        }
        (x, y)
    }

    #[test]
    fn probabilities_are_row_stochastic() {
        let (x, y) = cyclic_dataset(20);
        let mut model = MlpClassifier::new(quick_config());
        model.fit(x.view(), y.view()).unwrap();
        let proba = model.predict_proba(x.view()).unwrap();
        assert_eq!(proba.dim(), (60, 3));
        for row in proba.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn learns_a_deterministic_transition() {
        let (x, y) = cyclic_dataset(40);
        let mut model = MlpClassifier::new(quick_config());
        model.fit(x.view(), y.view()).unwrap();
        let probe = array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 1.0]];
        let proba = model.predict_proba(probe.view()).unwrap();
        assert!(proba[[0, 1]] > 0.8, "0 -> 1 got {}", proba[[0, 1]]);
        assert!(proba[[1, 0]] > 0.8, "2 -> 0 got {}", proba[[1, 0]]);
    }

    #[test]
    fn identical_seeds_give_identical_fits() {
        let (x, y) = cyclic_dataset(10);
        let mut a = MlpClassifier::new(quick_config());
        let mut b = MlpClassifier::new(quick_config());
        let sa = a.fit(x.view(), y.view()).unwrap();
        let sb = b.fit(x.view(), y.view()).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(a.predict_proba(x.view()).unwrap(), b.predict_proba(x.view()).unwrap());
    }

    #[test]
    fn max_iter_is_honoured_and_reported() {
        let (x, y) = cyclic_dataset(5);
        let config = MlpConfig {
            max_iter: 3,
            ..quick_config()
        };
        let mut model = MlpClassifier::new(config);
        let summary = model.fit(x.view(), y.view()).unwrap();
        assert_eq!(summary.status, FitStatus::MaxIterationsReached);
        assert_eq!(summary.epochs, 3);
        assert!(model.is_fitted());
    }

    #[test]
    fn constant_schedule_stops_on_plateau() {
        let (x, y) = cyclic_dataset(10);
        let config = MlpConfig {
            schedule: LearningRateSchedule::Constant,
            tol: 10.0,
            n_iter_no_change: 2,
            ..quick_config()
        };
        let mut model = MlpClassifier::new(config);
        let summary = model.fit(x.view(), y.view()).unwrap();
        // The first epoch only sets the baseline; three more exceed the patience of 2.
        assert_eq!(summary.status, FitStatus::Converged);
        assert_eq!(summary.epochs, 4);
        assert_eq!(summary.final_learning_rate, 0.05);
    }

    #[test]
    fn adaptive_schedule_decays_before_stopping() {
        let (x, y) = cyclic_dataset(10);
        let config = MlpConfig {
            tol: 10.0,
            n_iter_no_change: 0,
            ..quick_config()
        };
        let mut model = MlpClassifier::new(config);
        let summary = model.fit(x.view(), y.view()).unwrap();
        assert_eq!(summary.status, FitStatus::Converged);
        assert!(summary.final_learning_rate < 0.05);
        assert!(summary.final_learning_rate / 5.0 < MIN_ADAPTIVE_LEARNING_RATE);
    }

    #[test]
    fn empty_and_mismatched_inputs_are_errors() {
        let mut model = MlpClassifier::new(quick_config());
        let x = Array2::<f64>::zeros((0, 4));
        let y = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            model.fit(x.view(), y.view()),
            Err(ClassifierError::InsufficientData { operation: "fit", .. })
        ));
        assert!(matches!(
            model.predict_proba(x.view()),
            Err(ClassifierError::NotFitted)
        ));

        let (x, y) = cyclic_dataset(2);
        assert!(matches!(
            model.fit(x.view(), y.slice(ndarray::s![..3, ..])),
            Err(ClassifierError::ShapeMismatch(_))
        ));
        model.fit(x.view(), y.view()).unwrap();
        assert!(matches!(
            model.predict_proba(Array2::zeros((2, 7)).view()),
            Err(ClassifierError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = MlpConfig {
            hidden_layer_sizes: vec![4, 0],
            ..MlpConfig::default()
        };
        let (x, y) = cyclic_dataset(2);
        let mut model = MlpClassifier::new(config);
        assert!(matches!(
            model.fit(x.view(), y.view()),
            Err(ClassifierError::InvalidConfig(_))
        ));
    }
}
