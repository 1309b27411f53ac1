//! # Pipeline Configuration
//!
//! One `PipelineConfig` carries every tunable of a run. Each section has
//! defaults, so an empty TOML file is a valid configuration, and command-line
//! flags override individual fields after loading.
//!
//! ```toml
//! include_covariates = false
//! parallel = true
//!
//! [reclassify]
//! threshold = 0.995
//!
//! [classifier]
//! hidden_layer_sizes = [10, 10, 10]
//! max_iter = 5000
//! ```

use crate::classifier::{ClassifierError, MlpConfig};
use crate::data::InputSettings;
use crate::metrics::ScoringSettings;
use crate::partition::{PartitionSpec, SplitSettings};
use crate::reclassify::ReclassifySettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid classifier settings: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Append the standardized covariates to the classifier features.
    pub include_covariates: bool,
    /// Fit the partitions concurrently.
    pub parallel: bool,
    pub input: InputSettings,
    pub reclassify: ReclassifySettings,
    pub split: SplitSettings,
    pub classifier: MlpConfig,
    pub scoring: ScoringSettings,
    pub partitions: Vec<PartitionSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            include_covariates: false,
            parallel: false,
            input: InputSettings::default(),
            reclassify: ReclassifySettings::default(),
            split: SplitSettings::default(),
            classifier: MlpConfig::default(),
            scoring: ScoringSettings::default(),
            partitions: PartitionSpec::standard(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.reclassify.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "reclassify.threshold must lie in (0, 1], got {threshold}"
            )));
        }
        let fraction = self.split.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "split.test_fraction must lie strictly between 0 and 1, got {fraction}"
            )));
        }
        let power = self.scoring.distance_power;
        if !(power.is_finite() && power >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "scoring.distance_power must be a non-negative number, got {power}"
            )));
        }
        if !self.input.delimiter.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "input.delimiter must be an ASCII character, got {:?}",
                self.input.delimiter
            )));
        }
        if self.partitions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one partition must be configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.partitions {
            if spec.name.is_empty() || !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "partition names must be non-empty and unique, got '{}'",
                    spec.name
                )));
            }
        }
        self.classifier.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LearningRateSchedule;
    use crate::partition::TierFilter;
    use crate::types::Tier;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        fs::write(&path, "").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.partitions.len(), 3);
        assert_eq!(config.classifier.hidden_layer_sizes, vec![10, 10, 10]);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
parallel = true

[reclassify]
threshold = 0.9

[classifier]
max_iter = 50
schedule = "constant"

[input.columns]
entity_id = "id"
covariates = ["upb"]

[[partitions]]
name = "low_only"
tier = { Only = "Low" }
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.parallel);
        assert_eq!(config.reclassify.threshold, 0.9);
        assert_eq!(config.reclassify.sentinel, "RA");
        assert_eq!(config.classifier.max_iter, 50);
        assert_eq!(config.classifier.schedule, LearningRateSchedule::Constant);
        assert_eq!(config.input.columns.entity_id, "id");
        assert_eq!(config.input.columns.period, "Monthly Reporting Period");
        assert_eq!(
            config.partitions,
            vec![PartitionSpec::new("low_only", TierFilter::Only(Tier::Low))]
        );
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = PipelineConfig::default();
        config.split.seed = 9;
        config.input.row_limit = Some(1000);
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = PipelineConfig::default();
        config.reclassify.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.partitions.push(PartitionSpec::new("all", TierFilter::All));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.classifier.hidden_layer_sizes = vec![0];
        assert!(matches!(config.validate(), Err(ConfigError::Classifier(_))));
    }
}
