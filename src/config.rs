//! Pipeline configuration loaded from `config.toml`.
//!
//! Every field has a default, so a partial file (or no file) is valid.

use crate::error::{PipelineError, Result};
use crate::features::{CategoricalFeature, FeatureSpec, NumericFeature, UnknownCategoryPolicy};
use crate::model::Target;
use crate::preprocess::{AgeBins, MissingValuePolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub window: WindowConfig,
    pub age_bins: AgeBins,
    pub missing: MissingValuePolicy,
    pub features: FeatureConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub records_path: PathBuf,
    pub model_dir: PathBuf,
    pub consolidate_stints: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            records_path: PathBuf::from("data/player_stats.csv"),
            model_dir: PathBuf::from("saved_models"),
            consolidate_stints: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Number of most recent prior seasons averaged per player.
    pub size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig { size: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub numeric: Vec<NumericFeature>,
    pub categorical: Vec<CategoricalFeature>,
    pub drop_first: bool,
    pub unknown_category: UnknownCategoryPolicy,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        let spec = FeatureSpec::default();
        FeatureConfig {
            numeric: spec.numeric,
            categorical: spec.categorical,
            drop_first: spec.drop_first,
            unknown_category: UnknownCategoryPolicy::Abort,
        }
    }
}

impl FeatureConfig {
    pub fn spec(&self) -> FeatureSpec {
        FeatureSpec {
            numeric: self.numeric.clone(),
            categorical: self.categorical.clone(),
            drop_first: self.drop_first,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub targets: Vec<Target>,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            targets: Target::ALL.to_vec(),
            test_fraction: 0.4,
            seed: 42,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.size == 0 {
            return Err(PipelineError::Config("window size must be at least 1".into()));
        }
        self.age_bins.validate().map_err(PipelineError::Config)?;
        if self.features.numeric.is_empty() && self.features.categorical.is_empty() {
            return Err(PipelineError::Config("feature list is empty".into()));
        }
        if self.training.targets.is_empty() {
            return Err(PipelineError::Config("at least one target is required".into()));
        }
        if !(0.0..1.0).contains(&self.training.test_fraction) {
            return Err(PipelineError::Config(format!(
                "test_fraction must be in [0, 1), got {}",
                self.training.test_fraction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{CategoryFill, NumericFill, Stat};

    #[test]
    fn test_defaults_match_box_score_pipeline() {
        let config = Config::default();
        assert_eq!(config.window.size, 3);
        assert_eq!(config.age_bins.edges, vec![0, 20, 25, 31, 35, 40]);
        assert_eq!(config.training.targets.len(), 5);
        assert_eq!(config.features.numeric[2], NumericFeature::Window(Stat::Points));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let text = r#"
            [window]
            size = 2

            [missing]
            position = { fixed = "SF" }
            age = "zero"
            stats = "median"

            [features]
            numeric = ["Age", "pl_avg_TOV"]
            categorical = ["Pos"]
            unknown_category = "report"

            [training]
            targets = ["PTS", "BLK"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.window.size, 2);
        assert_eq!(config.missing.position, CategoryFill::Fixed("SF".into()));
        assert_eq!(config.missing.age, NumericFill::Zero);
        assert_eq!(config.missing.stats, NumericFill::Median);
        assert_eq!(
            config.features.numeric,
            vec![NumericFeature::Age, NumericFeature::Window(Stat::Turnovers)]
        );
        assert_eq!(config.features.unknown_category, UnknownCategoryPolicy::Report);
        assert_eq!(config.training.targets, vec![Target::Pts, Target::Blk]);
        // untouched sections keep their defaults
        assert_eq!(config.training.seed, 42);
        assert!(config.features.drop_first);
    }

    #[test]
    fn test_unknown_feature_name_is_rejected() {
        let text = "[features]\nnumeric = [\"pl_avg_XYZ\"]\n";
        assert!(toml::from_str::<Config>(text).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.window.size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.age_bins.edges = vec![0, 20, 20, 31, 35, 40];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.test_fraction = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join("season_forecast_config.toml");
        let path = path.to_string_lossy().to_string();
        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.features.numeric, Config::default().features.numeric);
        assert_eq!(loaded.data.model_dir, PathBuf::from("saved_models"));
    }
}
