/// Per-target regression models and their evaluation.
use crate::error::{PipelineError, Result};
use crate::features::{FeatureMatrix, FeatureSchema};
use crate::preprocess::Stat;
use chrono::{DateTime, Utc};
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// The per-game statistics a forecast is produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "PTS")] Pts,
    #[serde(rename = "AST")] Ast,
    #[serde(rename = "TRB")] Trb,
    #[serde(rename = "STL")] Stl,
    #[serde(rename = "BLK")] Blk,
}

impl Target {
    pub const ALL: [Target; 5] = [Target::Pts, Target::Ast, Target::Trb, Target::Stl, Target::Blk];

    pub fn stat(self) -> Stat {
        match self {
            Target::Pts => Stat::Points,
            Target::Ast => Stat::Assists,
            Target::Trb => Stat::Rebounds,
            Target::Stl => Stat::Steals,
            Target::Blk => Stat::Blocks,
        }
    }

    pub fn code(self) -> &'static str {
        self.stat().code()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Target {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Target::ALL
            .into_iter()
            .find(|t| t.code() == s)
            .ok_or_else(|| format!("Unknown target: {}", s))
    }
}

/// A trained regressor for one target, queried with schema-encoded rows.
pub trait Estimator {
    /// Columns the estimator was trained against, in order.
    fn columns(&self) -> &[String];
    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>>;
}

pub fn model_path(dir: &Path, target: Target) -> PathBuf {
    dir.join(format!("best_model_{}.json", target.code()))
}

/// Ordinary least squares model persisted as plain coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub target: Target,
    pub columns: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub trained_at: DateTime<Utc>,
    pub train_rows: usize,
}

impl LinearModel {
    pub fn fit(target: Target, columns: &[String], x: &Array2<f64>, y: &Array1<f64>) -> Result<Self> {
        let ds = Dataset::new(x.clone(), y.clone());
        let fitted = LinearRegression::new().fit(&ds)?;
        Ok(LinearModel {
            target,
            columns: columns.to_vec(),
            intercept: fitted.intercept(),
            coefficients: fitted.params().to_vec(),
            trained_at: Utc::now(),
            train_rows: x.nrows(),
        })
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = model_path(dir, self.target);
        crate::io::write_json(&path, self)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// (column, coefficient) pairs sorted by absolute size, largest first.
    pub fn importances(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .columns
            .iter()
            .cloned()
            .zip(self.coefficients.iter().copied())
            .collect();
        out.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        out
    }
}

impl Estimator for LinearModel {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>> {
        if features.ncols() != self.coefficients.len() {
            return Err(PipelineError::SchemaMismatch(format!(
                "{} model expects {} columns, got {}",
                self.target,
                self.coefficients.len(),
                features.ncols()
            )));
        }
        let coefs = Array1::from(self.coefficients.clone());
        Ok(features.dot(&coefs) + self.intercept)
    }
}

/// One estimator per target, all checked against the same feature schema.
pub struct Ensemble {
    columns: Vec<String>,
    models: BTreeMap<Target, Box<dyn Estimator>>,
}

pub type TargetPredictions = BTreeMap<Target, Array1<f64>>;

impl Ensemble {
    /// Build from ready estimators; every target must be present and agree
    /// with `schema` on the column list.
    pub fn new(
        targets: &[Target],
        mut estimators: BTreeMap<Target, Box<dyn Estimator>>,
        schema: &FeatureSchema,
    ) -> Result<Self> {
        let expected = schema.column_names();
        let mut models = BTreeMap::new();
        for &target in targets {
            let model = estimators.remove(&target).ok_or_else(|| PipelineError::MissingEstimator {
                target,
                path: PathBuf::from(format!("best_model_{}", target.code())),
            })?;
            if model.columns() != expected.as_slice() {
                return Err(PipelineError::SchemaMismatch(format!(
                    "{} model was trained on different columns than the feature schema",
                    target
                )));
            }
            models.insert(target, model);
        }
        Ok(Ensemble { columns: expected, models })
    }

    /// Load `best_model_<TARGET>.json` for every target. Any missing file
    /// aborts before a single model is used.
    pub fn load(dir: &Path, targets: &[Target], schema: &FeatureSchema) -> Result<Self> {
        if let Some(&target) = targets.iter().find(|&&t| !model_path(dir, t).exists()) {
            return Err(PipelineError::MissingEstimator { target, path: model_path(dir, target) });
        }
        let mut estimators: BTreeMap<Target, Box<dyn Estimator>> = BTreeMap::new();
        for &target in targets {
            let model = LinearModel::load(&model_path(dir, target))?;
            if model.target != target {
                return Err(PipelineError::SchemaMismatch(format!(
                    "{} holds a {} model",
                    model_path(dir, target).display(),
                    model.target
                )));
            }
            estimators.insert(target, Box::new(model));
        }
        info!(dir = %dir.display(), models = estimators.len(), "loaded estimators");
        Ensemble::new(targets, estimators, schema)
    }

    pub fn targets(&self) -> Vec<Target> {
        self.models.keys().copied().collect()
    }

    pub fn predict(&self, matrix: &FeatureMatrix) -> Result<TargetPredictions> {
        if matrix.columns != self.columns {
            return Err(PipelineError::SchemaMismatch(
                "feature matrix columns differ from the estimators' columns".to_string(),
            ));
        }
        self.models
            .iter()
            .map(|(&target, model)| Ok((target, model.predict(&matrix.data)?)))
            .collect()
    }
}

/// Held-out metrics, averaged uniformly over targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub mse: f64,
    pub r2: f64,
    /// MSE over rows with a non-zero truth, as a percentage of their mean.
    pub mse_percent: f64,
}

/// `y_true` and `y_pred` are (rows, targets).
pub fn evaluate(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> Evaluation {
    let n_targets = y_true.ncols();
    let mut mse_sum = 0.0;
    let mut r2_sum = 0.0;
    let mut percents = Vec::new();

    for j in 0..n_targets {
        let t = y_true.column(j);
        let p = y_pred.column(j);
        let mse = (&t - &p).mapv(|d| d * d).mean().unwrap_or(0.0);
        mse_sum += mse;

        let mean = t.mean().unwrap_or(0.0);
        let ss_tot: f64 = t.iter().map(|v| (v - mean).powi(2)).sum();
        let ss_res: f64 = t.iter().zip(p.iter()).map(|(a, b)| (a - b).powi(2)).sum();
        r2_sum += if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

        let nonzero: Vec<(f64, f64)> = t
            .iter()
            .zip(p.iter())
            .filter(|(a, _)| **a != 0.0)
            .map(|(&a, &b)| (a, b))
            .collect();
        if !nonzero.is_empty() {
            let k = nonzero.len() as f64;
            let mse_nz = nonzero.iter().map(|(a, b)| (a - b).powi(2)).sum::<f64>() / k;
            let mean_nz = nonzero.iter().map(|(a, _)| a).sum::<f64>() / k;
            if mean_nz != 0.0 {
                percents.push(mse_nz / mean_nz * 100.0);
            }
        }
    }

    let denom = n_targets.max(1) as f64;
    Evaluation {
        mse: mse_sum / denom,
        r2: r2_sum / denom,
        mse_percent: if percents.is_empty() {
            f64::NAN
        } else {
            percents.iter().sum::<f64>() / percents.len() as f64
        },
    }
}

/// Shuffle row indices with a fixed seed and split off `test_fraction`.
pub fn train_test_split(rows: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut idx: Vec<usize> = (0..rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    let n_test = (rows as f64 * test_fraction).ceil() as usize;
    let test = idx.split_off(rows - n_test.min(rows));
    (idx, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};

    #[test]
    fn test_train_model_simple() {
        // y = 2*x0 - x1 + 3
        let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [2.0, 1.0], [3.0, 5.0]];
        let y = x.map_axis(Axis(1), |r| 2.0 * r[0] - r[1] + 3.0);
        let columns = vec!["a".to_string(), "b".to_string()];
        let model = LinearModel::fit(Target::Pts, &columns, &x, &y).expect("training failed");
        assert!((model.intercept - 3.0).abs() < 1e-6);
        assert!((model.coefficients[0] - 2.0).abs() < 1e-6);
        assert_eq!(model.importances()[0].0, "a");

        let pred = model.predict(&array![[4.0, 2.0]]).unwrap();
        assert!((pred[0] - 9.0).abs() < 1e-6);
        assert!(model.predict(&array![[4.0]]).is_err());
    }

    #[test]
    fn test_evaluate_perfect_and_offset() {
        let t = array![[1.0, 0.0], [3.0, 2.0]];
        let perfect = evaluate(&t, &t);
        assert_eq!(perfect.mse, 0.0);
        assert_eq!(perfect.r2, 1.0);
        assert_eq!(perfect.mse_percent, 0.0);

        let off = evaluate(&t, &(&t + 1.0));
        assert_eq!(off.mse, 1.0);
        // col 0: mse 1 / mean 2 -> 50%; col 1 (only the 2.0 row): mse 1 / mean 2 -> 50%
        assert!((off.mse_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_split_is_seeded_and_complete() {
        let (train_a, test_a) = train_test_split(10, 0.4, 42);
        let (train_b, test_b) = train_test_split(10, 0.4, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);
        assert_eq!(test_a.len(), 4);
        let mut all: Vec<usize> = train_a.into_iter().chain(test_a).collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_model_file_is_configuration_error() {
        use crate::features::{AssembledRow, ContextRow, FeatureSpec};
        use crate::preprocess::{AgeCategory, StatLine};
        use crate::window::WindowSummary;

        let row = AssembledRow::new(
            ContextRow { player: "A".into(), season: 2021, age: 24, position: "PG".into() },
            WindowSummary {
                player: "A".into(),
                reference_season: 2021,
                seasons_used: 1,
                averages: StatLine::default(),
                position: "PG".into(),
                age_category: AgeCategory::Young,
            },
        );
        let schema = FeatureSchema::fit(&FeatureSpec::default(), &[row], 3).unwrap();
        let dir = std::env::temp_dir().join("season_forecast_no_models");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let err = Ensemble::load(&dir, &Target::ALL, &schema).err().unwrap();
        match err {
            PipelineError::MissingEstimator { target, path } => {
                assert_eq!(target, Target::Pts);
                assert!(path.ends_with("best_model_PTS.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
