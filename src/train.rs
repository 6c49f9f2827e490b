// Training pipeline: windows -> schema -> matrix -> one model per target.
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::features::{AssembledRow, ContextRow, FeatureSchema, UnknownCategoryPolicy};
use crate::model::{evaluate, train_test_split, Estimator, Evaluation, LinearModel, Target};
use crate::preprocess::PlayerSeason;
use crate::window::{aggregate_training, CoverageGap, GapReason, TrainingWindow};
use ndarray::{s, Array1, Array2};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub examples: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    /// Player-seasons with no earlier season; left out of the matrix.
    pub gaps: Vec<CoverageGap>,
    /// Held-out rows carrying a category level the training split never saw.
    pub unscored: Vec<CoverageGap>,
    pub per_target: BTreeMap<Target, Evaluation>,
    pub overall: Option<Evaluation>,
}

pub struct TrainedModels {
    pub schema: FeatureSchema,
    pub models: Vec<LinearModel>,
    pub report: TrainingReport,
}

impl TrainedModels {
    /// Write the schema and every `best_model_<TARGET>.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.schema.save(dir)?;
        for model in &self.models {
            let path = model.save(dir)?;
            info!(stat = %model.target, path = %path.display(), "saved model");
        }
        Ok(())
    }
}

fn target_matrix(examples: &[TrainingWindow<'_>], idx: &[usize], targets: &[Target]) -> Array2<f64> {
    let mut y = Array2::<f64>::zeros((idx.len(), targets.len()));
    for (i, &row) in idx.iter().enumerate() {
        for (j, target) in targets.iter().enumerate() {
            y[(i, j)] = examples[row].row.stats.get(target.stat());
        }
    }
    y
}

pub fn train(records: &[PlayerSeason], config: &Config) -> Result<TrainedModels> {
    let window_size = config.window.size;
    let targets = &config.training.targets;

    let windows = aggregate_training(records, window_size)?;
    if !windows.gaps.is_empty() {
        warn!(gaps = windows.gaps.len(), "player-seasons without prior history left out of training");
    }

    let rows: Vec<AssembledRow> = windows
        .examples
        .iter()
        .map(|e| AssembledRow::new(ContextRow::from_season(e.row), e.window.clone()))
        .collect();
    let (train_idx, held_out) = train_test_split(rows.len(), config.training.test_fraction, config.training.seed);

    // vocabularies come from the training split only, so every encoded
    // indicator column has at least one non-zero training row
    let train_rows: Vec<AssembledRow> = train_idx.iter().map(|&i| rows[i].clone()).collect();
    let schema = FeatureSchema::fit(&config.features.spec(), &train_rows, window_size)?;
    if train_idx.len() <= schema.width() {
        return Err(PipelineError::InsufficientTrainingData {
            rows: train_idx.len(),
            columns: schema.width(),
        });
    }

    let mut test_idx = Vec::with_capacity(held_out.len());
    let mut unscored = Vec::new();
    for i in held_out {
        match schema.unknown_category(&rows[i]) {
            None => test_idx.push(i),
            Some((feature, value)) => unscored.push(CoverageGap {
                player: rows[i].context.player.clone(),
                season: rows[i].context.season,
                reason: GapReason::UnknownCategory { feature: feature.name().to_string(), value },
            }),
        }
    }
    if !unscored.is_empty() {
        warn!(rows = unscored.len(), "held-out rows with categories unseen in training left unscored");
    }
    let test_rows: Vec<AssembledRow> = test_idx.iter().map(|&i| rows[i].clone()).collect();

    let train_matrix = schema.encode(&train_rows, UnknownCategoryPolicy::Abort)?.matrix;
    let x_train = train_matrix.data;
    let columns = train_matrix.columns;
    let x_test = schema.encode(&test_rows, UnknownCategoryPolicy::Abort)?.matrix.data;
    let y_train = target_matrix(&windows.examples, &train_idx, targets);
    let y_test = target_matrix(&windows.examples, &test_idx, targets);
    info!(
        train = train_idx.len(),
        test = test_idx.len(),
        columns = schema.width(),
        "training one model per target"
    );

    let mut models = Vec::with_capacity(targets.len());
    let mut y_pred = Array2::<f64>::zeros(y_test.raw_dim());
    let mut per_target = BTreeMap::new();
    for (j, &target) in targets.iter().enumerate() {
        let y_col: Array1<f64> = y_train.column(j).to_owned();
        let model = LinearModel::fit(target, &columns, &x_train, &y_col)?;
        if !test_idx.is_empty() {
            let pred = model.predict(&x_test)?;
            y_pred.column_mut(j).assign(&pred);
            let eval = evaluate(
                &y_test.slice(s![.., j..j + 1]).to_owned(),
                &y_pred.slice(s![.., j..j + 1]).to_owned(),
            );
            info!(stat = %target, mse = eval.mse, r2 = eval.r2, "held-out fit");
            per_target.insert(target, eval);
        }
        models.push(model);
    }

    let overall = (!test_idx.is_empty()).then(|| evaluate(&y_test, &y_pred));
    if let Some(eval) = overall {
        info!(mse = eval.mse, r2 = eval.r2, mse_percent = eval.mse_percent, "overall held-out fit");
    }

    Ok(TrainedModels {
        schema,
        models,
        report: TrainingReport {
            examples: windows.examples.len(),
            train_rows: train_idx.len(),
            test_rows: test_idx.len(),
            gaps: windows.gaps,
            unscored,
            per_target,
            overall,
        },
    })
}
