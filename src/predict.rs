//! Inference pipeline and prediction composition.
//!
//! A forecast for season `S` is made for every player with a record in
//! `S - 1`: the context is that record aged by one year, the window is built
//! from seasons strictly before `S`, and the row is encoded with the schema
//! saved at training time.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::features::{assemble, ContextRow, FeatureSchema};
use crate::model::{Ensemble, Target, TargetPredictions};
use crate::preprocess::PlayerSeason;
use crate::window::{aggregate_inference, CoverageGap, GapReason};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// A player with no records, described by the minimum needed to featurize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlayer {
    pub name: String,
    pub age: i32,
    pub position: String,
}

impl FromStr for NewPlayer {
    type Err = String;
    /// Parses `Name,Age,Pos`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [name, age, pos] if !name.is_empty() && !pos.is_empty() => Ok(NewPlayer {
                name: name.to_string(),
                age: age.parse().map_err(|_| format!("invalid age in {:?}", s))?,
                position: pos.to_string(),
            }),
            _ => Err(format!("expected Name,Age,Pos, got {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionRequest {
    pub season: i32,
    /// Restrict to these players; `None` means everyone with a predecessor season.
    pub players: Option<Vec<String>>,
    pub new_players: Vec<NewPlayer>,
}

/// One forecast row. Targets without a trained model are left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(rename = "Player")] pub player: String,
    #[serde(rename = "Season")] pub season: i32,
    #[serde(rename = "Age")]    pub age: i32,
    #[serde(rename = "Pos")]    pub position: String,
    #[serde(rename = "PTS")]    pub pts: Option<f64>,
    #[serde(rename = "AST")]    pub ast: Option<f64>,
    #[serde(rename = "TRB")]    pub trb: Option<f64>,
    #[serde(rename = "STL")]    pub stl: Option<f64>,
    #[serde(rename = "BLK")]    pub blk: Option<f64>,
}

impl PredictionRecord {
    fn slot(&mut self, target: Target) -> &mut Option<f64> {
        match target {
            Target::Pts => &mut self.pts,
            Target::Ast => &mut self.ast,
            Target::Trb => &mut self.trb,
            Target::Stl => &mut self.stl,
            Target::Blk => &mut self.blk,
        }
    }
}

/// Predictions and, alongside them, every requested player that got none.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub season: i32,
    pub predictions: Vec<PredictionRecord>,
    pub gaps: Vec<CoverageGap>,
}

/// Flat form of a `CoverageGap` for tabular output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapRecord {
    #[serde(rename = "Player")] pub player: String,
    #[serde(rename = "Season")] pub season: i32,
    pub reason: &'static str,
    pub feature: Option<String>,
    pub value: Option<String>,
}

impl From<&CoverageGap> for GapRecord {
    fn from(gap: &CoverageGap) -> Self {
        let (feature, value) = match &gap.reason {
            GapReason::UnknownCategory { feature, value } => (Some(feature.clone()), Some(value.clone())),
            _ => (None, None),
        };
        GapRecord {
            player: gap.player.clone(),
            season: gap.season,
            reason: gap.reason.code(),
            feature,
            value,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Context rows for the requested season, plus gaps for named players that
/// have no predecessor-season record.
pub fn build_contexts(records: &[PlayerSeason], request: &PredictionRequest) -> (Vec<ContextRow>, Vec<CoverageGap>) {
    let previous: BTreeMap<&str, &PlayerSeason> = records
        .iter()
        .filter(|r| r.season == request.season - 1)
        .map(|r| (r.player.as_str(), r))
        .collect();
    let to_context = |r: &PlayerSeason| ContextRow {
        player: r.player.clone(),
        season: request.season,
        age: r.age + 1,
        position: r.position.clone(),
    };

    let mut contexts = Vec::new();
    let mut gaps = Vec::new();
    match &request.players {
        None => contexts.extend(previous.values().map(|r| to_context(*r))),
        Some(names) => {
            let mut named: HashSet<&str> = HashSet::new();
            for name in names {
                if !named.insert(name.as_str()) {
                    continue;
                }
                match previous.get(name.as_str()) {
                    Some(r) => contexts.push(to_context(*r)),
                    None => gaps.push(CoverageGap {
                        player: name.clone(),
                        season: request.season,
                        reason: GapReason::NoPredecessorSeason,
                    }),
                }
            }
        }
    }

    let mut seen: HashSet<String> = contexts.iter().map(|c| c.player.clone()).collect();
    for p in &request.new_players {
        if !seen.insert(p.name.clone()) {
            warn!(player = %p.name, "new player already has a predecessor season, ignoring");
            continue;
        }
        contexts.push(ContextRow {
            player: p.name.clone(),
            season: request.season,
            age: p.age,
            position: p.position.clone(),
        });
    }
    (contexts, gaps)
}

fn target_column<'a>(predictions: &'a TargetPredictions, target: Target, rows: usize) -> Result<&'a Array1<f64>> {
    let values = predictions.get(&target).ok_or_else(|| PipelineError::MissingEstimator {
        target,
        path: PathBuf::from(format!("best_model_{}", target.code())),
    })?;
    if values.len() != rows {
        return Err(PipelineError::SchemaMismatch(format!(
            "{} {} predictions for {} rows",
            values.len(),
            target,
            rows
        )));
    }
    Ok(values)
}

/// Attach identity fields to the raw predictions, one record per row, with
/// every statistic rounded to one decimal. Each of `targets` must have a
/// prediction; any other statistic is left empty.
pub fn compose(
    rows: &[ContextRow],
    predictions: &TargetPredictions,
    targets: &[Target],
) -> Result<Vec<PredictionRecord>> {
    let mut out: Vec<PredictionRecord> = rows
        .iter()
        .map(|row| PredictionRecord {
            player: row.player.clone(),
            season: row.season,
            age: row.age,
            position: row.position.clone(),
            pts: None,
            ast: None,
            trb: None,
            stl: None,
            blk: None,
        })
        .collect();
    for &target in targets {
        let values = target_column(predictions, target, rows.len())?;
        for (record, &v) in out.iter_mut().zip(values.iter()) {
            *record.slot(target) = Some(round1(v));
        }
    }
    Ok(out)
}

pub fn predict_season(
    records: &[PlayerSeason],
    request: &PredictionRequest,
    schema: &FeatureSchema,
    ensemble: &Ensemble,
    config: &Config,
) -> Result<PredictionReport> {
    if schema.window_size != config.window.size {
        return Err(PipelineError::SchemaMismatch(format!(
            "models were trained with a {}-season window, configured window is {}",
            schema.window_size, config.window.size
        )));
    }

    let arena = aggregate_inference(records, request.season, schema.window_size)?;
    if arena.is_empty() {
        warn!(season = request.season, "no player has any recorded season");
    }
    let (contexts, mut gaps) = build_contexts(records, request);
    let assembly = assemble(&contexts, &arena);
    gaps.extend(assembly.gaps);

    let encoded = schema.encode(&assembly.rows, config.features.unknown_category)?;
    gaps.extend(encoded.gaps);

    let raw = ensemble.predict(&encoded.matrix)?;
    let predictions = compose(&encoded.matrix.rows, &raw, &ensemble.targets())?;
    gaps.sort_by(|a, b| a.player.cmp(&b.player));

    info!(
        season = request.season,
        predictions = predictions.len(),
        gaps = gaps.len(),
        "composed predictions"
    );
    Ok(PredictionReport { season: request.season, predictions, gaps })
}
