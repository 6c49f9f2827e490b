//! Feature assembly and the persisted feature schema.
//!
//! The schema (ordered columns plus categorical vocabularies) is fitted once
//! on the training rows and saved next to the models. Inference loads it and
//! encodes against it; it is never re-derived from an inference batch.

use crate::error::{PipelineError, Result};
use crate::preprocess::{AgeCategory, PlayerSeason, Stat};
use crate::window::{window_column, CoverageGap, GapReason, WindowArena, WindowSummary, WINDOW_PREFIX};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub const SCHEMA_VERSION: u32 = 1;
pub const SCHEMA_FILE: &str = "feature_schema.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NumericFeature {
    Season,
    Age,
    /// Window average of a stat, named with the window prefix.
    Window(Stat),
}

impl NumericFeature {
    pub fn name(self) -> String {
        match self {
            NumericFeature::Season => "Season".to_string(),
            NumericFeature::Age => "Age".to_string(),
            NumericFeature::Window(stat) => window_column(stat),
        }
    }
}

impl FromStr for NumericFeature {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Season" => Ok(NumericFeature::Season),
            "Age" => Ok(NumericFeature::Age),
            _ => s
                .strip_prefix(WINDOW_PREFIX)
                .and_then(|code| code.parse::<Stat>().ok())
                .map(NumericFeature::Window)
                .ok_or_else(|| format!("Unknown numeric feature: {}", s)),
        }
    }
}

impl TryFrom<String> for NumericFeature {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NumericFeature> for String {
    fn from(f: NumericFeature) -> String {
        f.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CategoricalFeature {
    #[serde(rename = "Age_Category")] AgeCategory,
    #[serde(rename = "Pos")]          Position,
}

impl CategoricalFeature {
    pub fn name(self) -> &'static str {
        match self {
            CategoricalFeature::AgeCategory => "Age_Category",
            CategoricalFeature::Position => "Pos",
        }
    }

    /// Deterministic level order: age groups by ordinal, positions by name.
    fn sort_levels(self, levels: &mut [String]) {
        match self {
            CategoricalFeature::AgeCategory => levels.sort_by_key(|l| l.parse::<AgeCategory>().ok()),
            CategoricalFeature::Position => levels.sort(),
        }
    }
}

impl fmt::Display for CategoricalFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical feature list, before any vocabulary is known.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSpec {
    pub numeric: Vec<NumericFeature>,
    pub categorical: Vec<CategoricalFeature>,
    pub drop_first: bool,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        FeatureSpec {
            numeric: vec![
                NumericFeature::Season,
                NumericFeature::Age,
                NumericFeature::Window(Stat::Points),
                NumericFeature::Window(Stat::Assists),
                NumericFeature::Window(Stat::Rebounds),
                NumericFeature::Window(Stat::Steals),
                NumericFeature::Window(Stat::Blocks),
            ],
            categorical: vec![CategoricalFeature::AgeCategory, CategoricalFeature::Position],
            drop_first: true,
        }
    }
}

/// What inference does with a category value missing from the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCategoryPolicy {
    /// Fail the whole batch with `UnknownCategory`.
    #[default]
    Abort,
    /// Drop the row and report it as a coverage gap.
    Report,
}

/// Identity and current-season context of a row to be featurized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextRow {
    pub player: String,
    pub season: i32,
    pub age: i32,
    pub position: String,
}

impl ContextRow {
    pub fn from_season(row: &PlayerSeason) -> Self {
        ContextRow {
            player: row.player.clone(),
            season: row.season,
            age: row.age,
            position: row.position.clone(),
        }
    }
}

/// Context merged with its window summary.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRow {
    pub context: ContextRow,
    pub window: WindowSummary,
}

impl AssembledRow {
    pub fn new(context: ContextRow, window: WindowSummary) -> Self {
        AssembledRow { context, window }
    }

    pub fn numeric(&self, feature: NumericFeature) -> f64 {
        match feature {
            NumericFeature::Season => self.context.season as f64,
            NumericFeature::Age => self.context.age as f64,
            NumericFeature::Window(stat) => self.window.average(stat),
        }
    }

    /// Position is current-season context; age group is carried by the window.
    pub fn category(&self, feature: CategoricalFeature) -> &str {
        match feature {
            CategoricalFeature::AgeCategory => self.window.age_category.label(),
            CategoricalFeature::Position => &self.context.position,
        }
    }
}

/// Every context row lands in exactly one of `rows` or `gaps`.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub rows: Vec<AssembledRow>,
    pub gaps: Vec<CoverageGap>,
}

/// Left-join contexts to their window summaries by player. A context whose
/// window is missing or empty would encode as all-zero averages, so it is
/// reported as a gap rather than merged as a valid row.
pub fn assemble(contexts: &[ContextRow], arena: &WindowArena) -> Assembly {
    let mut out = Assembly::default();
    for context in contexts {
        match arena.get(&context.player) {
            Some(window) if window.has_history() => {
                out.rows.push(AssembledRow::new(context.clone(), window.clone()))
            }
            _ => out.gaps.push(CoverageGap {
                player: context.player.clone(),
                season: context.season,
                reason: GapReason::NoPriorHistory,
            }),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Indicator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub feature: CategoricalFeature,
    /// Every level seen at training time; the first is the reference level
    /// when `drop_first` is set.
    pub levels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub window_size: usize,
    pub numeric: Vec<NumericFeature>,
    pub vocabularies: Vec<Vocabulary>,
    pub drop_first: bool,
    pub columns: Vec<Column>,
}

/// Encoded rows ready for an estimator, with the identities they belong to.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub data: Array2<f64>,
    pub rows: Vec<ContextRow>,
}

#[derive(Debug, Clone)]
pub struct Encoded {
    pub matrix: FeatureMatrix,
    pub gaps: Vec<CoverageGap>,
}

fn build_columns(numeric: &[NumericFeature], vocabularies: &[Vocabulary], drop_first: bool) -> Vec<Column> {
    let mut columns: Vec<Column> = numeric
        .iter()
        .map(|f| Column { name: f.name(), kind: ColumnKind::Numeric })
        .collect();
    for vocab in vocabularies {
        let skip = usize::from(drop_first);
        columns.extend(vocab.levels.iter().skip(skip).map(|level| Column {
            name: format!("{}_{}", vocab.feature.name(), level),
            kind: ColumnKind::Indicator,
        }));
    }
    columns
}

impl FeatureSchema {
    /// Learn the categorical vocabularies from training rows.
    pub fn fit(spec: &FeatureSpec, rows: &[AssembledRow], window_size: usize) -> Result<Self> {
        if rows.is_empty() {
            return Err(PipelineError::InsufficientTrainingData {
                rows: 0,
                columns: spec.numeric.len(),
            });
        }
        let vocabularies: Vec<Vocabulary> = spec
            .categorical
            .iter()
            .map(|&feature| {
                let seen: BTreeSet<&str> = rows.iter().map(|r| r.category(feature)).collect();
                let mut levels: Vec<String> = seen.into_iter().map(str::to_string).collect();
                feature.sort_levels(&mut levels);
                Vocabulary { feature, levels }
            })
            .collect();
        let columns = build_columns(&spec.numeric, &vocabularies, spec.drop_first);
        info!(columns = columns.len(), "fitted feature schema");
        Ok(FeatureSchema {
            version: SCHEMA_VERSION,
            window_size,
            numeric: spec.numeric.clone(),
            vocabularies,
            drop_first: spec.drop_first,
            columns,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// First categorical value of `row` missing from its vocabulary, if any.
    pub fn unknown_category(&self, row: &AssembledRow) -> Option<(CategoricalFeature, String)> {
        self.vocabularies.iter().find_map(|vocab| {
            let value = row.category(vocab.feature);
            (!vocab.levels.iter().any(|l| l == value)).then(|| (vocab.feature, value.to_string()))
        })
    }

    /// Encode rows into the fixed column layout. A category value outside the
    /// vocabulary either fails the batch or drops the row as a gap, per `policy`.
    pub fn encode(&self, rows: &[AssembledRow], policy: UnknownCategoryPolicy) -> Result<Encoded> {
        let mut kept: Vec<(&AssembledRow, Vec<usize>)> = Vec::with_capacity(rows.len());
        let mut gaps = Vec::new();

        for row in rows {
            if let Some((feature, value)) = self.unknown_category(row) {
                match policy {
                    UnknownCategoryPolicy::Abort => {
                        return Err(PipelineError::UnknownCategory {
                            feature: feature.name().to_string(),
                            value,
                        })
                    }
                    UnknownCategoryPolicy::Report => {
                        gaps.push(CoverageGap {
                            player: row.context.player.clone(),
                            season: row.context.season,
                            reason: GapReason::UnknownCategory { feature: feature.name().to_string(), value },
                        });
                        continue;
                    }
                }
            }
            let indices: Vec<usize> = self
                .vocabularies
                .iter()
                .filter_map(|vocab| {
                    let value = row.category(vocab.feature);
                    vocab.levels.iter().position(|l| l == value)
                })
                .collect();
            kept.push((row, indices));
        }

        let mut data = Array2::<f64>::zeros((kept.len(), self.width()));
        for (i, (row, indices)) in kept.iter().enumerate() {
            for (j, &feature) in self.numeric.iter().enumerate() {
                data[(i, j)] = row.numeric(feature);
            }
            let mut offset = self.numeric.len();
            for (vocab, &level) in self.vocabularies.iter().zip(indices) {
                let encoded = vocab.levels.len() - usize::from(self.drop_first);
                if !(self.drop_first && level == 0) {
                    data[(i, offset + level - usize::from(self.drop_first))] = 1.0;
                }
                offset += encoded;
            }
        }

        Ok(Encoded {
            matrix: FeatureMatrix {
                columns: self.column_names(),
                data,
                rows: kept.into_iter().map(|(row, _)| row.context.clone()).collect(),
            },
            gaps,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        crate::io::write_json(&dir.join(SCHEMA_FILE), self)
    }

    /// Load a schema saved at training time and check it is self-consistent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SCHEMA_FILE);
        let file = File::open(&path).map_err(|e| {
            PipelineError::Config(format!("Failed to open feature schema {}: {}", path.display(), e))
        })?;
        let schema: FeatureSchema = serde_json::from_reader(file)?;
        if schema.version != SCHEMA_VERSION {
            return Err(PipelineError::SchemaMismatch(format!(
                "schema version {} is not supported (expected {})",
                schema.version, SCHEMA_VERSION
            )));
        }
        if schema.columns != build_columns(&schema.numeric, &schema.vocabularies, schema.drop_first) {
            return Err(PipelineError::SchemaMismatch(
                "column list does not match the stored vocabularies".to_string(),
            ));
        }
        Ok(schema)
    }
}
