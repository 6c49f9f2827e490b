// Error taxonomy shared by every pipeline stage.
use std::path::PathBuf;
use thiserror::Error;

use crate::model::Target;

/// Broad class of a failure, used by callers that only care whether a
/// batch failed on its data, its setup, or a train/predict disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DataIntegrity,
    Configuration,
    SchemaMismatch,
    Io,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot derive a fill value for {column} from an empty collection")]
    EmptyInput { column: &'static str },

    #[error("duplicate season {season} for player {player}")]
    DuplicateSeason { player: String, season: i32 },

    #[error("age {age} of {player} ({season}) is outside the bucketing range [{min}, {max})")]
    AgeOutOfRange {
        player: String,
        season: i32,
        age: i32,
        min: i32,
        max: i32,
    },

    #[error("not enough training rows: {rows} rows for {columns} feature columns")]
    InsufficientTrainingData { rows: usize, columns: usize },

    #[error("no trained estimator for {target} at {}", .path.display())]
    MissingEstimator { target: Target, path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{feature} value {value:?} has no encoded column in the training schema")]
    UnknownCategory { feature: String, value: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model fit failed: {0}")]
    Fit(#[from] linfa_linear::LinearError<f64>),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::EmptyInput { .. }
            | PipelineError::DuplicateSeason { .. }
            | PipelineError::AgeOutOfRange { .. }
            | PipelineError::InsufficientTrainingData { .. }
            | PipelineError::Fit(_) => ErrorKind::DataIntegrity,
            PipelineError::MissingEstimator { .. } | PipelineError::Config(_) => {
                ErrorKind::Configuration
            }
            PipelineError::UnknownCategory { .. } | PipelineError::SchemaMismatch(_) => {
                ErrorKind::SchemaMismatch
            }
            PipelineError::Csv(_) | PipelineError::Io(_) | PipelineError::Json(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
