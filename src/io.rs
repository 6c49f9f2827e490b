// Record store adapter over box-score CSV files, plus CSV/JSON writers.
use crate::error::Result;
use crate::preprocess::{PlayerSeason, Stat};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One raw player-season row, exactly as the box-score table carries it.
/// Unparseable numbers deserialize to `None` and are filled by the cleaner.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "Player")] pub player: String,
    #[serde(rename = "Season")] pub season: i32,
    #[serde(rename = "Age", default, deserialize_with = "csv::invalid_option")]
                                pub age: Option<f64>,
    #[serde(rename = "Pos", default)]
                                pub pos: Option<String>,
    #[serde(rename = "G", default, deserialize_with = "csv::invalid_option")]   pub g: Option<f64>,
    #[serde(rename = "MP", default, deserialize_with = "csv::invalid_option")]  pub mp: Option<f64>,
    #[serde(rename = "PTS", default, deserialize_with = "csv::invalid_option")] pub pts: Option<f64>,
    #[serde(rename = "AST", default, deserialize_with = "csv::invalid_option")] pub ast: Option<f64>,
    #[serde(rename = "TRB", default, deserialize_with = "csv::invalid_option")] pub trb: Option<f64>,
    #[serde(rename = "STL", default, deserialize_with = "csv::invalid_option")] pub stl: Option<f64>,
    #[serde(rename = "BLK", default, deserialize_with = "csv::invalid_option")] pub blk: Option<f64>,
    #[serde(rename = "TOV", default, deserialize_with = "csv::invalid_option")] pub tov: Option<f64>,
    #[serde(rename = "3P", default, deserialize_with = "csv::invalid_option")]  pub three_p: Option<f64>,
    #[serde(rename = "3PA", default, deserialize_with = "csv::invalid_option")] pub three_pa: Option<f64>,
    #[serde(rename = "2P", default, deserialize_with = "csv::invalid_option")]  pub two_p: Option<f64>,
    #[serde(rename = "2PA", default, deserialize_with = "csv::invalid_option")] pub two_pa: Option<f64>,
    #[serde(rename = "FT", default, deserialize_with = "csv::invalid_option")]  pub ft: Option<f64>,
    #[serde(rename = "FTA", default, deserialize_with = "csv::invalid_option")] pub fta: Option<f64>,
}

impl RawRecord {
    pub fn stat(&self, stat: Stat) -> Option<f64> {
        match stat {
            Stat::Games => self.g,
            Stat::Minutes => self.mp,
            Stat::Points => self.pts,
            Stat::Assists => self.ast,
            Stat::Rebounds => self.trb,
            Stat::Steals => self.stl,
            Stat::Blocks => self.blk,
            Stat::Turnovers => self.tov,
            Stat::ThreesMade => self.three_p,
            Stat::ThreesAttempted => self.three_pa,
            Stat::TwosMade => self.two_p,
            Stat::TwosAttempted => self.two_pa,
            Stat::FreeThrowsMade => self.ft,
            Stat::FreeThrowsAttempted => self.fta,
        }
    }
}

/// Source of every player-season row of a league. No ordering is promised.
pub trait RecordStore {
    fn fetch_all(&self) -> Result<Vec<RawRecord>>;
}

pub struct CsvRecordStore {
    path: PathBuf,
}

impl CsvRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvRecordStore { path: path.into() }
    }
}

impl RecordStore for CsvRecordStore {
    fn fetch_all(&self) -> Result<Vec<RawRecord>> {
        load_csv(&self.path)
    }
}

impl RecordStore for Vec<RawRecord> {
    fn fetch_all(&self) -> Result<Vec<RawRecord>> {
        Ok(self.clone())
    }
}

pub fn load_csv(path: &Path) -> Result<Vec<RawRecord>> {
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .has_headers(true)
        .from_reader(file);

    let headers = rdr.headers()?.clone();
    let expected_len = headers.len();

    let mut out = Vec::new();
    for result in rdr.records() {
        let raw: StringRecord = result?;
        let line = raw.position().map(|p| p.line()).unwrap_or(0);

        if raw.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        if raw.len() != expected_len {
            warn!(line, expected = expected_len, found = raw.len(), "skipping row with wrong field count");
            continue;
        }

        match raw.deserialize::<RawRecord>(Some(&headers)) {
            Ok(rec) => out.push(rec),
            Err(e) => warn!(line, error = %e, "skipping malformed record"),
        }
    }

    info!(path = %path.display(), records = out.len(), "loaded player seasons");
    Ok(out)
}

/// Cleaned records with their age category, in the box-score column layout.
pub fn write_clean_csv(path: &Path, records: &[PlayerSeason]) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path)?;
    let mut header = vec!["Player", "Season", "Age", "Pos"];
    header.extend(Stat::ALL.iter().map(|s| s.code()));
    header.push("Age_Category");
    wtr.write_record(&header)?;

    for r in records {
        let mut row = vec![
            r.player.clone(),
            r.season.to_string(),
            r.age.to_string(),
            r.position.clone(),
        ];
        row.extend(Stat::ALL.iter().map(|&s| r.stats.get(s).to_string()));
        row.push(r.age_category.label().to_string());
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
