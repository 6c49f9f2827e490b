/// Put the pipeline stages together behind a small CLI: clean box scores,
/// train one model per statistic, and forecast the next season.
use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use clap::{Parser, Subcommand};
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod features;
mod io;
mod league;
mod model;
mod predict;
mod preprocess;
mod train;
mod window;

use config::Config;
use features::FeatureSchema;
use io::CsvRecordStore;
use model::{Ensemble, LinearModel};
use error::PipelineError;
use predict::{predict_season, GapRecord, NewPlayer, PredictionReport, PredictionRequest};
use preprocess::load_records;

#[derive(Parser)]
#[command(author, version, about = "Per-player season forecasts from box-score history", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override `data.records_path`
    #[arg(long, global = true)]
    records: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to a TOML file
    InitConfig {
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
    /// Clean the records and write them back with an Age_Category column
    Clean {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// League averages and spreads by position and age
    League {
        #[arg(short, long, default_value = "league_profiles.csv")]
        output: PathBuf,
    },
    /// Train one model per target and save them with the feature schema
    Train {
        /// Also render a coefficient chart per model
        #[arg(long)]
        plot: bool,

        /// Write the training report (metrics, gaps) as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Forecast a season for every player with a record in the season before
    Predict {
        /// Season to forecast (end year); defaults to the upcoming season
        #[arg(short, long)]
        season: Option<i32>,

        /// Only forecast these players (repeatable)
        #[arg(short, long = "player")]
        players: Vec<String>,

        /// A player with no records, as "Name,Age,Pos" (repeatable)
        #[arg(long = "new-player")]
        new_players: Vec<NewPlayer>,

        /// Output file; `.csv` writes predictions plus a `<name>_gaps.csv`, anything else the JSON report
        #[arg(short, long, default_value = "predictions.json")]
        output: PathBuf,
    },
}

/// Season labels use the year the season ends in; from July on, that is next year.
fn upcoming_season() -> i32 {
    let today = Local::now().date_naive();
    if today.month() >= 7 { today.year() + 1 } else { today.year() }
}

/// Draws a horizontal bar chart of one model's coefficients.
/// input: the trained model and the PNG path to write
/// logic: sort coefficients by magnitude; pad the X range; label each Y tick
/// with its column name; draw one bar per coefficient
fn plot_coefficients(model: &LinearModel, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let results = model.importances();
    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    let coefs: Vec<f64> = results.iter().map(|(_, c)| *c).collect();
    let count = results.len();

    let min_x = coefs.iter().cloned().fold(0.0_f64, f64::min);
    let max_x = coefs.iter().cloned().fold(0.0_f64, f64::max);
    let pad = ((max_x - min_x) * 0.1).max(1e-3);
    let x_range = (min_x - pad)..(max_x + pad);

    let root = BitMapBackend::new(path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let caption = format!("{} model coefficients", model.target);
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(200)
        .build_cartesian_2d(x_range, 0..count)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .y_labels(count)
        .y_label_formatter(&|idx| {
            let i = *idx;
            if i < count { names[i].to_string() } else { String::new() }
        })
        .x_desc("Coefficient")
        .y_desc("Feature")
        .draw()?;

    chart.draw_series(coefs.iter().enumerate().map(|(i, &coef)| {
        let start = 0.0_f64.min(coef);
        let end = 0.0_f64.max(coef);
        Rectangle::new([(start, i), (end, i + 1)], BLUE.mix(0.5).filled())
    }))?;

    root.present()?;
    Ok(())
}

/// `predictions.csv` -> `predictions_gaps.csv`, in the same directory.
fn gaps_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    output.with_file_name(format!("{}_gaps.csv", stem))
}

/// Tabular output: predictions in `output`, coverage gaps next to it.
fn write_report_csv(output: &Path, report: &PredictionReport) -> Result<PathBuf> {
    io::write_csv(output, &report.predictions)?;
    let gaps: Vec<GapRecord> = report.gaps.iter().map(GapRecord::from).collect();
    let path = gaps_path(output);
    io::write_csv(&path, &gaps)?;
    Ok(path)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).map_err(|e| {
        if let Some(err) = e.downcast_ref::<PipelineError>() {
            tracing::error!(kind = ?err.kind(), "pipeline stopped");
        }
        e
    })
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path))?,
        None => Config::default(),
    };
    if let Some(path) = cli.records {
        config.data.records_path = path;
    }
    config.validate()?;
    let store = CsvRecordStore::new(&config.data.records_path);

    match cli.command {
        Commands::InitConfig { output } => {
            config.save(&output).with_context(|| format!("writing {}", output))?;
            info!(path = %output, "wrote configuration");
        }
        Commands::Clean { output } => {
            let records = load_records(&store, &config).context("preparing records")?;
            io::write_clean_csv(&output, &records)?;
            info!(path = %output.display(), records = records.len(), "wrote cleaned records");
        }
        Commands::League { output } => {
            let records = load_records(&store, &config).context("preparing records")?;
            let profiles = league::profiles(&records);
            league::write_profiles_csv(&output, &profiles)?;
            info!(path = %output.display(), groups = profiles.len(), "wrote league profiles");
        }
        Commands::Train { plot, report } => {
            let records = load_records(&store, &config).context("preparing records")?;
            let trained = train::train(&records, &config).context("training models")?;
            trained.save(&config.data.model_dir).context("saving models")?;
            if let Some(path) = report {
                io::write_json(&path, &trained.report)?;
            }
            if plot {
                for model in &trained.models {
                    let path = config.data.model_dir.join(format!("coefficients_{}.png", model.target));
                    plot_coefficients(model, &path)
                        .map_err(|e| anyhow::anyhow!("plotting {}: {}", path.display(), e))?;
                }
            }
        }
        Commands::Predict { season, players, new_players, output } => {
            let request = PredictionRequest {
                season: season.unwrap_or_else(upcoming_season),
                players: (!players.is_empty()).then_some(players),
                new_players,
            };
            let schema = FeatureSchema::load(&config.data.model_dir).context("loading feature schema")?;
            // every model must be present before any record is touched
            let ensemble = Ensemble::load(&config.data.model_dir, &config.training.targets, &schema)?;
            let records = load_records(&store, &config).context("preparing records")?;
            let report = predict_season(&records, &request, &schema, &ensemble, &config)?;

            if output.extension().is_some_and(|ext| ext == "csv") {
                let gaps = write_report_csv(&output, &report)?;
                info!(path = %gaps.display(), gaps = report.gaps.len(), "wrote coverage gaps");
            } else {
                io::write_json(&output, &report)?;
            }
            info!(path = %output.display(), season = report.season, "wrote predictions");
        }
    }
    Ok(())
}

/// the end-to-end tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{AssembledRow, ContextRow, FeatureSpec};
    use crate::model::Target;
    use crate::preprocess::Stat;
    use crate::window::{aggregate_inference, aggregate_training, GapReason};
    use std::error::Error;
    use std::fs::File;
    use std::io::Write;

    const HEADER: &str = "Player,Season,Age,Pos,G,MP,PTS,AST,TRB,STL,BLK,TOV,3P,3PA,2P,2PA,FT,FTA";

    fn write_league(path: &Path) -> Result<(), Box<dyn Error>> {
        let mut f = File::create(path)?;
        writeln!(f, "{}", HEADER)?;
        writeln!(f, "A,2020,23,PG,70,30,10,5,3,1,0.2,2,1,3,3,6,1,2")?;
        writeln!(f, "A,2021,24,,71,31,20,6,4,1,0.3,2,2,5,5,9,2,3")?;
        writeln!(f, "B,2019,28,PG,60,25,8,2,7,1,1.0,1,0,0,3,6,2,2")?;
        writeln!(f, "B,2020,29,C,61,26,9,2,8,1,1.2,1,0,0,4,7,1,2")?;
        writeln!(f, "B,2021,30,C,62,27,12,3,9,1,1.4,1,0,1,5,8,2,3")?;
        writeln!(f, "C,2021,22,PG,40,12,4,1,2,0,0.1,1,0,1,2,4,0,1")?;
        Ok(())
    }

    /// PIPELINE: two seasons of history average to 15 and the forecast is aged one year
    #[test]
    fn test_end_to_end_forecast() -> Result<(), Box<dyn Error>> {
        let path = std::env::temp_dir().join("season_forecast_e2e.csv");
        write_league(&path)?;

        let config = Config::default();
        let records = load_records(&CsvRecordStore::new(&path), &config)?;
        assert_eq!(records.len(), 6);
        // the missing 2021 position for A is filled with the batch mode
        let a_2021 = records.iter().find(|r| r.player == "A" && r.season == 2021).unwrap();
        assert_eq!(a_2021.position, "PG");

        let arena = aggregate_inference(&records, 2022, config.window.size)?;
        let a = arena.get("A").unwrap();
        assert_eq!(a.average(Stat::Points), 15.0);

        let windows = aggregate_training(&records, config.window.size)?;
        let rows: Vec<AssembledRow> = windows
            .examples
            .iter()
            .map(|e| AssembledRow::new(ContextRow::from_season(e.row), e.window.clone()))
            .collect();
        let schema = FeatureSchema::fit(&FeatureSpec::default(), &rows, config.window.size)?;
        let ensemble = predict::tests::echo_ensemble(&schema);

        let request = PredictionRequest { season: 2022, ..Default::default() };
        let report = predict_season(&records, &request, &schema, &ensemble, &config)?;

        let a = report.predictions.iter().find(|p| p.player == "A").unwrap();
        assert_eq!(a.season, 2022);
        assert_eq!(a.age, 25);
        assert_eq!(a.position, "PG");
        assert_eq!(a.pts, Some(15.0));

        // a single earlier season is enough history for a forecast
        assert!(report.predictions.iter().any(|p| p.player == "C"));
        assert!(report.gaps.iter().all(|g| g.reason != GapReason::NoPriorHistory));
        Ok(())
    }

    /// PIPELINE: a missing model file aborts before any prediction is made
    #[test]
    fn test_missing_estimator_aborts() -> Result<(), Box<dyn Error>> {
        let path = std::env::temp_dir().join("season_forecast_e2e_missing.csv");
        write_league(&path)?;
        let mut config = Config::default();
        config.data.model_dir = std::env::temp_dir().join("season_forecast_e2e_models");
        let _ = std::fs::remove_dir_all(&config.data.model_dir);

        let records = load_records(&CsvRecordStore::new(&path), &config)?;
        let windows = aggregate_training(&records, config.window.size)?;
        let rows: Vec<AssembledRow> = windows
            .examples
            .iter()
            .map(|e| AssembledRow::new(ContextRow::from_season(e.row), e.window.clone()))
            .collect();
        let schema = FeatureSchema::fit(&config.features.spec(), &rows, config.window.size)?;
        schema.save(&config.data.model_dir)?;

        let err = Ensemble::load(&config.data.model_dir, &Target::ALL, &schema).err().unwrap();
        assert_eq!(err.kind(), error::ErrorKind::Configuration);
        Ok(())
    }

    /// IO: csv output puts gaps in a sibling file next to the predictions
    #[test]
    fn test_csv_report_writes_gaps_alongside() -> Result<(), Box<dyn Error>> {
        use crate::predict::PredictionRecord;
        use crate::window::CoverageGap;

        let dir = std::env::temp_dir().join("season_forecast_csv_report");
        std::fs::create_dir_all(&dir)?;
        let output = dir.join("predictions.csv");
        let report = PredictionReport {
            season: 2022,
            predictions: vec![PredictionRecord {
                player: "A".into(),
                season: 2022,
                age: 25,
                position: "PG".into(),
                pts: Some(15.0),
                ast: Some(5.5),
                trb: Some(3.5),
                stl: Some(1.0),
                blk: None,
            }],
            gaps: vec![CoverageGap { player: "Rookie".into(), season: 2022, reason: GapReason::NoPriorHistory }],
        };

        let gaps = write_report_csv(&output, &report)?;
        assert_eq!(gaps, dir.join("predictions_gaps.csv"));

        let predictions = std::fs::read_to_string(&output)?;
        assert!(predictions.starts_with("Player,Season,Age,Pos,PTS,AST,TRB,STL,BLK"));
        assert!(predictions.contains("A,2022,25,PG,15.0,5.5,3.5,1.0,"));

        let gap_text = std::fs::read_to_string(&gaps)?;
        let mut lines = gap_text.lines();
        assert_eq!(lines.next(), Some("Player,Season,reason,feature,value"));
        assert_eq!(lines.next(), Some("Rookie,2022,no_prior_history,,"));
        Ok(())
    }
}
