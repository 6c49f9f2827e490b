// Data cleaning, stint consolidation and age bucketing.
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::io::{RawRecord, RecordStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

pub const STAT_COUNT: usize = 14;

/// Per-game box-score statistics carried by every season record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stat {
    #[serde(rename = "G")]    Games,
    #[serde(rename = "MP")]   Minutes,
    #[serde(rename = "PTS")]  Points,
    #[serde(rename = "AST")]  Assists,
    #[serde(rename = "TRB")]  Rebounds,
    #[serde(rename = "STL")]  Steals,
    #[serde(rename = "BLK")]  Blocks,
    #[serde(rename = "TOV")]  Turnovers,
    #[serde(rename = "3P")]   ThreesMade,
    #[serde(rename = "3PA")]  ThreesAttempted,
    #[serde(rename = "2P")]   TwosMade,
    #[serde(rename = "2PA")]  TwosAttempted,
    #[serde(rename = "FT")]   FreeThrowsMade,
    #[serde(rename = "FTA")]  FreeThrowsAttempted,
}

impl Stat {
    pub const ALL: [Stat; STAT_COUNT] = [
        Stat::Games, Stat::Minutes, Stat::Points, Stat::Assists, Stat::Rebounds,
        Stat::Steals, Stat::Blocks, Stat::Turnovers, Stat::ThreesMade, Stat::ThreesAttempted,
        Stat::TwosMade, Stat::TwosAttempted, Stat::FreeThrowsMade, Stat::FreeThrowsAttempted,
    ];

    /// Column code used in box-score tables.
    pub fn code(self) -> &'static str {
        match self {
            Stat::Games => "G",
            Stat::Minutes => "MP",
            Stat::Points => "PTS",
            Stat::Assists => "AST",
            Stat::Rebounds => "TRB",
            Stat::Steals => "STL",
            Stat::Blocks => "BLK",
            Stat::Turnovers => "TOV",
            Stat::ThreesMade => "3P",
            Stat::ThreesAttempted => "3PA",
            Stat::TwosMade => "2P",
            Stat::TwosAttempted => "2PA",
            Stat::FreeThrowsMade => "FT",
            Stat::FreeThrowsAttempted => "FTA",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Stat {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stat::ALL
            .into_iter()
            .find(|stat| stat.code() == s)
            .ok_or_else(|| format!("Unknown stat: {}", s))
    }
}

/// One value per `Stat`, indexed by `Stat::index`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatLine([f64; STAT_COUNT]);

impl StatLine {
    pub fn new(values: [f64; STAT_COUNT]) -> Self {
        StatLine(values)
    }

    pub fn get(&self, stat: Stat) -> f64 {
        self.0[stat.index()]
    }

    pub fn set(&mut self, stat: Stat, value: f64) {
        self.0[stat.index()] = value;
    }

    pub fn values(&self) -> &[f64; STAT_COUNT] {
        &self.0
    }

    /// Arithmetic mean of `lines`; all zeros when `lines` is empty.
    pub fn mean<'a>(lines: impl IntoIterator<Item = &'a StatLine>) -> StatLine {
        let mut sum = [0.0; STAT_COUNT];
        let mut count = 0usize;
        for line in lines {
            for (acc, v) in sum.iter_mut().zip(line.0.iter()) {
                *acc += v;
            }
            count += 1;
        }
        if count > 0 {
            for acc in sum.iter_mut() {
                *acc /= count as f64;
            }
        }
        StatLine(sum)
    }
}

/// Ordinal age group by athletic prime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeCategory { Premature, Young, Prime, Veteran, Old }

impl AgeCategory {
    pub const ALL: [AgeCategory; 5] = [
        AgeCategory::Premature,
        AgeCategory::Young,
        AgeCategory::Prime,
        AgeCategory::Veteran,
        AgeCategory::Old,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AgeCategory::Premature => "Premature",
            AgeCategory::Young => "Young",
            AgeCategory::Prime => "Prime",
            AgeCategory::Veteran => "Veteran",
            AgeCategory::Old => "Old",
        }
    }
}

impl fmt::Display for AgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AgeCategory {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Premature" => Ok(AgeCategory::Premature),
            "Young"     => Ok(AgeCategory::Young),
            "Prime"     => Ok(AgeCategory::Prime),
            "Veteran"   => Ok(AgeCategory::Veteran),
            "Old"       => Ok(AgeCategory::Old),
            _ => Err(format!("Unknown age category: {}", s)),
        }
    }
}

/// Half-open bin edges, one more edge than `AgeCategory::ALL` has labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeBins {
    pub edges: Vec<i32>,
}

impl Default for AgeBins {
    fn default() -> Self {
        AgeBins { edges: vec![0, 20, 25, 31, 35, 40] }
    }
}

impl AgeBins {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.edges.len() != AgeCategory::ALL.len() + 1 {
            return Err(format!(
                "age bins need {} edges, got {}",
                AgeCategory::ALL.len() + 1,
                self.edges.len()
            ));
        }
        if self.edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err("age bin edges must be strictly increasing".to_string());
        }
        Ok(())
    }

    pub fn min(&self) -> i32 {
        self.edges.first().copied().unwrap_or(0)
    }

    pub fn max(&self) -> i32 {
        self.edges.last().copied().unwrap_or(0)
    }

    /// Category whose bin `[lo, hi)` contains `age`, or `None` outside the edges.
    pub fn bucketize(&self, age: i32) -> Option<AgeCategory> {
        self.edges
            .windows(2)
            .zip(AgeCategory::ALL)
            .find(|(w, _)| w[0] <= age && age < w[1])
            .map(|(_, cat)| cat)
    }
}

/// Fill rule for the position column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryFill {
    MostFrequent,
    Fixed(String),
}

/// Fill rule for numeric columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericFill {
    Median,
    Zero,
    Fixed(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingValuePolicy {
    pub position: CategoryFill,
    pub age: NumericFill,
    pub stats: NumericFill,
}

impl Default for MissingValuePolicy {
    fn default() -> Self {
        MissingValuePolicy {
            position: CategoryFill::MostFrequent,
            age: NumericFill::Median,
            stats: NumericFill::Zero,
        }
    }
}

/// Record with every missing field filled.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRecord {
    pub player: String,
    pub season: i32,
    pub age: i32,
    pub position: String,
    pub stats: StatLine,
}

/// Cleaned record plus its age category; the unit every later stage consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSeason {
    pub player: String,
    pub season: i32,
    pub age: i32,
    pub position: String,
    pub age_category: AgeCategory,
    pub stats: StatLine,
}

/// Most frequent value; ties go to the value encountered first.
fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (order, v) in values.enumerate() {
        counts.entry(v).or_insert((0, order)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (ca, oa)), (_, (cb, ob))| ca.cmp(cb).then(ob.cmp(oa)))
        .map(|(v, _)| v.to_string())
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn numeric_fill(
    rule: &NumericFill,
    column: &'static str,
    observed: impl Iterator<Item = f64>,
) -> Result<f64> {
    match rule {
        NumericFill::Zero => Ok(0.0),
        NumericFill::Fixed(v) => Ok(*v),
        NumericFill::Median => {
            median(observed.collect()).ok_or(PipelineError::EmptyInput { column })
        }
    }
}

/// Fill missing position, age and statistics according to `policy`.
/// Returns one `CleanRecord` per input record, in input order.
pub fn clean(records: &[RawRecord], policy: &MissingValuePolicy) -> Result<Vec<CleanRecord>> {
    if records.is_empty() {
        return Err(PipelineError::EmptyInput { column: "Pos" });
    }

    let position_fill = if records.iter().any(|r| r.pos.is_none()) {
        match &policy.position {
            CategoryFill::Fixed(v) => v.clone(),
            CategoryFill::MostFrequent => {
                most_frequent(records.iter().filter_map(|r| r.pos.as_deref()))
                    .ok_or(PipelineError::EmptyInput { column: "Pos" })?
            }
        }
    } else {
        String::new()
    };

    let age_fill = if records.iter().any(|r| r.age.is_none()) {
        numeric_fill(&policy.age, "Age", records.iter().filter_map(|r| r.age))?
    } else {
        0.0
    };

    // per-stat fill values, only resolved for columns that need one
    let mut stat_fill = [0.0; STAT_COUNT];
    for stat in Stat::ALL {
        if records.iter().any(|r| r.stat(stat).is_none()) {
            stat_fill[stat.index()] = numeric_fill(
                &policy.stats,
                stat.code(),
                records.iter().filter_map(|r| r.stat(stat)),
            )?;
        }
    }

    let cleaned: Vec<CleanRecord> = records
        .iter()
        .map(|r| {
            let mut stats = StatLine::default();
            for stat in Stat::ALL {
                stats.set(stat, r.stat(stat).unwrap_or(stat_fill[stat.index()]));
            }
            CleanRecord {
                player: r.player.clone(),
                season: r.season,
                age: r.age.unwrap_or(age_fill).trunc() as i32,
                position: r.pos.clone().unwrap_or_else(|| position_fill.clone()),
                stats,
            }
        })
        .collect();

    debug!(filled_position = %position_fill, filled_age = age_fill, "cleaned records");
    Ok(cleaned)
}

/// Merge rows sharing (player, season) into a single season line: games are
/// summed, other stats and age averaged, position taken from the stint with
/// the most games.
pub fn consolidate_stints(records: &[CleanRecord]) -> Vec<CleanRecord> {
    let mut order: Vec<(String, i32)> = Vec::new();
    let mut stints: HashMap<(String, i32), Vec<&CleanRecord>> = HashMap::new();
    for r in records {
        let key = (r.player.clone(), r.season);
        stints
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(r);
    }

    order
        .into_iter()
        .filter_map(|key| stints.remove(&key))
        .map(|group| {
            if let [only] = group.as_slice() {
                return (*only).clone();
            }
            let mut stats = StatLine::mean(group.iter().map(|r| &r.stats));
            stats.set(Stat::Games, group.iter().map(|r| r.stats.get(Stat::Games)).sum());
            let age = group.iter().map(|r| r.age as f64).sum::<f64>() / group.len() as f64;
            // first stint wins ties on games played
            let main = group.iter().copied().fold(group[0], |best, r| {
                if r.stats.get(Stat::Games) > best.stats.get(Stat::Games) { r } else { best }
            });
            CleanRecord {
                player: main.player.clone(),
                season: main.season,
                age: age.trunc() as i32,
                position: main.position.clone(),
                stats,
            }
        })
        .collect()
}

/// Attach an age category to every record; an age outside the bins aborts.
pub fn categorize(records: Vec<CleanRecord>, bins: &AgeBins) -> Result<Vec<PlayerSeason>> {
    records
        .into_iter()
        .map(|r| {
            let age_category = bins.bucketize(r.age).ok_or_else(|| PipelineError::AgeOutOfRange {
                player: r.player.clone(),
                season: r.season,
                age: r.age,
                min: bins.min(),
                max: bins.max(),
            })?;
            Ok(PlayerSeason {
                player: r.player,
                season: r.season,
                age: r.age,
                position: r.position,
                age_category,
                stats: r.stats,
            })
        })
        .collect()
}

/// Helper to fetch, clean, optionally consolidate and bucketize a league.
pub fn load_records(store: &dyn RecordStore, config: &Config) -> Result<Vec<PlayerSeason>> {
    let raw = store.fetch_all()?;
    let mut cleaned = clean(&raw, &config.missing)?;
    if config.data.consolidate_stints {
        let before = cleaned.len();
        cleaned = consolidate_stints(&cleaned);
        info!(before, after = cleaned.len(), "consolidated multi-team stints");
    }
    let records = categorize(cleaned, &config.age_bins)?;
    info!(records = records.len(), "prepared player seasons");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(player: &str, season: i32, age: Option<f64>, pos: Option<&str>) -> RawRecord {
        RawRecord {
            player: player.to_string(),
            season,
            age,
            pos: pos.map(str::to_string),
            ..RawRecord::default()
        }
    }

    #[test]
    fn test_missing_position_takes_batch_mode() {
        let records = vec![
            raw("A", 2020, Some(24.0), None),
            raw("B", 2020, Some(27.0), Some("PG")),
            raw("C", 2020, Some(30.0), Some("PG")),
        ];
        let cleaned = clean(&records, &MissingValuePolicy::default()).unwrap();
        assert_eq!(cleaned.len(), 3);
        assert_eq!(cleaned[0].position, "PG");
    }

    #[test]
    fn test_mode_ties_go_to_first_seen() {
        let records = vec![
            raw("A", 2020, Some(24.0), Some("SF")),
            raw("B", 2020, Some(27.0), Some("C")),
            raw("C", 2020, Some(30.0), Some("C")),
            raw("D", 2020, Some(30.0), Some("SF")),
            raw("E", 2020, Some(30.0), None),
        ];
        let cleaned = clean(&records, &MissingValuePolicy::default()).unwrap();
        assert_eq!(cleaned[4].position, "SF");
    }

    #[test]
    fn test_missing_age_takes_median_and_stats_zero() {
        let mut with_stat = raw("C", 2020, Some(31.0), Some("C"));
        with_stat.pts = Some(12.5);
        let records = vec![
            raw("A", 2020, Some(22.0), Some("PG")),
            raw("B", 2020, None, Some("SG")),
            with_stat,
            raw("D", 2020, Some(25.0), Some("PF")),
        ];
        let cleaned = clean(&records, &MissingValuePolicy::default()).unwrap();
        // median of 22, 25, 31
        assert_eq!(cleaned[1].age, 25);
        assert_eq!(cleaned[0].stats.get(Stat::Points), 0.0);
        assert_eq!(cleaned[2].stats.get(Stat::Points), 12.5);
    }

    #[test]
    fn test_injected_policy_overrides_dataset_statistics() {
        let records = vec![
            raw("A", 2020, None, None),
            raw("B", 2020, Some(30.0), Some("C")),
        ];
        let policy = MissingValuePolicy {
            position: CategoryFill::Fixed("SF".into()),
            age: NumericFill::Fixed(21.0),
            stats: NumericFill::Fixed(1.0),
        };
        let cleaned = clean(&records, &policy).unwrap();
        assert_eq!(cleaned[0].position, "SF");
        assert_eq!(cleaned[0].age, 21);
        assert_eq!(cleaned[0].stats.get(Stat::Blocks), 1.0);
    }

    #[test]
    fn test_empty_input_fails_fast() {
        let err = clean(&[], &MissingValuePolicy::default()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput { .. }));
    }

    #[test]
    fn test_all_positions_missing_has_no_mode() {
        let records = vec![raw("A", 2020, Some(24.0), None)];
        let err = clean(&records, &MissingValuePolicy::default()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput { column: "Pos" }));
    }

    #[test]
    fn test_bucketize_boundaries() {
        let bins = AgeBins::default();
        assert_eq!(bins.bucketize(0), Some(AgeCategory::Premature));
        assert_eq!(bins.bucketize(19), Some(AgeCategory::Premature));
        assert_eq!(bins.bucketize(20), Some(AgeCategory::Young));
        assert_eq!(bins.bucketize(25), Some(AgeCategory::Prime));
        assert_eq!(bins.bucketize(30), Some(AgeCategory::Prime));
        assert_eq!(bins.bucketize(31), Some(AgeCategory::Veteran));
        assert_eq!(bins.bucketize(35), Some(AgeCategory::Old));
        assert_eq!(bins.bucketize(39), Some(AgeCategory::Old));
        assert_eq!(bins.bucketize(40), None);
        assert_eq!(bins.bucketize(-1), None);
    }

    #[test]
    fn test_categorize_rejects_out_of_range_age() {
        let records = vec![CleanRecord {
            player: "Vet".into(),
            season: 2021,
            age: 40,
            position: "C".into(),
            stats: StatLine::default(),
        }];
        let err = categorize(records, &AgeBins::default()).unwrap_err();
        assert!(matches!(err, PipelineError::AgeOutOfRange { age: 40, .. }));
    }

    #[test]
    fn test_consolidate_stints_merges_traded_player() {
        let mut first = CleanRecord {
            player: "T".into(),
            season: 2022,
            age: 27,
            position: "SG".into(),
            stats: StatLine::default(),
        };
        first.stats.set(Stat::Games, 20.0);
        first.stats.set(Stat::Points, 10.0);
        let mut second = first.clone();
        second.position = "SF".into();
        second.stats.set(Stat::Games, 40.0);
        second.stats.set(Stat::Points, 16.0);
        let other = CleanRecord { player: "U".into(), ..first.clone() };

        let merged = consolidate_stints(&[first, other, second]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].player, "T");
        assert_eq!(merged[0].position, "SF");
        assert_eq!(merged[0].stats.get(Stat::Games), 60.0);
        assert_eq!(merged[0].stats.get(Stat::Points), 13.0);
        assert_eq!(merged[1].player, "U");
    }

    #[test]
    fn test_load_records_from_memory_store() {
        let store: Vec<RawRecord> = vec![
            raw("T", 2022, Some(24.0), Some("PG")),
            raw("T", 2022, Some(24.0), Some("SF")),
            raw("U", 2022, Some(33.0), None),
        ];
        let mut config = Config::default();
        assert!(matches!(
            crate::window::group_by_player(&load_records(&store, &config).unwrap()),
            Err(PipelineError::DuplicateSeason { season: 2022, .. })
        ));

        config.data.consolidate_stints = true;
        let records = load_records(&store, &config).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].position, "PG");
        assert_eq!(records[0].age_category, AgeCategory::Young);
        assert_eq!(records[1].age_category, AgeCategory::Veteran);
    }

    #[test]
    fn test_stat_codes_parse_back() {
        for stat in Stat::ALL {
            assert_eq!(stat.code().parse::<Stat>().unwrap(), stat);
        }
        assert!("XYZ".parse::<Stat>().is_err());
    }
}
