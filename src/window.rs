//! Trailing-window summaries of prior seasons.
//!
//! Both modes share [`window_before`]: the up-to-N most recent seasons
//! strictly before a reference season are averaged stat by stat, and the
//! categorical attributes are copied from the newest of them.
//!
//! * Training: one window per player-season row, referenced on that row's
//!   own season, so a training example never averages the season it is
//!   trained to predict.
//! * Inference: one window per player, referenced on the requested season.

use crate::error::{PipelineError, Result};
use crate::preprocess::{AgeCategory, PlayerSeason, Stat, StatLine};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Column prefix separating window averages from a season's own values.
pub const WINDOW_PREFIX: &str = "pl_avg_";

pub fn window_column(stat: Stat) -> String {
    format!("{}{}", WINDOW_PREFIX, stat.code())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub player: String,
    /// Season the window was computed relative to (exclusive upper bound).
    pub reference_season: i32,
    /// Number of prior seasons averaged; zero means no usable history.
    pub seasons_used: usize,
    pub averages: StatLine,
    pub position: String,
    pub age_category: AgeCategory,
}

impl WindowSummary {
    pub fn average(&self, stat: Stat) -> f64 {
        self.averages.get(stat)
    }

    pub fn has_history(&self) -> bool {
        self.seasons_used > 0
    }
}

/// Why a player ended up without a usable feature row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GapReason {
    NoPriorHistory,
    NoPredecessorSeason,
    UnknownCategory { feature: String, value: String },
}

impl GapReason {
    pub fn code(&self) -> &'static str {
        match self {
            GapReason::NoPriorHistory => "no_prior_history",
            GapReason::NoPredecessorSeason => "no_predecessor_season",
            GapReason::UnknownCategory { .. } => "unknown_category",
        }
    }
}

/// A player-season for which no feature row (and so no prediction) exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageGap {
    pub player: String,
    pub season: i32,
    #[serde(flatten)]
    pub reason: GapReason,
}

/// A player's seasons sorted newest first, with unique season numbers.
#[derive(Debug, Clone)]
pub struct PlayerHistory<'a> {
    pub player: &'a str,
    pub seasons: Vec<&'a PlayerSeason>,
}

/// Group records by player. Season ties within a player are an integrity
/// error: the newest-first ordering the window relies on would be undefined.
pub fn group_by_player(records: &[PlayerSeason]) -> Result<BTreeMap<&str, PlayerHistory<'_>>> {
    let mut groups: BTreeMap<&str, PlayerHistory<'_>> = BTreeMap::new();
    for r in records {
        groups
            .entry(r.player.as_str())
            .or_insert_with(|| PlayerHistory { player: r.player.as_str(), seasons: Vec::new() })
            .seasons
            .push(r);
    }
    for history in groups.values_mut() {
        history.seasons.sort_by(|a, b| b.season.cmp(&a.season));
        if let Some(pair) = history.seasons.windows(2).find(|w| w[0].season == w[1].season) {
            return Err(PipelineError::DuplicateSeason {
                player: history.player.to_string(),
                season: pair[0].season,
            });
        }
    }
    Ok(groups)
}

/// Window over the up-to-`n` most recent seasons strictly before `reference`.
/// `None` when the player has no season before `reference`.
pub fn window_before(history: &PlayerHistory<'_>, reference: i32, n: usize) -> Option<WindowSummary> {
    let recent: Vec<&PlayerSeason> = history
        .seasons
        .iter()
        .copied()
        .filter(|s| s.season < reference)
        .take(n)
        .collect();
    let newest = recent.first()?;
    Some(WindowSummary {
        player: history.player.to_string(),
        reference_season: reference,
        seasons_used: recent.len(),
        averages: StatLine::mean(recent.iter().map(|s| &s.stats)),
        position: newest.position.clone(),
        age_category: newest.age_category,
    })
}

/// Window summaries indexed by player for constant-time merge lookups.
#[derive(Debug, Clone, Default)]
pub struct WindowArena {
    summaries: HashMap<String, WindowSummary>,
}

impl WindowArena {
    pub fn get(&self, player: &str) -> Option<&WindowSummary> {
        self.summaries.get(player)
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

impl FromIterator<WindowSummary> for WindowArena {
    fn from_iter<I: IntoIterator<Item = WindowSummary>>(iter: I) -> Self {
        WindowArena {
            summaries: iter.into_iter().map(|s| (s.player.clone(), s)).collect(),
        }
    }
}

/// One window per player relative to `target_season`. Players with no season
/// before the target get an all-zero summary (`seasons_used == 0`) carrying
/// the categorical attributes of their most recent known record.
pub fn aggregate_inference(records: &[PlayerSeason], target_season: i32, n: usize) -> Result<WindowArena> {
    let groups = group_by_player(records)?;
    let arena: WindowArena = groups
        .values()
        .filter_map(|history| {
            window_before(history, target_season, n).or_else(|| {
                let latest = history.seasons.first()?;
                debug!(player = history.player, target_season, "no prior seasons, zero window");
                Some(WindowSummary {
                    player: history.player.to_string(),
                    reference_season: target_season,
                    seasons_used: 0,
                    averages: StatLine::default(),
                    position: latest.position.clone(),
                    age_category: latest.age_category,
                })
            })
        })
        .collect();
    info!(players = arena.len(), target_season, window = n, "computed inference windows");
    Ok(arena)
}

/// A season row paired with the window of seasons before it.
#[derive(Debug, Clone)]
pub struct TrainingWindow<'a> {
    pub row: &'a PlayerSeason,
    pub window: WindowSummary,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingWindows<'a> {
    pub examples: Vec<TrainingWindow<'a>>,
    pub gaps: Vec<CoverageGap>,
}

/// One window per player-season row, excluding the row's own season.
/// A row with no earlier season is a data gap and is reported, not defaulted.
pub fn aggregate_training(records: &[PlayerSeason], n: usize) -> Result<TrainingWindows<'_>> {
    let groups = group_by_player(records)?;
    let mut out = TrainingWindows::default();
    for history in groups.values() {
        // oldest first so examples read chronologically per player
        for row in history.seasons.iter().rev() {
            match window_before(history, row.season, n) {
                Some(window) => out.examples.push(TrainingWindow { row, window }),
                None => out.gaps.push(CoverageGap {
                    player: row.player.clone(),
                    season: row.season,
                    reason: GapReason::NoPriorHistory,
                }),
            }
        }
    }
    info!(
        examples = out.examples.len(),
        gaps = out.gaps.len(),
        window = n,
        "computed training windows"
    );
    Ok(out)
}
