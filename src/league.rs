// League context: per (position, age) means and spreads of every stat.
use crate::error::Result;
use crate::preprocess::{PlayerSeason, Stat, StatLine, STAT_COUNT};
use csv::WriterBuilder;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct LeagueProfile {
    pub position: String,
    pub age: i32,
    pub samples: usize,
    pub averages: StatLine,
    /// Sample standard deviation (n - 1); zero for single-row groups.
    pub std_devs: StatLine,
}

pub fn profiles(records: &[PlayerSeason]) -> Vec<LeagueProfile> {
    let mut groups: BTreeMap<(&str, i32), Vec<&StatLine>> = BTreeMap::new();
    for r in records {
        groups.entry((r.position.as_str(), r.age)).or_default().push(&r.stats);
    }

    groups
        .into_iter()
        .map(|((position, age), lines)| {
            let averages = StatLine::mean(lines.iter().copied());
            let mut spread = [0.0; STAT_COUNT];
            if lines.len() > 1 {
                for stat in Stat::ALL {
                    let mean = averages.get(stat);
                    let ss: f64 = lines.iter().map(|l| (l.get(stat) - mean).powi(2)).sum();
                    spread[stat.index()] = (ss / (lines.len() - 1) as f64).sqrt();
                }
            }
            LeagueProfile {
                position: position.to_string(),
                age,
                samples: lines.len(),
                averages,
                std_devs: StatLine::new(spread),
            }
        })
        .collect()
}

pub fn write_profiles_csv(path: &Path, profiles: &[LeagueProfile]) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path)?;
    let mut header = vec!["Pos".to_string(), "Age".to_string(), "samples".to_string()];
    header.extend(Stat::ALL.iter().map(|s| format!("lg_{}_avg", s.code())));
    header.extend(Stat::ALL.iter().map(|s| format!("{}_std", s.code())));
    wtr.write_record(&header)?;

    for p in profiles {
        let mut row = vec![p.position.clone(), p.age.to_string(), p.samples.to_string()];
        row.extend(p.averages.values().iter().map(|v| format!("{:.3}", v)));
        row.extend(p.std_devs.values().iter().map(|v| format!("{:.3}", v)));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::AgeCategory;

    fn season(player: &str, pos: &str, age: i32, pts: f64) -> PlayerSeason {
        let mut stats = StatLine::default();
        stats.set(Stat::Points, pts);
        PlayerSeason {
            player: player.into(),
            season: 2021,
            age,
            position: pos.into(),
            age_category: AgeCategory::Prime,
            stats,
        }
    }

    #[test]
    fn test_profiles_group_by_position_and_age() {
        let records = vec![
            season("A", "PG", 27, 10.0),
            season("B", "PG", 27, 14.0),
            season("C", "PG", 27, 18.0),
            season("D", "C", 27, 9.0),
        ];
        let out = profiles(&records);
        assert_eq!(out.len(), 2);
        // ordered by position then age
        assert_eq!(out[0].position, "C");
        assert_eq!(out[0].std_devs.get(Stat::Points), 0.0);

        let pg = &out[1];
        assert_eq!(pg.samples, 3);
        assert_eq!(pg.averages.get(Stat::Points), 14.0);
        assert!((pg.std_devs.get(Stat::Points) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_write_profiles_header() {
        let path = std::env::temp_dir().join("season_forecast_league.csv");
        write_profiles_csv(&path, &profiles(&[season("A", "SF", 24, 7.0)])).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("Pos,Age,samples,lg_G_avg"));
        assert!(header.ends_with("FTA_std"));
    }
}
