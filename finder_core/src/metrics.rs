//! Finder statistics: per-event seed counters and result-code tallies.

use crate::result::ResultCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters of one event, reset by
/// [`CombinatorialFinder::new_event`](crate::finder::CombinatorialFinder::new_event).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounters {
    /// Seeds handed to the finder
    pub input_seeds: u64,
    /// Seeds whose measurements could be resolved
    pub good_seeds: u64,
    /// Trajectories that initialised
    pub initialized: u64,
    /// Tracks returned
    pub found: u64,
    /// Seeds with measurements off their road
    pub road_bugs: u64,
}

impl EventCounters {
    pub fn add(&mut self, other: &EventCounters) {
        self.input_seeds += other.input_seeds;
        self.good_seeds += other.good_seeds;
        self.initialized += other.initialized;
        self.found += other.found;
        self.road_bugs += other.road_bugs;
    }
}

/// Per-seed outcome flags; several codes can be raised by one seed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedFlags([bool; ResultCode::COUNT]);

impl SeedFlags {
    pub fn raise(&mut self, code: ResultCode) {
        self.0[code.index()] = true;
    }

    pub fn is_raised(&self, code: ResultCode) -> bool {
        self.0[code.index()]
    }

    pub fn clear(&mut self) {
        self.0 = [false; ResultCode::COUNT];
    }

    pub fn raised(&self) -> impl Iterator<Item = ResultCode> + '_ {
        ResultCode::ALL.into_iter().filter(|c| self.is_raised(*c))
    }
}

/// Accumulated statistics over events and workers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinderStatistics {
    pub events: u64,
    pub counters: EventCounters,
    /// Seeds that raised each code, indexed by [`ResultCode::index`]
    pub results: [u64; ResultCode::COUNT],
}

impl FinderStatistics {
    pub fn record(&mut self, flags: &SeedFlags) {
        for code in flags.raised() {
            self.results[code.index()] += 1;
        }
    }

    pub fn count(&self, code: ResultCode) -> u64 {
        self.results[code.index()]
    }

    pub fn merge(mut self, other: &FinderStatistics) -> Self {
        self.events += other.events;
        self.counters.add(&other.counters);
        for (a, b) in self.results.iter_mut().zip(other.results.iter()) {
            *a += b;
        }
        self
    }

    /// Fraction of input seeds that produced a track.
    pub fn efficiency(&self) -> f64 {
        ratio(self.counters.found, self.counters.input_seeds)
    }

    /// Fraction of good seeds whose trajectory initialised.
    pub fn initialization_rate(&self) -> f64 {
        ratio(self.counters.initialized, self.counters.good_seeds)
    }

    /// Tracks per initialised trajectory; above one with alternates.
    pub fn tracks_per_trajectory(&self) -> f64 {
        ratio(self.counters.found, self.counters.initialized)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for FinderStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        let rule = "|-------------------------|--------------|";
        writeln!(f, "{rule}")?;
        writeln!(f, "| Events                  | {:>12} |", self.events)?;
        writeln!(f, "| Input seeds             | {:>12} |", c.input_seeds)?;
        writeln!(f, "| Accepted seeds          | {:>12} |", c.good_seeds)?;
        writeln!(f, "| Initial trajectories    | {:>12} |", c.initialized)?;
        writeln!(f, "| Wrong roads             | {:>12} |", c.road_bugs)?;
        writeln!(f, "| Output tracks           | {:>12} |", c.found)?;
        writeln!(f, "{rule}")?;
        for code in ResultCode::ALL {
            let n = self.count(code);
            if n > 0 {
                writeln!(f, "| {:<23} | {:>12} |", code.as_str(), n)?;
            }
        }
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "| Efficiency              | {:>11.1}% |",
            100.0 * self.efficiency()
        )?;
        write!(
            f,
            "| Tracks per trajectory   | {:>12.2} |",
            self.tracks_per_trajectory()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_flags_count_once_per_seed() {
        let mut flags = SeedFlags::default();
        flags.raise(ResultCode::BremAttempt);
        flags.raise(ResultCode::BremAttempt);
        flags.raise(ResultCode::HoleCut);
        let mut stats = FinderStatistics::default();
        stats.record(&flags);
        assert_eq!(stats.count(ResultCode::BremAttempt), 1);
        assert_eq!(stats.count(ResultCode::HoleCut), 1);
        assert_eq!(stats.count(ResultCode::Success), 0);
        flags.clear();
        assert_eq!(flags.raised().count(), 0);
    }

    #[test]
    fn test_merge_and_ratios() {
        let a = FinderStatistics {
            events: 1,
            counters: EventCounters {
                input_seeds: 10,
                good_seeds: 8,
                initialized: 6,
                found: 3,
                road_bugs: 1,
            },
            ..Default::default()
        };
        let b = FinderStatistics {
            events: 1,
            counters: EventCounters {
                input_seeds: 10,
                good_seeds: 8,
                initialized: 2,
                found: 1,
                road_bugs: 0,
            },
            ..Default::default()
        };
        let total = a.merge(&b);
        assert_eq!(total.events, 2);
        assert_eq!(total.counters.road_bugs, 1);
        assert_abs_diff_eq!(total.efficiency(), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(total.initialization_rate(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(FinderStatistics::default().efficiency(), 0.0);
    }

    #[test]
    fn test_display_lists_raised_codes() {
        let mut stats = FinderStatistics::default();
        let mut flags = SeedFlags::default();
        flags.raise(ResultCode::WrongRoad);
        stats.record(&flags);
        let table = stats.to_string();
        assert!(table.contains("WrongRoad"));
        assert!(!table.contains("HoleCut"));
    }
}
