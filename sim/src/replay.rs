//! Replay: serialize/deserialize generated events for offline reruns.

use crate::gun::Event;
use finder_core::FinderConfig;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A recorded scenario run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    /// Finder configuration the events were generated for
    pub config: FinderConfig,
    pub events: Vec<Event>,
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{Scenario, ScenarioKind};

    #[test]
    fn test_replay_file_restores_events() {
        let scenario = Scenario::build(ScenarioKind::SingleMuon, 3);
        let log = ReplayLog {
            scenario_name: scenario.name.clone(),
            seed: scenario.seed,
            config: scenario.config.clone(),
            events: scenario.generate(),
        };
        let path = std::env::temp_dir().join(format!("sitrack_replay_{}.json", std::process::id()));
        save_replay(&log, &path).unwrap();
        let back = load_replay(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.scenario_name, "single_muon");
        assert_eq!(back.config, log.config);
        assert_eq!(back.events.len(), log.events.len());
        assert_eq!(back.events[0].seeds.len(), log.events[0].seeds.len());
        assert_eq!(
            back.events[0].particles[0].measurements,
            log.events[0].particles[0].measurements
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_replay(Path::new("/nonexistent/sitrack/replay.json")).is_err());
    }
}
