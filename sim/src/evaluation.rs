//! Truth matching of found tracks: efficiency, fake and duplicate rates,
//! momentum resolution.

use crate::gun::Event;
use detector_models::MeasurementId;
use finder_core::Track;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Share of a track's measurements that must come from one particle for
/// the track to be matched to it.
pub const MIN_PURITY: f64 = 0.75;

/// Accumulated truth-matching statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TruthMetrics {
    pub n_events: u64,
    pub n_tracks: u64,
    /// Particles with at least `min_clusters` measurements
    pub reconstructable: u64,
    /// Reconstructable particles with a matched track
    pub found: u64,
    /// Matched tracks beyond the first per particle
    pub duplicates: u64,
    /// Tracks matched to no particle
    pub fakes: u64,
    /// Sum of squared relative pT errors of matched tracks
    pub sum_sq_pt_err: f64,
    pub n_matched: u64,
}

impl TruthMetrics {
    /// found / reconstructable
    pub fn efficiency(&self) -> f64 {
        if self.reconstructable == 0 {
            return 0.0;
        }
        self.found as f64 / self.reconstructable as f64
    }

    /// fakes / tracks
    pub fn fake_rate(&self) -> f64 {
        if self.n_tracks == 0 {
            return 0.0;
        }
        self.fakes as f64 / self.n_tracks as f64
    }

    pub fn duplicate_rate(&self) -> f64 {
        if self.n_tracks == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.n_tracks as f64
    }

    /// Root-mean-square of (pT_track − pT_true) / pT_true.
    pub fn pt_resolution(&self) -> f64 {
        if self.n_matched == 0 {
            return 0.0;
        }
        (self.sum_sq_pt_err / self.n_matched as f64).sqrt()
    }

    /// Accumulate one event.
    pub fn accumulate(&mut self, event: &Event, tracks: &[Track], min_clusters: usize) {
        self.n_events += 1;
        self.n_tracks += tracks.len() as u64;

        let owner: HashMap<MeasurementId, usize> = event
            .particles
            .iter()
            .enumerate()
            .flat_map(|(p, particle)| particle.measurements.iter().map(move |&m| (m, p)))
            .collect();

        let mut matches = vec![0u32; event.particles.len()];
        for track in tracks {
            let Some(p) = match_track(track, &owner) else {
                self.fakes += 1;
                continue;
            };
            matches[p] += 1;
            let truth = event.particles[p].pt;
            if truth > 0.0 {
                let rel = (track.pt() - truth) / truth;
                self.sum_sq_pt_err += rel * rel;
                self.n_matched += 1;
            }
        }

        for (particle, &n) in event.particles.iter().zip(&matches) {
            self.duplicates += u64::from(n.saturating_sub(1));
            if particle.measurements.len() < min_clusters {
                continue;
            }
            self.reconstructable += 1;
            if n > 0 {
                self.found += 1;
            }
        }
    }

    pub fn merge(mut self, other: &TruthMetrics) -> Self {
        self.n_events += other.n_events;
        self.n_tracks += other.n_tracks;
        self.reconstructable += other.reconstructable;
        self.found += other.found;
        self.duplicates += other.duplicates;
        self.fakes += other.fakes;
        self.sum_sq_pt_err += other.sum_sq_pt_err;
        self.n_matched += other.n_matched;
        self
    }
}

/// Particle owning at least [`MIN_PURITY`] of the track's measurements.
fn match_track(track: &Track, owner: &HashMap<MeasurementId, usize>) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    let mut total = 0;
    for id in track.measurement_ids() {
        total += 1;
        if let Some(&p) = owner.get(&id) {
            *counts.entry(p).or_default() += 1;
        }
    }
    let (p, n) = counts.into_iter().max_by_key(|&(p, n)| (n, std::cmp::Reverse(p)))?;
    (n as f64 >= MIN_PURITY * total as f64).then_some(p)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gun::TruthParticle;
    use approx::assert_abs_diff_eq;
    use finder_core::{PatternHoleSearchOutcome, PatternInfo, ResultCode, TrackState, TrackStateKind};

    fn particle(id: u64, ids: std::ops::RangeInclusive<u64>) -> TruthParticle {
        TruthParticle {
            id,
            pt: 2000.0,
            phi: 0.0,
            theta: 1.0,
            charge: 1.0,
            z0: 0.0,
            measurements: ids.map(MeasurementId).collect(),
        }
    }

    fn track(ids: &[u64]) -> Track {
        Track {
            states: ids
                .iter()
                .map(|&id| TrackState {
                    element: None,
                    kind: TrackStateKind::Measurement,
                    parameters: None,
                    measurement: Some(MeasurementId(id)),
                    measured: None,
                    fit: None,
                    material: None,
                })
                .collect(),
            fit_quality: None,
            hole_search: PatternHoleSearchOutcome::default(),
            result: ResultCode::Success,
            info: PatternInfo::default(),
        }
    }

    #[test]
    fn test_matching_counts_found_fakes_and_duplicates() {
        let event = Event {
            particles: vec![particle(0, 1..=8), particle(1, 11..=18), particle(2, 21..=23)],
            ..Default::default()
        };
        let tracks = vec![
            track(&[1, 2, 3, 4, 5, 6, 7, 8]),
            // 7 of 8 from particle 0
            track(&[1, 2, 3, 4, 5, 6, 7, 99]),
            // half and half
            track(&[11, 12, 13, 14, 1, 2, 3, 4]),
        ];
        let mut m = TruthMetrics::default();
        m.accumulate(&event, &tracks, 7);

        assert_eq!(m.n_tracks, 3);
        assert_eq!(m.reconstructable, 2);
        assert_eq!(m.found, 1);
        assert_eq!(m.duplicates, 1);
        assert_eq!(m.fakes, 1);
        assert_abs_diff_eq!(m.efficiency(), 0.5);
        assert_abs_diff_eq!(m.fake_rate(), 1.0 / 3.0, epsilon = 1e-12);
        // tracks without parameters report pT zero
        assert_abs_diff_eq!(m.pt_resolution(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_single_muons_are_found() {
        use crate::scenarios::{Scenario, ScenarioKind};
        use finder_core::{ClaimIndex, CombinatorialFinder, FinderData};

        let scenario = Scenario::build(ScenarioKind::SingleMuon, 1);
        let finder = CombinatorialFinder::new(scenario.config.clone());
        let mut metrics = TruthMetrics::default();
        for event in scenario.generate() {
            let index = event.index();
            let mut data = FinderData::new();
            let mut claims = ClaimIndex::new();
            let tracks = finder
                .find_tracks(&mut data, &event.seeds, &index, &mut claims)
                .unwrap();
            metrics.accumulate(&event, &tracks, 7);
        }
        assert_eq!(metrics.n_events, 20);
        assert!(metrics.efficiency() > 0.8, "efficiency {}", metrics.efficiency());
        assert!(metrics.fake_rate() < 0.2);
        assert!(metrics.pt_resolution() < 0.2);
    }

    #[test]
    fn test_empty_metrics_have_zero_rates() {
        let m = TruthMetrics::default();
        assert_eq!(m.efficiency(), 0.0);
        assert_eq!(m.fake_rate(), 0.0);
        assert_eq!(m.pt_resolution(), 0.0);
        let merged = m.clone().merge(&TruthMetrics {
            n_events: 2,
            fakes: 1,
            n_tracks: 4,
            ..Default::default()
        });
        assert_eq!(merged.n_events, 2);
        assert_abs_diff_eq!(merged.fake_rate(), 0.25);
    }
}
