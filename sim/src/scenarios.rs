//! Scenario definitions.
//!
//! Each scenario is a named gun setting, a detector state and a finder
//! configuration. All scenarios are deterministic given the same seed.

use crate::detector::ToyDetector;
use crate::gun::{Event, GunSpec, ParticleGun};
use detector_models::ElementId;
use finder_core::FinderConfig;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Which pre-defined scenario to load.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// One high-momentum muon per event, clean detector
    SingleMuon,
    /// 20 tracks per event over the full pT range
    Multi,
    /// 20 tracks with random noise clusters on a fifth of the modules
    Noisy,
    /// Pairs of nearly collinear tracks, alternates enabled
    CloseTracks,
    /// Low cluster efficiency and dead modules; failed tracks are kept
    Inefficient,
    /// 300 tracks per event with noise, scalability stress test
    Dense,
}

/// A fully configured scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    pub n_events: usize,
    pub gun: GunSpec,
    pub config: FinderConfig,
    /// Modules switched off before generation
    pub disabled: Vec<ElementId>,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        let mut config = FinderConfig {
            field_tesla: 2.0,
            ..Default::default()
        };
        let mut disabled = Vec::new();
        let (name, n_events, gun) = match kind {
            ScenarioKind::SingleMuon => (
                "single_muon",
                20,
                GunSpec {
                    n_particles: 1,
                    pt_min: 10_000.0,
                    pt_max: 50_000.0,
                    ..Default::default()
                },
            ),
            ScenarioKind::Multi => (
                "multi",
                10,
                GunSpec {
                    n_particles: 20,
                    pt_min: 600.0,
                    ..Default::default()
                },
            ),
            ScenarioKind::Noisy => (
                "noisy",
                10,
                GunSpec {
                    n_particles: 20,
                    noise_occupancy: 0.2,
                    ..Default::default()
                },
            ),
            ScenarioKind::CloseTracks => {
                config.cuts.multi_tracks = true;
                (
                    "close_tracks",
                    10,
                    GunSpec {
                        n_particles: 20,
                        pt_min: 5000.0,
                        pair_separation: Some(2e-4),
                        ..Default::default()
                    },
                )
            }
            ScenarioKind::Inefficient => {
                config.cuts.return_failed_tracks = true;
                config.cuts.write_hole_search = true;
                let detector = ToyDetector::standard();
                let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1));
                disabled = detector
                    .elements
                    .iter()
                    .filter(|_| rng.gen_bool(0.03))
                    .map(|e| e.id)
                    .collect();
                (
                    "inefficient",
                    10,
                    GunSpec {
                        n_particles: 20,
                        efficiency: 0.85,
                        ..Default::default()
                    },
                )
            }
            ScenarioKind::Dense => (
                "dense",
                3,
                GunSpec {
                    n_particles: 300,
                    pt_min: 600.0,
                    noise_occupancy: 0.05,
                    ..Default::default()
                },
            ),
        };
        config.field_tesla = gun.field_tesla;

        Scenario {
            name: name.into(),
            seed,
            n_events,
            gun,
            config,
            disabled,
        }
    }

    /// The standard barrel with this scenario's modules switched off.
    pub fn detector(&self) -> ToyDetector {
        let mut detector = ToyDetector::standard();
        detector.disable(self.disabled.iter().copied());
        detector
    }

    /// Generate every event of the scenario.
    pub fn generate(&self) -> Vec<Event> {
        let detector = self.detector();
        let mut gun = ParticleGun::new(self.gun.clone(), self.seed);
        (0..self.n_events).map(|_| gun.generate(&detector)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
