//! Particle gun: charged tracks from the beam line, their clusters, noise
//! clusters and one three-pixel seed per track.
//!
//! # Design choices
//! - Tracks are transported with the finder's own propagator, so a perfect
//!   fit reproduces the generated helix up to the cluster smearing.
//! - No scattering or energy loss is simulated; the finder's noise model
//!   only widens its covariance.
//! - Seeds carry the generated parameters with a smeared q/p on the
//!   perigee plane, as a seed maker working on ideal space points would.

use crate::detector::ToyDetector;
use detector_models::{Measurement, MeasurementId, MeasurementIndex, PlaneSurface, SpacePoint, Technology};
use finder_core::propagator::{for_field, Propagator};
use finder_core::types::QOP;
use finder_core::{LocalVec, PatternParameters, RoadSeed, Seed, SeedHits};
use nalgebra::{Vector2, Vector3};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, TAU};

/// Extra distance around a module outline that still puts it on a road (mm).
const ROAD_MARGIN: f64 = 1.0;
/// Pixel space points a seed is made of.
const SEED_POINTS: usize = 3;

/// Kinematics and detector response of one generated event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GunSpec {
    pub n_particles: usize,
    /// Transverse momentum range (MeV)
    pub pt_min: f64,
    pub pt_max: f64,
    /// Largest |cot θ|
    pub cot_theta_max: f64,
    /// Spread of the production point along z (mm)
    pub z0_sigma: f64,
    /// Probability that a crossed module gives a cluster
    pub efficiency: f64,
    /// Probability that any module carries one random cluster
    pub noise_occupancy: f64,
    /// Relative Gaussian smearing of the seed q/p
    pub seed_qop_smear: f64,
    /// Solenoid field (Tesla)
    pub field_tesla: f64,
    /// Particles come in pairs this far apart in φ (rad)
    pub pair_separation: Option<f64>,
}

impl Default for GunSpec {
    fn default() -> Self {
        Self {
            n_particles: 1,
            pt_min: 1000.0,
            pt_max: 20_000.0,
            cot_theta_max: 0.25,
            z0_sigma: 10.0,
            efficiency: 0.99,
            noise_occupancy: 0.0,
            seed_qop_smear: 0.05,
            field_tesla: 2.0,
            pair_separation: None,
        }
    }
}

/// A generated particle and the clusters it left.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TruthParticle {
    pub id: u64,
    /// Transverse momentum (MeV)
    pub pt: f64,
    pub phi: f64,
    pub theta: f64,
    pub charge: f64,
    pub z0: f64,
    /// In path order
    pub measurements: Vec<MeasurementId>,
}

/// Everything the finder sees for one event, plus the truth.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub measurements: Vec<Measurement>,
    pub seeds: Vec<RoadSeed>,
    pub particles: Vec<TruthParticle>,
}

impl Event {
    pub fn index(&self) -> MeasurementIndex {
        MeasurementIndex::from_measurements(self.measurements.iter().cloned())
    }

    pub fn n_noise(&self) -> usize {
        let signal: usize = self.particles.iter().map(|p| p.measurements.len()).sum();
        self.measurements.len() - signal
    }
}

pub struct ParticleGun {
    spec: GunSpec,
    rng: ChaCha8Rng,
    propagator: Box<dyn Propagator>,
    next_measurement: u64,
}

impl ParticleGun {
    pub fn new(spec: GunSpec, seed: u64) -> Self {
        let propagator = for_field(spec.field_tesla);
        Self {
            spec,
            rng: ChaCha8Rng::seed_from_u64(seed),
            propagator,
            next_measurement: 1,
        }
    }

    pub fn spec(&self) -> &GunSpec {
        &self.spec
    }

    /// Generate one event on `detector`. Particles whose seed layers were
    /// missed produce clusters but no seed.
    pub fn generate(&mut self, detector: &ToyDetector) -> Event {
        let mut event = Event::default();
        let mut k = 0;
        while k < self.spec.n_particles {
            let (phi, theta, qop, z0) = self.kinematics();
            self.shoot(detector, &mut event, phi, theta, qop, z0);
            k += 1;
            if let Some(dphi) = self.spec.pair_separation {
                if k < self.spec.n_particles {
                    self.shoot(detector, &mut event, phi + dphi, theta, qop, z0);
                    k += 1;
                }
            }
        }
        self.add_noise(detector, &mut event);
        tracing::debug!(
            particles = event.particles.len(),
            seeds = event.seeds.len(),
            clusters = event.measurements.len(),
            "event generated"
        );
        event
    }

    fn kinematics(&mut self) -> (f64, f64, f64, f64) {
        let spec = &self.spec;
        // flat in 1/pT between the limits
        let inv = 1.0 / spec.pt_max + self.rng.gen::<f64>() * (1.0 / spec.pt_min - 1.0 / spec.pt_max);
        let pt = 1.0 / inv;
        let phi = self.rng.gen::<f64>() * TAU - std::f64::consts::PI;
        let cot = (2.0 * self.rng.gen::<f64>() - 1.0) * spec.cot_theta_max;
        let theta = FRAC_PI_2 - cot.atan();
        let charge = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let qop = charge * theta.sin() / pt;
        let z0 = gauss(&mut self.rng) * spec.z0_sigma;
        (phi, theta, qop, z0)
    }

    fn shoot(&mut self, detector: &ToyDetector, event: &mut Event, phi: f64, theta: f64, qop: f64, z0: f64) {
        let dir = Vector3::new(phi.cos() * theta.sin(), phi.sin() * theta.sin(), theta.cos());
        let perigee = PlaneSurface::transverse_perigee(&dir);
        let start = PatternParameters::new(perigee, LocalVec::new(0.0, z0, phi, theta, qop), None);
        let crossings = detector.crossings(&start, self.propagator.as_ref(), ROAD_MARGIN);

        let mut particle = TruthParticle {
            id: event.particles.len() as u64,
            pt: start.pt(),
            phi,
            theta,
            charge: start.charge(),
            z0,
            measurements: Vec::new(),
        };
        let mut points: Vec<(usize, SpacePoint)> = Vec::new();
        for c in crossings.iter().filter(|c| c.inside) {
            let element = &detector.elements[c.element];
            if element.disabled || !self.rng.gen_bool(self.spec.efficiency.clamp(0.0, 1.0)) {
                continue;
            }
            let layer = detector.layer(c.element);
            let id = self.next_id();
            let m = match layer.technology {
                Technology::Pixel => {
                    let local = Vector2::new(
                        c.local.x + gauss(&mut self.rng) * layer.sigma_x,
                        c.local.y + gauss(&mut self.rng) * layer.sigma_y,
                    );
                    let layer_index = detector.layer_index(c.element);
                    let new_layer = points.iter().all(|(l, _)| *l != layer_index);
                    if points.len() < SEED_POINTS && new_layer {
                        points.push((
                            layer_index,
                            SpacePoint {
                                first: id,
                                second: None,
                                position: element.surface.local_to_global(&local),
                            },
                        ));
                    }
                    Measurement::pixel(id, element.id, local, layer.sigma_x, layer.sigma_y)
                }
                Technology::Strip => Measurement::strip(
                    id,
                    element.id,
                    c.local.x + gauss(&mut self.rng) * layer.sigma_x,
                    layer.sigma_x,
                    element.half_length,
                ),
            };
            particle.measurements.push(m.id);
            event.measurements.push(m);
        }

        if points.len() == SEED_POINTS {
            let mut parameters = start;
            parameters.par[QOP] *= 1.0 + gauss(&mut self.rng) * self.spec.seed_qop_smear;
            event.seeds.push(RoadSeed {
                road: detector.road(&crossings),
                seed: Seed {
                    parameters,
                    hits: SeedHits::SpacePoints(points.into_iter().map(|(_, sp)| sp).collect()),
                },
            });
        } else {
            tracing::trace!(particle = particle.id, "too few pixel layers for a seed");
        }
        event.particles.push(particle);
    }

    fn add_noise(&mut self, detector: &ToyDetector, event: &mut Event) {
        if self.spec.noise_occupancy <= 0.0 {
            return;
        }
        for (i, element) in detector.elements.iter().enumerate() {
            if element.disabled || !self.rng.gen_bool(self.spec.noise_occupancy.min(1.0)) {
                continue;
            }
            let layer = detector.layer(i);
            let x = (2.0 * self.rng.gen::<f64>() - 1.0) * element.half_width;
            let id = self.next_id();
            let m = match layer.technology {
                Technology::Pixel => {
                    let y = (2.0 * self.rng.gen::<f64>() - 1.0) * element.half_length;
                    Measurement::pixel(id, element.id, Vector2::new(x, y), layer.sigma_x, layer.sigma_y)
                }
                Technology::Strip => Measurement::strip(id, element.id, x, layer.sigma_x, element.half_length),
            };
            event.measurements.push(m);
        }
    }

    fn next_id(&mut self) -> MeasurementId {
        let id = MeasurementId(self.next_measurement);
        self.next_measurement += 1;
        id
    }
}

/// Standard normal deviate (Box-Muller).
fn gauss(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_same_seed_same_event() {
        let det = ToyDetector::standard();
        let spec = GunSpec {
            n_particles: 5,
            ..Default::default()
        };
        let a = ParticleGun::new(spec.clone(), 7).generate(&det);
        let b = ParticleGun::new(spec, 7).generate(&det);
        assert_eq!(a, b);
    }

    #[test]
    fn test_perfect_particle_hits_every_layer() {
        let det = ToyDetector::standard();
        let spec = GunSpec {
            n_particles: 1,
            efficiency: 1.0,
            cot_theta_max: 0.0,
            z0_sigma: 0.0,
            ..Default::default()
        };
        let event = ParticleGun::new(spec, 3).generate(&det);
        let particle = &event.particles[0];
        assert_abs_diff_eq!(particle.theta, FRAC_PI_2, epsilon = 1e-12);
        assert!(particle.pt >= 1000.0 && particle.pt <= 20_000.0);
        // one cluster per layer at least, more in the overlaps
        assert!(particle.measurements.len() >= det.layers.len());
        assert_eq!(event.n_noise(), 0);

        assert_eq!(event.seeds.len(), 1);
        let seed = &event.seeds[0].seed;
        assert_eq!(seed.n_space_points(), 3);
        let index = event.index();
        if let SeedHits::SpacePoints(points) = &seed.hits {
            let layers: Vec<usize> = points
                .iter()
                .filter_map(|sp| index.get(sp.first))
                .map(|m| det.layer_index(m.element.0 as usize))
                .collect();
            assert_eq!(layers, vec![0, 1, 2]);
        }
        // the road holds every measured module
        let road = &event.seeds[0].road;
        assert!(event
            .measurements
            .iter()
            .all(|m| road.iter().any(|e| e.id == m.element)));
    }

    #[test]
    fn test_noise_occupancy_adds_clusters() {
        let det = ToyDetector::standard();
        let spec = GunSpec {
            n_particles: 0,
            noise_occupancy: 1.0,
            ..Default::default()
        };
        let event = ParticleGun::new(spec, 1).generate(&det);
        assert_eq!(event.measurements.len(), det.elements.len());
        assert_eq!(event.n_noise(), det.elements.len());
        assert!(event.seeds.is_empty());
    }

    #[test]
    fn test_pairs_share_kinematics() {
        let det = ToyDetector::standard();
        let spec = GunSpec {
            n_particles: 2,
            pair_separation: Some(1e-3),
            ..Default::default()
        };
        let event = ParticleGun::new(spec, 11).generate(&det);
        assert_eq!(event.particles.len(), 2);
        let (a, b) = (&event.particles[0], &event.particles[1]);
        assert_abs_diff_eq!(b.phi - a.phi, 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(a.pt, b.pt, epsilon = 1e-9);
    }

    #[test]
    fn test_gauss_has_unit_spread() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|_| gauss(&mut rng)).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.03);
        assert_abs_diff_eq!(var, 1.0, epsilon = 0.05);
    }
}
