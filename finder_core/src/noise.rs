//! Material effects: multiple scattering and energy loss per crossed module.
//!
//! # Design choices
//! - Noise is produced once per element and direction and stored with the
//!   element; the next propagation step adds it to the state it starts from.
//! - The momentum correction is a multiplicative factor on q/p for the
//!   direction the noise was produced for (> 1 along the momentum, < 1
//!   against it); stepping the other way divides by it instead.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Particle hypothesis for material effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseModel {
    /// Ionisation loss only
    #[default]
    Muon,
    /// Bremsstrahlung-dominated loss for electrons
    Electron,
}

/// Propagation direction relative to the momentum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Along,
    Opposite,
}

/// Process noise added when crossing a module.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseState {
    /// Variance added to φ (rad²)
    pub cov_azimuth: f64,
    /// Variance added to θ (rad²)
    pub cov_polar: f64,
    /// Variance added to q/p (1/MeV²)
    pub cov_qop: f64,
    /// Factor applied to q/p for a step in `direction`
    pub correction_qop: f64,
    /// Direction the noise was produced for
    pub direction: Direction,
}

impl Default for NoiseState {
    fn default() -> Self {
        Self {
            cov_azimuth: 0.0,
            cov_polar: 0.0,
            cov_qop: 0.0,
            correction_qop: 1.0,
            direction: Direction::Along,
        }
    }
}

/// Material description of a crossed module.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    /// Thickness in radiation lengths at normal incidence
    pub radiation_length: f64,
    /// Relative energy-loss coefficient
    pub energy_loss: f64,
}

impl NoiseState {
    /// Noise for a track with `qop` and global `direction` crossing a plane
    /// with `normal`. Returns the noise and the traversed radiation length.
    pub fn produce(
        model: NoiseModel,
        direction: Direction,
        qop: f64,
        track_dir: &Vector3<f64>,
        normal: &Vector3<f64>,
        material: Material,
    ) -> (Self, f64) {
        let q = qop.abs();
        let cos_incidence = track_dir.dot(normal).abs();
        let path = if cos_incidence < 0.05 {
            20.0
        } else {
            1.0 / cos_incidence
        };
        let rad = path * material.radiation_length;

        let cov_polar = 134.0 * rad * q * q;
        let d = (1.0 - track_dir.z * track_dir.z).max(1e-5);
        let cov_azimuth = cov_polar / d;

        let (cov_qop, mut correction) = match model {
            NoiseModel::Muon => {
                let dp = material.energy_loss * q * path;
                (0.2 * dp * dp * q * q, 1.0 - dp)
            }
            NoiseModel::Electron => (0.09 * q * q, 0.7),
        };
        if direction == Direction::Along {
            correction = 1.0 / correction;
        }
        (
            Self {
                cov_azimuth,
                cov_polar,
                cov_qop,
                correction_qop: correction,
                direction,
            },
            rad,
        )
    }
}

/// Radiation length of the unmodelled services between the pixel and strip
/// systems, as a function of |z| (mm).
pub fn dead_material_radiation_length(z: f64) -> f64 {
    let z = z.abs();
    if z < 50.0 {
        0.0075
    } else if z < 205.0 {
        0.02
    } else if z < 360.0 {
        0.03 + (z - 205.0) * 0.000_129_032
    } else if z < 570.0 {
        0.035 + (z - 360.0) * 9.047_62e-5
    } else if z < 1500.0 {
        0.054 + (z - 570.0) * 1.827_96e-5
    } else if z < 2400.0 {
        0.071 + (z - 1500.0) * 7.142_86e-6
    } else {
        0.078
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
