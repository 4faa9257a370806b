//! Fundamental types used across the finder.

use nalgebra::{Matrix5, Vector5};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use detector_models::{ElementId, MeasurementId, SurfaceId};

// ---------------------------------------------------------------------------
// Local track parameters: [l1, l2, φ, θ, q/p]
// Units: mm, rad, 1/MeV.
// ---------------------------------------------------------------------------

/// 5-vector of local track parameters
pub type LocalVec = Vector5<f64>;

/// 5×5 covariance of the local parameters
pub type LocalCov = Matrix5<f64>;

pub const LOC1: usize = 0;
pub const LOC2: usize = 1;
pub const PHI: usize = 2;
pub const THETA: usize = 3;
pub const QOP: usize = 4;

/// Conversion constant for curvature: κ[1/mm] = C · B[T] · q/p[1/MeV]
pub const CURVATURE_CONSTANT: f64 = 0.299_792_458;

/// Slots in a trajectory arena
pub const MAX_TRAJECTORY_ELEMENTS: usize = 300;

/// Maximum ranked candidates kept per element and direction
pub const MAX_LINKS: usize = 10;

// ---------------------------------------------------------------------------
// Identifier types
// ---------------------------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

/// Wrap an angle into (−π, π].
pub fn wrap_phi(phi: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut p = phi % two_pi;
    if p > std::f64::consts::PI {
        p -= two_pi;
    } else if p <= -std::f64::consts::PI {
        p += two_pi;
    }
    p
}

/// Transverse momentum (MeV) from local parameters.
pub fn transverse_momentum(par: &LocalVec) -> f64 {
    let qop = par[QOP];
    if qop.abs() < 1e-12 {
        return 1e12;
    }
    (par[THETA].sin() / qop).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_phi() {
        assert_abs_diff_eq!(wrap_phi(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_phi(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_phi(0.3), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_phi(-PI), PI, epsilon = 1e-12);
    }

    #[test]
    fn test_transverse_momentum() {
        let par = LocalVec::new(0.0, 0.0, 0.0, PI / 6.0, 1.0 / 2000.0);
        assert_abs_diff_eq!(transverse_momentum(&par), 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_track_id_display() {
        assert_eq!(TrackId(42).to_string(), "T42");
    }
}
