//! Propagation of local track parameters between planar surfaces.
//!
//! # Design choices
//! - [`StraightLinePropagator`] has an analytic Jacobian and is used when the
//!   magnetic field is off.
//! - [`HelixPropagator`] follows an exact helix in a uniform solenoidal field
//!   B = (0, 0, Bz); the plane intersection is found by Newton iteration and
//!   the Jacobian by central differences.
//! - Propagation is allowed in either direction along the path; the signed
//!   path length is returned as the step.

use crate::parameters::PatternParameters;
use crate::types::{wrap_phi, LocalCov, LocalVec, CURVATURE_CONSTANT, PHI, QOP, THETA};
use detector_models::PlaneSurface;
use nalgebra::{Matrix3x5, Vector3};

/// Longest accepted path between two surfaces (mm).
const MAX_PATH: f64 = 1.0e5;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Result of a successful propagation.
#[derive(Clone, Copy, Debug)]
pub struct Propagation {
    pub parameters: PatternParameters,
    /// Signed path length (mm)
    pub step: f64,
}

pub trait Propagator: Send + Sync {
    /// Move `start` onto `target`. The covariance is transported only when
    /// `with_covariance` is set and `start` carries one.
    fn propagate(
        &self,
        start: &PatternParameters,
        target: &PlaneSurface,
        with_covariance: bool,
    ) -> Option<Propagation>;
}

// ---------------------------------------------------------------------------
// Shared local <-> global helpers
// ---------------------------------------------------------------------------

fn to_local(target: &PlaneSurface, pos: &Vector3<f64>, dir: &Vector3<f64>, qop: f64) -> LocalVec {
    let (loc, _) = target.global_to_local(pos);
    LocalVec::new(
        loc.x,
        loc.y,
        dir.y.atan2(dir.x),
        dir.z.clamp(-1.0, 1.0).acos(),
        qop,
    )
}

/// d(position)/d(local) and d(direction)/d(local) on the start surface.
fn start_derivatives(start: &PatternParameters) -> (Matrix3x5<f64>, Matrix3x5<f64>) {
    let ex = start.surface.axis_x();
    let ey = start.surface.axis_y();
    let (sp, cp) = start.par[PHI].sin_cos();
    let (st, ct) = start.par[THETA].sin_cos();
    let mut dr = Matrix3x5::zeros();
    dr.set_column(0, &ex);
    dr.set_column(1, &ey);
    let mut da = Matrix3x5::zeros();
    da.set_column(PHI, &Vector3::new(-sp * st, cp * st, 0.0));
    da.set_column(THETA, &Vector3::new(cp * ct, sp * ct, -st));
    (dr, da)
}

// ---------------------------------------------------------------------------
// Straight line
// ---------------------------------------------------------------------------

/// Field-free propagation.
#[derive(Clone, Copy, Debug, Default)]
pub struct StraightLinePropagator;

impl Propagator for StraightLinePropagator {
    fn propagate(
        &self,
        start: &PatternParameters,
        target: &PlaneSurface,
        with_covariance: bool,
    ) -> Option<Propagation> {
        let r = start.position();
        let a = start.direction();
        let n = target.normal();
        let na = n.dot(&a);
        if na.abs() < 1e-10 {
            return None;
        }
        let s = n.dot(&(target.center - r)) / na;
        if !s.is_finite() || s.abs() > MAX_PATH {
            return None;
        }
        let r1 = r + a * s;
        let mut par = to_local(target, &r1, &a, start.par[QOP]);
        par[PHI] = wrap_phi(par[PHI]);

        let cov = match (with_covariance, start.cov) {
            (true, Some(c)) => {
                let (dr, da) = start_derivatives(start);
                // ds/dp = -(n·dr/dp + s n·dA/dp) / (n·A)
                let ds = -(n.transpose() * dr + (n.transpose() * da) * s) / na;
                let dr1 = dr + a * ds + da * s;
                let ex = target.axis_x();
                let ey = target.axis_y();
                let txy = a.x * a.x + a.y * a.y;
                let sin_t = txy.sqrt().max(1e-12);
                let mut j = LocalCov::zeros();
                for k in 0..5 {
                    let drk = dr1.column(k);
                    let dak = da.column(k);
                    j[(0, k)] = ex.dot(&drk);
                    j[(1, k)] = ey.dot(&drk);
                    j[(PHI, k)] = (a.x * dak[1] - a.y * dak[0]) / txy.max(1e-24);
                    j[(THETA, k)] = -dak[2] / sin_t;
                }
                j[(QOP, QOP)] = 1.0;
                let out = j * c * j.transpose();
                Some(0.5 * (out + out.transpose()))
            }
            _ => None,
        };
        Some(Propagation {
            parameters: PatternParameters::new(*target, par, cov),
            step: s,
        })
    }
}

// ---------------------------------------------------------------------------
// Helix in a uniform solenoidal field
// ---------------------------------------------------------------------------

/// Exact helix propagation in B = (0, 0, bz).
#[derive(Clone, Copy, Debug)]
pub struct HelixPropagator {
    /// Field along z (Tesla)
    pub bz: f64,
    /// Newton iterations before giving up
    pub max_iterations: usize,
    /// Convergence tolerance on the path length (mm)
    pub tolerance: f64,
}

impl HelixPropagator {
    pub fn new(bz: f64) -> Self {
        Self {
            bz,
            max_iterations: 20,
            tolerance: 1e-6,
        }
    }

    /// Position and direction after path `s` from (r0, a0).
    fn advance(&self, r0: &Vector3<f64>, a0: &Vector3<f64>, qop: f64, s: f64) -> (Vector3<f64>, Vector3<f64>) {
        // dA/ds = C qop (A × B): the transverse direction turns with rate ω
        let omega = -CURVATURE_CONSTANT * qop * self.bz;
        let wt = omega * s;
        if wt.abs() < 1e-9 {
            return (r0 + a0 * s, *a0);
        }
        let (sw, cw) = wt.sin_cos();
        let ax = a0.x * cw - a0.y * sw;
        let ay = a0.x * sw + a0.y * cw;
        let x = r0.x + (a0.x * sw - a0.y * (1.0 - cw)) / omega;
        let y = r0.y + (a0.y * sw + a0.x * (1.0 - cw)) / omega;
        (
            Vector3::new(x, y, r0.z + a0.z * s),
            Vector3::new(ax, ay, a0.z),
        )
    }

    fn intersect(&self, r0: &Vector3<f64>, a0: &Vector3<f64>, qop: f64, target: &PlaneSurface) -> Option<(f64, Vector3<f64>, Vector3<f64>)> {
        let n = target.normal();
        let na = n.dot(a0);
        if na.abs() < 1e-10 {
            return None;
        }
        let mut s = n.dot(&(target.center - r0)) / na;
        for _ in 0..self.max_iterations {
            let (r, a) = self.advance(r0, a0, qop, s);
            let f = n.dot(&(r - target.center));
            let df = n.dot(&a);
            if df.abs() < 1e-10 {
                return None;
            }
            let ds = f / df;
            s -= ds;
            if !s.is_finite() || s.abs() > MAX_PATH {
                return None;
            }
            if ds.abs() < self.tolerance {
                let (r, a) = self.advance(r0, a0, qop, s);
                return Some((s, r, a));
            }
        }
        None
    }

    fn transport(&self, start: &PatternParameters, target: &PlaneSurface) -> Option<(f64, LocalVec)> {
        let r0 = start.position();
        let a0 = start.direction();
        let qop = start.par[QOP];
        let (s, r, a) = self.intersect(&r0, &a0, qop, target)?;
        let mut par = to_local(target, &r, &a, qop);
        par[PHI] = wrap_phi(par[PHI]);
        Some((s, par))
    }
}

impl Propagator for HelixPropagator {
    fn propagate(
        &self,
        start: &PatternParameters,
        target: &PlaneSurface,
        with_covariance: bool,
    ) -> Option<Propagation> {
        let (s, par) = self.transport(start, target)?;
        let cov = match (with_covariance, start.cov) {
            (true, Some(c)) => {
                let steps = [1e-4, 1e-4, 1e-7, 1e-7, 1e-6 * start.par[QOP].abs() + 1e-12];
                let mut j = LocalCov::zeros();
                for k in 0..5 {
                    let mut plus = *start;
                    let mut minus = *start;
                    plus.par[k] += steps[k];
                    minus.par[k] -= steps[k];
                    let (_, pp) = self.transport(&plus, target)?;
                    let (_, pm) = self.transport(&minus, target)?;
                    let mut d = pp - pm;
                    d[PHI] = wrap_phi(d[PHI]);
                    j.set_column(k, &(d / (2.0 * steps[k])));
                }
                let out = j * c * j.transpose();
                Some(0.5 * (out + out.transpose()))
            }
            _ => None,
        };
        Some(Propagation {
            parameters: PatternParameters::new(*target, par, cov),
            step: s,
        })
    }
}

/// Straight-line propagator for a zero field, helix otherwise.
pub fn for_field(bz: f64) -> Box<dyn Propagator> {
    if bz.abs() < 1e-9 {
        Box::new(StraightLinePropagator)
    } else {
        Box::new(HelixPropagator::new(bz))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LOC1, LOC2};
    use approx::assert_abs_diff_eq;
    use detector_models::SurfaceId;

    fn plane_at(x: f64, id: u64) -> PlaneSurface {
        PlaneSurface::from_normal(SurfaceId(id), Vector3::new(x, 0.0, 0.0), Vector3::x(), Vector3::z())
    }

    fn start() -> PatternParameters {
        PatternParameters::from_global(
            plane_at(50.0, 1),
            &Vector3::new(50.0, 5.0, 2.5),
            &Vector3::new(1.0, 0.1, 0.05),
            1.0 / 1000.0,
            Some(LocalCov::identity() * 0.01),
        )
    }

    #[test]
    fn test_straight_line_hits_expected_point() {
        let p = StraightLinePropagator
            .propagate(&start(), &plane_at(90.0, 2), true)
            .expect("propagation");
        let g = p.parameters.position();
        assert_abs_diff_eq!(g.x, 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(g.y, 9.0, epsilon = 1e-9);
        assert_abs_diff_eq!(g.z, 4.5, epsilon = 1e-9);
        assert!(p.step > 40.0);
        let c = p.parameters.cov.expect("covariance");
        assert!(c[(LOC1, LOC1)] > 0.01);
    }

    #[test]
    fn test_straight_line_backwards_step_is_negative() {
        let fwd = StraightLinePropagator.propagate(&start(), &plane_at(90.0, 2), false).unwrap();
        let back = StraightLinePropagator
            .propagate(&fwd.parameters, &plane_at(50.0, 1), false)
            .unwrap();
        assert!(back.step < 0.0);
        assert_abs_diff_eq!(back.parameters.par[LOC1], start().par[LOC1], epsilon = 1e-9);
        assert_abs_diff_eq!(back.parameters.par[LOC2], start().par[LOC2], epsilon = 1e-9);
    }

    #[test]
    fn test_parallel_plane_fails() {
        let side = PlaneSurface::from_normal(SurfaceId(3), Vector3::new(0.0, 0.0, 100.0), Vector3::y(), Vector3::z());
        let mut s = start();
        s.par[PHI] = 0.0;
        s.par[THETA] = std::f64::consts::FRAC_PI_2;
        assert!(StraightLinePropagator.propagate(&s, &side, false).is_none());
    }

    #[test]
    fn test_helix_matches_straight_line_without_field() {
        let h = HelixPropagator::new(0.0).propagate(&start(), &plane_at(130.0, 3), true).unwrap();
        let l = StraightLinePropagator.propagate(&start(), &plane_at(130.0, 3), true).unwrap();
        for k in 0..5 {
            assert_abs_diff_eq!(h.parameters.par[k], l.parameters.par[k], epsilon = 1e-9);
        }
        let (hc, lc) = (h.parameters.cov.unwrap(), l.parameters.cov.unwrap());
        assert_abs_diff_eq!(hc[(LOC1, LOC1)], lc[(LOC1, LOC1)], epsilon = 1e-3);
        assert_abs_diff_eq!(hc[(LOC2, THETA)], lc[(LOC2, THETA)], epsilon = 1e-3);
    }

    #[test]
    fn test_helix_bends_positive_charge_clockwise() {
        let mut s = start();
        s.par[PHI] = 0.0;
        s.par[LOC1] = 0.0;
        let h = HelixPropagator::new(2.0).propagate(&s, &plane_at(250.0, 4), false).unwrap();
        // positive charge in +z field curves towards −y
        assert!(h.parameters.position().y < 0.0);
        assert!(h.parameters.par[PHI] < 0.0);
    }

    #[test]
    fn test_helix_preserves_momentum_magnitude() {
        let h = HelixPropagator::new(2.0).propagate(&start(), &plane_at(250.0, 4), false).unwrap();
        assert_abs_diff_eq!(h.parameters.par[THETA], start().par[THETA], epsilon = 1e-9);
        assert_abs_diff_eq!(h.parameters.par[QOP], start().par[QOP], epsilon = 1e-15);
    }
}
