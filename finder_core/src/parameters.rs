//! Local track parameters expressed on a detector surface.

use crate::noise::{Direction, NoiseState};
use crate::types::{
    transverse_momentum, wrap_phi, LocalCov, LocalVec, LOC1, LOC2, PHI, QOP, THETA,
};
use detector_models::{Measurement, PlaneSurface};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Track state `[l1, l2, φ, θ, q/p]` on a plane, with optional covariance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternParameters {
    pub surface: PlaneSurface,
    pub par: LocalVec,
    pub cov: Option<LocalCov>,
}

impl PatternParameters {
    pub fn new(surface: PlaneSurface, par: LocalVec, cov: Option<LocalCov>) -> Self {
        Self { surface, par, cov }
    }

    /// Parameters from a global position and direction; the position is
    /// projected onto the plane along its normal.
    pub fn from_global(
        surface: PlaneSurface,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        qop: f64,
        cov: Option<LocalCov>,
    ) -> Self {
        let (local, _) = surface.global_to_local(position);
        let d = direction.normalize();
        let par = LocalVec::new(
            local.x,
            local.y,
            d.y.atan2(d.x),
            d.z.clamp(-1.0, 1.0).acos(),
            qop,
        );
        Self::new(surface, par, cov)
    }

    pub fn local_position(&self) -> Vector2<f64> {
        Vector2::new(self.par[LOC1], self.par[LOC2])
    }

    pub fn local_covariance(&self) -> Option<Matrix2<f64>> {
        self.cov.map(|c| c.fixed_view::<2, 2>(0, 0).into_owned())
    }

    pub fn position(&self) -> Vector3<f64> {
        self.surface.local_to_global(&self.local_position())
    }

    /// Unit direction of flight.
    pub fn direction(&self) -> Vector3<f64> {
        let (sp, cp) = self.par[PHI].sin_cos();
        let (st, ct) = self.par[THETA].sin_cos();
        Vector3::new(cp * st, sp * st, ct)
    }

    /// Momentum vector (MeV).
    pub fn momentum(&self) -> Vector3<f64> {
        let qop = self.par[QOP];
        let p = if qop.abs() < 1e-12 { 1e12 } else { 1.0 / qop.abs() };
        self.direction() * p
    }

    pub fn charge(&self) -> f64 {
        if self.par[QOP] < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    pub fn pt(&self) -> f64 {
        transverse_momentum(&self.par)
    }

    /// Replace the covariance with its diagonal scaled by `factor`.
    pub fn diagonalize(&mut self, factor: f64) {
        if let Some(c) = self.cov.as_mut() {
            *c = LocalCov::from_diagonal(&(c.diagonal() * factor));
        }
    }

    /// Add multiple-scattering and energy-loss noise for a step in
    /// `direction`. Noise produced for the other direction has its momentum
    /// correction inverted.
    pub fn add_noise(&mut self, noise: &NoiseState, direction: Direction) {
        if let Some(c) = self.cov.as_mut() {
            c[(PHI, PHI)] += noise.cov_azimuth;
            c[(THETA, THETA)] += noise.cov_polar;
            c[(QOP, QOP)] += noise.cov_qop;
        }
        if direction == noise.direction {
            self.par[QOP] *= noise.correction_qop;
        } else if noise.correction_qop != 0.0 {
            self.par[QOP] /= noise.correction_qop;
        }
    }

    /// Flip the direction of flight, keeping the crossing point.
    pub fn change_direction(&mut self) {
        self.par[PHI] = wrap_phi(self.par[PHI] + PI);
        self.par[THETA] = PI - self.par[THETA];
        self.par[QOP] = -self.par[QOP];
        if let Some(c) = self.cov.as_mut() {
            for i in [THETA, QOP] {
                for j in 0..5 {
                    if j != THETA && j != QOP {
                        c[(i, j)] = -c[(i, j)];
                        c[(j, i)] = -c[(j, i)];
                    }
                }
            }
        }
    }

    /// Seed the local position and its covariance from a measurement,
    /// decoupling it from the angles and momentum.
    pub fn initiate(predicted: &Self, local: &Vector2<f64>, cov: &Matrix2<f64>) -> Self {
        let mut out = *predicted;
        out.par[LOC1] = local.x;
        out.par[LOC2] = local.y;
        let mut c = predicted.cov.unwrap_or_else(LocalCov::identity);
        for i in 0..2 {
            for j in 0..5 {
                c[(i, j)] = 0.0;
                c[(j, i)] = 0.0;
            }
        }
        c.fixed_view_mut::<2, 2>(0, 0).copy_from(cov);
        out.cov = Some(c);
        out
    }

    /// Seed from a measurement using its nominal position and covariance.
    pub fn initiate_from(predicted: &Self, measurement: &Measurement) -> Self {
        Self::initiate(predicted, &measurement.local, &measurement.covariance)
    }

    /// Keep φ in (−π, π] and θ in (0, π).
    pub fn normalize_angles(&mut self) {
        self.par[PHI] = wrap_phi(self.par[PHI]);
        self.par[THETA] = self.par[THETA].clamp(1e-9, PI - 1e-9);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use detector_models::SurfaceId;

    fn plane() -> PlaneSurface {
        PlaneSurface::from_normal(
            SurfaceId(1),
            Vector3::new(50.0, 0.0, 0.0),
            Vector3::x(),
            Vector3::z(),
        )
    }

    #[test]
    fn test_from_global_roundtrip_position() {
        let p = PatternParameters::from_global(
            plane(),
            &Vector3::new(50.0, 3.0, -2.0),
            &Vector3::new(1.0, 0.1, 0.2),
            1e-3,
            None,
        );
        let g = p.position();
        assert_abs_diff_eq!(g.x, 50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.y, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.z, -2.0, epsilon = 1e-12);
        let d = p.direction();
        let expect = Vector3::new(1.0, 0.1, 0.2).normalize();
        assert_abs_diff_eq!(d.x, expect.x, epsilon = 1e-12);
        assert_abs_diff_eq!(d.z, expect.z, epsilon = 1e-12);
    }

    #[test]
    fn test_change_direction_is_involution() {
        let mut cov = LocalCov::identity() * 0.1;
        cov[(THETA, LOC1)] = 0.01;
        cov[(LOC1, THETA)] = 0.01;
        let orig = PatternParameters::new(
            plane(),
            LocalVec::new(1.0, 2.0, 0.4, 1.2, 1e-3),
            Some(cov),
        );
        let mut p = orig;
        p.change_direction();
        assert_abs_diff_eq!(p.direction().dot(&orig.direction()), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.cov.unwrap()[(THETA, LOC1)], -0.01, epsilon = 1e-15);
        p.change_direction();
        assert_abs_diff_eq!(p.par[PHI], orig.par[PHI], epsilon = 1e-12);
        assert_abs_diff_eq!(p.par[QOP], orig.par[QOP], epsilon = 1e-15);
        assert_abs_diff_eq!(p.cov.unwrap()[(THETA, LOC1)], 0.01, epsilon = 1e-15);
    }

    #[test]
    fn test_initiate_decouples_position() {
        let mut cov = LocalCov::identity();
        cov[(LOC1, PHI)] = 0.3;
        cov[(PHI, LOC1)] = 0.3;
        let pred = PatternParameters::new(plane(), LocalVec::new(0.0, 0.0, 0.1, 1.5, 0.0), Some(cov));
        let v = Matrix2::new(1e-4, 0.0, 0.0, 4e-4);
        let p = PatternParameters::initiate(&pred, &Vector2::new(0.5, -0.5), &v);
        let c = p.cov.unwrap();
        assert_abs_diff_eq!(p.par[LOC1], 0.5);
        assert_abs_diff_eq!(c[(LOC1, PHI)], 0.0);
        assert_abs_diff_eq!(c[(LOC2, LOC2)], 4e-4);
        assert_abs_diff_eq!(c[(PHI, PHI)], 1.0);
    }

    #[test]
    fn test_diagonalize_scales() {
        let mut cov = LocalCov::identity() * 2.0;
        cov[(0, 1)] = 0.5;
        cov[(1, 0)] = 0.5;
        let mut p = PatternParameters::new(plane(), LocalVec::zeros(), Some(cov));
        p.diagonalize(10.0);
        let c = p.cov.unwrap();
        assert_abs_diff_eq!(c[(0, 1)], 0.0);
        assert_abs_diff_eq!(c[(3, 3)], 20.0);
    }
}
