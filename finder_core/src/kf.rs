//! Kalman measurement update and forward/backward state combination.
//!
//! # Design choices
//! - Measurements are local positions on the same surface as the predicted
//!   state, so H selects the first one (strip) or two (pixel) parameters.
//! - Updates use the Joseph form for numerical stability.
//! - The χ² returned is that of the predicted residual, r·(V + HCHᵀ)⁻¹·r.

use crate::parameters::PatternParameters;
use crate::types::{wrap_phi, LocalCov, LocalVec, PHI};
use nalgebra::{Matrix2, Matrix2x5, Matrix5x2, Vector2};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Result of a measurement update, kept for diagnostics.
#[derive(Clone, Debug)]
pub struct KfUpdateResult {
    pub parameters: PatternParameters,
    /// χ² of the predicted residual
    pub chi2: f64,
    /// Residual r = m − H·x
    pub innovation: Vector2<f64>,
    /// Residual covariance S = V + H·C·Hᵀ
    pub innovation_cov: Matrix2<f64>,
}

pub trait KalmanUpdator: Send + Sync {
    /// Filter `predicted` with a local measurement of dimension `dim`.
    fn update(
        &self,
        predicted: &PatternParameters,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
        dim: u32,
    ) -> Option<KfUpdateResult>;

    /// χ² of the predicted residual without updating.
    fn chi2(
        &self,
        predicted: &PatternParameters,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
        dim: u32,
    ) -> Option<f64>;

    /// Weighted mean of two independent estimates on the same surface.
    fn combine(&self, a: &PatternParameters, b: &PatternParameters) -> Option<PatternParameters>;
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

/// Linear updator for local-position measurements.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatternUpdator;

impl PatternUpdator {
    fn residual(
        predicted: &PatternParameters,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
        dim: u32,
    ) -> Option<(Vector2<f64>, Matrix2<f64>)> {
        let c = predicted.cov?;
        let r = local - predicted.local_position();
        let s = cov + c.fixed_view::<2, 2>(0, 0);
        if dim == 1 {
            Some((Vector2::new(r.x, 0.0), Matrix2::new(s[(0, 0)], 0.0, 0.0, 0.0)))
        } else {
            Some((r, s))
        }
    }

    fn chi2_of(r: &Vector2<f64>, s: &Matrix2<f64>, dim: u32) -> Option<f64> {
        if dim == 1 {
            if s[(0, 0)] <= 0.0 {
                return None;
            }
            Some(r.x * r.x / s[(0, 0)])
        } else {
            let si = s.try_inverse()?;
            Some((r.transpose() * si * r)[(0, 0)])
        }
    }
}

impl KalmanUpdator for PatternUpdator {
    fn update(
        &self,
        predicted: &PatternParameters,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
        dim: u32,
    ) -> Option<KfUpdateResult> {
        let c = predicted.cov?;
        let (r, s) = Self::residual(predicted, local, cov, dim)?;
        let chi2 = Self::chi2_of(&r, &s, dim)?;

        // K = C Hᵀ S⁻¹, with the unmeasured column zeroed for strips
        let cht: Matrix5x2<f64> = c.fixed_view::<5, 2>(0, 0).into_owned();
        let (k, v) = if dim == 1 {
            let mut k = Matrix5x2::zeros();
            k.set_column(0, &(cht.column(0) / s[(0, 0)]));
            (k, Matrix2::new(cov[(0, 0)], 0.0, 0.0, 0.0))
        } else {
            (cht * s.try_inverse()?, *cov)
        };

        let mut par: LocalVec = predicted.par + k * r;
        par[PHI] = wrap_phi(par[PHI]);

        let mut h = Matrix2x5::<f64>::zeros();
        h[(0, 0)] = 1.0;
        if dim == 2 {
            h[(1, 1)] = 1.0;
        }
        let ikh = LocalCov::identity() - k * h;
        let joseph = ikh * c * ikh.transpose() + k * v * k.transpose();
        let mut out = PatternParameters::new(
            predicted.surface,
            par,
            Some(0.5 * (joseph + joseph.transpose())),
        );
        out.normalize_angles();

        Some(KfUpdateResult {
            parameters: out,
            chi2,
            innovation: r,
            innovation_cov: s,
        })
    }

    fn chi2(
        &self,
        predicted: &PatternParameters,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
        dim: u32,
    ) -> Option<f64> {
        let (r, s) = Self::residual(predicted, local, cov, dim)?;
        Self::chi2_of(&r, &s, dim)
    }

    fn combine(&self, a: &PatternParameters, b: &PatternParameters) -> Option<PatternParameters> {
        if a.surface.id != b.surface.id {
            return None;
        }
        let (ca, cb) = (a.cov?, b.cov?);
        let w = (ca + cb).try_inverse()?;
        let k = ca * w;
        let mut d = b.par - a.par;
        d[PHI] = wrap_phi(d[PHI]);
        let mut par = a.par + k * d;
        par[PHI] = wrap_phi(par[PHI]);
        let c = ca - k * ca;
        let mut out = PatternParameters::new(a.surface, par, Some(0.5 * (c + c.transpose())));
        out.normalize_angles();
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LOC1, LOC2, THETA};
    use approx::assert_abs_diff_eq;
    use detector_models::{PlaneSurface, SurfaceId};
    use nalgebra::Vector3;

    fn predicted() -> PatternParameters {
        let s = PlaneSurface::from_normal(SurfaceId(1), Vector3::new(50.0, 0.0, 0.0), Vector3::x(), Vector3::z());
        PatternParameters::new(s, LocalVec::new(0.0, 0.0, 0.1, 1.5, 1e-3), Some(LocalCov::identity()))
    }

    #[test]
    fn test_pixel_update_pulls_towards_measurement() {
        let v = Matrix2::identity();
        let res = PatternUpdator.update(&predicted(), &Vector2::new(2.0, -2.0), &v, 2).unwrap();
        assert_abs_diff_eq!(res.parameters.par[LOC1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.parameters.par[LOC2], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.chi2, 4.0, epsilon = 1e-12);
        let c = res.parameters.cov.unwrap();
        assert_abs_diff_eq!(c[(LOC1, LOC1)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(c[(THETA, THETA)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_strip_update_ignores_second_coordinate() {
        let v = Matrix2::new(1.0, 0.0, 0.0, 100.0);
        let res = PatternUpdator.update(&predicted(), &Vector2::new(2.0, 50.0), &v, 1).unwrap();
        assert_abs_diff_eq!(res.parameters.par[LOC1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.parameters.par[LOC2], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.chi2, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_chi2_matches_update() {
        let v = Matrix2::new(0.5, 0.1, 0.1, 0.7);
        let m = Vector2::new(0.3, 0.9);
        let a = PatternUpdator.chi2(&predicted(), &m, &v, 2).unwrap();
        let b = PatternUpdator.update(&predicted(), &m, &v, 2).unwrap().chi2;
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn test_update_without_covariance_fails() {
        let mut p = predicted();
        p.cov = None;
        assert!(PatternUpdator.update(&p, &Vector2::zeros(), &Matrix2::identity(), 2).is_none());
    }

    #[test]
    fn test_combine_equal_weights_is_mean() {
        let a = predicted();
        let mut b = predicted();
        b.par[LOC1] = 2.0;
        let c = PatternUpdator.combine(&a, &b).unwrap();
        assert_abs_diff_eq!(c.par[LOC1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.cov.unwrap()[(LOC1, LOC1)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_combine_rejects_different_surfaces() {
        let a = predicted();
        let mut b = predicted();
        b.surface.id = SurfaceId(2);
        assert!(PatternUpdator.combine(&a, &b).is_none());
    }
}
