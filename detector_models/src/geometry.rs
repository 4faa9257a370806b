//! Planar sensor surfaces and their local frames.
//!
//! Every silicon module is a flat wafer. Its frame is stored as a rotation
//! matrix whose columns are the local x axis, the local y axis and the outward
//! normal, all expressed in global coordinates (mm).

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Reserved id for the transverse perigee plane built on demand.
pub const PERIGEE_SURFACE: SurfaceId = SurfaceId(u64::MAX);

/// A bounded-free plane with an orthonormal local frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaneSurface {
    pub id: SurfaceId,
    /// Origin of the local frame (mm)
    pub center: Vector3<f64>,
    /// Columns: local x, local y, normal
    pub rotation: Matrix3<f64>,
}

impl Default for PlaneSurface {
    fn default() -> Self {
        Self::new(SurfaceId::default(), Vector3::zeros(), Matrix3::identity())
    }
}

impl PlaneSurface {
    pub fn new(id: SurfaceId, center: Vector3<f64>, rotation: Matrix3<f64>) -> Self {
        Self {
            id,
            center,
            rotation,
        }
    }

    /// Build a frame from the normal and a hint for the local y axis.
    ///
    /// The hint is orthogonalised against the normal; local x completes a
    /// right-handed frame (x = y × n).
    pub fn from_normal(
        id: SurfaceId,
        center: Vector3<f64>,
        normal: Vector3<f64>,
        y_hint: Vector3<f64>,
    ) -> Self {
        let n = normal.normalize();
        let mut y = y_hint - n * n.dot(&y_hint);
        if y.norm() < 1e-12 {
            // hint parallel to the normal; fall back to any perpendicular axis
            let any = if n.x.abs() < 0.9 {
                Vector3::x()
            } else {
                Vector3::y()
            };
            y = any - n * n.dot(&any);
        }
        let y = y.normalize();
        let x = y.cross(&n);
        Self::new(id, center, Matrix3::from_columns(&[x, y, n]))
    }

    /// Plane through the beam line whose normal is the transverse direction
    /// of `direction`; a straight track crossing it sits at its point of
    /// closest transverse approach to the z axis.
    pub fn transverse_perigee(direction: &Vector3<f64>) -> Self {
        let mut t = Vector3::new(direction.x, direction.y, 0.0);
        if t.norm() < 1e-12 {
            t = Vector3::x();
        }
        Self::from_normal(PERIGEE_SURFACE, Vector3::zeros(), t, Vector3::z())
    }

    pub fn axis_x(&self) -> Vector3<f64> {
        self.rotation.column(0).into_owned()
    }

    pub fn axis_y(&self) -> Vector3<f64> {
        self.rotation.column(1).into_owned()
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.rotation.column(2).into_owned()
    }

    pub fn local_to_global(&self, local: &Vector2<f64>) -> Vector3<f64> {
        self.center + self.axis_x() * local.x + self.axis_y() * local.y
    }

    /// Returns the in-plane coordinates and the signed distance along the normal.
    pub fn global_to_local(&self, global: &Vector3<f64>) -> (Vector2<f64>, f64) {
        let d = global - self.center;
        (
            Vector2::new(d.dot(&self.axis_x()), d.dot(&self.axis_y())),
            d.dot(&self.normal()),
        )
    }

    /// Transverse radius of the frame origin.
    pub fn radius(&self) -> f64 {
        self.center.xy().norm()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_frame_is_orthonormal() {
        let s = PlaneSurface::from_normal(
            SurfaceId(1),
            Vector3::new(50.0, 0.0, 0.0),
            Vector3::new(1.0, 0.2, 0.0),
            Vector3::z(),
        );
        let r = s.rotation;
        let should_be_identity = r.transpose() * r;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(should_be_identity[(i, j)], expected, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_local_global_inverse() {
        let s = PlaneSurface::from_normal(
            SurfaceId(2),
            Vector3::new(10.0, 20.0, 30.0),
            Vector3::new(0.3, 1.0, 0.1),
            Vector3::z(),
        );
        let local = Vector2::new(3.5, -7.25);
        let g = s.local_to_global(&local);
        let (back, dist) = s.global_to_local(&g);
        assert_abs_diff_eq!(back.x, local.x, epsilon = 1e-10);
        assert_abs_diff_eq!(back.y, local.y, epsilon = 1e-10);
        assert_abs_diff_eq!(dist, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_perigee_plane_contains_beam_line() {
        let s = PlaneSurface::transverse_perigee(&Vector3::new(0.6, 0.8, 0.3));
        assert_abs_diff_eq!(s.normal().z, 0.0, epsilon = 1e-12);
        let (_, d) = s.global_to_local(&Vector3::new(0.0, 0.0, 125.0));
        assert_abs_diff_eq!(d, 0.0, epsilon = 1e-12);
    }
}
