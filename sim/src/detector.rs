//! Toy cylindrical barrel made of flat silicon modules.
//!
//! Each layer is tiled in φ with slightly overlapping modules and in z with
//! a few rings. Module frames follow the finder's convention: the normal
//! points away from the beam line, local x runs along rφ and local y
//! along z.

use detector_models::{DetectorElement, ElementId, PlaneSurface, Region, SurfaceId, Technology};
use finder_core::propagator::Propagator;
use finder_core::PatternParameters;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Fraction of a module width used when tiling in φ; below one the
/// neighbours overlap.
const PHI_TILING: f64 = 0.92;
/// Same along z.
const Z_TILING: f64 = 0.98;
/// Smallest cosine between a module normal and the transverse direction for
/// the module to be considered on a road.
const MIN_FACING: f64 = 0.5;

/// One cylindrical layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub technology: Technology,
    /// mm
    pub radius: f64,
    /// Half size along rφ (mm)
    pub half_width: f64,
    /// Half size along z (mm)
    pub half_length: f64,
    /// Modules along z
    pub rings: u32,
    /// Intrinsic resolution along local x (mm)
    pub sigma_x: f64,
    /// Intrinsic resolution along local y (mm), pixels only
    pub sigma_y: f64,
}

impl LayerSpec {
    pub fn pixel(radius: f64) -> Self {
        Self {
            technology: Technology::Pixel,
            radius,
            half_width: 8.0,
            half_length: 30.0,
            rings: 5,
            sigma_x: 0.012,
            sigma_y: 0.1,
        }
    }

    pub fn strip(radius: f64) -> Self {
        Self {
            technology: Technology::Strip,
            radius,
            half_width: 30.0,
            half_length: 60.0,
            rings: 5,
            sigma_x: 0.023,
            sigma_y: 0.0,
        }
    }

    /// Modules needed to close the ring in φ.
    pub fn n_phi(&self) -> u32 {
        (TAU * self.radius / (2.0 * self.half_width * PHI_TILING)).ceil() as u32
    }
}

/// Where a track crosses a module plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModuleCrossing {
    /// Position of the element in [`ToyDetector::elements`]
    pub element: usize,
    pub local: Vector2<f64>,
    /// Path length from the start (mm)
    pub step: f64,
    /// Inside the active area, not just inside the road margin
    pub inside: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToyDetector {
    pub layers: Vec<LayerSpec>,
    pub elements: Vec<DetectorElement>,
    /// Layer index of each element
    layer_of: Vec<usize>,
}

impl ToyDetector {
    /// Tile every layer. Element and surface ids follow the layer order.
    pub fn barrel(layers: Vec<LayerSpec>) -> Self {
        let mut elements = Vec::new();
        let mut layer_of = Vec::new();
        for (l, spec) in layers.iter().enumerate() {
            let n_phi = spec.n_phi();
            // odd layers are staggered by half a module
            let offset = if l % 2 == 1 { 0.5 } else { 0.0 };
            for ring in 0..spec.rings {
                let z = (ring as f64 - 0.5 * (spec.rings - 1) as f64)
                    * 2.0
                    * spec.half_length
                    * Z_TILING;
                for k in 0..n_phi {
                    let phi = TAU * (k as f64 + offset) / n_phi as f64;
                    let (s, c) = phi.sin_cos();
                    let id = elements.len() as u64;
                    elements.push(DetectorElement {
                        id: ElementId(id),
                        technology: spec.technology,
                        region: Region::Barrel,
                        surface: PlaneSurface::from_normal(
                            SurfaceId(id),
                            Vector3::new(spec.radius * c, spec.radius * s, z),
                            Vector3::new(c, s, 0.0),
                            Vector3::z(),
                        ),
                        half_width: spec.half_width,
                        half_length: spec.half_length,
                        disabled: false,
                    });
                    layer_of.push(l);
                }
            }
        }
        tracing::debug!(
            layers = layers.len(),
            modules = elements.len(),
            "toy barrel built"
        );
        Self {
            layers,
            elements,
            layer_of,
        }
    }

    /// Four pixel layers followed by four strip layers.
    pub fn standard() -> Self {
        Self::barrel(vec![
            LayerSpec::pixel(33.0),
            LayerSpec::pixel(50.5),
            LayerSpec::pixel(88.5),
            LayerSpec::pixel(122.5),
            LayerSpec::strip(299.0),
            LayerSpec::strip(371.0),
            LayerSpec::strip(443.0),
            LayerSpec::strip(514.0),
        ])
    }

    pub fn layer(&self, element: usize) -> &LayerSpec {
        &self.layers[self.layer_of[element]]
    }

    pub fn layer_index(&self, element: usize) -> usize {
        self.layer_of[element]
    }

    /// Switch modules off; their crossings become dead rather than holes.
    pub fn disable(&mut self, ids: impl IntoIterator<Item = ElementId>) {
        for id in ids {
            if let Some(e) = self.elements.get_mut(id.0 as usize) {
                e.disabled = true;
            }
        }
    }

    /// Module planes the track from `start` crosses within `margin` of
    /// their outline, ordered by path length.
    pub fn crossings(
        &self,
        start: &PatternParameters,
        propagator: &dyn Propagator,
        margin: f64,
    ) -> Vec<ModuleCrossing> {
        let dir = start.direction();
        let transverse = Vector3::new(dir.x, dir.y, 0.0);
        let transverse = if transverse.norm() > 1e-12 {
            transverse.normalize()
        } else {
            Vector3::x()
        };

        let mut out: Vec<ModuleCrossing> = self
            .elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.surface.normal().dot(&transverse) >= MIN_FACING)
            .filter_map(|(i, e)| {
                let p = propagator.propagate(start, &e.surface, false)?;
                if p.step <= 0.0 {
                    return None;
                }
                let local = p.parameters.local_position();
                let (dx, dy) = (local.x.abs(), local.y.abs());
                if dx > e.half_width + margin || dy > e.half_length + margin {
                    return None;
                }
                Some(ModuleCrossing {
                    element: i,
                    local,
                    step: p.step,
                    inside: dx <= e.half_width && dy <= e.half_length,
                })
            })
            .collect();
        out.sort_by(|a, b| a.step.total_cmp(&b.step));
        out
    }

    /// The elements of `crossings`, in order, as a finder road.
    pub fn road(&self, crossings: &[ModuleCrossing]) -> Vec<DetectorElement> {
        crossings
            .iter()
            .map(|c| self.elements[c.element].clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finder_core::propagator::for_field;
    use finder_core::LocalVec;
    use std::f64::consts::FRAC_PI_2;

    fn start(phi: f64, qop: f64) -> PatternParameters {
        let dir = Vector3::new(phi.cos(), phi.sin(), 0.0);
        PatternParameters::new(
            PlaneSurface::transverse_perigee(&dir),
            LocalVec::new(0.0, 0.0, phi, FRAC_PI_2, qop),
            None,
        )
    }

    #[test]
    fn test_layers_close_in_phi() {
        let det = ToyDetector::standard();
        for spec in &det.layers {
            let covered = spec.n_phi() as f64 * 2.0 * spec.half_width;
            assert!(covered >= TAU * spec.radius);
        }
        let per_layer: usize = det.layers.iter().map(|l| (l.n_phi() * l.rings) as usize).sum();
        assert_eq!(det.elements.len(), per_layer);
        // module centres sit on their layer radius
        let e = &det.elements[0];
        assert_abs_diff_eq!(e.surface.radius(), 33.0, epsilon = 1e-9);
        assert!(e.is_pixel());
    }

    #[test]
    fn test_straight_track_crosses_every_layer_in_order() {
        let det = ToyDetector::standard();
        let propagator = for_field(0.0);
        let crossings = det.crossings(&start(0.3, 1e-4), propagator.as_ref(), 0.0);

        let mut layers: Vec<usize> = crossings.iter().map(|c| det.layer_index(c.element)).collect();
        assert!(crossings.windows(2).all(|w| w[0].step <= w[1].step));
        assert!(layers.windows(2).all(|w| w[0] <= w[1]));
        layers.dedup();
        assert_eq!(layers, (0..8).collect::<Vec<_>>());
        assert!(crossings.iter().all(|c| c.inside));
    }

    #[test]
    fn test_curved_track_still_reaches_outer_layer() {
        let det = ToyDetector::standard();
        let propagator = for_field(2.0);
        // 1 GeV in 2 T bends by about 0.16 rad at the last layer
        let crossings = det.crossings(&start(1.0, 1.0 / 1000.0), propagator.as_ref(), 1.0);
        let last = crossings.last().map(|c| det.layer_index(c.element));
        assert_eq!(last, Some(7));
        let road = det.road(&crossings);
        assert_eq!(road.len(), crossings.len());
        assert!(road[0].is_pixel());
        assert!(!road[road.len() - 1].is_pixel());
    }

    #[test]
    fn test_disable_marks_modules() {
        let mut det = ToyDetector::standard();
        det.disable([ElementId(3), ElementId(999_999)]);
        assert!(det.elements[3].disabled);
        assert_eq!(det.elements.iter().filter(|e| e.disabled).count(), 1);
    }
}
