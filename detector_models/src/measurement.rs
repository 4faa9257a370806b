//! Silicon clusters, space points and the per-event measurement index.

use crate::element::{DetectorElement, ElementId, Technology};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementId(pub u64);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// A cluster on one detector element, in that element's local frame.
///
/// Strip clusters carry a nominal local y of zero with a covariance spanning
/// the strip length, so both technologies share the 2-vector layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: MeasurementId,
    pub element: ElementId,
    /// Local position (mm)
    pub local: Vector2<f64>,
    /// Local covariance (mm²)
    pub covariance: Matrix2<f64>,
    /// Number of measured coordinates (2 pixel, 1 strip)
    pub dim: u32,
}

impl Measurement {
    pub fn pixel(
        id: MeasurementId,
        element: ElementId,
        local: Vector2<f64>,
        sigma_x: f64,
        sigma_y: f64,
    ) -> Self {
        Self {
            id,
            element,
            local,
            covariance: Matrix2::new(sigma_x * sigma_x, 0.0, 0.0, sigma_y * sigma_y),
            dim: 2,
        }
    }

    /// Strip cluster measuring local x only; y is spread uniformly over the strip.
    pub fn strip(id: MeasurementId, element: ElementId, x: f64, sigma_x: f64, half_length: f64) -> Self {
        let length = 2.0 * half_length;
        Self {
            id,
            element,
            local: Vector2::new(x, 0.0),
            covariance: Matrix2::new(sigma_x * sigma_x, 0.0, 0.0, length * length / 12.0),
            dim: 1,
        }
    }

    /// Build a cluster from a true local hit on `element`, using the
    /// element's technology to pick the measurement flavour.
    pub fn on_element(
        id: MeasurementId,
        element: &DetectorElement,
        local: Vector2<f64>,
        sigma_x: f64,
        sigma_y: f64,
    ) -> Self {
        match element.technology {
            Technology::Pixel => Self::pixel(id, element.id, local, sigma_x, sigma_y),
            Technology::Strip => {
                Self::strip(id, element.id, local.x, sigma_x, element.half_length)
            }
        }
    }

    pub fn is_pixel(&self) -> bool {
        self.dim == 2
    }
}

// ---------------------------------------------------------------------------
// Space points
// ---------------------------------------------------------------------------

/// A 3-D point built from one pixel cluster or a pair of stereo strip clusters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpacePoint {
    pub first: MeasurementId,
    pub second: Option<MeasurementId>,
    /// Global position (mm)
    pub position: Vector3<f64>,
}

impl SpacePoint {
    pub fn measurements(&self) -> impl Iterator<Item = MeasurementId> + '_ {
        std::iter::once(self.first).chain(self.second)
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Event-level store of clusters grouped by detector element.
#[derive(Clone, Debug, Default)]
pub struct MeasurementIndex {
    by_element: HashMap<ElementId, Vec<Measurement>>,
    locations: HashMap<MeasurementId, (ElementId, usize)>,
}

impl MeasurementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_measurements(measurements: impl IntoIterator<Item = Measurement>) -> Self {
        let mut index = Self::new();
        for m in measurements {
            index.insert(m);
        }
        index
    }

    /// Add a cluster. A cluster re-using an existing id replaces it.
    pub fn insert(&mut self, measurement: Measurement) {
        if let Some((element, slot)) = self.locations.get(&measurement.id).copied() {
            if element == measurement.element {
                if let Some(list) = self.by_element.get_mut(&element) {
                    list[slot] = measurement;
                    return;
                }
            }
            self.remove(measurement.id);
        }
        let list = self.by_element.entry(measurement.element).or_default();
        self.locations
            .insert(measurement.id, (measurement.element, list.len()));
        list.push(measurement);
    }

    fn remove(&mut self, id: MeasurementId) {
        let Some((element, slot)) = self.locations.remove(&id) else {
            return;
        };
        if let Some(list) = self.by_element.get_mut(&element) {
            list.remove(slot);
            for (i, m) in list.iter().enumerate().skip(slot) {
                self.locations.insert(m.id, (element, i));
            }
        }
    }

    /// Clusters on one element; empty if the element has none.
    pub fn on_element(&self, element: ElementId) -> &[Measurement] {
        self.by_element
            .get(&element)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, id: MeasurementId) -> Option<&Measurement> {
        let (element, slot) = self.locations.get(&id)?;
        self.by_element.get(element)?.get(*slot)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.by_element.values().flatten()
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
    fn test_strip_covariance_spans_length() {
        let m = Measurement::strip(MeasurementId(1), ElementId(3), 1.5, 0.02, 30.0);
        assert_eq!(m.dim, 1);
        assert!(!m.is_pixel());
        assert_abs_diff_eq!(m.covariance[(1, 1)], 300.0, epsilon = 1e-9);
    }

    #[test]
    fn test_index_groups_by_element() {
        let idx = MeasurementIndex::from_measurements(vec![
            Measurement::pixel(MeasurementId(1), ElementId(1), Vector2::new(0.0, 0.0), 0.01, 0.05),
            Measurement::pixel(MeasurementId(2), ElementId(1), Vector2::new(1.0, 0.0), 0.01, 0.05),
            Measurement::pixel(MeasurementId(3), ElementId(2), Vector2::new(2.0, 0.0), 0.01, 0.05),
        ]);
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.on_element(ElementId(1)).len(), 2);
        assert!(idx.on_element(ElementId(9)).is_empty());
        assert_eq!(idx.get(MeasurementId(3)).map(|m| m.element), Some(ElementId(2)));
    }

    #[test]
    fn test_reinsert_moves_measurement() {
        let mut idx = MeasurementIndex::new();
        idx.insert(Measurement::pixel(MeasurementId(1), ElementId(1), Vector2::zeros(), 0.01, 0.05));
        idx.insert(Measurement::pixel(MeasurementId(2), ElementId(1), Vector2::zeros(), 0.01, 0.05));
        idx.insert(Measurement::pixel(MeasurementId(1), ElementId(4), Vector2::zeros(), 0.01, 0.05));
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.on_element(ElementId(1)).len(), 1);
        assert_eq!(idx.get(MeasurementId(2)).map(|m| m.element), Some(ElementId(1)));
        assert_eq!(idx.get(MeasurementId(1)).map(|m| m.element), Some(ElementId(4)));
    }

    #[test]
    fn test_space_point_lists_both_clusters() {
        let sp = SpacePoint {
            first: MeasurementId(4),
            second: Some(MeasurementId(5)),
            position: Vector3::zeros(),
        };
        let ids: Vec<_> = sp.measurements().collect();
        assert_eq!(ids, vec![MeasurementId(4), MeasurementId(5)]);
    }
}
