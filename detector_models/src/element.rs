//! Detector elements (silicon modules) and their boundary links.

use crate::geometry::PlaneSurface;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Sensor technology. Pixel measurements are 2-D, strip measurements 1-D.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technology {
    Pixel,
    Strip,
}

impl Technology {
    pub fn measurement_dim(self) -> u32 {
        match self {
            Technology::Pixel => 2,
            Technology::Strip => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Barrel,
    Endcap,
}

/// One silicon module of a road.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorElement {
    pub id: ElementId,
    pub technology: Technology,
    pub region: Region,
    pub surface: PlaneSurface,
    /// Half extent along local x (mm)
    pub half_width: f64,
    /// Half extent along local y (mm)
    pub half_length: f64,
    /// Module flagged bad by conditions
    pub disabled: bool,
}

impl DetectorElement {
    pub fn is_pixel(&self) -> bool {
        self.technology == Technology::Pixel
    }

    pub fn is_barrel(&self) -> bool {
        self.region == Region::Barrel
    }

    pub fn measurement_dim(&self) -> u32 {
        self.technology.measurement_dim()
    }
}

// ---------------------------------------------------------------------------
// Boundary link
// ---------------------------------------------------------------------------

/// Outcome of intersecting a predicted local position with a module outline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crossing {
    /// Well inside the sensitive area
    Inside,
    /// Within the uncertainty band of an edge
    Edge,
    #[default]
    Outside,
}

impl Crossing {
    pub fn is_inside(self) -> bool {
        self == Crossing::Inside
    }

    /// Inside or on the edge: the track may have crossed the module.
    pub fn is_crossed(self) -> bool {
        self != Crossing::Outside
    }
}

/// Precomputed outline of a detector element, used for fast inside/outside
/// decisions during the search.
#[derive(Clone, Copy, Debug)]
pub struct BoundaryLink<'a> {
    element: &'a DetectorElement,
    /// Minimal edge band (mm)
    tolerance: f64,
}

impl<'a> BoundaryLink<'a> {
    pub fn new(element: &'a DetectorElement, tolerance: f64) -> Self {
        Self { element, tolerance }
    }

    pub fn element(&self) -> &'a DetectorElement {
        self.element
    }

    /// Classify a local position with covariance `cov`.
    ///
    /// Returns the crossing together with the signed distance to the closest
    /// edge: negative inside, positive outside.
    pub fn intersect(&self, local: &Vector2<f64>, cov: &Matrix2<f64>) -> (Crossing, f64) {
        let dx = local.x.abs() - self.element.half_width;
        let dy = local.y.abs() - self.element.half_length;
        let dist = dx.max(dy);
        let sigma = cov[(0, 0)].max(cov[(1, 1)]).max(0.0).sqrt();
        let band = self.tolerance.max(3.0 * sigma);
        let crossing = if dist < -band {
            Crossing::Inside
        } else if dist > band {
            Crossing::Outside
        } else {
            Crossing::Edge
        };
        (crossing, dist)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
