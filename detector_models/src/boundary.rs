//! Pattern hole classification of predicted module crossings.
//!
//! # Design choices
//! - A [`BoundaryCheck`] is consulted only after the track is fully built, to
//!   decide whether an element without a measurement is a genuine hole.
//! - Strip modules are two wafers bonded along local y = 0; a prediction in the
//!   bond gap is insensitive rather than a hole.

use crate::element::{BoundaryLink, Crossing, DetectorElement, Technology};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryCheckResult {
    /// Inside the sensitive area: a missing hit here is a hole
    Candidate,
    /// Inside the outline but in a dead region such as a bond gap
    Insensitive,
    OnEdge,
    Outside,
    /// Module disabled by conditions
    DeadElement,
    /// Prediction unusable
    Error,
}

pub trait BoundaryCheck: Send + Sync {
    fn check(
        &self,
        element: &DetectorElement,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
    ) -> BoundaryCheckResult;
}

/// Outline-based classifier for planar modules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorBoundaryCheck {
    /// Minimal edge band (mm)
    pub tolerance: f64,
    /// Full width of the strip bond gap around local y = 0 (mm)
    pub strip_bond_gap: f64,
}

impl Default for DetectorBoundaryCheck {
    fn default() -> Self {
        Self {
            tolerance: 0.1, // mm
            strip_bond_gap: 0.0, // mm, no gap unless configured
        }
    }
}

impl BoundaryCheck for DetectorBoundaryCheck {
    fn check(
        &self,
        element: &DetectorElement,
        local: &Vector2<f64>,
        cov: &Matrix2<f64>,
    ) -> BoundaryCheckResult {
        if element.disabled {
            return BoundaryCheckResult::DeadElement;
        }
        if !local.iter().all(|v| v.is_finite()) || !cov.iter().all(|v| v.is_finite()) {
            return BoundaryCheckResult::Error;
        }
        match BoundaryLink::new(element, self.tolerance).intersect(local, cov).0 {
            Crossing::Outside => BoundaryCheckResult::Outside,
            Crossing::Edge => BoundaryCheckResult::OnEdge,
            Crossing::Inside => {
                if element.technology == Technology::Strip
                    && local.y.abs() < 0.5 * self.strip_bond_gap
                {
                    BoundaryCheckResult::Insensitive
                } else {
                    BoundaryCheckResult::Candidate
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
