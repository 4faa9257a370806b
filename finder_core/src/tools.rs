//! Pluggable numerical tools and the per-call search context.

use crate::association::ClaimIndex;
use crate::config::{FinderConfig, QualityCuts, SearchTuning};
use crate::kf::{KalmanUpdator, PatternUpdator};
use crate::parameters::PatternParameters;
use crate::propagator::{self, Propagator};
use detector_models::{BoundaryCheck, DetectorBoundaryCheck, Measurement};
use nalgebra::{Matrix2, Vector2};

/// Refines a measurement's position and error given the local track state.
pub trait MeasurementCorrector: Send + Sync {
    fn correct(
        &self,
        measurement: &Measurement,
        predicted: &PatternParameters,
    ) -> (Vector2<f64>, Matrix2<f64>);
}

/// Uses the cluster's own position and covariance.
#[derive(Clone, Copy, Debug, Default)]
pub struct NominalErrors;

impl MeasurementCorrector for NominalErrors {
    fn correct(
        &self,
        measurement: &Measurement,
        _predicted: &PatternParameters,
    ) -> (Vector2<f64>, Matrix2<f64>) {
        (measurement.local, measurement.covariance)
    }
}

/// The numerical collaborators of the search.
pub struct Tools {
    pub propagator: Box<dyn Propagator>,
    pub updator: Box<dyn KalmanUpdator>,
    pub corrector: Box<dyn MeasurementCorrector>,
    pub boundary_check: Box<dyn BoundaryCheck>,
}

impl Tools {
    /// Default tool set for a solenoid field `bz` (Tesla).
    pub fn for_field(bz: f64, boundary_tolerance: f64) -> Self {
        Self {
            propagator: propagator::for_field(bz),
            updator: Box::new(PatternUpdator),
            corrector: Box::new(NominalErrors),
            boundary_check: Box::new(DetectorBoundaryCheck {
                tolerance: boundary_tolerance,
                ..Default::default()
            }),
        }
    }
}

/// Everything an element operation needs besides the elements themselves.
#[derive(Clone, Copy)]
pub struct SearchContext<'t> {
    pub tools: &'t Tools,
    pub cuts: &'t QualityCuts,
    pub tuning: &'t SearchTuning,
    /// Electron noise model on the extension elements
    pub brem_noise: bool,
    /// Claims of accepted tracks, consulted when association is enabled
    pub claims: Option<&'t ClaimIndex>,
}

impl<'t> SearchContext<'t> {
    pub fn new(tools: &'t Tools, config: &'t FinderConfig) -> Self {
        Self {
            tools,
            cuts: &config.cuts,
            tuning: &config.tuning,
            brem_noise: false,
            claims: None,
        }
    }

    pub fn with_claims(mut self, claims: &'t ClaimIndex) -> Self {
        if self.cuts.use_association {
            self.claims = Some(claims);
        }
        self
    }

    pub fn with_brem_noise(mut self, on: bool) -> Self {
        self.brem_noise = on;
        self
    }
}
