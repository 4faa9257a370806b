//! Output track records produced from an accepted trajectory.

use crate::parameters::PatternParameters;
use crate::result::ResultCode;
use crate::types::{transverse_momentum, ElementId, LocalCov, LocalVec, MeasurementId, SurfaceId};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Track parameters attached to a track state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackParameters {
    pub surface: SurfaceId,
    /// [l1, l2, φ, θ, q/p]
    pub local: LocalVec,
    pub covariance: Option<LocalCov>,
    /// Global position (mm)
    pub position: Vector3<f64>,
    /// Global momentum (MeV)
    pub momentum: Vector3<f64>,
    pub charge: f64,
}

impl TrackParameters {
    pub fn from_pattern(p: &PatternParameters) -> Self {
        Self {
            surface: p.surface.id,
            local: p.par,
            covariance: p.cov,
            position: p.position(),
            momentum: p.momentum(),
            charge: p.charge(),
        }
    }

    pub fn pt(&self) -> f64 {
        transverse_momentum(&self.local)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackStateKind {
    Measurement,
    Outlier,
    Perigee,
}

/// Measurement position as used on the track, after error correction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPosition {
    pub local: Vector2<f64>,
    pub covariance: Matrix2<f64>,
    pub dim: u32,
}

/// Scattering description of a crossed module.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialEffects {
    /// Traversed thickness in radiation lengths
    pub radiation_length: f64,
    pub sigma_azimuth: f64,
    pub sigma_polar: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub chi2: f64,
    pub ndf: i32,
}

/// One state of a track.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub element: Option<ElementId>,
    pub kind: TrackStateKind,
    pub parameters: Option<TrackParameters>,
    pub measurement: Option<MeasurementId>,
    pub measured: Option<MeasuredPosition>,
    pub fit: Option<FitQuality>,
    pub material: Option<MaterialEffects>,
}

impl TrackState {
    pub fn perigee(parameters: &PatternParameters) -> Self {
        Self {
            element: None,
            kind: TrackStateKind::Perigee,
            parameters: Some(TrackParameters::from_pattern(parameters)),
            measurement: None,
            measured: None,
            fit: None,
            material: None,
        }
    }

    pub fn is_measurement(&self) -> bool {
        self.kind == TrackStateKind::Measurement
    }
}

/// Classified interior crossings without a measurement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternHoleSearchOutcome {
    pub pixel_holes: u32,
    pub strip_holes: u32,
    /// Adjacent strip holes
    pub strip_double_holes: u32,
    pub pixel_deads: u32,
    pub strip_deads: u32,
    pub passed: bool,
}

/// How a track was built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternInfo {
    /// Found with the electron noise model
    pub brem_fit: bool,
    pub simple: bool,
    /// Seed is compatible with a calorimeter region of interest
    pub in_calo_roi: bool,
    /// Alternative assignment of ambiguous pixel measurements
    pub alternative: bool,
}

/// An accepted candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub states: Vec<TrackState>,
    pub fit_quality: Option<FitQuality>,
    pub hole_search: PatternHoleSearchOutcome,
    /// Success, or the recoverable failure the track was kept despite
    pub result: ResultCode,
    pub info: PatternInfo,
}

impl Track {
    /// Measurements used as hits, in track order.
    pub fn measurement_ids(&self) -> impl Iterator<Item = MeasurementId> + '_ {
        self.states
            .iter()
            .filter(|s| s.is_measurement())
            .filter_map(|s| s.measurement)
    }

    pub fn n_measurements(&self) -> usize {
        self.measurement_ids().count()
    }

    pub fn n_outliers(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.kind == TrackStateKind::Outlier)
            .count()
    }

    /// Parameters of the first state that carries any.
    pub fn first_parameters(&self) -> Option<&TrackParameters> {
        self.states.iter().find_map(|s| s.parameters.as_ref())
    }

    pub fn pt(&self) -> f64 {
        self.first_parameters().map_or(0.0, |p| p.pt())
    }
}
