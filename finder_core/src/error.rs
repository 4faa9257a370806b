//! Error types of the finder.
//!
//! Per-element failures ([`StepError`]) and trajectory-level failures
//! ([`SearchError`]) are ordinary control flow of the search and end up as a
//! [`ResultCode`](crate::result::ResultCode). Only [`FinderError`] reaches the
//! caller, for inputs the finder cannot work with at all.

use crate::types::{MeasurementId, SurfaceId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    #[error("propagation to surface {0} failed")]
    Propagation(SurfaceId),

    #[error("Kalman update rejected on surface {0}")]
    Update(SurfaceId),

    #[error("forward and backward states could not be combined on surface {0}")]
    Combination(SurfaceId),

    #[error("element carries no measurement")]
    NoMeasurement,

    #[error("element has no filtered state")]
    NotFiltered,

    #[error("no alternative candidate left")]
    NoAlternative,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SearchError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error("seed has {0} measurements, at least 2 are required")]
    TooFewSeedMeasurements(usize),

    #[error("seed measurement not found on the road")]
    SeedNotOnRoad,

    #[error("only {ndf} measured coordinates, {required} required")]
    TooFewDegreesOfFreedom { ndf: u32, required: u32 },

    #[error("too few active elements for the holes found")]
    TooFewClusters,

    #[error("trajectory span is empty")]
    EmptySpan,

    #[error("trajectory invariant violated: {0}")]
    Invariant(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FinderError {
    #[error("road is empty")]
    EmptyRoad,

    #[error("measurement {0} is not in the event index")]
    UnknownMeasurement(MeasurementId),
}
