//! `detector_models`: Silicon detector description shared by the finder and the simulation.
//!
//! # Module layout
//! - [`geometry`]: Planar surfaces and local frames
//! - [`element`]: Detector elements, technologies and boundary links
//! - [`measurement`]: Clusters, space points and the per-event index
//! - [`boundary`]: Hole classification of predicted crossings

pub mod boundary;
pub mod element;
pub mod geometry;
pub mod measurement;

pub use boundary::{BoundaryCheck, BoundaryCheckResult, DetectorBoundaryCheck};
pub use element::{BoundaryLink, Crossing, DetectorElement, ElementId, Region, Technology};
pub use geometry::{PlaneSurface, SurfaceId, PERIGEE_SURFACE};
pub use measurement::{Measurement, MeasurementId, MeasurementIndex, SpacePoint};
