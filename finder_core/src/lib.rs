//! `finder_core`: Combinatorial Kalman-filter track finding in silicon.
//!
//! # Module layout
//! - [`types`]      : Fundamental types (IDs, local parameter vectors, constants)
//! - [`parameters`] : Track parameters on a detector surface
//! - [`propagator`] : Straight-line and helix propagation between planes
//! - [`kf`]         : Kalman measurement update and state combination
//! - [`noise`]      : Multiple scattering and energy loss per module
//! - [`gating`]     : χ² ranking of candidate measurements
//! - [`tools`]      : Pluggable numerical tools and the search context
//! - [`config`]     : Quality cuts and search tuning
//! - [`element`]    : Filter state of one road element
//! - [`trajectory`] : Element arena, extension, smoothing and conversion
//! - [`association`]: Measurement claims and the new-track test
//! - [`finder`]     : Seed-to-track orchestration and parallel driver
//! - [`track`]      : Output track records
//! - [`result`]     : Per-seed outcome codes
//! - [`metrics`]    : Finder statistics
//! - [`error`]      : Error types

pub mod association;
pub mod config;
pub mod element;
pub mod error;
pub mod finder;
pub mod gating;
pub mod kf;
pub mod metrics;
pub mod noise;
pub mod parameters;
pub mod propagator;
pub mod result;
pub mod tools;
pub mod track;
pub mod trajectory;
pub mod types;

pub use association::{is_new_track, ClaimIndex};
pub use config::{FinderConfig, QualityCuts, SearchTuning};
pub use element::{DetStatus, FilterStatus, TrajectoryElement};
pub use error::{FinderError, SearchError, StepError};
pub use finder::{CombinatorialFinder, FinderData, RoadSeed, Seed, SeedHits};
pub use metrics::{EventCounters, FinderStatistics};
pub use parameters::PatternParameters;
pub use result::ResultCode;
pub use tools::{SearchContext, Tools};
pub use track::{FitQuality, PatternHoleSearchOutcome, PatternInfo, Track, TrackState, TrackStateKind};
pub use trajectory::Trajectory;
pub use types::{ElementId, LocalCov, LocalVec, MeasurementId, SurfaceId, TrackId};
