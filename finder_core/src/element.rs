//! Per-module Kalman state and search bookkeeping.
//!
//! A [`TrajectoryElement`] lives in a slot of the trajectory arena and is
//! rebound to a new road element by [`TrajectoryElement::set`] for every
//! seed. It holds five parameter sets on its surface:
//!
//! | set  | meaning                                         |
//! |------|-------------------------------------------------|
//! | `pf` | forward prediction (propagated from upstream)   |
//! | `uf` | forward update (`pf` + assigned measurement)    |
//! | `pb` | backward prediction                             |
//! | `ub` | backward update                                 |
//! | `sm` | smoothed: weighted mean of `pb` and `pf`        |
//!
//! together with running counters (measurements, holes, double holes,
//! measured coordinates, χ²) accumulated from the neighbouring element in
//! the direction of the last pass.
//!
//! # Design choices
//! - Every operation that can fail returns `Result<(), StepError>`; the
//!   trajectory decides whether a failure drops the element, ends a branch
//!   or rejects the seed.
//! - Measurements and detector elements are borrowed for the lifetime of
//!   the event (`'a`); the element never owns them.
//! - Candidate links are kept per direction, sorted by χ², so the
//!   branch-and-bound search can fall back to the next-best candidate
//!   without searching again.

use crate::error::StepError;
use crate::gating::{search_links, Links};
use crate::kf::KfUpdateResult;
use crate::noise::{dead_material_radiation_length, Direction, Material, NoiseModel, NoiseState};
use crate::parameters::PatternParameters;
use crate::propagator::Propagation;
use crate::tools::SearchContext;
use crate::track::{FitQuality, MaterialEffects, MeasuredPosition, TrackParameters, TrackState, TrackStateKind};
use crate::types::{LocalCov, LocalVec, QOP};
use detector_models::{BoundaryLink, Crossing, DetectorElement, Measurement, PlaneSurface};
use nalgebra::{Matrix2, Vector3};
use std::fmt;

/// Role of an element on the road.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetStatus {
    /// Module flagged bad by conditions; never a hole
    #[default]
    Disabled,
    /// Module without measurements in this event
    Empty,
    /// Module with measurements
    Active,
    /// Last module with measurements on the road
    LastActive,
    /// Synthetic service-material marker
    Dead,
}

impl DetStatus {
    /// A crossing without a measurement counts as a hole.
    pub fn counts_holes(self) -> bool {
        matches!(self, DetStatus::Empty | DetStatus::Active | DetStatus::LastActive)
    }

    pub fn has_measurements(self) -> bool {
        matches!(self, DetStatus::Active | DetStatus::LastActive)
    }
}

/// Last pass that touched the element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterStatus {
    #[default]
    Unset,
    Forward,
    Backward,
    Smoothed,
}

/// Where an element sits in the emitted track; selects the parameter set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatePosition {
    First,
    Interior,
    Last,
}

/// Outcome of dropping the assigned measurement during the restart scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fallback {
    /// A second candidate within the acceptance cut exists
    pub alternate: bool,
    /// Running χ² with the current measurement replaced by the fallback
    pub chi2: f64,
}

const INITIAL_COVARIANCE: [f64; 5] = [1.0, 1.0, 0.001, 0.001, 1e-5];
const UNSET_CHI2: f64 = 10_000.0;

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrajectoryElement<'a> {
    pub(crate) status: DetStatus,
    pub(crate) link: Option<BoundaryLink<'a>>,
    pub(crate) surface: PlaneSurface,
    pub(crate) measurements: &'a [Measurement],
    pub(crate) cluster: Option<&'a Measurement>,
    pub(crate) cluster_old: Option<&'a Measurement>,
    /// Rejected measurement kept as an outlier
    pub(crate) no_add: Option<&'a Measurement>,
    pub(crate) filter: FilterStatus,
    pub(crate) inside: Crossing,
    /// Signed distance of the prediction to the closest edge (mm)
    pub(crate) dist: f64,
    pub(crate) ndf: u32,

    pub(crate) pf: PatternParameters,
    pub(crate) uf: PatternParameters,
    pub(crate) pb: PatternParameters,
    pub(crate) ub: PatternParameters,
    pub(crate) sm: PatternParameters,

    pub(crate) noise: NoiseState,
    pub(crate) noise_model: NoiseModel,
    pub(crate) radiation_length: f64,
    /// Traversed radiation length of the last noise production
    pub(crate) rad_traversed: f64,

    pub(crate) xi2_f: f64,
    pub(crate) xi2_b: f64,
    pub(crate) xi2_total_f: f64,
    pub(crate) xi2_total_b: f64,
    pub(crate) n_clusters_f: u32,
    pub(crate) n_clusters_b: u32,
    pub(crate) n_pixels_b: u32,
    pub(crate) n_holes_f: u32,
    pub(crate) n_holes_b: u32,
    pub(crate) n_double_holes_f: u32,
    pub(crate) n_double_holes_b: u32,
    /// Well-inside misses along the running direction
    pub(crate) n_missing: u32,
    pub(crate) ndf_f: u32,
    pub(crate) ndf_b: u32,
    /// Accumulated path length from the first element (mm)
    pub(crate) step: f64,

    pub(crate) links_f: Links<'a>,
    pub(crate) links_b: Links<'a>,
}

impl Default for TrajectoryElement<'_> {
    fn default() -> Self {
        Self {
            status: DetStatus::Disabled,
            link: None,
            surface: PlaneSurface::default(),
            measurements: &[],
            cluster: None,
            cluster_old: None,
            no_add: None,
            filter: FilterStatus::Unset,
            inside: Crossing::Outside,
            dist: 0.0,
            ndf: 0,
            pf: PatternParameters::default(),
            uf: PatternParameters::default(),
            pb: PatternParameters::default(),
            ub: PatternParameters::default(),
            sm: PatternParameters::default(),
            noise: NoiseState::default(),
            noise_model: NoiseModel::Muon,
            radiation_length: 0.0,
            rad_traversed: 0.0,
            xi2_f: 0.0,
            xi2_b: 0.0,
            xi2_total_f: 0.0,
            xi2_total_b: 0.0,
            n_clusters_f: 0,
            n_clusters_b: 0,
            n_pixels_b: 0,
            n_holes_f: 0,
            n_holes_b: 0,
            n_double_holes_f: 0,
            n_double_holes_b: 0,
            n_missing: 0,
            ndf_f: 0,
            ndf_b: 0,
            step: 0.0,
            links_f: Links::new(),
            links_b: Links::new(),
        }
    }
}

impl<'a> TrajectoryElement<'a> {
    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Bind the slot to a road element and its candidate measurements,
    /// clearing everything left over from the previous seed.
    pub fn set(
        &mut self,
        ctx: &SearchContext<'_>,
        status: DetStatus,
        link: BoundaryLink<'a>,
        measurements: &'a [Measurement],
        seed_measurement: Option<&'a Measurement>,
    ) {
        let element = link.element();
        *self = Self {
            status,
            surface: element.surface,
            ndf: element.measurement_dim(),
            link: Some(link),
            measurements,
            cluster: seed_measurement,
            radiation_length: ctx.tuning.radiation_length,
            ..Self::default()
        };
    }

    /// Bind the slot to the service-material marker on `surface`.
    pub fn set_dead(&mut self, surface: PlaneSurface) {
        *self = Self {
            status: DetStatus::Dead,
            surface,
            inside: Crossing::Inside,
            ..Self::default()
        };
    }

    pub fn detector(&self) -> Option<&'a DetectorElement> {
        self.link.map(|l| l.element())
    }

    pub fn is_detector(&self) -> bool {
        self.link.is_some()
    }

    pub fn status(&self) -> DetStatus {
        self.status
    }

    pub fn filter_status(&self) -> FilterStatus {
        self.filter
    }

    pub fn inside(&self) -> Crossing {
        self.inside
    }

    pub fn cluster(&self) -> Option<&'a Measurement> {
        self.cluster
    }

    pub fn cluster_no_add(&self) -> Option<&'a Measurement> {
        self.no_add
    }

    pub fn ndf(&self) -> u32 {
        self.ndf
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn is_pixel(&self) -> bool {
        self.ndf == 2
    }

    pub fn set_cluster(&mut self, cluster: Option<&'a Measurement>) {
        self.cluster = cluster;
    }

    pub fn set_parameters_b(&mut self, parameters: PatternParameters) {
        self.pb = parameters;
        self.ub = parameters;
    }

    /// Mark as the last module with measurements on the road.
    pub fn last_active(&mut self) {
        self.status = DetStatus::LastActive;
    }

    /// Switch to the electron energy-loss model.
    pub fn brem_noise_model(&mut self) {
        self.noise_model = NoiseModel::Electron;
    }

    // -----------------------------------------------------------------------
    // Seeding and end points
    // -----------------------------------------------------------------------

    /// Start the forward filter on this element from the seed parameters.
    pub fn first_trajectory_element(
        &mut self,
        ctx: &SearchContext<'_>,
        seed: &PatternParameters,
    ) -> Result<(), StepError> {
        let m = self.cluster.ok_or(StepError::NoMeasurement)?;
        let mut pf = if seed.surface.id == self.surface.id {
            *seed
        } else {
            self.propagate(ctx, seed, false)?.parameters
        };
        pf.cov = Some(LocalCov::from_diagonal(&LocalVec::from(INITIAL_COVARIANCE)));
        self.pf = pf;
        self.uf = PatternParameters::initiate_from(&pf, m);
        self.start_forward();
        self.produce_noise(ctx, self.uf, Direction::Along);
        Ok(())
    }

    /// Restart the forward filter from the element's own estimate with an
    /// inflated covariance, optionally with corrected measurement errors.
    pub fn first_trajectory_element_refit(
        &mut self,
        ctx: &SearchContext<'_>,
        correction: bool,
    ) -> Result<(), StepError> {
        let m = self.cluster.ok_or(StepError::NoMeasurement)?;
        if self.filter == FilterStatus::Unset {
            return Err(StepError::NotFiltered);
        }
        if self.filter > FilterStatus::Forward {
            self.pf = self.ub;
        }
        if correction {
            self.pf.diagonalize(10.0);
            let (local, cov) = ctx.tools.corrector.correct(m, &self.pf);
            self.uf = PatternParameters::initiate(&self.pf, &local, &cov);
        } else {
            self.pf.diagonalize(100.0);
            self.uf = PatternParameters::initiate_from(&self.pf, m);
        }
        self.start_forward();
        self.produce_noise(ctx, self.uf, Direction::Along);
        Ok(())
    }

    fn start_forward(&mut self) {
        self.dist = -10.0;
        self.step = 0.0;
        self.xi2_f = 0.0;
        self.xi2_total_f = 0.0;
        self.filter = FilterStatus::Forward;
        self.inside = Crossing::Inside;
        self.n_missing = 0;
        self.links_f.clear();
        self.n_holes_f = 0;
        self.n_double_holes_f = 0;
        self.no_add = None;
        self.n_clusters_f = 1;
        self.ndf_f = self.ndf;
    }

    /// Start the backward pass on the last measured element.
    pub fn last_trajectory_element(&mut self, ctx: &SearchContext<'_>) -> Result<(), StepError> {
        let m = self.cluster.ok_or(StepError::NoMeasurement)?;
        if self.filter == FilterStatus::Unset {
            return Err(StepError::NotFiltered);
        }
        self.produce_noise(ctx, self.uf, Direction::Along);
        self.sm = self.pf;
        self.pb = self.uf;
        self.pb.diagonalize(100.0);
        self.ub = PatternParameters::initiate_from(&self.pb, m);
        self.start_backward();
        Ok(())
    }

    /// As [`Self::last_trajectory_element`] with corrected measurement errors.
    pub fn last_trajectory_element_precise(
        &mut self,
        ctx: &SearchContext<'_>,
    ) -> Result<(), StepError> {
        let m = self.cluster.ok_or(StepError::NoMeasurement)?;
        if self.filter == FilterStatus::Unset {
            return Err(StepError::NotFiltered);
        }
        self.radiation_length = ctx.tuning.precise_radiation_length;
        self.produce_noise(ctx, self.uf, Direction::Along);
        self.sm = self.pf;
        self.pb = self.uf;
        self.pb.diagonalize(10.0);
        let (local, cov) = ctx.tools.corrector.correct(m, &self.pb);
        self.ub = PatternParameters::initiate(&self.pb, &local, &cov);
        self.start_backward();
        Ok(())
    }

    fn start_backward(&mut self) {
        self.filter = FilterStatus::Smoothed;
        self.inside = Crossing::Inside;
        self.n_missing = 0;
        self.links_b.clear();
        self.n_holes_b = 0;
        self.n_double_holes_b = 0;
        self.no_add = None;
        self.n_clusters_b = 1;
        self.n_pixels_b = u32::from(self.ndf == 2);
        self.ndf_b = self.ndf;
        self.xi2_b = self.xi2_f;
        self.xi2_total_b = self.xi2_f;
        self.dist = -10.0;
    }

    // -----------------------------------------------------------------------
    // Forward passes
    // -----------------------------------------------------------------------

    /// Propagate from `prev` and filter with the measurement already
    /// assigned, if any.
    pub fn forward_propagation_without_search(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<(), StepError> {
        let p = self.propagate_forward_from(ctx, prev)?;
        self.pf = p.parameters;
        self.step = p.step + prev.step;
        self.copy_forward_counts(prev);

        if self.is_detector() {
            if let Some(m) = self.cluster {
                let r = self.add_cluster(ctx, &self.pf, m)?;
                self.uf = r.parameters;
                self.xi2_f = r.chi2;
                self.inside = Crossing::Inside;
                self.n_clusters_f += 1;
                self.xi2_total_f += r.chi2;
                self.ndf_f += self.ndf;
            } else {
                self.xi2_f = 0.0;
                self.check_boundaries(self.pf);
                self.count_forward_hole(ctx);
            }
        } else {
            self.radiation_length = dead_material_radiation_length(self.pf.position().z);
        }

        if self.inside.is_crossed() {
            let from = if self.cluster.is_some() { self.uf } else { self.pf };
            self.produce_noise(ctx, from, Direction::Along);
        } else {
            self.noise = NoiseState::default();
        }
        self.filter = FilterStatus::Forward;
        self.links_f.clear();
        self.no_add = None;
        Ok(())
    }

    /// Forward step with corrected measurement errors and the thicker
    /// material description of the final refit.
    pub fn forward_propagation_without_search_precise(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<(), StepError> {
        let p = self.propagate_forward_from(ctx, prev)?;
        self.pf = p.parameters;
        self.step = p.step + prev.step;
        self.copy_forward_counts(prev);
        self.inside = Crossing::Inside;

        if let Some(m) = self.cluster {
            let r = self.add_cluster_precise(ctx, &self.pf, m)?;
            self.uf = r.parameters;
            self.xi2_f = r.chi2;
            self.n_clusters_f += 1;
            self.xi2_total_f += r.chi2;
            self.ndf_f += self.ndf;
        } else if self.status.counts_holes() {
            self.n_holes_f += 1;
            self.n_double_holes_f += 1;
            self.n_missing += 1;
        }

        self.radiation_length = ctx.tuning.precise_radiation_length;
        let from = if self.cluster.is_some() { self.uf } else { self.pf };
        self.produce_noise(ctx, from, Direction::Along);
        self.filter = FilterStatus::Forward;
        Ok(())
    }

    /// Propagate from `prev`, classify the crossing and assign the best
    /// compatible measurement.
    pub fn forward_propagation_with_search(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<(), StepError> {
        let p = self.propagate_forward_from(ctx, prev)?;
        self.pf = p.parameters;
        self.step = p.step + prev.step;
        self.filter = FilterStatus::Forward;
        self.links_f.clear();
        self.cluster_old = self.cluster;
        self.cluster = None;
        self.no_add = None;
        self.xi2_f = UNSET_CHI2;
        self.copy_forward_counts(prev);

        if !self.is_detector() {
            self.radiation_length = dead_material_radiation_length(self.pf.position().z);
            self.produce_noise(ctx, self.pf, Direction::Along);
            return Ok(());
        }
        if !self.check_boundaries(self.pf) {
            self.noise = NoiseState::default();
            return Ok(());
        }

        self.links_f = self.search(ctx, &self.pf);
        match self.links_f.first().copied() {
            Some(best) => {
                self.xi2_f = best.chi2;
                if best.chi2 <= ctx.cuts.xi2_max {
                    let r = self.add_cluster(ctx, &self.pf, best.measurement)?;
                    self.cluster = Some(best.measurement);
                    self.uf = r.parameters;
                    self.produce_noise(ctx, self.uf, Direction::Along);
                    self.n_clusters_f += 1;
                    self.xi2_total_f += best.chi2;
                    self.ndf_f += best.measurement.dim;
                } else {
                    if best.chi2 <= ctx.cuts.xi2_max_no_add {
                        self.no_add = Some(best.measurement);
                    }
                    self.produce_noise(ctx, self.pf, Direction::Along);
                }
            }
            None => self.produce_noise(ctx, self.pf, Direction::Along),
        }

        if self.cluster.is_none() && self.no_add.is_none() {
            self.count_forward_hole(ctx);
        }
        Ok(())
    }

    fn propagate_forward_from(
        &self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<Propagation, StepError> {
        let mut start = if prev.cluster.is_some() { prev.uf } else { prev.pf };
        start.add_noise(&prev.noise, Direction::Along);
        self.propagate(ctx, &start, true)
    }

    fn copy_forward_counts(&mut self, prev: &TrajectoryElement<'a>) {
        self.n_double_holes_f = if prev.cluster.is_some() {
            0
        } else {
            prev.n_double_holes_f
        };
        self.n_clusters_f = prev.n_clusters_f;
        self.n_holes_f = prev.n_holes_f;
        self.n_missing = prev.n_missing;
        self.ndf_f = prev.ndf_f;
        self.xi2_total_f = prev.xi2_total_f;
    }

    fn count_forward_hole(&mut self, ctx: &SearchContext<'_>) {
        if self.status.counts_holes() && self.inside.is_inside() {
            self.n_holes_f += 1;
            self.n_double_holes_f += 1;
            if self.dist < -ctx.tuning.missing_distance {
                self.n_missing += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Backward passes
    // -----------------------------------------------------------------------

    /// Backward analogue of [`Self::forward_propagation_with_search`].
    pub fn backward_propagation_filter(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<(), StepError> {
        let mut start = if prev.cluster.is_some() { prev.ub } else { prev.pb };
        if prev.noise.correction_qop < 1.0 {
            start.add_noise(&prev.noise, Direction::Opposite);
        }
        let p = self.propagate(ctx, &start, true)?;
        self.pb = p.parameters;
        self.step = p.step + prev.step;
        self.filter = FilterStatus::Backward;
        self.links_b.clear();
        self.cluster_old = self.cluster;
        self.cluster = None;
        self.no_add = None;
        self.xi2_b = UNSET_CHI2;
        self.copy_backward_counts(prev);

        if !self.is_detector() {
            self.radiation_length = dead_material_radiation_length(self.pb.position().z);
            self.produce_noise(ctx, self.pb, Direction::Opposite);
            return Ok(());
        }
        if !self.check_boundaries(self.pb) {
            self.noise = NoiseState::default();
            return Ok(());
        }

        self.links_b = self.search(ctx, &self.pb);
        match self.links_b.first().copied() {
            Some(best) => {
                self.xi2_b = best.chi2;
                if best.chi2 <= ctx.cuts.xi2_max {
                    let r = self.add_cluster(ctx, &self.pb, best.measurement)?;
                    self.cluster = Some(best.measurement);
                    self.ub = r.parameters;
                    self.produce_noise(ctx, self.ub, Direction::Opposite);
                    self.accept_backward(best.chi2, best.measurement.dim);
                } else {
                    if best.chi2 <= ctx.cuts.xi2_max_no_add {
                        self.no_add = Some(best.measurement);
                    }
                    self.produce_noise(ctx, self.pb, Direction::Opposite);
                }
            }
            None => self.produce_noise(ctx, self.pb, Direction::Opposite),
        }

        if self.cluster.is_none() && self.no_add.is_none() {
            self.count_backward_hole(ctx);
        }
        Ok(())
    }

    /// Backward filter step that also combines with the forward prediction
    /// into the smoothed state and re-decides the measurement on it.
    ///
    /// With `two_point_seed` the acceptance cut is doubled.
    pub fn backward_propagation_smoother(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
        two_point_seed: bool,
    ) -> Result<(), StepError> {
        let start = if prev.cluster.is_some() { prev.ub } else { prev.pb };
        let p = self.propagate(ctx, &start, true)?;
        self.pb = p.parameters;
        let noise = self.noise;
        self.pb.add_noise(&noise, Direction::Opposite);
        self.copy_backward_counts(prev);

        if !self.is_detector() {
            self.filter = FilterStatus::Backward;
            return Ok(());
        }

        self.sm = ctx
            .tools
            .updator
            .combine(&self.pb, &self.pf)
            .ok_or(StepError::Combination(self.surface.id))?;
        self.filter = if self.cluster.is_some() {
            FilterStatus::Smoothed
        } else {
            FilterStatus::Backward
        };

        let xi2_max = if two_point_seed {
            2.0 * ctx.cuts.xi2_max
        } else {
            ctx.cuts.xi2_max
        };

        let crossed = self.check_boundaries(self.sm);
        self.links_b.clear();
        self.cluster_old = self.cluster;
        self.cluster = None;
        self.no_add = None;
        self.xi2_b = UNSET_CHI2;
        if !crossed {
            return Ok(());
        }

        match self.cluster_old {
            Some(old) if self.ndf_f == self.ndf && self.ndf_f + self.ndf_b <= 6 => {
                // first measurement of a short trajectory: keep it unless it
                // is badly off
                let r = self.add_cluster(ctx, &self.pb, old)?;
                self.xi2_b = r.chi2;
                if r.chi2 <= xi2_max {
                    self.cluster = Some(old);
                    self.ub = r.parameters;
                    self.accept_backward(r.chi2, old.dim);
                } else if r.chi2 <= ctx.cuts.xi2_max_no_add {
                    self.no_add = Some(old);
                }
            }
            _ => {
                self.links_b = self.search(ctx, &self.sm);
                if let Some(best) = self.links_b.first().copied() {
                    self.xi2_b = best.chi2;
                    if best.chi2 <= xi2_max {
                        let r = self.add_cluster(ctx, &self.pb, best.measurement)?;
                        self.cluster = Some(best.measurement);
                        self.ub = r.parameters;
                        self.xi2_b = r.chi2;
                        self.accept_backward(r.chi2, best.measurement.dim);
                    } else if best.chi2 <= ctx.cuts.xi2_max_no_add {
                        self.no_add = Some(best.measurement);
                    }
                }
            }
        }

        if self.cluster.is_none() && self.no_add.is_none() {
            self.count_backward_hole(ctx);
        }
        Ok(())
    }

    /// Backward step of the final refit; keeps the measurement choice.
    pub fn backward_propagation_precise(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
    ) -> Result<(), StepError> {
        let start = if prev.cluster.is_some() { prev.ub } else { prev.pb };
        let p = self.propagate(ctx, &start, true)?;
        self.pb = p.parameters;
        let noise = self.noise;
        self.pb.add_noise(&noise, Direction::Opposite);
        self.copy_backward_counts(prev);
        if let Some(s) = ctx.tools.updator.combine(&self.pb, &self.pf) {
            self.sm = s;
        }

        match self.cluster {
            Some(m) => {
                let r = self.add_cluster_precise(ctx, &self.pb, m)?;
                self.ub = r.parameters;
                self.xi2_b = r.chi2;
                self.accept_backward(r.chi2, m.dim);
                self.filter = FilterStatus::Smoothed;
            }
            None => self.filter = FilterStatus::Backward,
        }
        Ok(())
    }

    fn copy_backward_counts(&mut self, prev: &TrajectoryElement<'a>) {
        self.n_double_holes_b = if prev.cluster.is_some() {
            0
        } else {
            prev.n_double_holes_b
        };
        self.n_holes_b = prev.n_holes_b;
        self.n_missing = prev.n_missing;
        self.n_clusters_b = prev.n_clusters_b;
        self.n_pixels_b = prev.n_pixels_b;
        self.ndf_b = prev.ndf_b;
        self.xi2_total_b = prev.xi2_total_b;
    }

    fn accept_backward(&mut self, chi2: f64, dim: u32) {
        self.n_clusters_b += 1;
        if dim == 2 {
            self.n_pixels_b += 1;
        }
        self.xi2_total_b += chi2;
        self.ndf_b += dim;
    }

    fn count_backward_hole(&mut self, ctx: &SearchContext<'_>) {
        if self.status.counts_holes() && self.inside.is_inside() {
            self.n_holes_b += 1;
            self.n_double_holes_b += 1;
            if self.dist < -ctx.tuning.missing_distance {
                self.n_missing += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Alternatives for the branch-and-bound restart
    // -----------------------------------------------------------------------

    /// What dropping the forward measurement would leave. `None` when the
    /// drop is not allowed: the last active module, or a hole budget that
    /// one more hole would exceed.
    pub fn next_cluster_fallback_f(&self, ctx: &SearchContext<'_>) -> Option<Fallback> {
        if self.status == DetStatus::LastActive {
            return None;
        }
        Self::fallback(
            ctx,
            &self.links_f,
            self.xi2_total_f - self.xi2_f,
            self.inside,
            self.n_holes_f,
            self.n_double_holes_f,
        )
    }

    /// Backward analogue of [`Self::next_cluster_fallback_f`].
    pub fn next_cluster_fallback_b(&self, ctx: &SearchContext<'_>) -> Option<Fallback> {
        Self::fallback(
            ctx,
            &self.links_b,
            self.xi2_total_b - self.xi2_b,
            self.inside,
            self.n_holes_b,
            self.n_double_holes_b,
        )
    }

    fn fallback(
        ctx: &SearchContext<'_>,
        links: &Links<'a>,
        base: f64,
        inside: Crossing,
        holes: u32,
        double_holes: u32,
    ) -> Option<Fallback> {
        if let Some(next) = links.get(1).filter(|l| l.chi2 <= ctx.cuts.xi2_max) {
            return Some(Fallback {
                alternate: true,
                chi2: base + next.chi2,
            });
        }
        let ok = !inside.is_inside()
            || (holes < ctx.cuts.max_holes && double_holes < ctx.cuts.max_double_holes);
        ok.then_some(Fallback {
            alternate: false,
            chi2: base,
        })
    }

    /// Replace the forward measurement with the next-best link, or with
    /// none when no link is left within the acceptance cut.
    pub fn add_next_cluster_f(&mut self, ctx: &SearchContext<'_>) -> Result<(), StepError> {
        if self.links_f.is_empty() {
            return Err(StepError::NoAlternative);
        }
        if self.cluster.is_some() {
            self.xi2_total_f -= self.xi2_f;
        }
        if self.links_f.len() > 1 && self.links_f[1].chi2 <= ctx.cuts.xi2_max {
            self.links_f.remove(0);
            let next = self.links_f[0];
            self.cluster = Some(next.measurement);
            self.xi2_f = next.chi2;
            self.xi2_total_f += next.chi2;
            let r = self.add_cluster(ctx, &self.pf, next.measurement)?;
            self.uf = r.parameters;
            return Ok(());
        }
        self.links_f.clear();
        if self.cluster.take().is_some() {
            self.n_clusters_f -= 1;
            self.ndf_f -= self.ndf;
        }
        if self.inside.is_inside() {
            self.n_holes_f += 1;
            self.n_double_holes_f += 1;
        }
        self.xi2_f = 0.0;
        if self.dist < -ctx.tuning.missing_distance {
            self.n_missing += 1;
        }
        Ok(())
    }

    /// Backward analogue of [`Self::add_next_cluster_f`].
    pub fn add_next_cluster_b(&mut self, ctx: &SearchContext<'_>) -> Result<(), StepError> {
        if self.links_b.is_empty() {
            return Err(StepError::NoAlternative);
        }
        if self.cluster.is_some() {
            self.xi2_total_b -= self.xi2_b;
        }
        if self.links_b.len() > 1 && self.links_b[1].chi2 <= ctx.cuts.xi2_max {
            self.links_b.remove(0);
            let next = self.links_b[0];
            self.cluster = Some(next.measurement);
            self.xi2_b = next.chi2;
            self.xi2_total_b += next.chi2;
            let r = self.add_cluster(ctx, &self.pb, next.measurement)?;
            self.ub = r.parameters;
            return Ok(());
        }
        self.links_b.clear();
        if let Some(old) = self.cluster.take() {
            self.n_clusters_b -= 1;
            self.ndf_b -= self.ndf;
            if old.dim == 2 {
                self.n_pixels_b -= 1;
            }
        }
        if self.inside.is_inside() {
            self.n_holes_b += 1;
            self.n_double_holes_b += 1;
        }
        self.xi2_b = 0.0;
        if self.dist < -ctx.tuning.missing_distance {
            self.n_missing += 1;
        }
        Ok(())
    }

    /// Re-derive the forward update with `cluster` (or none) against the
    /// counters of `prev`, keeping the existing prediction.
    pub fn add_next_cluster_f_from(
        &mut self,
        ctx: &SearchContext<'_>,
        prev: &TrajectoryElement<'a>,
        cluster: Option<&'a Measurement>,
    ) -> Result<(), StepError> {
        self.cluster_old = self.cluster;
        self.cluster = cluster;
        self.copy_forward_counts(prev);
        match cluster {
            Some(m) => {
                let r = self.add_cluster(ctx, &self.pf, m)?;
                self.uf = r.parameters;
                self.xi2_f = r.chi2;
                self.inside = Crossing::Inside;
                self.produce_noise(ctx, self.uf, Direction::Along);
                self.n_clusters_f += 1;
                self.xi2_total_f += r.chi2;
                self.ndf_f += m.dim;
            }
            None => {
                if self.inside.is_inside() {
                    self.n_holes_f += 1;
                    self.n_double_holes_f += 1;
                }
                self.xi2_f = 0.0;
                if self.dist < -ctx.tuning.missing_distance {
                    self.n_missing += 1;
                }
            }
        }
        Ok(())
    }

    /// Undo the forward bookkeeping of a rejected seed measurement.
    pub fn erase_cluster_forward_propagation(&mut self) {
        if self.cluster.take().is_some() {
            self.n_clusters_f -= 1;
            self.xi2_total_f -= self.xi2_f;
            self.ndf_f -= self.ndf;
        }
    }

    // -----------------------------------------------------------------------
    // Scores
    // -----------------------------------------------------------------------

    /// Score contribution of the element. `running_holes` counts holes since
    /// the last measurement; a second hole in a row doubles the penalty.
    pub fn quality(&self, ctx: &SearchContext<'_>, running_holes: &mut u32) -> f64 {
        if self.cluster.is_none() && self.no_add.is_none() {
            if !self.status.counts_holes() {
                return 0.0;
            }
            return match self.inside {
                Crossing::Inside => {
                    let mut w = 2.0 - ctx.cuts.xi2_max;
                    *running_holes += 1;
                    if *running_holes > 1 {
                        w *= 2.0;
                    }
                    w
                }
                Crossing::Edge => -1.0,
                Crossing::Outside => 0.0,
            };
        }
        let x = if self.filter == FilterStatus::Forward {
            self.xi2_f
        } else {
            self.xi2_b
        };
        let xc = ctx.cuts.xi2_max + 2.0;
        let w = if self.ndf == 2 {
            1.2 * (xc - 0.5 * x)
        } else {
            xc - x
        };
        *running_holes = 0;
        w.max(-1.0)
    }

    /// The smoothing pass changed the measurement choice or has not reached
    /// this element.
    pub fn difference(&self) -> bool {
        !same_measurement(self.cluster, self.cluster_old) || self.filter != FilterStatus::Smoothed
    }

    // -----------------------------------------------------------------------
    // Geometry helpers
    // -----------------------------------------------------------------------

    /// Best current estimate, by the direction of the last pass.
    pub fn best_parameters(&self) -> &PatternParameters {
        match (self.filter, self.cluster.is_some()) {
            (FilterStatus::Smoothed, _) => &self.sm,
            (FilterStatus::Backward, true) => &self.ub,
            (FilterStatus::Backward, false) => &self.pb,
            (_, true) => &self.uf,
            (_, false) => &self.pf,
        }
    }

    /// Path length from `other`'s estimate to this surface; zero when the
    /// propagation fails.
    pub fn step_from(&self, ctx: &SearchContext<'_>, other: &TrajectoryElement<'a>) -> f64 {
        self.propagate(ctx, other.best_parameters(), false)
            .map_or(0.0, |p| p.step)
    }

    pub fn global_position(&self, ctx: &SearchContext<'_>) -> Vector3<f64> {
        if self.filter == FilterStatus::Smoothed {
            let b = if self.cluster.is_some() { &self.ub } else { &self.pb };
            if let Some(c) = ctx.tools.updator.combine(b, &self.pf) {
                return c.position();
            }
        }
        self.best_parameters().position()
    }

    /// Transverse path to the point of closest approach to the beam line;
    /// positive when the perigee lies ahead.
    pub fn step_to_perigee(&self) -> f64 {
        let p = if self.cluster.is_some() { &self.ub } else { &self.pb };
        let r = p.position();
        let d = p.direction();
        -(r.x * d.x + r.y * d.y)
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Parameters emitted for the element at `position` in the track.
    pub fn track_parameters(
        &self,
        ctx: &SearchContext<'_>,
        position: StatePosition,
        with_covariance: bool,
        new_direction: bool,
    ) -> PatternParameters {
        let has_cluster = self.cluster.is_some();
        let mut p = match self.filter {
            FilterStatus::Forward | FilterStatus::Unset => {
                if has_cluster {
                    self.uf
                } else {
                    self.pf
                }
            }
            FilterStatus::Backward => {
                if has_cluster {
                    self.ub
                } else {
                    self.pb
                }
            }
            FilterStatus::Smoothed => match (position, self.cluster) {
                (_, None) => self.sm,
                (StatePosition::First, Some(_)) => self.ub,
                (StatePosition::Last, Some(_)) => self.uf,
                (StatePosition::Interior, Some(m)) => self
                    .add_cluster(ctx, &self.sm, m)
                    .map(|r| r.parameters)
                    .unwrap_or_else(|_| {
                        let qop_var = |p: &PatternParameters| {
                            p.cov.map_or(f64::MAX, |c| c[(QOP, QOP)])
                        };
                        if qop_var(&self.ub) < qop_var(&self.pf) {
                            self.ub
                        } else {
                            self.pf
                        }
                    }),
            },
        };
        if !with_covariance {
            p.cov = None;
        }
        if new_direction {
            p.change_direction();
        }
        p
    }

    fn fit_quality(&self) -> FitQuality {
        let chi2 = if self.filter == FilterStatus::Forward {
            self.xi2_f
        } else {
            self.xi2_b
        };
        FitQuality {
            chi2,
            ndf: self.ndf as i32,
        }
    }

    fn material_effects(&self) -> MaterialEffects {
        MaterialEffects {
            radiation_length: self.rad_traversed,
            sigma_azimuth: self.noise.cov_azimuth.max(0.0).sqrt(),
            sigma_polar: self.noise.cov_polar.max(0.0).sqrt(),
        }
    }

    /// Full track state: measurement or outlier, parameters with covariance,
    /// fit quality and material.
    pub fn track_state(
        &self,
        ctx: &SearchContext<'_>,
        position: StatePosition,
        new_direction: bool,
    ) -> Option<TrackState> {
        let (kind, m) = match (self.cluster, self.no_add) {
            (Some(m), _) => (TrackStateKind::Measurement, m),
            (None, Some(m)) => (TrackStateKind::Outlier, m),
            (None, None) => return None,
        };
        let p = self.track_parameters(ctx, position, true, new_direction);
        Some(self.state_with(ctx, kind, m, &p, self.fit_quality()))
    }

    /// Alternative pixel assignments within `xi2_multi` of the backward
    /// prediction, at most `max_states − 1` of them.
    pub fn alternative_track_states(
        &self,
        ctx: &SearchContext<'_>,
        xi2_multi: f64,
        new_direction: bool,
    ) -> Vec<TrackState> {
        if self.cluster.is_none() || self.ndf != 2 || self.links_b.len() < 2 {
            return Vec::new();
        }
        let limit = ctx.tuning.max_alternative_states.saturating_sub(1);
        self.links_b
            .iter()
            .skip(1)
            .take_while(|l| l.chi2 <= xi2_multi)
            .take(limit)
            .filter_map(|l| {
                let r = self.add_cluster(ctx, &self.sm, l.measurement).ok()?;
                let mut p = r.parameters;
                if new_direction {
                    p.change_direction();
                }
                let fit = FitQuality {
                    chi2: l.chi2,
                    ndf: self.ndf as i32,
                };
                Some(self.state_with(ctx, TrackStateKind::Measurement, l.measurement, &p, fit))
            })
            .collect()
    }

    fn state_with(
        &self,
        ctx: &SearchContext<'_>,
        kind: TrackStateKind,
        m: &Measurement,
        p: &PatternParameters,
        fit: FitQuality,
    ) -> TrackState {
        let (local, covariance) = ctx.tools.corrector.correct(m, p);
        TrackState {
            element: self.detector().map(|d| d.id),
            kind,
            parameters: Some(TrackParameters::from_pattern(p)),
            measurement: Some(m.id),
            measured: Some(MeasuredPosition {
                local,
                covariance,
                dim: m.dim,
            }),
            fit: Some(fit),
            material: Some(self.material_effects()),
        }
    }

    /// Reduced state: raw measurement, parameters only when asked for.
    pub fn simple_track_state(
        &self,
        ctx: &SearchContext<'_>,
        position: StatePosition,
        with_parameters: bool,
        new_direction: bool,
    ) -> Option<TrackState> {
        let detector = self.detector()?;
        let m = self.cluster?;
        let parameters = with_parameters.then(|| {
            TrackParameters::from_pattern(&self.track_parameters(ctx, position, true, new_direction))
        });
        Some(TrackState {
            element: Some(detector.id),
            kind: TrackStateKind::Measurement,
            parameters,
            measurement: Some(m.id),
            measured: Some(MeasuredPosition {
                local: m.local,
                covariance: m.covariance,
                dim: m.dim,
            }),
            fit: None,
            material: None,
        })
    }

    /// Backward estimate moved to the transverse perigee plane.
    pub fn perigee_state(&self, ctx: &SearchContext<'_>) -> Option<TrackState> {
        let start = if self.cluster.is_some() { &self.ub } else { &self.pb };
        let target = PlaneSurface::transverse_perigee(&start.direction());
        let p = ctx.tools.propagator.propagate(start, &target, true)?;
        Some(TrackState::perigee(&p.parameters))
    }

    // -----------------------------------------------------------------------
    // Primitives
    // -----------------------------------------------------------------------

    fn propagate(
        &self,
        ctx: &SearchContext<'_>,
        start: &PatternParameters,
        with_covariance: bool,
    ) -> Result<Propagation, StepError> {
        ctx.tools
            .propagator
            .propagate(start, &self.surface, with_covariance)
            .ok_or(StepError::Propagation(self.surface.id))
    }

    fn add_cluster(
        &self,
        ctx: &SearchContext<'_>,
        predicted: &PatternParameters,
        m: &Measurement,
    ) -> Result<KfUpdateResult, StepError> {
        ctx.tools
            .updator
            .update(predicted, &m.local, &m.covariance, m.dim)
            .ok_or(StepError::Update(self.surface.id))
    }

    fn add_cluster_precise(
        &self,
        ctx: &SearchContext<'_>,
        predicted: &PatternParameters,
        m: &Measurement,
    ) -> Result<KfUpdateResult, StepError> {
        let (local, cov) = ctx.tools.corrector.correct(m, predicted);
        ctx.tools
            .updator
            .update(predicted, &local, &cov, m.dim)
            .ok_or(StepError::Update(self.surface.id))
    }

    fn search(&self, ctx: &SearchContext<'_>, predicted: &PatternParameters) -> Links<'a> {
        search_links(
            &*ctx.tools.updator,
            predicted,
            self.measurements,
            ctx.cuts.xi2_max_link,
            ctx.claims,
        )
    }

    /// Classify `p` against the module outline. Returns `false` when the
    /// prediction misses the module.
    fn check_boundaries(&mut self, p: PatternParameters) -> bool {
        let Some(link) = self.link else {
            return true;
        };
        let cov = p.local_covariance().unwrap_or_else(Matrix2::zeros);
        let (crossing, dist) = link.intersect(&p.local_position(), &cov);
        self.inside = crossing;
        self.dist = dist;
        crossing.is_crossed()
    }

    fn produce_noise(&mut self, ctx: &SearchContext<'_>, from: PatternParameters, direction: Direction) {
        let model = if ctx.brem_noise {
            self.noise_model
        } else {
            NoiseModel::Muon
        };
        let material = Material {
            radiation_length: self.radiation_length,
            energy_loss: ctx.tuning.energy_loss,
        };
        let (noise, rad) = NoiseState::produce(
            model,
            direction,
            from.par[QOP],
            &from.direction(),
            &self.surface.normal(),
            material,
        );
        self.noise = noise;
        self.rad_traversed = rad;
    }
}

fn same_measurement(a: Option<&Measurement>, b: Option<&Measurement>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id == b.id,
        (None, None) => true,
        _ => false,
    }
}

impl fmt::Display for TrajectoryElement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self
            .detector()
            .map_or_else(|| "dead".to_string(), |d| d.id.to_string());
        let hit = |m: Option<&Measurement>| m.map_or_else(|| "-".to_string(), |m| m.id.to_string());
        write!(
            f,
            "{:>6} {:?}/{:?}/{:?} cl={:>6} na={:>6} xf={:>8.3} xb={:>8.3} \
             nf={:>2} nb={:>2} hf={} hb={} ndf={}/{} step={:>9.2}",
            id,
            self.status,
            self.filter,
            self.inside,
            hit(self.cluster),
            hit(self.no_add),
            self.xi2_f,
            self.xi2_b,
            self.n_clusters_f,
            self.n_clusters_b,
            self.n_holes_f,
            self.n_holes_b,
            self.ndf_f,
            self.ndf_b,
            self.step,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
