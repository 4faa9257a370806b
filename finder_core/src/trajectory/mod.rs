//! The trajectory of one seed: an arena of [`TrajectoryElement`]s along the
//! road plus the index map that gives their current order.
//!
//! # Layout
//! ```text
//! slots  : [e0 e1 e2 ... e299]        reused for every seed
//! map    : position -> slot           positions 0..n_elements
//! span   : first ..= last             positions holding the track
//! ```
//! Compacting, re-ordering and installing a better branch only rewrite the
//! map; the element slots stay where they are.
//!
//! # Design choices
//! - The arena is allocated once per worker and rebound per seed, so the
//!   search itself never allocates elements.
//! - Operations return `Result<_, SearchError>`. A failure leaves the
//!   trajectory in a state that the next [`Trajectory::initialize`] resets.
//! - Neighbouring elements are accessed as a shared/exclusive pair split out
//!   of the slot vector; see [`pair_mut`].

mod conversion;
mod extension;
mod ordering;
mod seeding;
mod smoothing;

pub use extension::{ExtensionSummary, Score};
pub use seeding::{
    global_positions_to_measurements, track_parameters_to_measurements, DEAD_MATERIAL_SURFACE,
};

use crate::association::{self, ClaimIndex};
use crate::element::TrajectoryElement;
use crate::error::SearchError;
use crate::track::{PatternHoleSearchOutcome, TrackState};
use crate::types::MAX_TRAJECTORY_ELEMENTS;
use detector_models::Measurement;
use smallvec::SmallVec;
use std::fmt;

/// Alternative states of one emitted element; index 0 is the primary.
pub(crate) type StateAlternatives = SmallVec<[TrackState; 3]>;

pub struct Trajectory<'a> {
    elements: Vec<TrajectoryElement<'a>>,
    map: Vec<usize>,
    n_elements: usize,
    first: usize,
    last: usize,
    seeded: bool,

    n_clusters: u32,
    n_clusters_no_add: u32,
    n_holes: u32,
    n_double_holes: u32,
    n_holes_before: u32,
    n_holes_after: u32,
    ndf: u32,
    ndf_cut: u32,
    /// Measurement choices changed by the last smoothing pass
    difference: u32,
    n_active: u32,

    hole_search: PatternHoleSearchOutcome,
    alternatives: Vec<StateAlternatives>,
    odometer: Vec<usize>,
}

impl Default for Trajectory<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Trajectory<'a> {
    pub fn new() -> Self {
        Self {
            elements: vec![TrajectoryElement::default(); MAX_TRAJECTORY_ELEMENTS],
            map: (0..MAX_TRAJECTORY_ELEMENTS).collect(),
            n_elements: 0,
            first: 0,
            last: 0,
            seeded: false,
            n_clusters: 0,
            n_clusters_no_add: 0,
            n_holes: 0,
            n_double_holes: 0,
            n_holes_before: 0,
            n_holes_after: 0,
            ndf: 0,
            ndf_cut: 0,
            difference: 0,
            n_active: 0,
            hole_search: PatternHoleSearchOutcome::default(),
            alternatives: Vec::new(),
            odometer: Vec::new(),
        }
    }

    /// Forget the previous seed. Element slots are rebound lazily.
    pub fn reset(&mut self) {
        self.n_elements = 0;
        self.first = 0;
        self.last = 0;
        self.seeded = false;
        self.n_clusters = 0;
        self.n_clusters_no_add = 0;
        self.n_holes = 0;
        self.n_double_holes = 0;
        self.n_holes_before = 0;
        self.n_holes_after = 0;
        self.ndf = 0;
        self.ndf_cut = 0;
        self.difference = 0;
        self.n_active = 0;
        self.hole_search = PatternHoleSearchOutcome::default();
        self.alternatives.clear();
        self.odometer.clear();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    pub fn first_element(&self) -> usize {
        self.first
    }

    pub fn last_element(&self) -> usize {
        self.last
    }

    pub fn n_clusters(&self) -> u32 {
        self.n_clusters
    }

    pub fn n_clusters_no_add(&self) -> u32 {
        self.n_clusters_no_add
    }

    pub fn n_holes(&self) -> u32 {
        self.n_holes
    }

    pub fn n_double_holes(&self) -> u32 {
        self.n_double_holes
    }

    /// Holes between the first measurement and the start of the road.
    pub fn n_holes_before(&self) -> u32 {
        self.n_holes_before
    }

    /// Holes between the last measurement and the end of the road.
    pub fn n_holes_after(&self) -> u32 {
        self.n_holes_after
    }

    /// Holes from the first measurement to the end of the road: interior
    /// holes plus those after the last measurement.
    pub fn n_holes_total(&self) -> u32 {
        self.n_holes + self.n_holes_after
    }

    pub fn ndf(&self) -> u32 {
        self.ndf
    }

    pub fn difference(&self) -> u32 {
        self.difference
    }

    pub fn hole_search_result(&self) -> PatternHoleSearchOutcome {
        self.hole_search
    }

    /// Element at trajectory position `position`.
    pub fn element(&self, position: usize) -> &TrajectoryElement<'a> {
        &self.elements[self.map[position]]
    }

    /// Measurements on the track, in trajectory order.
    pub fn clusters(&self) -> impl Iterator<Item = &'a Measurement> + '_ {
        self.span().filter_map(|e| e.cluster())
    }

    /// Measurements plus outliers.
    pub fn clusters_with_outliers(&self) -> impl Iterator<Item = &'a Measurement> + '_ {
        self.span().filter_map(|e| e.cluster().or(e.cluster_no_add()))
    }

    fn span(&self) -> impl Iterator<Item = &TrajectoryElement<'a>> + '_ {
        let end = if self.seeded { self.last + 1 } else { self.first };
        (self.first..end).map(move |p| &self.elements[self.map[p]])
    }

    pub(crate) fn at(&self, position: usize) -> &TrajectoryElement<'a> {
        &self.elements[self.map[position]]
    }

    pub(crate) fn at_mut(&mut self, position: usize) -> &mut TrajectoryElement<'a> {
        &mut self.elements[self.map[position]]
    }

    /// Element at `prev` for reading and element at `cur` for writing.
    pub(crate) fn pair(
        &mut self,
        prev: usize,
        cur: usize,
    ) -> (&TrajectoryElement<'a>, &mut TrajectoryElement<'a>) {
        pair_mut(&mut self.elements, self.map[prev], self.map[cur])
    }

    // -----------------------------------------------------------------------
    // Ambiguity
    // -----------------------------------------------------------------------

    /// Whether the candidate is not a subset of an accepted track.
    pub fn is_new_track(&self, claims: &ClaimIndex) -> bool {
        if !self.seeded {
            return false;
        }
        association::is_new_track(
            self.clusters_with_outliers().map(|m| m.id),
            (self.n_clusters + self.n_clusters_no_add) as usize,
            claims,
        )
    }

    /// Structural consistency of map, span and counters.
    pub fn check_invariants(&self) -> Result<(), SearchError> {
        if self.n_elements > MAX_TRAJECTORY_ELEMENTS {
            return Err(SearchError::Invariant("more elements than arena slots"));
        }
        if !self.seeded {
            return Ok(());
        }
        if self.first > self.last || self.last >= self.n_elements {
            return Err(SearchError::Invariant("span outside the element range"));
        }
        let mut seen = [false; MAX_TRAJECTORY_ELEMENTS];
        for &slot in &self.map[..self.n_elements] {
            if slot >= MAX_TRAJECTORY_ELEMENTS || seen[slot] {
                return Err(SearchError::Invariant("index map is not injective"));
            }
            seen[slot] = true;
        }
        let clusters = self.clusters().count();
        if clusters != self.n_clusters as usize {
            return Err(SearchError::Invariant("measurement count out of step"));
        }
        let possible_holes = self
            .span()
            .filter(|e| {
                e.cluster().is_none()
                    && e.cluster_no_add().is_none()
                    && e.inside().is_inside()
                    && e.status().counts_holes()
            })
            .count();
        if self.n_holes as usize > possible_holes {
            return Err(SearchError::Invariant("more holes than empty crossings"));
        }
        Ok(())
    }
}

/// Shared access to slot `prev` and exclusive access to slot `cur`.
pub(crate) fn pair_mut<'s, 'a>(
    elements: &'s mut [TrajectoryElement<'a>],
    prev: usize,
    cur: usize,
) -> (&'s TrajectoryElement<'a>, &'s mut TrajectoryElement<'a>) {
    debug_assert_ne!(prev, cur);
    if prev < cur {
        let (lo, hi) = elements.split_at_mut(cur);
        (&lo[prev], &mut hi[0])
    } else {
        let (lo, hi) = elements.split_at_mut(prev);
        (&hi[0], &mut lo[cur])
    }
}

impl fmt::Display for Trajectory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "trajectory: elements={} span={}..={} clusters={} no_add={} holes={} \
             double_holes={} before={} after={} ndf={}",
            self.n_elements,
            self.first,
            self.last,
            self.n_clusters,
            self.n_clusters_no_add,
            self.n_holes,
            self.n_double_holes,
            self.n_holes_before,
            self.n_holes_after,
            self.ndf,
        )?;
        for p in 0..self.n_elements {
            let mark = if p == self.first {
                '>'
            } else if p == self.last {
                '<'
            } else {
                ' '
            };
            writeln!(f, "{mark}{p:>3} {}", self.at(p))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures;
