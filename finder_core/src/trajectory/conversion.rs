//! Conversion of the span into output track states.
//!
//! # Alternates
//! In multi-track mode every emitted element keeps a row of states: the
//! primary assignment followed by the ambiguous pixel alternatives. An
//! odometer over the rows enumerates the remaining combinations one track
//! at a time, the first row turning fastest.

use super::{StateAlternatives, Trajectory};
use crate::element::{FilterStatus, StatePosition};
use crate::parameters::PatternParameters;
use crate::tools::SearchContext;
use crate::track::{FitQuality, TrackState};

/// Parameters are fit relative to five track parameters.
const FIT_PARAMETERS: i32 = 5;

impl<'a> Trajectory<'a> {
    /// Cosmic tracks whose first state points upward are emitted in the
    /// reversed direction.
    fn new_direction(&self, ctx: &SearchContext<'_>) -> bool {
        ctx.cuts.cosmic && self.at(self.first).ub.par[2] >= 0.0
    }

    /// Track states of the span: first, interior measurements and outliers,
    /// last. Fills the alternates table when multi-track mode applies.
    pub fn convert_to_track_states(&mut self, ctx: &SearchContext<'_>) -> Vec<TrackState> {
        self.alternatives.clear();
        self.odometer.clear();
        if !self.seeded {
            return Vec::new();
        }
        if self.new_direction(ctx) {
            return self.reversed_track_states(ctx);
        }

        let multi = ctx.cuts.multi_tracks
            && self.n_clusters > ctx.cuts.min_clusters
            && self.pt_first() >= ctx.cuts.pt_min;

        let mut positions = Vec::with_capacity(self.last - self.first + 1);
        positions.push((self.first, StatePosition::First));
        for p in self.first + 1..self.last {
            let e = self.at(p);
            if e.cluster.is_some() || e.no_add.is_some() {
                positions.push((p, StatePosition::Interior));
            }
        }
        positions.push((self.last, StatePosition::Last));

        let mut states = Vec::with_capacity(positions.len());
        let mut rows = Vec::new();
        for (p, position) in positions {
            let e = self.at(p);
            let Some(state) = e.track_state(ctx, position, false) else {
                continue;
            };
            states.push(state);
            if multi {
                let mut row = StateAlternatives::new();
                row.push(state);
                row.extend(e.alternative_track_states(ctx, ctx.cuts.xi2_multi_tracks, false));
                rows.push(row);
            }
        }
        if multi {
            self.odometer = vec![0; rows.len()];
            self.alternatives = rows;
        }
        states
    }

    fn reversed_track_states(&self, ctx: &SearchContext<'_>) -> Vec<TrackState> {
        let mut states = Vec::new();
        states.extend(self.at(self.last).track_state(ctx, StatePosition::Last, true));
        for p in (self.first + 1..self.last).rev() {
            let e = self.at(p);
            if e.cluster.is_some() || e.no_add.is_some() {
                states.extend(e.track_state(ctx, StatePosition::Interior, true));
            }
        }
        states.extend(self.at(self.first).track_state(ctx, StatePosition::First, true));
        states
    }

    /// Reduced states: the perigee, the first measurement, interior
    /// measurements without parameters and the last measurement with them.
    pub fn convert_to_simple_track_states(&self, ctx: &SearchContext<'_>) -> Vec<TrackState> {
        if !self.seeded {
            return Vec::new();
        }
        if self.new_direction(ctx) {
            let mut states = Vec::new();
            states.extend(self.at(self.last).simple_track_state(ctx, StatePosition::Last, true, true));
            for p in (self.first + 1..self.last).rev() {
                states.extend(self.at(p).simple_track_state(ctx, StatePosition::Interior, false, true));
            }
            states.extend(self.at(self.first).simple_track_state(ctx, StatePosition::First, false, true));
            return states;
        }

        let first = self.at(self.first);
        let mut states = Vec::new();
        states.extend(first.perigee_state(ctx));
        states.extend(first.simple_track_state(ctx, StatePosition::First, false, false));

        let Some(last_cluster) = (self.first..=self.last)
            .rev()
            .find(|&p| self.at(p).cluster.is_some())
        else {
            return states;
        };
        if last_cluster == self.first {
            return states;
        }
        for p in self.first + 1..last_cluster {
            states.extend(self.at(p).simple_track_state(ctx, StatePosition::Interior, false, false));
        }
        states.extend(self.at(last_cluster).simple_track_state(ctx, StatePosition::Last, true, false));
        states
    }

    /// Next combination of alternates, or `None` once every combination
    /// has been emitted.
    pub fn convert_to_next_track_states(&mut self) -> Option<Vec<TrackState>> {
        let mut advanced = false;
        for (row, digit) in self.alternatives.iter().zip(self.odometer.iter_mut()) {
            if *digit + 1 < row.len() {
                *digit += 1;
                advanced = true;
                break;
            }
            *digit = 0;
        }
        if !advanced {
            return None;
        }
        Some(
            self.alternatives
                .iter()
                .zip(&self.odometer)
                .map(|(row, &digit)| row[digit])
                .collect(),
        )
    }

    /// Total backward χ² at the first element with the track's ndf.
    pub fn convert_to_fit_quality(&self) -> FitQuality {
        FitQuality {
            chi2: self.at(self.first).xi2_total_b,
            ndf: self.ndf as i32 - FIT_PARAMETERS,
        }
    }

    /// Transverse momentum at the first element once a backward pass ran.
    pub fn pt_first(&self) -> f64 {
        if !self.seeded {
            return 0.0;
        }
        let e = self.at(self.first);
        if e.filter <= FilterStatus::Forward {
            return 0.0;
        }
        e.ub.pt()
    }

    pub fn first_parameters(&self) -> Option<&PatternParameters> {
        if !self.seeded {
            return None;
        }
        let e = self.at(self.first);
        (e.filter > FilterStatus::Forward).then_some(&e.ub)
    }

    /// The span ends on a pixel module, which marks a pixel seed right
    /// after initialisation.
    pub fn is_last_pixel(&self) -> bool {
        self.seeded && self.at(self.last).is_pixel()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
