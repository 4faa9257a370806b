//! Ordering, trimming and scoring of the finished span.

use super::Trajectory;
use crate::element::StatePosition;
use crate::tools::SearchContext;
use crate::track::PatternHoleSearchOutcome;
use detector_models::BoundaryCheckResult;
use nalgebra::Matrix2;

impl<'a> Trajectory<'a> {
    /// Element contributes to the ordering: it has a measurement or an
    /// outlier, or the track crosses it well inside.
    fn is_ordered(&self, position: usize) -> bool {
        let e = self.at(position);
        e.cluster.is_some() || e.no_add.is_some() || e.inside.is_inside()
    }

    /// Put the span in order of path length from the seed element and trim
    /// leading and trailing elements without a measurement.
    ///
    /// Neighbours swap when their recorded path lengths disagree with the
    /// direction of the span and a direct propagation between them confirms
    /// it. Holes left outside the outermost measurements by a re-sort move
    /// to the before/after counters.
    pub fn sort_step(&mut self, ctx: &SearchContext<'_>) {
        if !self.seeded {
            return;
        }
        let mut kept = self.first;
        for p in self.first + 1..=self.last {
            if self.is_ordered(p) {
                kept += 1;
                self.map[kept] = self.map[p];
            }
        }
        self.last = kept;
        self.n_elements = kept + 1;

        let ascending = self.at(self.last).step - self.at(self.first).step > 0.0;
        let mut sorted = true;
        loop {
            let mut swapped = false;
            for n in self.first + 1..=self.last {
                let (a, b) = (self.map[n - 1], self.map[n]);
                let (before, after) = (&self.elements[a], &self.elements[b]);
                let misplaced = if ascending {
                    after.step < before.step && after.step_from(ctx, before) < 0.0
                } else {
                    after.step > before.step && after.step_from(ctx, before) > 0.0
                };
                if misplaced {
                    self.map.swap(n - 1, n);
                    swapped = true;
                    sorted = false;
                }
            }
            if !swapped {
                break;
            }
        }
        if sorted {
            return;
        }
        tracing::trace!(first = self.first, last = self.last, "zig-zag road re-sorted");

        let mut n = self.first;
        while n <= self.last {
            let e = self.at(n);
            if e.cluster.is_some() {
                break;
            }
            if e.no_add.is_some() {
                self.n_clusters_no_add = self.n_clusters_no_add.saturating_sub(1);
            } else if e.inside.is_inside() && e.status.counts_holes() {
                self.n_holes = self.n_holes.saturating_sub(1);
                self.n_holes_before += 1;
            }
            n += 1;
        }
        let mut m = self.last;
        while m > n {
            let e = self.at(m);
            if e.cluster.is_some() {
                break;
            }
            if e.no_add.is_some() {
                self.n_clusters_no_add = self.n_clusters_no_add.saturating_sub(1);
            } else if e.inside.is_inside() && e.status.counts_holes() {
                self.n_holes = self.n_holes.saturating_sub(1);
                self.n_holes_after += 1;
            }
            m -= 1;
        }
        self.first = n.min(m);
        self.last = m;
    }

    /// Drop leading pixel measurements on the far side of the perigee, as
    /// left by a path through the beam line. Returns whether the span
    /// changed.
    pub fn jump_through_perigee(&mut self) -> bool {
        if !self.seeded {
            return false;
        }
        let span_step = self.at(self.last).step - self.at(self.first).step;
        let mut p = self.first;
        while p <= self.last {
            let e = self.at(p);
            if e.cluster.is_some() && (e.ndf != 2 || e.step_to_perigee() * span_step <= 0.0) {
                break;
            }
            p += 1;
        }
        if p == self.first || p > self.last {
            return false;
        }
        for q in self.first..p {
            let e = self.at(q);
            let ndf = e.ndf;
            match (e.cluster, e.no_add) {
                (Some(_), _) => {
                    self.n_clusters -= 1;
                    self.ndf -= ndf;
                }
                (None, Some(_)) => {
                    self.n_clusters_no_add = self.n_clusters_no_add.saturating_sub(1);
                }
                (None, None) => {
                    if e.inside.is_inside() && e.status.counts_holes() {
                        self.n_holes = self.n_holes.saturating_sub(1);
                    }
                }
            }
        }
        self.first = p;
        true
    }

    /// Sum of the element scores over the span.
    pub fn quality(&self, ctx: &SearchContext<'_>) -> f64 {
        let mut holes = 0;
        (self.first..=self.last)
            .map(|p| self.at(p).quality(ctx, &mut holes))
            .sum()
    }

    /// Cut the span to the sub-span of highest score, first choosing its
    /// last measurement going forward, then its first going backward.
    /// Counters follow the cut. `None` when no sub-span has enough
    /// measurements.
    pub fn quality_optimization(&mut self, ctx: &SearchContext<'_>) -> Option<f64> {
        if !self.seeded {
            return None;
        }
        let mut holes = 0;
        let mut q = 0.0;
        let mut best = 0.0;
        let mut last = self.first;
        for p in self.first..=self.last {
            let e = self.at(p);
            q += e.quality(ctx, &mut holes);
            if e.cluster.is_some() && q > best {
                best = q;
                last = p;
            }
        }
        if last == self.first {
            return None;
        }

        let mut first = last;
        let (mut n_clusters, mut n_no_add, mut n_holes, mut n_double_holes, mut ndf) =
            (0u32, 0u32, 0u32, 0u32, 0u32);
        let mut best_counts = (0u32, 0u32, 0u32, 0u32, 0u32);
        holes = 0;
        q = 0.0;
        best = 0.0;
        for p in (self.first..=last).rev() {
            let e = self.at(p);
            q += e.quality(ctx, &mut holes);
            if e.cluster.is_some() {
                n_clusters += 1;
                ndf += e.ndf;
                if q > best {
                    best = q;
                    first = p;
                    best_counts = (n_clusters, n_no_add, n_holes, n_double_holes, ndf);
                }
            } else if e.no_add.is_some() {
                n_no_add += 1;
            } else if e.inside.is_inside() && e.status.counts_holes() {
                n_holes += 1;
                n_double_holes = n_double_holes.max(holes);
            }
        }

        let (c, na, h, dh, d) = best_counts;
        if first == last || c + na < ctx.cuts.min_clusters {
            return None;
        }
        self.n_clusters = c;
        self.n_clusters_no_add = na;
        self.n_holes = h;
        self.n_double_holes = dh;
        self.ndf = d;
        self.first = first;
        self.last = last;
        Some(best)
    }

    /// Classify every interior crossing without a measurement with the
    /// boundary checker. The track passes when these holes plus the
    /// trailing ones stay within the hole budget.
    pub fn update_hole_search_result(&mut self, ctx: &SearchContext<'_>) -> PatternHoleSearchOutcome {
        let mut out = PatternHoleSearchOutcome {
            passed: true,
            ..Default::default()
        };
        let mut previous_strip_hole = false;
        for p in self.first + 1..self.last {
            let e = self.at(p);
            if e.cluster.is_some() || e.no_add.is_some() {
                previous_strip_hole = false;
                continue;
            }
            let Some(detector) = e.detector() else {
                continue;
            };
            let pixel = e.ndf == 2;
            let params = e.track_parameters(ctx, StatePosition::Interior, true, false);
            let cov = params.local_covariance().unwrap_or_else(Matrix2::zeros);
            let mut strip_hole = false;
            match ctx
                .tools
                .boundary_check
                .check(detector, &params.local_position(), &cov)
            {
                BoundaryCheckResult::Candidate if pixel => out.pixel_holes += 1,
                BoundaryCheckResult::Candidate => {
                    out.strip_holes += 1;
                    strip_hole = true;
                }
                BoundaryCheckResult::DeadElement if pixel => out.pixel_deads += 1,
                BoundaryCheckResult::DeadElement => out.strip_deads += 1,
                _ => {}
            }
            if strip_hole && previous_strip_hole {
                previous_strip_hole = false;
                out.strip_double_holes += 1;
            } else {
                previous_strip_hole = strip_hole;
            }
        }
        // holes past the last measurement count against the budget too
        if out.pixel_holes + out.strip_holes + self.n_holes_after > ctx.cuts.max_holes
            || out.strip_double_holes > ctx.cuts.max_double_holes
        {
            out.passed = false;
        }
        self.hole_search = out;
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
