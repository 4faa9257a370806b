//! Smoothing and refits of the span.

use super::Trajectory;
use crate::error::{SearchError, StepError};
use crate::tools::SearchContext;
use detector_models::Crossing;

impl<'a> Trajectory<'a> {
    /// Backward pass from the last measurement combining with the forward
    /// predictions. Measurement choices are re-decided on the smoothed
    /// states; elements that cannot be reached are dropped from the span.
    ///
    /// With `two_point_seed` the acceptance cut is doubled.
    pub fn backward_smoother(
        &mut self,
        ctx: &SearchContext<'_>,
        two_point_seed: bool,
    ) -> Result<(), SearchError> {
        if !self.seeded || self.first >= self.last {
            return Err(SearchError::EmptySpan);
        }
        if !(self.first..=self.last).any(|p| self.at(p).difference()) {
            return Ok(());
        }

        self.at_mut(self.last).last_trajectory_element(ctx)?;
        let mut first = self.last;
        let mut lowest_empty = self.last - 1;
        self.n_clusters_no_add = 0;
        self.difference = 0;

        let mut p = self.last;
        while p > self.first {
            p -= 1;
            let smoothed = {
                let (prev, cur) = self.pair(p + 1, p);
                cur.backward_propagation_smoother(ctx, prev, two_point_seed)
            };
            if smoothed.is_err() {
                if p == self.first {
                    break;
                }
                self.map.copy_within(p + 1..self.n_elements, p);
                self.last -= 1;
                self.n_elements -= 1;
                first -= 1;
                continue;
            }

            let e = self.at(p);
            let changed = matches!((e.cluster, e.cluster_old), (Some(now), Some(before)) if now.id != before.id);
            let has_cluster = e.cluster.is_some();
            let no_add = e.no_add.is_some();
            let over = e.n_holes_b > ctx.cuts.max_holes
                || e.n_double_holes_b > ctx.cuts.max_double_holes;
            if changed {
                self.difference += 1;
            }
            if has_cluster {
                first = p;
            } else {
                lowest_empty = p;
                if no_add {
                    self.n_clusters_no_add += 1;
                }
                if over {
                    self.difference += 1;
                    break;
                }
            }
        }

        self.first = first;
        let (n_clusters_b, n_holes_b, ndf_b) = {
            let f = self.at(first);
            (f.n_clusters_b, f.n_holes_b, f.ndf_b)
        };
        self.n_clusters = n_clusters_b;
        self.n_holes = n_holes_b;
        self.ndf = ndf_b;
        self.n_holes_before = self.at(lowest_empty).n_holes_b.saturating_sub(self.n_holes);

        if self.ndf < self.ndf_cut {
            return Err(SearchError::TooFewDegreesOfFreedom {
                ndf: self.ndf,
                required: self.ndf_cut,
            });
        }

        // elements the smoothed track misses leave the span
        let mut kept = self.first + 1;
        for p in self.first + 1..self.last {
            let slot = self.map[p];
            let e = &self.elements[slot];
            if e.inside == Crossing::Outside {
                if e.status.has_measurements() {
                    self.n_active = self.n_active.saturating_sub(1);
                }
            } else {
                self.map[kept] = slot;
                kept += 1;
            }
        }
        let old_last = self.last;
        self.last = kept;
        if self.n_active < ctx.cuts.min_clusters && self.n_holes + self.n_holes_after > 0 {
            return Err(SearchError::TooFewClusters);
        }
        if kept != old_last {
            for p in old_last..self.n_elements {
                self.map[kept] = self.map[p];
                kept += 1;
            }
            self.n_elements = kept;
        }
        Ok(())
    }

    /// Refilter the span forward from a widened first state, keeping the
    /// measurement choices.
    pub fn forward_filter(&mut self, ctx: &SearchContext<'_>) -> Result<(), SearchError> {
        if !self.seeded {
            return Err(SearchError::EmptySpan);
        }
        self.at_mut(self.first).first_trajectory_element_refit(ctx, false)?;
        for p in self.first + 1..=self.last {
            let (prev, cur) = self.pair(p - 1, p);
            cur.forward_propagation_without_search(ctx, prev)?;
        }
        Ok(())
    }

    /// Final forward and backward refit with corrected measurement errors
    /// and the thicker material description. The span is compacted to the
    /// elements with a measurement, an outlier or a well-inside crossing.
    pub fn filter_with_precise_errors(&mut self, ctx: &SearchContext<'_>) -> Result<(), SearchError> {
        if !self.seeded {
            return Err(SearchError::EmptySpan);
        }
        if self.at(self.first).cluster.is_none() {
            return Err(StepError::NoMeasurement.into());
        }

        let mut k = 0;
        self.map[0] = self.map[self.first];
        for p in self.first + 1..=self.last {
            let slot = self.map[p];
            let e = &self.elements[slot];
            if e.cluster.is_some() || e.no_add.is_some() || e.inside.is_inside() {
                k += 1;
                self.map[k] = slot;
            }
        }
        self.first = 0;
        self.last = k;
        self.n_elements = k + 1;

        self.at_mut(0).first_trajectory_element_refit(ctx, true)?;
        for p in 1..=self.last {
            let (prev, cur) = self.pair(p - 1, p);
            cur.forward_propagation_without_search_precise(ctx, prev)?;
        }
        self.at_mut(self.last).last_trajectory_element_precise(ctx)?;
        for p in (0..self.last).rev() {
            let (prev, cur) = self.pair(p + 1, p);
            cur.backward_propagation_precise(ctx, prev)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::fixtures::Telescope;
    use super::*;
    use crate::element::FilterStatus;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_smoother_marks_span_smoothed() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2, 3]))
            .unwrap();
        t.backward_smoother(&ctx, false).unwrap();

        assert_eq!(t.first_element(), 0);
        assert_eq!(t.n_clusters(), 4);
        assert_eq!(t.ndf(), 8);
        assert_eq!(t.difference(), 0);
        for p in 0..=t.last_element() {
            assert_eq!(t.element(p).filter_status(), FilterStatus::Smoothed);
        }
        // a second pass reaches the same track
        t.backward_smoother(&ctx, false).unwrap();
        assert_eq!(t.n_clusters(), 4);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_two_pixel_seed_passes_its_own_ndf_cut() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1]))
            .unwrap();
        // two pixels measure four coordinates; the cut is only the smaller
        assert!(t.backward_smoother(&ctx, false).is_ok());
        assert_eq!(t.ndf(), 4);
    }

    #[test]
    fn test_precise_refit_keeps_measurements() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2, 3]))
            .unwrap();
        t.backward_smoother(&ctx, false).unwrap();
        t.filter_with_precise_errors(&ctx).unwrap();

        assert_eq!(t.first_element(), 0);
        assert_eq!(t.last_element(), 3);
        assert_eq!(t.clusters().count(), 4);
        let first = t.element(0);
        assert_eq!(first.filter_status(), FilterStatus::Smoothed);
        assert_abs_diff_eq!(first.ub.par[0], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_forward_filter_refilters_span() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2]))
            .unwrap();
        t.backward_smoother(&ctx, false).unwrap();
        t.forward_filter(&ctx).unwrap();
        assert_eq!(t.element(2).filter_status(), FilterStatus::Forward);
        assert_eq!(t.element(2).n_clusters_f, 3);
    }
}
