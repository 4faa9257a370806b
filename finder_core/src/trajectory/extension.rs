//! Branch-and-bound extension of the seed span.
//!
//! # Algorithm
//! Every iteration filters from a restart element to the end of the road
//! (forward) or to its start (backward), assigning the best measurement on
//! each element. A branch is scored by `(measurements − holes, χ²)`; the
//! best branch so far is recorded. The next iteration restarts from the
//! outermost measured element that still has an alternative: the next-best
//! link, or dropping the measurement.
//!
//! A branch is abandoned early when it can no longer beat the best one,
//! when it leaves the φ window around the seed, or when it collects more
//! holes or far-inside misses than allowed.
//!
//! The best branch is installed into the index map at the end. When it was
//! not the last one explored, the measurement choices on its elements are
//! restored.

use super::Trajectory;
use crate::error::SearchError;
use crate::parameters::PatternParameters;
use crate::tools::SearchContext;
use crate::types::{wrap_phi, MAX_TRAJECTORY_ELEMENTS, PHI};
use detector_models::Measurement;

/// Branch score: measurements minus holes, then lower χ².
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Score {
    pub quality: i32,
    pub chi2: f64,
}

impl Score {
    const NONE: Score = Score {
        quality: -100,
        chi2: 0.0,
    };

    pub fn beats(&self, other: &Score) -> bool {
        self.quality > other.quality || (self.quality == other.quality && self.chi2 < other.chi2)
    }
}

/// What an extension explored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtensionSummary {
    pub iterations: usize,
    /// Iteration of the installed branch
    pub best_iteration: Option<usize>,
    /// Scores of successive best branches, in discovery order
    pub improvements: Vec<Score>,
    /// Measurements added to the span
    pub added: u32,
}

/// The best branch seen so far.
struct BestCandidate<'a> {
    score: Score,
    iteration: usize,
    holes: u32,
    /// Holes beyond the last measurement in the direction of the search
    holes_outside: u32,
    missing: u32,
    ndf: u32,
    /// Measurements on the whole trajectory if installed
    n_clusters: u32,
    /// First position the path is installed at
    start: usize,
    /// Crossed elements, as positions in the current map
    path: Vec<usize>,
    /// Measurements with the position they take once installed
    clusters: Vec<(usize, &'a Measurement)>,
    /// Backward state on the outermost measurement
    parameters: Option<PatternParameters>,
}

impl<'a> BestCandidate<'a> {
    fn new(start: usize) -> Self {
        Self {
            score: Score::NONE,
            iteration: 0,
            holes: 0,
            holes_outside: 0,
            missing: 0,
            ndf: 0,
            n_clusters: 0,
            start,
            path: Vec::new(),
            clusters: Vec::new(),
            parameters: None,
        }
    }
}

fn phi_deviation(phi: f64, reference: f64) -> f64 {
    wrap_phi(phi - reference).abs()
}

impl<'a> Trajectory<'a> {
    /// Extend the span towards the end of the road.
    ///
    /// With `smoother` the span is first refiltered forward, restarting
    /// from the first element whose measurement choice changed.
    pub fn forward_extension(
        &mut self,
        ctx: &SearchContext<'_>,
        smoother: bool,
        max_iterations: usize,
    ) -> Result<ExtensionSummary, SearchError> {
        if !self.seeded || self.first >= self.last {
            return Err(SearchError::EmptySpan);
        }
        let mut summary = ExtensionSummary::default();

        if smoother {
            if self.at(self.first).difference() {
                self.at_mut(self.first).first_trajectory_element_refit(ctx, false)?;
                for p in self.first + 1..=self.last {
                    let (prev, cur) = self.pair(p - 1, p);
                    cur.forward_propagation_without_search(ctx, prev)?;
                }
            } else {
                let mut changed = false;
                for p in self.first + 1..=self.last {
                    let (prev, cur) = self.pair(p - 1, p);
                    if changed {
                        cur.forward_propagation_without_search(ctx, prev)?;
                    } else if cur.difference() {
                        changed = true;
                        let cluster = cur.cluster;
                        cur.add_next_cluster_f_from(ctx, prev, cluster)?;
                    }
                }
            }
        }

        let start = self.last;
        let last_on_road = self.n_elements - 1;
        if start == last_on_road {
            return Ok(summary);
        }

        let max_holes = ctx.cuts.max_holes;
        let max_double_holes = ctx.cuts.max_double_holes;
        let phi_max = ctx.tuning.max_phi_deviation;
        let phi0 = self.at(self.first).uf.par[PHI];

        let mut best = BestCandidate::new(start + 1);
        let mut missing_cut = ctx.tuning.missing_cut;
        let mut path = [0usize; MAX_TRAJECTORY_ELEMENTS];
        let mut current = start;
        let mut m = start;
        path[start] = start;
        self.at_mut(start).n_missing = 0;

        let mut last_iteration = 0;
        for iteration in 0..max_iterations {
            last_iteration = iteration;
            let mut last_seen = current;
            let mut last_expected = current;
            let mut previous = current;
            let mut last_cluster_m = m;
            let bound = i64::from(best.n_clusters) - last_on_road as i64;
            let mut open_hole = false;

            current += 1;
            while current < self.n_elements {
                let propagated = {
                    let (prev, cur) = self.pair(previous, current);
                    cur.forward_propagation_with_search(ctx, prev)
                };
                if propagated.is_err() {
                    // a failed barrel crossing right after the restart skips
                    // ahead to the first non-barrel element
                    let barrel = self.at(current).detector().is_some_and(|d| d.is_barrel());
                    if !barrel || previous + 1 != current {
                        break;
                    }
                    let next = (current + 1..self.n_elements)
                        .find(|&p| !self.at(p).detector().is_some_and(|d| d.is_barrel()));
                    match next {
                        Some(p) => {
                            current = p;
                            continue;
                        }
                        None => break,
                    }
                }

                previous = current;
                m += 1;
                path[m] = current;
                let e = self.at(current);
                if e.cluster.is_some() {
                    if phi_deviation(e.uf.par[PHI], phi0) > phi_max {
                        break;
                    }
                    last_expected = current;
                    last_seen = current;
                    last_cluster_m = m;
                    open_hole = false;
                } else {
                    if e.inside.is_inside() {
                        last_expected = current;
                        if e.n_holes_f > max_holes || e.n_double_holes_f > max_double_holes {
                            break;
                        }
                        open_hole = true;
                    }
                    if phi_deviation(e.pf.par[PHI], phi0) > phi_max {
                        break;
                    }
                }
                let reach = i64::from(e.n_clusters_f) - current as i64;
                if e.n_missing > missing_cut
                    || reach < bound
                    || (reach == bound && e.xi2_total_f > best.score.chi2)
                {
                    break;
                }
                current += 1;
            }

            let seen = self.at(last_seen);
            let nc = seen.n_clusters_f;
            let nh = seen.n_holes_f;
            let chi2 = seen.xi2_total_f;
            self.n_holes_after = self.at(last_expected).n_holes_f.saturating_sub(nh);
            if iteration == 0 && nc == self.n_clusters {
                summary.iterations = 1;
                return Ok(summary);
            }
            let last_processed = current.min(last_on_road);
            let nd = self.at(last_processed).n_missing;

            let score = Score {
                quality: nc as i32 - nh as i32,
                chi2,
            };
            if score.beats(&best.score) {
                best.score = score;
                best.iteration = iteration;
                best.holes = nh;
                best.holes_outside = self.n_holes_after;
                best.missing = nd;
                summary.improvements.push(score);
                if last_processed == last_on_road && nd < missing_cut {
                    missing_cut = nd;
                }

                best.path.clear();
                best.clusters.clear();
                best.ndf = 0;
                for &p in &path[start + 1..=last_cluster_m] {
                    let e = self.at(p);
                    if e.inside.is_crossed() {
                        best.path.push(p);
                        if let Some(c) = e.cluster {
                            best.clusters.push((start + best.path.len(), c));
                            best.ndf += e.ndf;
                        }
                    }
                }
                best.n_clusters = self.n_clusters + best.clusters.len() as u32;

                let full = best.n_clusters >= ctx.tuning.full_track_clusters && !open_hole;
                if full || (last_processed == last_on_road && best.missing == 0) {
                    break;
                }
            }

            // outermost measured element with an alternative left
            let reach_base = last_on_road as i64 - i64::from(best.n_clusters) - 1;
            let mut restart = None;
            for j in (start + 1..=last_cluster_m).rev() {
                let p = path[j];
                if p == last_on_road {
                    continue;
                }
                let e = self.at(p);
                if e.cluster.is_none() {
                    continue;
                }
                let Some(fallback) = e.next_cluster_fallback_f(ctx) else {
                    continue;
                };
                let mut reach = reach_base - p as i64 + i64::from(e.n_clusters_f);
                if fallback.alternate {
                    reach += 1;
                } else if e.dist < -ctx.tuning.missing_distance && e.n_missing + 1 > missing_cut {
                    continue;
                }
                if reach < 0 || (reach == 0 && fallback.chi2 > best.score.chi2) {
                    continue;
                }
                restart = Some((p, j));
                break;
            }
            let Some((p, j)) = restart else {
                break;
            };
            current = p;
            m = j;
            if iteration + 1 != max_iterations && self.at_mut(current).add_next_cluster_f(ctx).is_err() {
                break;
            }
        }
        summary.iterations = last_iteration + 1;

        if best.clusters.is_empty() {
            return Ok(summary);
        }
        summary.best_iteration = Some(best.iteration);
        summary.added = best.clusters.len() as u32;

        self.n_holes = best.holes;
        self.n_holes_after = best.holes_outside;
        self.n_clusters += best.clusters.len() as u32;
        self.ndf += best.ndf;
        if let Some(&(p, _)) = best.clusters.last() {
            self.last = p;
        }
        self.n_elements = self.last + 1;
        for (k, &p) in best.path.iter().enumerate() {
            let n = start + 1 + k;
            if n > self.last {
                break;
            }
            self.map[n] = self.map[p];
        }

        if best.iteration == last_iteration {
            return Ok(summary);
        }

        // the last branch explored differs: restore the best one's choices
        let mut next = 0;
        let mut first_changed = None;
        for n in start + 1..self.n_elements {
            let wanted = match best.clusters.get(next) {
                Some(&(p, c)) if p == n => {
                    next += 1;
                    Some(c)
                }
                _ => None,
            };
            let current = self.at(n).cluster;
            let differs = match (wanted, current) {
                (Some(a), Some(b)) => a.id != b.id,
                (None, None) => false,
                _ => true,
            };
            if differs {
                if first_changed.is_none() {
                    first_changed = Some(n);
                    let (prev, cur) = self.pair(n - 1, n);
                    cur.add_next_cluster_f_from(ctx, prev, wanted)?;
                } else {
                    self.at_mut(n).set_cluster(wanted);
                }
            }
            if next == best.clusters.len() && wanted.is_some() {
                break;
            }
        }
        if let Some(n) = first_changed.filter(|&n| n < self.last) {
            for p in n + 1..=self.last {
                let (prev, cur) = self.pair(p - 1, p);
                cur.forward_propagation_without_search(ctx, prev)?;
            }
        }
        Ok(summary)
    }

    /// Extend the span towards the start of the road, filtering backward
    /// from the first measurement.
    pub fn backward_extension(
        &mut self,
        ctx: &SearchContext<'_>,
        max_iterations: usize,
    ) -> Result<ExtensionSummary, SearchError> {
        if !self.seeded || self.first >= self.last {
            return Err(SearchError::EmptySpan);
        }
        let mut summary = ExtensionSummary::default();
        let anchor = self.first;
        if anchor == 0 {
            return Ok(summary);
        }

        let max_holes = ctx.cuts.max_holes;
        let max_double_holes = ctx.cuts.max_double_holes;
        let mut best = BestCandidate::new(anchor);
        let mut missing_cut = ctx.tuning.missing_cut;
        let mut restart_at = anchor;
        self.at_mut(anchor).n_missing = 0;

        let mut last_iteration = 0;
        for iteration in 0..max_iterations {
            last_iteration = iteration;
            let mut lowest_cluster = restart_at;
            let mut last_expected = restart_at;
            let mut reached = restart_at;

            for f in (0..restart_at).rev() {
                let propagated = {
                    let (prev, cur) = self.pair(f + 1, f);
                    cur.backward_propagation_filter(ctx, prev)
                };
                if propagated.is_err() {
                    break;
                }
                reached = f;
                let e = self.at(f);
                if e.cluster.is_some() {
                    last_expected = f;
                    lowest_cluster = f;
                } else if e.inside.is_inside() {
                    last_expected = f;
                    if e.n_holes_b > max_holes || e.n_double_holes_b > max_double_holes {
                        break;
                    }
                }
                let reach = i64::from(e.n_clusters_b) + f as i64;
                let bound = i64::from(best.n_clusters);
                if e.n_missing > missing_cut
                    || reach < bound
                    || (reach == bound && e.xi2_total_b > best.score.chi2)
                {
                    break;
                }
            }

            let e = self.at(lowest_cluster);
            let nc = e.n_clusters_b;
            let nh = e.n_holes_b;
            let chi2 = e.xi2_total_b;
            if iteration == 0 && nc == self.n_clusters {
                summary.iterations = 1;
                return Ok(summary);
            }
            let nd = self.at(reached).n_missing;

            let score = Score {
                quality: nc as i32 - nh as i32,
                chi2,
            };
            if score.beats(&best.score) {
                best.score = score;
                best.iteration = iteration;
                best.holes = nh;
                best.holes_outside = self.at(last_expected).n_holes_b.saturating_sub(nh);
                best.parameters = Some(self.at(lowest_cluster).ub);
                summary.improvements.push(score);
                if reached == 0 && nd < missing_cut {
                    missing_cut = nd;
                }

                best.start = lowest_cluster;
                best.path.clear();
                best.clusters.clear();
                best.ndf = 0;
                for p in lowest_cluster..anchor {
                    let e = self.at(p);
                    if e.inside.is_crossed() {
                        best.path.push(p);
                        if let Some(c) = e.cluster {
                            best.clusters.push((lowest_cluster + best.path.len() - 1, c));
                            best.ndf += e.ndf;
                        }
                    }
                }
                best.n_clusters = self.n_clusters + best.clusters.len() as u32;
            }

            // innermost measured element with an alternative left
            let mut restart = None;
            for p in lowest_cluster.max(1)..anchor {
                let e = self.at(p);
                if e.cluster.is_none() {
                    continue;
                }
                let Some(fallback) = e.next_cluster_fallback_b(ctx) else {
                    continue;
                };
                let mut reach = p as i64 + i64::from(e.n_clusters_b);
                if !fallback.alternate {
                    if e.dist < -ctx.tuning.missing_distance && e.n_missing + 1 > missing_cut {
                        continue;
                    }
                    reach -= 1;
                }
                let bound = i64::from(best.n_clusters);
                if reach < bound || (reach == bound && fallback.chi2 > best.score.chi2) {
                    continue;
                }
                restart = Some(p);
                break;
            }
            let Some(p) = restart else {
                break;
            };
            restart_at = p;
            if iteration + 1 != max_iterations && self.at_mut(p).add_next_cluster_b(ctx).is_err() {
                break;
            }
        }
        summary.iterations = last_iteration + 1;

        if best.clusters.is_empty() {
            return Ok(summary);
        }
        summary.best_iteration = Some(best.iteration);
        summary.added = best.clusters.len() as u32;

        self.n_holes = best.holes;
        self.n_holes_before = best.holes_outside;
        self.n_clusters += best.clusters.len() as u32;
        self.ndf += best.ndf;

        // drop the uncrossed elements between the new first measurement and
        // the old one
        let dropped = anchor - best.start - best.path.len();
        let path_end = best.start + best.path.len();
        if dropped != 0 {
            for (k, &p) in best.path.iter().enumerate() {
                self.map[best.start + k] = self.map[p];
            }
            for n in path_end..self.n_elements - dropped {
                self.map[n] = self.map[n + dropped];
            }
            self.n_elements -= dropped;
            self.last -= dropped;
        }
        self.first = best.start;
        if let Some(p) = best.parameters {
            self.at_mut(self.first).set_parameters_b(p);
        }

        if best.iteration == last_iteration {
            return Ok(summary);
        }

        let mut remaining = best.clusters.len();
        for n in (0..path_end).rev() {
            match best.clusters.iter().find(|&&(p, _)| p == n) {
                Some(&(_, c)) => {
                    self.at_mut(n).set_cluster(Some(c));
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
                None => self.at_mut(n).set_cluster(None),
            }
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::fixtures::Telescope;
    use super::*;
    use crate::types::MeasurementId;

    #[test]
    fn test_score_ordering() {
        let a = Score { quality: 5, chi2: 3.0 };
        let b = Score { quality: 5, chi2: 1.0 };
        let c = Score { quality: 4, chi2: 0.0 };
        assert!(b.beats(&a));
        assert!(a.beats(&c));
        assert!(!a.beats(&a));
        assert!(c.beats(&Score::NONE));
    }

    #[test]
    fn test_forward_extension_collects_downstream_hits() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2]))
            .unwrap();

        let summary = t.forward_extension(&ctx, false, 30).unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(t.n_clusters(), 5);
        assert_eq!(t.ndf(), 10);
        assert_eq!(t.last_element(), 4);
        assert_eq!(t.n_holes(), 0);
        assert_eq!(t.n_holes_after(), 0);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_forward_extension_counts_trailing_holes() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), None, None]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2]))
            .unwrap();

        let summary = t.forward_extension(&ctx, false, 30).unwrap();
        assert_eq!(summary.added, 0);
        assert_eq!(t.n_clusters(), 3);
        assert_eq!(t.n_holes_after(), 2);
        assert_eq!(t.last_element(), 2);
    }

    #[test]
    fn test_forward_extension_prefers_the_compatible_hit() {
        let mut scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), Some(0.0), Some(0.0)]);
        let decoy = scope.add_hit(3, 0.08);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2]))
            .unwrap();

        let summary = t.forward_extension(&ctx, false, 30).unwrap();
        assert_eq!(t.n_clusters(), 5);
        assert!(t.clusters().any(|m| m.id == MeasurementId(4)));
        assert!(t.clusters().all(|m| m.id != decoy));
        // each recorded best strictly improves on the previous one
        for pair in summary.improvements.windows(2) {
            assert!(pair[1].beats(&pair[0]));
        }
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_backward_extension_collects_upstream_hits() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[2, 3, 4]))
            .unwrap();
        assert_eq!(t.first_element(), 2);
        t.backward_smoother(&ctx, false).unwrap();

        let summary = t.backward_extension(&ctx, 30).unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(t.first_element(), 0);
        assert_eq!(t.n_clusters(), 5);
        assert_eq!(t.n_holes_before(), 0);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_extensions_need_a_seeded_span() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let mut t = Trajectory::new();
        assert_eq!(t.forward_extension(&ctx, false, 30), Err(SearchError::EmptySpan));
        assert_eq!(t.backward_extension(&ctx, 30), Err(SearchError::EmptySpan));
    }

    #[test]
    fn test_extensions_leave_a_full_road_unchanged() {
        let scope = Telescope::straight(&[Some(0.0), Some(0.0), Some(0.0)]);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[0, 1, 2]))
            .unwrap();
        let before = (
            t.n_clusters(),
            t.n_holes(),
            t.n_holes_after(),
            t.first_element(),
            t.last_element(),
        );
        assert_eq!(before, (3, 0, 0, 0, 2));

        assert_eq!(t.forward_extension(&ctx, false, 30), Ok(ExtensionSummary::default()));
        assert_eq!(t.backward_extension(&ctx, 30), Ok(ExtensionSummary::default()));
        let after = (
            t.n_clusters(),
            t.n_holes(),
            t.n_holes_after(),
            t.first_element(),
            t.last_element(),
        );
        assert_eq!(after, before);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_backward_extension_restores_the_better_branch() {
        // the hit on module 2 sits 20 µm off the line through the other
        // hits, a second one 21 µm off on the other side
        let mut scope = Telescope::straight(&[
            Some(0.0),
            Some(0.0),
            Some(0.02),
            Some(0.0),
            Some(0.0),
            Some(0.0),
        ]);
        let decoy = scope.add_hit(2, -0.021);
        let tools = scope.tools();
        let config = scope.config();
        let ctx = scope.context(&tools, &config);
        let links = scope.links();
        let mut t = Trajectory::new();
        t.initialize(&ctx, &links, &scope.index, &scope.seed(), &scope.seed_hits(&[3, 4, 5]))
            .unwrap();
        t.backward_smoother(&ctx, false).unwrap();

        let summary = t.backward_extension(&ctx, 30).unwrap();
        // the mirrored branch through the second hit is explored and loses
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.best_iteration, Some(0));
        assert_eq!(summary.improvements.len(), 1);
        for pair in summary.improvements.windows(2) {
            assert!(pair[1].beats(&pair[0]));
        }
        assert_eq!(summary.added, 3);
        assert_eq!(t.first_element(), 0);
        assert_eq!(t.n_clusters(), 6);
        assert_eq!(t.ndf(), 12);
        assert_eq!(t.element(2).cluster().map(|m| m.id), Some(MeasurementId(3)));
        assert!(t.clusters().all(|m| m.id != decoy));

        // refitting re-derives the restored element from its measurement
        t.forward_filter(&ctx).unwrap();
        t.backward_smoother(&ctx, false).unwrap();
        assert_eq!(t.element(2).cluster().map(|m| m.id), Some(MeasurementId(3)));
        assert!(t.at(2).sm.par[0] > 0.0);
        assert!(t.check_invariants().is_ok());
    }
}
