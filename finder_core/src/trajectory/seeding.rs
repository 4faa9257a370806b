//! Binding a seed to the road.
//!
//! [`Trajectory::initialize`] walks the road once, rebinds one arena slot
//! per used element and filters the seed measurements forward. Seed
//! measurements that do not fit are dropped as long as enough measured
//! coordinates remain. The span is then cut to the seed measurements and
//! everything in between that the track may have crossed.

use super::{pair_mut, Trajectory};
use crate::association::ClaimIndex;
use crate::element::DetStatus;
use crate::error::SearchError;
use crate::gating::{closest_measurement, search_links};
use crate::parameters::PatternParameters;
use crate::tools::SearchContext;
use crate::types::{LocalCov, LocalVec, MAX_TRAJECTORY_ELEMENTS};
use detector_models::{BoundaryLink, DetectorElement, Measurement, MeasurementIndex, PlaneSurface, SurfaceId};
use nalgebra::Vector3;
use smallvec::SmallVec;

/// Surface id of the service-material marker.
pub const DEAD_MATERIAL_SURFACE: SurfaceId = SurfaceId(u64::MAX - 1);

/// Strip measurements on accepted tracks at least this long are not reused
/// for seeds.
const LONG_TRACK_MEASUREMENTS: usize = 10;

/// χ² cut of a measurement picked for a parameter or position seed
const SEED_PICK_CHI2: f64 = 10.0;

/// Largest normalised χ² of a measurement picked from a parameter seed
const SEED_PICK_NORMALISED_CHI2: f64 = 0.5;

impl<'a> Trajectory<'a> {
    /// Bind the seed to the road and filter it.
    ///
    /// `links` is the road in order. Every element in `seed_measurements`
    /// must lie on it.
    pub fn initialize(
        &mut self,
        ctx: &SearchContext<'_>,
        links: &[BoundaryLink<'a>],
        index: &'a MeasurementIndex,
        seed: &PatternParameters,
        seed_measurements: &[&'a Measurement],
    ) -> Result<(), SearchError> {
        self.reset();
        if seed_measurements.len() < 2 {
            return Err(SearchError::TooFewSeedMeasurements(seed_measurements.len()));
        }
        let mut pending: SmallVec<[&'a Measurement; 8]> = seed_measurements.iter().copied().collect();
        let xi2_cut = ctx.tuning.seed_chi2_factor * ctx.cuts.xi2_max;
        let mut dead_radius = ctx.tuning.dead_material_radius;
        let mut ndf_wrong = 0u32;
        let mut up = 0;
        let mut last_good = 0;
        let mut first = None;

        for link in links {
            let element = link.element();
            let used = if element.is_pixel() {
                ctx.cuts.use_pixel
            } else {
                ctx.cuts.use_strip
            };
            if !used {
                continue;
            }

            if let Some(radius) = dead_radius.filter(|r| element.surface.radius() > *r) {
                dead_radius = None;
                let n = self.n_elements;
                self.elements[n].set_dead(dead_material_surface(element, radius));
                self.map[n] = n;
                if self.n_clusters > 0 && !pending.is_empty() {
                    let (prev, cur) = pair_mut(&mut self.elements, up, n);
                    cur.forward_propagation_without_search(ctx, prev)?;
                    up = n;
                }
                self.n_elements += 1;
                if self.n_elements == MAX_TRAJECTORY_ELEMENTS {
                    break;
                }
            }

            let measurements = index.on_element(element.id);
            let n = self.n_elements;
            let mut seed_hit = None;
            if !measurements.is_empty() && !element.disabled {
                if let Some(k) = pending.iter().position(|m| m.element == element.id) {
                    let m = pending.remove(k);
                    if self.n_clusters == 0 {
                        first = Some(n);
                    } else {
                        self.last = n;
                    }
                    self.n_clusters += 1;
                    self.ndf_cut += m.dim;
                    seed_hit = Some(m);
                }
                self.elements[n].set(ctx, DetStatus::Active, *link, measurements, seed_hit);
                self.n_active += 1;
            } else if self.n_active > 0 {
                let status = if element.disabled {
                    DetStatus::Disabled
                } else {
                    DetStatus::Empty
                };
                self.elements[n].set(ctx, status, *link, measurements, None);
            } else {
                continue;
            }
            self.map[n] = n;
            self.n_elements += 1;

            if first == Some(n) {
                self.elements[n].first_trajectory_element(ctx, seed)?;
                up = n;
            } else if seed_hit.is_some() {
                let (prev, cur) = pair_mut(&mut self.elements, up, n);
                cur.forward_propagation_without_search(ctx, prev)?;
                up = n;
                if cur.xi2_f <= xi2_cut {
                    last_good = n;
                } else {
                    ndf_wrong += cur.ndf;
                    if ndf_wrong > ctx.tuning.wrong_seed_ndf_budget {
                        return Err(SearchError::TooFewDegreesOfFreedom {
                            ndf: self.ndf_cut,
                            required: ctx.tuning.min_seed_ndf,
                        });
                    }
                    self.ndf_cut -= cur.ndf;
                    self.n_clusters -= 1;
                    cur.erase_cluster_forward_propagation();
                }
            } else if self.n_clusters > 0 && !pending.is_empty() {
                let (prev, cur) = pair_mut(&mut self.elements, up, n);
                if cur.forward_propagation_without_search(ctx, prev).is_ok() {
                    if cur.inside.is_inside() && cur.status.counts_holes() {
                        self.n_holes += 1;
                    }
                    up = n;
                } else {
                    if cur.status.has_measurements() {
                        self.n_active -= 1;
                    }
                    self.n_elements -= 1;
                }
            }
            if self.n_elements == MAX_TRAJECTORY_ELEMENTS {
                break;
            }
        }

        if !pending.is_empty() {
            return Err(SearchError::SeedNotOnRoad);
        }
        let first = first.ok_or(SearchError::SeedNotOnRoad)?;
        if ndf_wrong > 0 && self.ndf_cut < ctx.tuning.min_seed_ndf {
            return Err(SearchError::TooFewDegreesOfFreedom {
                ndf: self.ndf_cut,
                required: ctx.tuning.min_seed_ndf,
            });
        }
        self.ndf = self.ndf_cut;
        self.ndf_cut = self.ndf_cut.min(ctx.tuning.min_seed_ndf);

        // trailing elements that can never be holes
        let mut n = self.n_elements - 1;
        while n > 0 && !self.elements[n].status.counts_holes() {
            n -= 1;
        }
        self.n_elements = n + 1;
        while n > 0 {
            if self.elements[n].status == DetStatus::Active {
                self.elements[n].last_active();
                break;
            }
            n -= 1;
        }

        self.first = first;
        self.last = last_good;
        if self.last <= self.first {
            return Err(SearchError::EmptySpan);
        }

        // keep measured or crossed elements between the seed end points
        let mut m = self.first + 1;
        let mut n = m;
        while n < self.last {
            let e = &self.elements[self.map[n]];
            if e.cluster.is_some() || e.inside.is_crossed() {
                self.map[m] = self.map[n];
                m += 1;
            }
            n += 1;
        }
        if m != n {
            self.last = m;
            while n < self.n_elements {
                self.map[m] = self.map[n];
                m += 1;
                n += 1;
            }
            self.n_elements = m;
        }

        if ctx.brem_noise {
            for p in self.last..self.n_elements {
                self.elements[self.map[p]].brem_noise_model();
            }
        }
        self.seeded = true;
        Ok(())
    }

    /// Transverse momentum of a straight filter through the seed
    /// measurements, or zero if they do not form a track.
    ///
    /// Uses the arena as scratch space; call it before
    /// [`Trajectory::initialize`].
    pub fn pt_seed(
        &mut self,
        ctx: &SearchContext<'_>,
        seed: &PatternParameters,
        hits: &[(BoundaryLink<'a>, &'a Measurement)],
    ) -> f64 {
        self.reset();
        let Some(((link, m), rest)) = hits.split_first() else {
            return 0.0;
        };
        self.elements[0].set(ctx, DetStatus::Active, *link, &[], Some(*m));
        if self.elements[0].first_trajectory_element(ctx, seed).is_err() {
            return 0.0;
        }
        let mut last = 0;
        for (k, (link, m)) in rest.iter().enumerate().take(MAX_TRAJECTORY_ELEMENTS - 1) {
            let n = k + 1;
            self.elements[n].set(ctx, DetStatus::Active, *link, &[], Some(*m));
            let (prev, cur) = pair_mut(&mut self.elements, n - 1, n);
            if cur.forward_propagation_without_search(ctx, prev).is_err()
                || cur.xi2_f > ctx.tuning.seed_pt_chi2_cut
            {
                return 0.0;
            }
            last = n;
        }
        self.elements[last].uf.pt()
    }
}

/// Measurements compatible with track parameters `params`: on each road
/// element the best link whose χ² per coordinate stays below a tight cut,
/// taken in order of quality until enough coordinates are measured.
pub fn track_parameters_to_measurements<'a>(
    ctx: &SearchContext<'_>,
    links: &[BoundaryLink<'a>],
    index: &'a MeasurementIndex,
    params: &PatternParameters,
    claims: &ClaimIndex,
) -> Option<Vec<&'a Measurement>> {
    let mut picked: Vec<(f64, &'a Measurement)> = Vec::new();
    for link in links {
        let element = link.element();
        let measurements = index.on_element(element.id);
        if measurements.is_empty() {
            continue;
        }
        let predicted = ctx
            .tools
            .propagator
            .propagate(params, &element.surface, true)?
            .parameters;
        let candidates = search_links(
            &*ctx.tools.updator,
            &predicted,
            measurements,
            ctx.cuts.xi2_max_link,
            None,
        );
        for l in &candidates {
            if !l.measurement.is_pixel() && is_on_long_track(claims, l.measurement) {
                continue;
            }
            let normalised = l.chi2 / f64::from(l.measurement.dim);
            if l.chi2 <= SEED_PICK_CHI2 && normalised <= SEED_PICK_NORMALISED_CHI2 {
                picked.push((normalised, l.measurement));
            }
            break;
        }
    }
    if picked.len() < 3 {
        return None;
    }
    picked.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut ndf = 0;
    let mut out = Vec::new();
    for (_, m) in picked {
        out.push(m);
        ndf += m.dim;
        if ndf >= ctx.tuning.min_seed_ndf {
            return Some(out);
        }
    }
    None
}

/// Measurements closest to global seed positions: each position is placed
/// on the road elements it lies on and matched to the nearest cluster.
pub fn global_positions_to_measurements<'a>(
    ctx: &SearchContext<'_>,
    links: &[BoundaryLink<'a>],
    index: &'a MeasurementIndex,
    positions: &[Vector3<f64>],
    claims: &ClaimIndex,
) -> Option<Vec<&'a Measurement>> {
    let mut out = Vec::new();
    let mut ndf = 0;
    for link in links {
        let element = link.element();
        let measurements = index.on_element(element.id);
        if measurements.is_empty() {
            continue;
        }
        // positions lie on the sensor plane for pixels, within the stereo
        // separation for strips (mm)
        let max_offset = if element.is_pixel() { 0.001 } else { 1.0 };
        for g in positions {
            let (local, offset) = element.surface.global_to_local(g);
            if offset.abs() > max_offset {
                continue;
            }
            let cov = LocalCov::from_diagonal(&LocalVec::new(0.1, 0.1, 0.001, 0.001, 0.00001));
            let probe = PatternParameters::new(
                element.surface,
                LocalVec::new(local.x, local.y, 0.0, 0.0, 0.0),
                Some(cov),
            );
            let Some(best) = closest_measurement(&*ctx.tools.updator, &probe, measurements) else {
                continue;
            };
            if best.chi2 > SEED_PICK_CHI2 {
                continue;
            }
            if !best.measurement.is_pixel() && is_on_long_track(claims, best.measurement) {
                continue;
            }
            if out.iter().any(|m: &&Measurement| m.id == best.measurement.id) {
                continue;
            }
            out.push(best.measurement);
            ndf += best.measurement.dim;
        }
    }
    (ndf >= ctx.tuning.min_seed_ndf).then_some(out)
}

fn is_on_long_track(claims: &ClaimIndex, m: &Measurement) -> bool {
    claims
        .longest_claim(m.id)
        .is_some_and(|n| n >= LONG_TRACK_MEASUREMENTS)
}

/// Plane of the service material at `radius`, facing the element's
/// transverse direction.
fn dead_material_surface(element: &DetectorElement, radius: f64) -> PlaneSurface {
    let c = element.surface.center;
    let mut radial = Vector3::new(c.x, c.y, 0.0);
    if radial.norm() < 1e-12 {
        radial = Vector3::x();
    }
    let u = radial.normalize();
    PlaneSurface::from_normal(DEAD_MATERIAL_SURFACE, u * radius, u, Vector3::z())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
