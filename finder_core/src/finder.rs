//! The combinatorial track finder: one seed and its road in, tracks out.
//!
//! # Processing steps per seed
//! 1. Resolve the seed into measurements (space points, global positions or
//!    bare parameters)
//! 2. Initialise the trajectory along the road
//! 3. Extend and smooth; pixel seeds extend outward first, mixed seeds
//!    inward first
//! 4. Apply the quality gates (score, pT, measurement count, holes)
//! 5. Check the candidate against the claims of accepted tracks
//! 6. Sort, optionally refit, and convert to [`Track`]s, alternates included
//!
//! # Design choices
//! - [`CombinatorialFinder`] holds only configuration and tools and is shared
//!   by all workers. Everything mutable lives in a per-worker [`FinderData`].
//! - Stage failures are [`ResultCode`]s, not errors. [`FinderError`] is kept
//!   for inputs that cannot be processed at all.

use crate::association::ClaimIndex;
use crate::config::{FinderConfig, QualityCuts};
use crate::error::{FinderError, SearchError};
use crate::metrics::{EventCounters, FinderStatistics, SeedFlags};
use crate::parameters::PatternParameters;
use crate::result::ResultCode;
use crate::tools::{SearchContext, Tools};
use crate::track::{PatternInfo, Track};
use crate::trajectory::{
    global_positions_to_measurements, track_parameters_to_measurements, Trajectory,
};
use crate::types::TrackId;
use detector_models::{BoundaryLink, DetectorElement, Measurement, MeasurementIndex, SpacePoint};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::mem;

/// Measurements on a brem-free track above which no electron retry is made.
const BREM_SKIP_CLUSTERS: u32 = 12;

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// What a seed provides besides its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SeedHits {
    /// Space points from the seed maker, usually three
    SpacePoints(Vec<SpacePoint>),
    /// Global positions of an external track candidate
    GlobalPositions(Vec<Vector3<f64>>),
    /// Parameters only; measurements are picked along the road
    Parameters,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    /// Starting estimate on the first seed element
    pub parameters: PatternParameters,
    pub hits: SeedHits,
}

impl Seed {
    pub fn n_space_points(&self) -> usize {
        match &self.hits {
            SeedHits::SpacePoints(points) => points.len(),
            _ => 0,
        }
    }

    /// First space point is a stereo strip pair.
    fn starts_with_strip_pair(&self) -> bool {
        matches!(&self.hits, SeedHits::SpacePoints(p) if p.first().is_some_and(|sp| sp.second.is_some()))
    }
}

/// A seed with the detector elements it may cross, in propagation order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadSeed {
    pub road: Vec<DetectorElement>,
    pub seed: Seed,
}

// ---------------------------------------------------------------------------
// Worker data
// ---------------------------------------------------------------------------

/// Scratch state of one worker, reused for every seed it processes.
pub struct FinderData<'a> {
    trajectory: Trajectory<'a>,
    links: Vec<BoundaryLink<'a>>,
    event: EventCounters,
    flags: SeedFlags,
    statistics: FinderStatistics,
    /// Last recoverable gate the current seed failed
    failed_gate: Option<ResultCode>,
}

impl Default for FinderData<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FinderData<'a> {
    pub fn new() -> Self {
        Self {
            trajectory: Trajectory::new(),
            links: Vec::new(),
            event: EventCounters::default(),
            flags: SeedFlags::default(),
            statistics: FinderStatistics::default(),
            failed_gate: None,
        }
    }

    pub fn trajectory(&self) -> &Trajectory<'a> {
        &self.trajectory
    }

    /// Counters of the current event.
    pub fn event(&self) -> &EventCounters {
        &self.event
    }

    /// Codes raised by the last seed.
    pub fn flags(&self) -> &SeedFlags {
        &self.flags
    }

    /// Totals of the finished events and seeds.
    pub fn statistics(&self) -> &FinderStatistics {
        &self.statistics
    }

    /// Hand over the accumulated statistics, including the current event's
    /// counters, and start from zero.
    pub fn take_statistics(&mut self) -> FinderStatistics {
        let event = mem::take(&mut self.event);
        self.statistics.counters.add(&event);
        mem::take(&mut self.statistics)
    }

    fn begin_seed(&mut self) {
        self.flags.clear();
        self.event.input_seeds += 1;
    }

    fn end_seed(&mut self) {
        self.statistics.record(&self.flags);
    }

    /// Remember a failed recoverable gate. Returns whether the search goes on.
    fn keep_failed(&mut self, cuts: &QualityCuts, code: ResultCode) -> bool {
        if cuts.return_failed_tracks {
            self.failed_gate = Some(code);
        }
        cuts.return_failed_tracks
    }
}

// ---------------------------------------------------------------------------
// Finder
// ---------------------------------------------------------------------------

pub struct CombinatorialFinder {
    config: FinderConfig,
    tools: Tools,
}

impl CombinatorialFinder {
    /// Finder with the default tools for the configured field. The quality
    /// cuts are clamped to the limits of the running mode.
    pub fn new(config: FinderConfig) -> Self {
        let tools = Tools::for_field(config.field_tesla, config.tuning.boundary_tolerance);
        Self::with_tools(config, tools)
    }

    pub fn with_tools(mut config: FinderConfig, tools: Tools) -> Self {
        config.cuts = config.cuts.clamped();
        Self { config, tools }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    fn context<'s>(&'s self, claims: &'s ClaimIndex) -> SearchContext<'s> {
        SearchContext::new(&self.tools, &self.config).with_claims(claims)
    }

    pub fn new_event(&self, data: &mut FinderData<'_>) {
        data.event = EventCounters::default();
    }

    /// Fold the event's counters into the worker totals and return them.
    pub fn end_event(&self, data: &mut FinderData<'_>) -> EventCounters {
        let event = mem::take(&mut data.event);
        data.statistics.events += 1;
        data.statistics.counters.add(&event);
        tracing::debug!(
            seeds = event.input_seeds,
            initialized = event.initialized,
            found = event.found,
            "event finished"
        );
        event
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Run the search for one seed. On success or a recoverable failure the
    /// trajectory in `data` holds the candidate.
    pub fn find_track<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
        claims: &ClaimIndex,
        brem_noise: bool,
    ) -> Result<ResultCode, FinderError> {
        if road.is_empty() {
            return Err(FinderError::EmptyRoad);
        }
        let ctx = self.context(claims).with_brem_noise(brem_noise);
        let cuts = ctx.cuts;
        let tolerance = ctx.tuning.boundary_tolerance;
        data.links.clear();
        data.links
            .extend(road.iter().map(|e| BoundaryLink::new(e, tolerance)));
        data.failed_gate = None;

        let mut two_point_seed = false;
        let seed_measurements = match &seed.hits {
            SeedHits::SpacePoints(points) if points.len() > 1 => {
                let Some(ms) = space_points_to_measurements(index, points)? else {
                    return Ok(ResultCode::TwoCluster);
                };
                two_point_seed = points.len() == 2;
                ms
            }
            SeedHits::GlobalPositions(positions) if positions.len() > 2 => {
                match global_positions_to_measurements(&ctx, &data.links, index, positions, claims) {
                    Some(ms) => ms,
                    None => return Ok(ResultCode::TwoCluster),
                }
            }
            _ => match track_parameters_to_measurements(
                &ctx,
                &data.links,
                index,
                &seed.parameters,
                claims,
            ) {
                Some(ms) => ms,
                None => return Ok(ResultCode::TwoCluster),
            },
        };
        data.event.good_seeds += 1;

        let mut init = data.trajectory.initialize(
            &ctx,
            &data.links,
            index,
            &seed.parameters,
            &seed_measurements,
        );
        // long external candidates get a second chance from their parameters
        if init.is_err() && matches!(&seed.hits, SeedHits::GlobalPositions(p) if p.len() > 3) {
            let Some(ms) =
                track_parameters_to_measurements(&ctx, &data.links, index, &seed.parameters, claims)
            else {
                return Ok(ResultCode::TwoCluster);
            };
            init = data
                .trajectory
                .initialize(&ctx, &data.links, index, &seed.parameters, &ms);
            if init.is_err() {
                return Ok(ResultCode::TwoCluster);
            }
        }
        match init {
            Ok(()) => {}
            Err(SearchError::SeedNotOnRoad) => {
                data.event.road_bugs += 1;
                return Ok(ResultCode::WrongRoad);
            }
            Err(e) => {
                tracing::debug!(error = %e, "trajectory initialisation failed");
                return Ok(ResultCode::WrongInit);
            }
        }
        data.event.initialized += 1;

        let max_iterations = if cuts.heavy_ion {
            ctx.tuning.heavy_ion_max_iterations
        } else if cuts.simple_track && !cuts.precise_refit {
            ctx.tuning.simple_max_iterations
        } else {
            ctx.tuning.max_iterations
        };
        let enough_clusters = |t: &Trajectory<'_>| {
            t.n_clusters() + t.n_clusters_no_add() >= cuts.min_clusters
                && t.ndf() >= cuts.min_weighted_clusters
        };

        if data.trajectory.is_last_pixel() {
            tracing::trace!("pixel seed strategy");
            let t = &mut data.trajectory;
            if t.forward_extension(&ctx, false, max_iterations).is_err()
                || t.backward_smoother(&ctx, false).is_err()
                || t.backward_extension(&ctx, max_iterations).is_err()
            {
                return Ok(ResultCode::CantFindTrack);
            }
            if t.difference() > 0 && !cuts.precise_refit {
                if data.trajectory.forward_filter(&ctx).is_err()
                    && !data.keep_failed(cuts, ResultCode::PixelSeedDiffForward)
                {
                    return Ok(ResultCode::CantFindTrack);
                }
                if data.trajectory.backward_smoother(&ctx, false).is_err()
                    && !data.keep_failed(cuts, ResultCode::PixelSeedDiffBackward)
                {
                    return Ok(ResultCode::CantFindTrack);
                }
            }
            if !enough_clusters(&data.trajectory)
                && !data.keep_failed(cuts, ResultCode::PixelSeedNCluster)
            {
                return Ok(ResultCode::CantFindTrack);
            }
        } else {
            tracing::trace!(two_point_seed, "mixed seed strategy");
            let t = &mut data.trajectory;
            if t.backward_smoother(&ctx, two_point_seed).is_err()
                || t.backward_extension(&ctx, max_iterations).is_err()
                || t.forward_extension(&ctx, true, max_iterations).is_err()
            {
                return Ok(ResultCode::CantFindTrack);
            }
            if !enough_clusters(t) || t.backward_smoother(&ctx, false).is_err() {
                return Ok(ResultCode::CantFindTrack);
            }
            if !enough_clusters(&data.trajectory)
                && !data.keep_failed(cuts, ResultCode::MixedSeedNCluster)
            {
                return Ok(ResultCode::CantFindTrack);
            }
            if data.trajectory.difference() > 0 {
                if data.trajectory.forward_filter(&ctx).is_err()
                    && !data.keep_failed(cuts, ResultCode::MixedSeedDiffForward)
                {
                    return Ok(ResultCode::CantFindTrack);
                }
                if data.trajectory.backward_smoother(&ctx, false).is_err()
                    && !data.keep_failed(cuts, ResultCode::MixedSeedDiffBackward)
                {
                    return Ok(ResultCode::CantFindTrack);
                }
            }
        }

        let required = cuts.quality_cut * cuts.min_clusters as f64;
        let quality = data.trajectory.quality_optimization(&ctx);
        if quality.map_or(true, |q| q < required) && !data.keep_failed(cuts, ResultCode::Quality) {
            tracing::trace!(?quality, required, "quality gate failed");
            return Ok(ResultCode::CantFindTrack);
        }

        let t = &data.trajectory;
        if t.pt_first() < cuts.pt_min
            && t.n_clusters() < cuts.min_clusters
            && !data.keep_failed(cuts, ResultCode::Pt)
        {
            return Ok(ResultCode::CantFindTrack);
        }

        let t = &data.trajectory;
        if (t.n_clusters() < cuts.min_clusters_backward() || t.ndf() < cuts.min_weighted_clusters)
            && !data.keep_failed(cuts, ResultCode::NCluster)
        {
            return Ok(ResultCode::CantFindTrack);
        }

        if cuts.write_hole_search {
            let outcome = data.trajectory.update_hole_search_result(&ctx);
            if !outcome.passed && !data.keep_failed(cuts, ResultCode::HoleCut) {
                return Ok(ResultCode::CantFindTrack);
            }
        }

        Ok(data.failed_gate.unwrap_or(ResultCode::Success))
    }

    // -----------------------------------------------------------------------
    // Track production
    // -----------------------------------------------------------------------

    /// Tracks for one seed: the best candidate and, in multi-track mode,
    /// its alternates.
    pub fn get_tracks<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
        claims: &ClaimIndex,
    ) -> Result<Vec<Track>, FinderError> {
        data.begin_seed();
        let tracks = self.collect_tracks(data, road, index, seed, claims);
        data.end_seed();
        tracks
    }

    fn collect_tracks<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
        claims: &ClaimIndex,
    ) -> Result<Vec<Track>, FinderError> {
        let cuts = &self.config.cuts;
        let mut tracks = Vec::new();
        if !cuts.use_pixel && !cuts.use_strip {
            return Ok(tracks);
        }

        let code = self.find_track(data, road, index, seed, claims, false)?;
        if code != ResultCode::Success {
            data.flags.raise(code);
            if !(cuts.return_failed_tracks && code.is_recoverable()) {
                tracing::debug!(%code, "seed rejected");
                return Ok(tracks);
            }
        }
        if !data.trajectory.is_new_track(claims) {
            data.flags.raise(ResultCode::NotNewTrack);
            return Ok(tracks);
        }

        let ctx = self.context(claims);
        if !order_span(&ctx, data) {
            return Ok(tracks);
        }
        if cuts.precise_refit && data.trajectory.filter_with_precise_errors(&ctx).is_err() {
            data.flags.raise(ResultCode::CantFindTrack);
            return Ok(tracks);
        }

        let info = PatternInfo {
            simple: cuts.simple_track,
            ..Default::default()
        };
        let Some(track) = convert_to_track(&ctx, &mut data.trajectory, code, info) else {
            return Ok(tracks);
        };
        tracks.push(track);

        let multi = cuts.multi_tracks
            && !cuts.simple_track
            && !cuts.cosmic
            && seed.n_space_points() > 2
            && data.trajectory.pt_first() >= cuts.pt_min;
        if multi {
            while let Some(track) = convert_to_next_track(&ctx, &mut data.trajectory, code, info) {
                tracks.push(track);
            }
        }
        data.event.found += tracks.len() as u64;
        tracing::debug!(
            n_tracks = tracks.len(),
            n_clusters = data.trajectory.n_clusters(),
            n_holes = data.trajectory.n_holes_total(),
            %code,
            "seed accepted"
        );
        Ok(tracks)
    }

    /// Like [`get_tracks`](Self::get_tracks), retrying with the electron noise
    /// model when the muon hypothesis fails or looks short for a high-pT
    /// seed. The electron track replaces nothing; it is added when it has
    /// more measurements.
    pub fn get_tracks_with_brem<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
        claims: &ClaimIndex,
        in_calo_roi: bool,
    ) -> Result<Vec<Track>, FinderError> {
        data.begin_seed();
        let tracks = self.collect_tracks_with_brem(data, road, index, seed, claims, in_calo_roi);
        data.end_seed();
        tracks
    }

    fn collect_tracks_with_brem<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
        claims: &ClaimIndex,
        in_calo_roi: bool,
    ) -> Result<Vec<Track>, FinderError> {
        let cuts = &self.config.cuts;
        let mut tracks = Vec::new();
        if !cuts.use_pixel && !cuts.use_strip {
            return Ok(tracks);
        }
        // alternates are never produced for electron candidates
        let single = QualityCuts {
            multi_tracks: false,
            ..cuts.clone()
        };
        let ctx = SearchContext {
            cuts: &single,
            ..self.context(claims)
        };

        let code = self.find_track(data, road, index, seed, claims, false)?;
        let mut n_muon = 0;
        if code == ResultCode::Success && data.trajectory.is_new_track(claims) {
            if !order_span(&ctx, data) {
                return Ok(tracks);
            }
            let info = PatternInfo {
                in_calo_roi,
                ..Default::default()
            };
            let Some(track) = convert_to_track(&ctx, &mut data.trajectory, code, info) else {
                return Ok(tracks);
            };
            tracks.push(track);
            data.event.found += 1;
            n_muon = data.trajectory.n_clusters();
            if n_muon >= BREM_SKIP_CLUSTERS && data.trajectory.n_clusters_no_add() == 0 {
                return Ok(tracks);
            }
            if data.trajectory.pt_first() < cuts.pt_min_brem {
                return Ok(tracks);
            }
        }
        if seed.starts_with_strip_pair() {
            return Ok(tracks);
        }

        data.flags.raise(ResultCode::BremAttempt);
        let code = self.find_track(data, road, index, seed, claims, true)?;
        if code != ResultCode::Success {
            data.flags.raise(code);
            return Ok(tracks);
        }
        if !data.trajectory.is_new_track(claims) {
            data.flags.raise(ResultCode::NotNewTrack);
            return Ok(tracks);
        }
        if data.trajectory.n_clusters() <= n_muon {
            return Ok(tracks);
        }

        let ctx = ctx.with_brem_noise(true);
        if !order_span(&ctx, data) {
            return Ok(tracks);
        }
        if cuts.precise_refit && data.trajectory.filter_with_precise_errors(&ctx).is_err() {
            data.flags.raise(ResultCode::CantFindTrack);
            return Ok(tracks);
        }
        let info = PatternInfo {
            brem_fit: true,
            in_calo_roi,
            ..Default::default()
        };
        if let Some(track) = convert_to_track(&ctx, &mut data.trajectory, code, info) {
            tracing::debug!(n_clusters = data.trajectory.n_clusters(), "electron track");
            tracks.push(track);
            data.event.found += 1;
        }
        Ok(tracks)
    }

    /// Transverse momentum of a space-point seed from a forward chain over
    /// its measurements; zero when the seed does not form a track.
    pub fn pt_seed<'a>(
        &self,
        data: &mut FinderData<'a>,
        road: &'a [DetectorElement],
        index: &'a MeasurementIndex,
        seed: &Seed,
    ) -> Result<f64, FinderError> {
        let SeedHits::SpacePoints(points) = &seed.hits else {
            return Ok(0.0);
        };
        let Some(measurements) = space_points_to_measurements(index, points)? else {
            return Ok(0.0);
        };
        let tolerance = self.config.tuning.boundary_tolerance;
        let mut hits = Vec::with_capacity(measurements.len());
        for m in measurements {
            let Some(element) = road.iter().find(|e| e.id == m.element) else {
                return Ok(0.0);
            };
            hits.push((BoundaryLink::new(element, tolerance), m));
        }
        let claims = ClaimIndex::new();
        let ctx = self.context(&claims);
        Ok(data.trajectory.pt_seed(&ctx, &seed.parameters, &hits))
    }

    // -----------------------------------------------------------------------
    // Drivers
    // -----------------------------------------------------------------------

    /// Process an event's seeds in order. Every accepted track claims its
    /// measurements, so later seeds are checked against earlier tracks.
    /// Track ids are the position in the returned list.
    pub fn find_tracks<'a>(
        &self,
        data: &mut FinderData<'a>,
        seeds: &'a [RoadSeed],
        index: &'a MeasurementIndex,
        claims: &mut ClaimIndex,
    ) -> Result<Vec<Track>, FinderError> {
        self.new_event(data);
        let mut found = Vec::new();
        for job in seeds {
            let tracks = self.get_tracks(data, &job.road, index, &job.seed, claims)?;
            for track in tracks {
                let id = TrackId(found.len() as u64);
                let total = track.n_measurements() + track.n_outliers();
                claims.claim(id, track.measurement_ids(), total);
                found.push(track);
            }
        }
        self.end_event(data);
        Ok(found)
    }

    /// Process an event's seeds on the rayon pool, one [`FinderData`] per
    /// worker. Candidates are checked against `claims` only, not against
    /// each other.
    pub fn find_tracks_parallel(
        &self,
        seeds: &[RoadSeed],
        index: &MeasurementIndex,
        claims: &ClaimIndex,
    ) -> Result<(Vec<Track>, FinderStatistics), FinderError> {
        let per_seed: Vec<Result<(Vec<Track>, FinderStatistics), FinderError>> = seeds
            .par_iter()
            .map_init(FinderData::new, |data, job| {
                let tracks = self.get_tracks(data, &job.road, index, &job.seed, claims);
                let statistics = data.take_statistics();
                tracks.map(|t| (t, statistics))
            })
            .collect();

        let mut statistics = FinderStatistics {
            events: 1,
            ..Default::default()
        };
        let mut tracks = Vec::new();
        for result in per_seed {
            let (t, s) = result?;
            statistics = statistics.merge(&s);
            tracks.extend(t);
        }
        Ok((tracks, statistics))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Measurements of the space points; `None` when two lie on one element.
fn space_points_to_measurements<'a>(
    index: &'a MeasurementIndex,
    points: &[SpacePoint],
) -> Result<Option<Vec<&'a Measurement>>, FinderError> {
    let mut out: Vec<&'a Measurement> = Vec::with_capacity(2 * points.len());
    for id in points.iter().flat_map(|sp| sp.measurements()) {
        let m = index.get(id).ok_or(FinderError::UnknownMeasurement(id))?;
        if out.iter().any(|o| o.element == m.element) {
            return Ok(None);
        }
        out.push(m);
    }
    Ok(Some(out))
}

/// Sort the span and, outside cosmic running, cut it back to the outgoing
/// leg. `false` when too few measurements remain.
fn order_span(ctx: &SearchContext<'_>, data: &mut FinderData<'_>) -> bool {
    let t = &mut data.trajectory;
    t.sort_step(ctx);
    if ctx.cuts.cosmic || !t.jump_through_perigee() {
        return true;
    }
    tracing::debug!(
        first = t.first_element(),
        n_clusters = t.n_clusters(),
        "span cut at the perigee"
    );
    if t.n_clusters() + t.n_clusters_no_add() < ctx.cuts.min_clusters {
        data.flags.raise(ResultCode::NCluster);
        return false;
    }
    true
}

fn convert_to_track(
    ctx: &SearchContext<'_>,
    trajectory: &mut Trajectory<'_>,
    result: ResultCode,
    info: PatternInfo,
) -> Option<Track> {
    if let Some(p) = trajectory.first_parameters() {
        let pt = p.pt();
        if pt < ctx.cuts.final_pt_min {
            tracing::debug!(pt, "low-pT track rejected");
            return None;
        }
    }
    let states = if ctx.cuts.simple_track {
        trajectory.convert_to_simple_track_states(ctx)
    } else {
        trajectory.convert_to_track_states(ctx)
    };
    Some(Track {
        states,
        fit_quality: Some(trajectory.convert_to_fit_quality()),
        hole_search: trajectory.hole_search_result(),
        result,
        info,
    })
}

fn convert_to_next_track(
    ctx: &SearchContext<'_>,
    trajectory: &mut Trajectory<'_>,
    result: ResultCode,
    info: PatternInfo,
) -> Option<Track> {
    let states = trajectory.convert_to_next_track_states()?;
    if let Some(p) = states.iter().find_map(|s| s.parameters) {
        if p.pt() < ctx.cuts.final_pt_min {
            tracing::warn!(pt = p.pt(), "low-pT alternate rejected");
            return None;
        }
    }
    Some(Track {
        states,
        fit_quality: Some(trajectory.convert_to_fit_quality()),
        hole_search: trajectory.hole_search_result(),
        result,
        info: PatternInfo {
            alternative: true,
            ..info
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementId, LocalVec, MeasurementId, SurfaceId};
    use detector_models::{PlaneSurface, Region, Technology};
    use nalgebra::Vector2;
    use std::f64::consts::FRAC_PI_2;

    /// Nine pixel modules at x = 50, 90, ... mm with one hit each on the
    /// straight track along x.
    fn telescope() -> (Vec<DetectorElement>, MeasurementIndex) {
        let road: Vec<DetectorElement> = (0..9)
            .map(|i| DetectorElement {
                id: ElementId(i),
                technology: Technology::Pixel,
                region: Region::Barrel,
                surface: PlaneSurface::from_normal(
                    SurfaceId(i),
                    Vector3::new(50.0 + 40.0 * i as f64, 0.0, 0.0),
                    Vector3::x(),
                    Vector3::z(),
                ),
                half_width: 20.0,
                half_length: 30.0,
                disabled: false,
            })
            .collect();
        let index = MeasurementIndex::from_measurements((0..9).map(|i| {
            Measurement::pixel(MeasurementId(i + 1), ElementId(i), Vector2::zeros(), 0.01, 0.05)
        }));
        (road, index)
    }

    fn seed(road: &[DetectorElement], ids: &[u64]) -> Seed {
        Seed {
            parameters: PatternParameters::new(
                road[0].surface,
                LocalVec::new(0.0, 0.0, 0.0, FRAC_PI_2, 1e-4),
                None,
            ),
            hits: SeedHits::SpacePoints(
                ids.iter()
                    .map(|&id| SpacePoint {
                        first: MeasurementId(id),
                        second: None,
                        position: Vector3::new(10.0 + 40.0 * id as f64, 0.0, 0.0),
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_straight_track_is_found() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let claims = ClaimIndex::new();
        let tracks = finder
            .get_tracks(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &claims)
            .unwrap();

        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.result, ResultCode::Success);
        assert_eq!(track.n_measurements(), 9);
        let ids: Vec<u64> = track.measurement_ids().map(|m| m.0).collect();
        assert_eq!(ids, (1..=9).collect::<Vec<_>>());
        assert_eq!(track.fit_quality.map(|f| f.ndf), Some(13));
        assert!(track.hole_search.passed);
        assert_eq!(data.event().found, 1);
        assert_eq!(data.event().initialized, 1);
    }

    #[test]
    fn test_claimed_candidate_is_not_new() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let mut claims = ClaimIndex::new();
        claims.claim(TrackId(0), (1..=9).map(MeasurementId), 9);

        let tracks = finder
            .get_tracks(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &claims)
            .unwrap();
        assert!(tracks.is_empty());
        assert!(data.flags().is_raised(ResultCode::NotNewTrack));
        assert_eq!(data.statistics().count(ResultCode::NotNewTrack), 1);
    }

    #[test]
    fn test_two_measurements_on_one_element() {
        let (road, mut index) = telescope();
        index.insert(Measurement::pixel(
            MeasurementId(50),
            ElementId(1),
            Vector2::new(1.0, 0.0),
            0.01,
            0.05,
        ));
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let claims = ClaimIndex::new();
        let code = finder
            .find_track(&mut data, &road, &index, &seed(&road, &[1, 2, 50]), &claims, false)
            .unwrap();
        assert_eq!(code, ResultCode::TwoCluster);
        assert_eq!(data.event().good_seeds, 0);
    }

    #[test]
    fn test_unknown_seed_measurement_is_an_error() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let err = finder
            .get_tracks(&mut data, &road, &index, &seed(&road, &[1, 2, 77]), &ClaimIndex::new())
            .unwrap_err();
        assert_eq!(err, FinderError::UnknownMeasurement(MeasurementId(77)));
    }

    #[test]
    fn test_seed_off_the_road_is_a_road_bug() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        // the road stops before the third seed module
        let short = &road[..2];
        let code = finder
            .find_track(&mut data, short, &index, &seed(&road, &[1, 2, 3]), &ClaimIndex::new(), false)
            .unwrap();
        assert_eq!(code, ResultCode::WrongRoad);
        assert_eq!(data.event().road_bugs, 1);
    }

    #[test]
    fn test_empty_road_is_an_error() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let err = finder
            .find_track(&mut data, &[], &index, &seed(&road, &[1, 2, 3]), &ClaimIndex::new(), false)
            .unwrap_err();
        assert_eq!(err, FinderError::EmptyRoad);
    }

    #[test]
    fn test_pt_seed_of_straight_seed() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let pt = finder
            .pt_seed(&mut data, &road, &index, &seed(&road, &[1, 2, 3]))
            .unwrap();
        assert!((pt - 1e4).abs() < 10.0);
    }

    #[test]
    fn test_sequential_driver_claims_found_tracks() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let jobs = vec![
            RoadSeed {
                road: road.clone(),
                seed: seed(&road, &[1, 2, 3]),
            },
            RoadSeed {
                road: road.clone(),
                seed: seed(&road, &[1, 2, 3]),
            },
        ];
        let mut data = FinderData::new();
        let mut claims = ClaimIndex::new();
        let tracks = finder.find_tracks(&mut data, &jobs, &index, &mut claims).unwrap();

        // the duplicate seed finds the same track, which is no longer new
        assert_eq!(tracks.len(), 1);
        assert_eq!(claims.len(), 9);
        let stats = data.statistics();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.counters.input_seeds, 2);
        assert_eq!(stats.counters.found, 1);
        assert_eq!(stats.count(ResultCode::NotNewTrack), 1);
    }

    #[test]
    fn test_parallel_driver_matches_sequential() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let jobs: Vec<RoadSeed> = (0..4)
            .map(|_| RoadSeed {
                road: road.clone(),
                seed: seed(&road, &[1, 2, 3]),
            })
            .collect();
        let (tracks, stats) = finder
            .find_tracks_parallel(&jobs, &index, &ClaimIndex::new())
            .unwrap();
        // no claims between parallel seeds
        assert_eq!(tracks.len(), 4);
        assert_eq!(stats.counters.input_seeds, 4);
        assert_eq!(stats.counters.found, 4);
        assert!(tracks.iter().all(|t| t.n_measurements() == 9));
    }

    #[test]
    fn test_brem_retry_keeps_the_longer_track() {
        let (road, index) = telescope();
        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let tracks = finder
            .get_tracks_with_brem(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &ClaimIndex::new(), true)
            .unwrap();
        // the electron pass finds the same nine hits, so only the muon track stays
        assert_eq!(tracks.len(), 1);
        assert!(!tracks[0].info.brem_fit);
        assert!(tracks[0].info.in_calo_roi);
        assert_eq!(tracks[0].n_measurements(), 9);
        assert!(data.flags().is_raised(ResultCode::BremAttempt));
        assert_eq!(data.event().found, 1);
    }

    /// Road E0..E5: hits on E0..E3, E4 crossed without a hit, E5 missed.
    fn short_road() -> (Vec<DetectorElement>, MeasurementIndex) {
        let (mut road, _) = telescope();
        road.truncate(6);
        road[5].surface = PlaneSurface::from_normal(
            SurfaceId(5),
            Vector3::new(250.0, 100.0, 0.0),
            Vector3::x(),
            Vector3::z(),
        );
        let index = MeasurementIndex::from_measurements((0..4).map(|i| {
            Measurement::pixel(MeasurementId(i + 1), ElementId(i), Vector2::zeros(), 0.01, 0.05)
        }));
        (road, index)
    }

    fn short_track_config(min_clusters: u32, max_holes: u32) -> FinderConfig {
        let mut config = FinderConfig::default();
        config.cuts.min_clusters = min_clusters;
        config.cuts.min_weighted_clusters = 8;
        config.cuts.max_holes = max_holes;
        config
    }

    #[test]
    fn test_short_track_with_trailing_hole_is_accepted() {
        let (road, index) = short_road();
        let finder = CombinatorialFinder::new(short_track_config(4, 1));
        let mut data = FinderData::new();
        let claims = ClaimIndex::new();
        let code = finder
            .find_track(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &claims, false)
            .unwrap();
        assert_eq!(code, ResultCode::Success);
        let t = data.trajectory();
        assert_eq!(t.n_clusters(), 4);
        assert_eq!(t.n_holes_total(), 1);
        assert_eq!(t.n_holes(), 0);
        assert_eq!(t.n_holes_after(), 1);
        assert_eq!(t.ndf(), 8);
        assert!(t.hole_search_result().passed);
    }

    #[test]
    fn test_short_track_fails_stricter_cuts() {
        let (road, index) = short_road();
        let claims = ClaimIndex::new();

        let finder = CombinatorialFinder::new(short_track_config(5, 1));
        let mut data = FinderData::new();
        let code = finder
            .find_track(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &claims, false)
            .unwrap();
        assert_eq!(code, ResultCode::CantFindTrack);

        let finder = CombinatorialFinder::new(short_track_config(4, 0));
        let mut data = FinderData::new();
        let code = finder
            .find_track(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &claims, false)
            .unwrap();
        assert_eq!(code, ResultCode::CantFindTrack);
    }

    #[test]
    fn test_failed_gate_is_returned_on_request() {
        let (road, index) = short_road();
        let mut config = short_track_config(4, 0);
        config.cuts.return_failed_tracks = true;
        let finder = CombinatorialFinder::new(config);
        let mut data = FinderData::new();
        let tracks = finder
            .get_tracks(&mut data, &road, &index, &seed(&road, &[1, 2, 3]), &ClaimIndex::new())
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].result, ResultCode::HoleCut);
        assert!(!tracks[0].hole_search.passed);
        assert!(data.flags().is_raised(ResultCode::HoleCut));
    }

    /// The telescope moved 80 mm back: its first module lies on the
    /// incoming side of the beam line.
    fn through_beam_line() -> (Vec<DetectorElement>, MeasurementIndex) {
        let (mut road, index) = telescope();
        for (i, e) in road.iter_mut().enumerate() {
            e.surface = PlaneSurface::from_normal(
                SurfaceId(i as u64),
                Vector3::new(-30.0 + 40.0 * i as f64, 0.0, 0.0),
                Vector3::x(),
                Vector3::z(),
            );
        }
        (road, index)
    }

    #[test]
    fn test_collision_track_is_cut_at_the_perigee() {
        let (road, index) = through_beam_line();
        let seed = seed(&road, &[1, 2, 3]);

        let finder = CombinatorialFinder::new(FinderConfig::default());
        let mut data = FinderData::new();
        let tracks = finder
            .get_tracks(&mut data, &road, &index, &seed, &ClaimIndex::new())
            .unwrap();
        assert_eq!(tracks.len(), 1);
        let ids: Vec<u64> = tracks[0].measurement_ids().map(|m| m.0).collect();
        assert_eq!(ids, (2..=9).collect::<Vec<_>>());

        // cosmic running keeps both legs
        let mut config = FinderConfig::default();
        config.cuts.cosmic = true;
        let finder = CombinatorialFinder::new(config);
        let mut data = FinderData::new();
        let tracks = finder
            .get_tracks(&mut data, &road, &index, &seed, &ClaimIndex::new())
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].n_measurements(), 9);
    }
}
