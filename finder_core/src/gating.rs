//! χ² gating of candidate measurements against a predicted state.
//!
//! # Gating criterion
//! χ²(m, x̂) = rᵀ S⁻¹ r  with  r = m − H·x̂,  S = V + H·C·Hᵀ
//!
//! Candidates above `chi2_max_link` are discarded; the survivors are kept
//! sorted by increasing χ², at most [`MAX_LINKS`] of them.

use crate::association::ClaimIndex;
use crate::kf::KalmanUpdator;
use crate::parameters::PatternParameters;
use crate::types::MAX_LINKS;
use detector_models::Measurement;
use smallvec::SmallVec;

/// A candidate measurement with its χ² against the prediction.
#[derive(Clone, Copy, Debug)]
pub struct Link<'a> {
    pub measurement: &'a Measurement,
    pub chi2: f64,
}

/// Ranked candidate list; stored inline for the usual handful of links.
pub type Links<'a> = SmallVec<[Link<'a>; MAX_LINKS]>;

/// Rank `candidates` against `predicted`.
///
/// Measurements already used by another track are skipped when `claims` is
/// given.
pub fn search_links<'a>(
    updator: &dyn KalmanUpdator,
    predicted: &PatternParameters,
    candidates: &'a [Measurement],
    chi2_max_link: f64,
    claims: Option<&ClaimIndex>,
) -> Links<'a> {
    let mut links = Links::new();
    for m in candidates {
        if claims.is_some_and(|c| c.is_claimed(m.id)) {
            continue;
        }
        let Some(chi2) = updator.chi2(predicted, &m.local, &m.covariance, m.dim) else {
            continue;
        };
        if chi2 > chi2_max_link {
            continue;
        }
        let pos = links.partition_point(|l: &Link<'a>| l.chi2 <= chi2);
        if pos >= MAX_LINKS {
            continue;
        }
        if links.len() == MAX_LINKS {
            links.pop();
        }
        links.insert(pos, Link { measurement: m, chi2 });
    }
    links
}

/// Best candidate regardless of the link threshold.
pub fn closest_measurement<'a>(
    updator: &dyn KalmanUpdator,
    predicted: &PatternParameters,
    candidates: &'a [Measurement],
) -> Option<Link<'a>> {
    candidates
        .iter()
        .filter_map(|m| {
            updator
                .chi2(predicted, &m.local, &m.covariance, m.dim)
                .map(|chi2| Link { measurement: m, chi2 })
        })
        .min_by(|a, b| a.chi2.total_cmp(&b.chi2))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kf::PatternUpdator;
    use crate::types::{LocalCov, LocalVec, TrackId};
    use detector_models::{ElementId, MeasurementId, PlaneSurface, SurfaceId};
    use nalgebra::{Vector2, Vector3};

    fn predicted() -> PatternParameters {
        let s = PlaneSurface::from_normal(SurfaceId(1), Vector3::new(50.0, 0.0, 0.0), Vector3::x(), Vector3::z());
        PatternParameters::new(s, LocalVec::new(0.0, 0.0, 0.0, 1.5, 1e-3), Some(LocalCov::identity() * 0.01))
    }

    fn hits(n: usize) -> Vec<Measurement> {
        (0..n)
            .map(|i| {
                Measurement::pixel(
                    MeasurementId(i as u64),
                    ElementId(1),
                    Vector2::new(0.05 * (n - i) as f64, 0.0),
                    0.1,
                    0.1,
                )
            })
            .collect()
    }

    #[test]
    fn test_links_sorted_and_capped() {
        let h = hits(14);
        let links = search_links(&PatternUpdator, &predicted(), &h, 1e6, None);
        assert_eq!(links.len(), MAX_LINKS);
        assert!(links.windows(2).all(|w| w[0].chi2 <= w[1].chi2));
        // closest hit is the last one generated
        assert_eq!(links[0].measurement.id, MeasurementId(13));
    }

    #[test]
    fn test_links_respect_threshold() {
        let h = hits(14);
        let links = search_links(&PatternUpdator, &predicted(), &h, 1.0, None);
        assert!(links.iter().all(|l| l.chi2 <= 1.0));
        assert!(links.len() < 14);
    }

    #[test]
    fn test_claimed_measurements_are_skipped() {
        let h = hits(3);
        let mut claims = ClaimIndex::new();
        claims.claim(TrackId(1), [MeasurementId(2)], 8);
        let links = search_links(&PatternUpdator, &predicted(), &h, 1e6, Some(&claims));
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.measurement.id != MeasurementId(2)));
    }

    #[test]
    fn test_closest_measurement() {
        let h = hits(4);
        let best = closest_measurement(&PatternUpdator, &predicted(), &h).unwrap();
        assert_eq!(best.measurement.id, MeasurementId(3));
    }
}
