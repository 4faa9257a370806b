//! Measurement-to-track claims and the ambiguity test for new candidates.
//!
//! # Rule
//! A candidate is new if it uses at least one measurement no accepted track
//! claims, or if it is longer than the longest accepted track claiming any
//! of its measurements. A strict subset of an accepted track is never new.

use crate::types::{MeasurementId, TrackId};
use smallvec::SmallVec;
use std::collections::HashMap;

/// One accepted track's claim on a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    pub track: TrackId,
    /// Number of measurements on the claiming track
    pub n_measurements: usize,
}

/// Which accepted tracks use which measurements.
#[derive(Clone, Debug, Default)]
pub struct ClaimIndex {
    claims: HashMap<MeasurementId, SmallVec<[Claim; 2]>>,
}

impl ClaimIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every measurement of an accepted track.
    pub fn claim(
        &mut self,
        track: TrackId,
        measurements: impl IntoIterator<Item = MeasurementId>,
        n_measurements: usize,
    ) {
        for id in measurements {
            let entry = self.claims.entry(id).or_default();
            if let Some(c) = entry.iter_mut().find(|c| c.track == track) {
                c.n_measurements = n_measurements;
            } else {
                entry.push(Claim {
                    track,
                    n_measurements,
                });
            }
        }
    }

    pub fn is_claimed(&self, id: MeasurementId) -> bool {
        self.claims.get(&id).is_some_and(|c| !c.is_empty())
    }

    pub fn claims(&self, id: MeasurementId) -> &[Claim] {
        self.claims.get(&id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Size of the longest track claiming `id`.
    pub fn longest_claim(&self, id: MeasurementId) -> Option<usize> {
        self.claims(id).iter().map(|c| c.n_measurements).max()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn clear(&mut self) {
        self.claims.clear();
    }
}

/// Apply the ambiguity rule to a candidate using `measurements`, whose total
/// count (measurements plus outliers) is `total`.
pub fn is_new_track(
    measurements: impl IntoIterator<Item = MeasurementId>,
    total: usize,
    index: &ClaimIndex,
) -> bool {
    let mut longest = Vec::new();
    for id in measurements {
        match index.longest_claim(id) {
            None => return true,
            Some(n) => longest.push(n),
        }
    }
    longest.into_iter().any(|n| total > n)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<u64>) -> Vec<MeasurementId> {
        range.map(MeasurementId).collect()
    }

    fn index_with_six() -> ClaimIndex {
        let mut idx = ClaimIndex::new();
        idx.claim(TrackId(1), ids(0..6), 6);
        idx
    }

    #[test]
    fn test_subset_is_not_new() {
        let idx = index_with_six();
        assert!(!is_new_track(ids(0..5), 5, &idx));
        assert!(!is_new_track(ids(0..6), 6, &idx));
    }

    #[test]
    fn test_longer_candidate_is_new() {
        let idx = index_with_six();
        // seven entries, all measurements shared, one counted as an outlier
        assert!(is_new_track(ids(0..6), 7, &idx));
    }

    #[test]
    fn test_unclaimed_measurement_makes_new() {
        let idx = index_with_six();
        let mut cand = ids(0..4);
        cand.push(MeasurementId(99));
        assert!(is_new_track(cand, 5, &idx));
    }

    #[test]
    fn test_longest_claim_wins() {
        let mut idx = index_with_six();
        idx.claim(TrackId(2), ids(3..12), 9);
        assert_eq!(idx.longest_claim(MeasurementId(4)), Some(9));
        assert_eq!(idx.longest_claim(MeasurementId(1)), Some(6));
        assert_eq!(idx.claims(MeasurementId(4)).len(), 2);
        // beats track 1 on its measurements but not track 2
        assert!(is_new_track(ids(0..7), 7, &idx));
    }

    #[test]
    fn test_empty_index_accepts_everything() {
        assert!(is_new_track(ids(0..3), 3, &ClaimIndex::new()));
    }
}
