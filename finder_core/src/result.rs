//! Per-seed outcome codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a seed did or did not produce a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    /// Two seed measurements on one element
    TwoCluster,
    /// Seed measurements not all on the road
    WrongRoad,
    /// Seed could not be filtered
    WrongInit,
    CantFindTrack,
    /// Candidate is ambiguous with an accepted track
    NotNewTrack,
    BremAttempt,
    PixelSeedDiffForward,
    PixelSeedDiffBackward,
    PixelSeedNCluster,
    MixedSeedDiffForward,
    MixedSeedDiffBackward,
    MixedSeedNCluster,
    Quality,
    Pt,
    NCluster,
    HoleCut,
}

impl ResultCode {
    pub const COUNT: usize = 17;

    pub const ALL: [ResultCode; Self::COUNT] = [
        ResultCode::Success,
        ResultCode::TwoCluster,
        ResultCode::WrongRoad,
        ResultCode::WrongInit,
        ResultCode::CantFindTrack,
        ResultCode::NotNewTrack,
        ResultCode::BremAttempt,
        ResultCode::PixelSeedDiffForward,
        ResultCode::PixelSeedDiffBackward,
        ResultCode::PixelSeedNCluster,
        ResultCode::MixedSeedDiffForward,
        ResultCode::MixedSeedDiffBackward,
        ResultCode::MixedSeedNCluster,
        ResultCode::Quality,
        ResultCode::Pt,
        ResultCode::NCluster,
        ResultCode::HoleCut,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Failures decided after a full trajectory existed. Such tracks may still
    /// be returned, tagged with the code, when failed tracks are requested.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ResultCode::PixelSeedDiffForward
                | ResultCode::PixelSeedDiffBackward
                | ResultCode::PixelSeedNCluster
                | ResultCode::MixedSeedDiffForward
                | ResultCode::MixedSeedDiffBackward
                | ResultCode::MixedSeedNCluster
                | ResultCode::Quality
                | ResultCode::Pt
                | ResultCode::NCluster
                | ResultCode::HoleCut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::TwoCluster => "TwoCluster",
            ResultCode::WrongRoad => "WrongRoad",
            ResultCode::WrongInit => "WrongInit",
            ResultCode::CantFindTrack => "CantFindTrack",
            ResultCode::NotNewTrack => "NotNewTrack",
            ResultCode::BremAttempt => "BremAttempt",
            ResultCode::PixelSeedDiffForward => "PixelSeedDiffForward",
            ResultCode::PixelSeedDiffBackward => "PixelSeedDiffBackward",
            ResultCode::PixelSeedNCluster => "PixelSeedNCluster",
            ResultCode::MixedSeedDiffForward => "MixedSeedDiffForward",
            ResultCode::MixedSeedDiffBackward => "MixedSeedDiffBackward",
            ResultCode::MixedSeedNCluster => "MixedSeedNCluster",
            ResultCode::Quality => "Quality",
            ResultCode::Pt => "Pt",
            ResultCode::NCluster => "NCluster",
            ResultCode::HoleCut => "HoleCut",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
