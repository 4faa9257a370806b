//! Finder configuration: quality cuts and search tuning constants.
//!
//! All structs deserialize with `#[serde(default)]`, so a JSON file only
//! needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Track quality requirements and search thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityCuts {
    /// Minimal number of measurements (measurements + outliers)
    pub min_clusters: u32,
    /// Minimal number of measured coordinates
    pub min_weighted_clusters: u32,
    /// Maximal number of holes
    pub max_holes: u32,
    /// Maximal number of consecutive strip holes
    pub max_double_holes: u32,
    /// Minimal pT (MeV)
    pub pt_min: f64,
    /// pT above which a bremsstrahlung recovery is attempted (MeV)
    pub pt_min_brem: f64,
    /// χ² to accept a measurement
    pub xi2_max: f64,
    /// χ² to keep a rejected measurement as an outlier
    pub xi2_max_no_add: f64,
    /// χ² to keep a candidate link at all
    pub xi2_max_link: f64,
    /// Emit alternative tracks from ambiguous pixel assignments
    pub multi_tracks: bool,
    /// χ² below which an alternative pixel assignment counts as ambiguous
    pub xi2_multi_tracks: f64,
    /// Emit reduced track states only
    pub simple_track: bool,
    /// Keep tracks that failed a recoverable quality gate, tagged with the reason
    pub return_failed_tracks: bool,
    pub cosmic: bool,
    pub heavy_ion: bool,
    /// Quality score per required measurement
    pub quality_cut: f64,
    /// Tracks below this pT (MeV) are dropped at conversion
    pub final_pt_min: f64,
    pub use_pixel: bool,
    pub use_strip: bool,
    /// Skip measurements already claimed by accepted tracks during search
    pub use_association: bool,
    /// Classify interior crossings for the pattern hole search
    pub write_hole_search: bool,
    /// Refit accepted candidates with corrected measurement errors
    pub precise_refit: bool,
}

impl Default for QualityCuts {
    fn default() -> Self {
        Self {
            min_clusters: 7,
            min_weighted_clusters: 7,
            max_holes: 2,
            max_double_holes: 2,
            pt_min: 500.0,       // MeV
            pt_min_brem: 1000.0, // MeV
            xi2_max: 9.0,
            xi2_max_no_add: 25.0,
            xi2_max_link: 100.0,
            multi_tracks: false,
            xi2_multi_tracks: 7.0,
            simple_track: false,
            return_failed_tracks: false,
            cosmic: false,
            heavy_ion: false,
            quality_cut: 9.3,
            final_pt_min: 100.0, // MeV
            use_pixel: true,
            use_strip: true,
            use_association: false,
            write_hole_search: true,
            precise_refit: false,
        }
    }
}

impl QualityCuts {
    /// Apply the collision-mode limits. Cosmic running lifts most caps.
    pub fn clamped(mut self) -> Self {
        if !self.cosmic {
            self.max_holes = self.max_holes.min(2);
            self.max_double_holes = self.max_double_holes.min(2);
            self.xi2_max_no_add = self.xi2_max_no_add.min(25.0);
            self.xi2_multi_tracks = self.xi2_multi_tracks.min(7.0);
        }
        self.max_double_holes = self.max_double_holes.min(self.max_holes);
        if self.xi2_max_no_add <= self.xi2_max {
            self.xi2_max_no_add = self.xi2_max + 5.0;
        }
        self
    }

    /// Measurement floor after the backward pass.
    pub fn min_clusters_backward(&self) -> u32 {
        self.min_clusters.saturating_sub(1).max(3)
    }
}

/// Internal constants of the combinatorial search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchTuning {
    /// Seed χ² cut is this factor times `xi2_max`
    pub seed_chi2_factor: f64,
    /// Measured coordinates of rejected seed measurements before giving up
    pub wrong_seed_ndf_budget: u32,
    /// Degrees of freedom required after seeding
    pub min_seed_ndf: u32,
    /// Initial cap on consecutive well-inside misses during an extension
    pub missing_cut: u32,
    /// Distance inside the outline below which a miss counts (mm)
    pub missing_distance: f64,
    /// Largest φ excursion from the seed direction (rad)
    pub max_phi_deviation: f64,
    /// Measurements at which a hole-free forward extension stops exploring
    pub full_track_clusters: u32,
    pub max_iterations: usize,
    pub simple_max_iterations: usize,
    pub heavy_ion_max_iterations: usize,
    /// χ² cut of the seed pT estimate
    pub seed_pt_chi2_cut: f64,
    /// Module thickness in radiation lengths
    pub radiation_length: f64,
    pub precise_radiation_length: f64,
    pub energy_loss: f64,
    /// Insert a service-material marker at this radius (mm)
    pub dead_material_radius: Option<f64>,
    /// Minimal edge band of the boundary links (mm)
    pub boundary_tolerance: f64,
    /// Track states kept per element for alternative tracks
    pub max_alternative_states: usize,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            seed_chi2_factor: 2.0,
            wrong_seed_ndf_budget: 3,
            min_seed_ndf: 6,
            missing_cut: 3,
            missing_distance: 2.0, // mm
            max_phi_deviation: 2.2,
            full_track_clusters: 14,
            max_iterations: 30,
            simple_max_iterations: 10,
            heavy_ion_max_iterations: 50,
            seed_pt_chi2_cut: 30.0,
            radiation_length: 0.03,
            precise_radiation_length: 0.04,
            energy_loss: 0.4,
            dead_material_radius: None,
            boundary_tolerance: 0.1, // mm
            max_alternative_states: 3,
        }
    }
}

/// Top-level finder configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    pub cuts: QualityCuts,
    pub tuning: SearchTuning,
    /// Solenoid field along z (Tesla); zero selects straight-line propagation
    pub field_tesla: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
